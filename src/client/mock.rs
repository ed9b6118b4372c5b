//! Scripted in-memory streams for exercising the client without sockets

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::net::{NetworkStream, SocketFactory};
use crate::error::Error;

/// An in-memory duplex stream.
///
/// Reads are served from a pre-scripted server transcript; everything the
/// client writes is captured. Clones share the same buffers, so a test
/// can keep a handle while the connection owns another.
#[derive(Clone, Debug, Default)]
pub struct MockStream {
    input: Arc<Mutex<Cursor<Vec<u8>>>>,
    output: Arc<Mutex<Vec<u8>>>,
    secure: Arc<AtomicBool>,
}

impl MockStream {
    /// Creates a stream that will serve the given server transcript
    pub fn new(server_transcript: &str) -> MockStream {
        MockStream {
            input: Arc::new(Mutex::new(Cursor::new(
                server_transcript.as_bytes().to_vec(),
            ))),
            output: Arc::new(Mutex::new(Vec::new())),
            secure: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Everything the client has written so far
    pub fn written(&self) -> Vec<u8> {
        self.output.lock().unwrap().clone()
    }

    /// Everything the client has written so far, as UTF-8
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// The part of the server transcript the client has not read
    pub fn unread_input(&self) -> Vec<u8> {
        let input = self.input.lock().unwrap();
        input.get_ref()[input.position() as usize..].to_vec()
    }

    /// Tells if the stream pretends to be encrypted
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Relaxed)
    }

    pub(crate) fn set_secure(&self) {
        self.secure.store(true, Ordering::Relaxed);
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.lock().unwrap().read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Socket capability handing out scripted streams, one per connection
pub struct MockSocketFactory {
    streams: Mutex<VecDeque<MockStream>>,
    canonical_hostname: Option<String>,
}

impl MockSocketFactory {
    /// Creates a factory that serves the given streams in order and
    /// reports the given canonical hostname for the local address
    pub fn new<I>(streams: I, canonical_hostname: &str) -> MockSocketFactory
    where
        I: IntoIterator<Item = MockStream>,
    {
        MockSocketFactory {
            streams: Mutex::new(streams.into_iter().collect()),
            canonical_hostname: Some(canonical_hostname.to_owned()),
        }
    }

    /// Like [`MockSocketFactory::new`] but without a canonical hostname,
    /// forcing the address-literal fallback for the HELO name
    pub fn without_hostname<I>(streams: I) -> MockSocketFactory
    where
        I: IntoIterator<Item = MockStream>,
    {
        MockSocketFactory {
            streams: Mutex::new(streams.into_iter().collect()),
            canonical_hostname: None,
        }
    }

    fn next_stream(&self) -> io::Result<MockStream> {
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted stream"))
    }
}

impl SocketFactory for MockSocketFactory {
    fn resolve(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
    }

    fn connect_plain(&self, _addr: SocketAddr, _timeout: Duration) -> io::Result<NetworkStream> {
        Ok(NetworkStream::Mock(self.next_stream()?))
    }

    fn connect_tls(
        &self,
        _addr: SocketAddr,
        _host: &str,
        _timeout: Duration,
        _client_certificate_alias: Option<&str>,
    ) -> Result<NetworkStream, Error> {
        let stream = self.next_stream()?;
        stream.set_secure();
        Ok(NetworkStream::Mock(stream))
    }

    fn start_tls(
        &self,
        stream: NetworkStream,
        _host: &str,
        _client_certificate_alias: Option<&str>,
    ) -> Result<NetworkStream, Error> {
        match stream {
            NetworkStream::Mock(stream) => {
                stream.set_secure();
                Ok(NetworkStream::Mock(stream))
            }
            _ => Err(Error::Protocol(
                "mock factory can only upgrade mock streams".to_owned(),
            )),
        }
    }

    fn canonical_hostname(&self, _local: Option<IpAddr>) -> Option<String> {
        self.canonical_hostname.clone()
    }
}
