//! Network streams and the socket capability used to create them

use std::fmt::{self, Debug, Formatter};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};

use crate::client::mock::MockStream;
use crate::error::{CertificateReason, Error};

/// The stream between client and server
pub enum NetworkStream {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// Scripted in-memory stream for tests
    Mock(MockStream),
    /// Placeholder for a stream that was handed off during a TLS upgrade
    Closed,
}

impl NetworkStream {
    /// Tells if the stream is currently encrypted
    pub fn is_encrypted(&self) -> bool {
        match self {
            NetworkStream::Plain(_) | NetworkStream::Closed => false,
            NetworkStream::Tls(_) => true,
            NetworkStream::Mock(stream) => stream.is_secure(),
        }
    }

    /// The local address of the underlying socket, when it has one
    pub fn local_ip(&self) -> Option<IpAddr> {
        match self {
            NetworkStream::Plain(stream) => stream.local_addr().ok().map(|a| a.ip()),
            NetworkStream::Tls(stream) => stream.get_ref().local_addr().ok().map(|a| a.ip()),
            NetworkStream::Mock(_) | NetworkStream::Closed => None,
        }
    }

    /// Sets the read timeout for subsequent reads
    pub fn set_read_timeout(&self, duration: Option<Duration>) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => stream.set_read_timeout(duration),
            NetworkStream::Tls(stream) => stream.get_ref().set_read_timeout(duration),
            NetworkStream::Mock(_) | NetworkStream::Closed => Ok(()),
        }
    }

    /// Best-effort shutdown of both directions
    pub fn shutdown(&self) {
        let _ = match self {
            NetworkStream::Plain(stream) => stream.shutdown(Shutdown::Both),
            NetworkStream::Tls(stream) => stream.get_ref().shutdown(Shutdown::Both),
            NetworkStream::Mock(_) | NetworkStream::Closed => Ok(()),
        };
    }
}

impl Debug for NetworkStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkStream::Plain(_) => "NetworkStream::Plain",
            NetworkStream::Tls(_) => "NetworkStream::Tls",
            NetworkStream::Mock(_) => "NetworkStream::Mock",
            NetworkStream::Closed => "NetworkStream::Closed",
        })
    }
}

impl Read for NetworkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Plain(stream) => stream.read(buf),
            NetworkStream::Tls(stream) => stream.read(buf),
            NetworkStream::Mock(stream) => stream.read(buf),
            NetworkStream::Closed => Ok(0),
        }
    }
}

impl Write for NetworkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Plain(stream) => stream.write(buf),
            NetworkStream::Tls(stream) => stream.write(buf),
            NetworkStream::Mock(stream) => stream.write(buf),
            NetworkStream::Closed => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => stream.flush(),
            NetworkStream::Tls(stream) => stream.flush(),
            NetworkStream::Mock(stream) => stream.flush(),
            NetworkStream::Closed => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

/// Capability for DNS resolution and socket creation
///
/// The connection logic only ever talks to this trait, so address
/// iteration, the STARTTLS upgrade, and the HELO name derivation can all
/// be exercised in tests without opening real sockets.
pub trait SocketFactory: Send + Sync {
    /// Resolves a host and port into candidate socket addresses
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;

    /// Opens a plaintext connection to one address
    fn connect_plain(&self, addr: SocketAddr, timeout: Duration) -> io::Result<NetworkStream>;

    /// Opens a connection that is encrypted from the first byte
    fn connect_tls(
        &self,
        addr: SocketAddr,
        host: &str,
        timeout: Duration,
        client_certificate_alias: Option<&str>,
    ) -> Result<NetworkStream, Error>;

    /// Upgrades an established connection to TLS in place, without
    /// reconnecting
    fn start_tls(
        &self,
        stream: NetworkStream,
        host: &str,
        client_certificate_alias: Option<&str>,
    ) -> Result<NetworkStream, Error>;

    /// The canonical hostname to report for the local address, if one is
    /// known
    fn canonical_hostname(&self, local: Option<IpAddr>) -> Option<String>;
}

/// Default socket capability backed by the operating system resolver and
/// native-tls
pub struct NativeTlsFactory {
    connector: TlsConnector,
}

impl NativeTlsFactory {
    /// Creates the factory with a default TLS configuration
    pub fn new() -> Result<NativeTlsFactory, Error> {
        let connector = TlsConnector::builder().build().map_err(tls_error)?;
        Ok(NativeTlsFactory { connector })
    }

    /// Creates the factory from a prepared connector, e.g. one carrying a
    /// client identity
    pub fn with_connector(connector: TlsConnector) -> NativeTlsFactory {
        NativeTlsFactory { connector }
    }
}

impl SocketFactory for NativeTlsFactory {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }

    fn connect_plain(&self, addr: SocketAddr, timeout: Duration) -> io::Result<NetworkStream> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Ok(NetworkStream::Plain(stream))
    }

    fn connect_tls(
        &self,
        addr: SocketAddr,
        host: &str,
        timeout: Duration,
        _client_certificate_alias: Option<&str>,
    ) -> Result<NetworkStream, Error> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        let stream = self.connector.connect(host, stream).map_err(tls_error)?;
        Ok(NetworkStream::Tls(Box::new(stream)))
    }

    fn start_tls(
        &self,
        stream: NetworkStream,
        host: &str,
        _client_certificate_alias: Option<&str>,
    ) -> Result<NetworkStream, Error> {
        match stream {
            NetworkStream::Plain(stream) => {
                let stream = self.connector.connect(host, stream).map_err(tls_error)?;
                Ok(NetworkStream::Tls(Box::new(stream)))
            }
            already_tls @ NetworkStream::Tls(_) => Ok(already_tls),
            NetworkStream::Mock(_) | NetworkStream::Closed => Err(Error::Protocol(
                "stream cannot be upgraded to TLS".to_owned(),
            )),
        }
    }

    fn canonical_hostname(&self, _local: Option<IpAddr>) -> Option<String> {
        hostname::get().ok().and_then(|name| name.into_string().ok())
    }
}

fn tls_error<E>(error: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::CertificateValidation {
        reason: CertificateReason::Handshake,
        source: Some(Box::new(error)),
    }
}
