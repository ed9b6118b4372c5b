//! SMTP client connection
//!
//! [`SmtpConnection`] owns the socket for exactly one session: it is
//! created by a successful open and torn down when the session ends,
//! never reused across transmissions. It provides the line-oriented
//! command channel, EHLO/HELO negotiation, and the STARTTLS upgrade.

use std::io::{self, BufRead, BufReader, Write};
use std::net::IpAddr;
use std::time::Duration;

use crate::auth::{self, OAuth2TokenProvider};
use crate::error::{CertificateReason, Error, NegativeReply};
use crate::extension::Capabilities;
use crate::response::Response;
use crate::settings::{ConnectionSecurity, ServerSettings};

pub mod codec;
pub mod mock;
pub mod net;
pub(crate) mod pipeline;

use self::net::{NetworkStream, SocketFactory};

/// Timeout for each connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for reads during the session
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Extended read timeout while waiting for the final reply to a message
/// body, which large messages can make slow to produce
pub(crate) const DATA_READ_TIMEOUT: Duration = Duration::from_secs(300);

// Last-resort EHLO identity when no usable local address or hostname is
// available
const FALLBACK_HELO_NAME: &str = "android";

/// Per-session state derived from the most recent EHLO response
///
/// Only valid between a successful open and the following close; a new
/// session starts from defaults because the server behind the same
/// settings may have changed.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Session {
    pub eight_bit_mime: bool,
    pub enhanced_status_codes: bool,
    pub pipelining: bool,
    pub size_limit: Option<u64>,
    pub encrypted: bool,
}

/// An open connection to the server
pub(crate) struct SmtpConnection {
    stream: BufReader<NetworkStream>,
    session: Session,
}

impl SmtpConnection {
    fn from_stream(stream: NetworkStream) -> SmtpConnection {
        SmtpConnection {
            stream: BufReader::with_capacity(1024, stream),
            session: Session::default(),
        }
    }

    /// Connects, negotiates capabilities and encryption, and
    /// authenticates, returning a connection that is ready for an
    /// envelope.
    pub(crate) fn open(
        settings: &ServerSettings,
        factory: &dyn SocketFactory,
        token_provider: Option<&dyn OAuth2TokenProvider>,
    ) -> Result<SmtpConnection, Error> {
        let stream = connect(settings, factory)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let local_ip = stream.local_ip();
        let mut conn = SmtpConnection::from_stream(stream);

        // Greeting; its content is ignored unless it is itself negative
        conn.read_checked_response()?;

        let helo_name = build_helo_name(local_ip, factory.canonical_hostname(local_ip).as_deref());
        let mut capabilities = conn.hello(&helo_name)?;

        if settings.connection_security == ConnectionSecurity::StartTlsRequired {
            if capabilities.contains("STARTTLS") {
                conn.command("STARTTLS")?;
                conn.upgrade_tls(
                    factory,
                    &settings.host,
                    settings.client_certificate_alias.as_deref(),
                )?;
                // RFC 2487 section 5.2: the EHLO must be resent on the
                // encrypted channel, and the extension set may differ
                capabilities = conn.hello(&helo_name)?;
            } else {
                // A client configured to require STARTTLS must not fall
                // back to plaintext; this is surfaced like a certificate
                // problem so the account setup gets reviewed.
                return Err(Error::CertificateValidation {
                    reason: CertificateReason::StartTlsNotAdvertised,
                    source: None,
                });
            }
        }

        conn.session.encrypted = conn.stream.get_ref().is_encrypted();
        let encrypted = conn.session.encrypted;

        auth::authenticate(&mut conn, settings, &capabilities, encrypted, token_provider)?;

        Ok(conn)
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    /// Writes a command and reads its response, raising classified
    /// errors on negative replies
    pub(crate) fn command(&mut self, command: &str) -> Result<Response, Error> {
        self.execute(command, false)
    }

    /// Like [`SmtpConnection::command`], but the command is redacted from
    /// the log
    pub(crate) fn sensitive_command(&mut self, command: &str) -> Result<Response, Error> {
        self.execute(command, true)
    }

    fn execute(&mut self, command: &str, sensitive: bool) -> Result<Response, Error> {
        self.write_line(command, sensitive)?;
        self.read_checked_response()
    }

    /// Writes one command line.
    ///
    /// The command and its CRLF go out in a single write: some servers
    /// misbehave when CR and LF arrive in separate TCP segments.
    pub(crate) fn write_line(&mut self, command: &str, sensitive: bool) -> Result<(), Error> {
        if sensitive {
            tracing::debug!("SMTP >>> *sensitive*");
        } else {
            tracing::debug!("SMTP >>> {command}");
        }

        let mut data = Vec::with_capacity(command.len() + 2);
        data.extend_from_slice(command.as_bytes());
        data.extend_from_slice(b"\r\n");

        let stream = self.stream.get_mut();
        stream.write_all(&data)?;
        stream.flush()?;
        Ok(())
    }

    /// Reads one complete response, raising a classified error when it is
    /// negative
    pub(crate) fn read_checked_response(&mut self) -> Result<Response, Error> {
        let response = self.read_response()?;
        if response.is_negative() {
            Err(Error::Reply(NegativeReply::from_response(
                response,
                self.session.enhanced_status_codes,
            )))
        } else {
            Ok(response)
        }
    }

    /// Reads response lines until the final one of the reply.
    ///
    /// Lines at least 4 characters long contribute their suffix to the
    /// response text; a 4th character other than `-` marks the final
    /// line. Shorter lines can only be a bare reply code and end the
    /// response as well.
    fn read_response(&mut self) -> Result<Response, Error> {
        let mut texts = Vec::new();
        let mut line = self.read_line()?;

        while line.len() >= 4 {
            match line.get(4..) {
                Some(text) => {
                    if !text.is_empty() {
                        texts.push(text.to_owned());
                    }
                }
                // 4-byte prefix straddles a code point; nothing sane can
                // follow
                None => break,
            }
            if line.as_bytes()[3] != b'-' {
                break;
            }
            line = self.read_line()?;
        }

        Response::from_final_line(&line, texts)
            .ok_or_else(|| Error::Protocol("zero-length server response".to_owned()))
    }

    fn read_line(&mut self) -> Result<String, Error> {
        let mut buf = Vec::with_capacity(100);
        self.stream.read_until(b'\n', &mut buf)?;
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        buf.retain(|&byte| byte != b'\r');

        let line = String::from_utf8_lossy(&buf).into_owned();
        tracing::debug!("SMTP <<< {line}");
        Ok(line)
    }

    /// Sends EHLO, falling back to HELO on a negative reply.
    ///
    /// A server rejecting both is assumed to simply predate extensions;
    /// the session continues with an empty capability map.
    fn hello(&mut self, helo_name: &str) -> Result<Capabilities, Error> {
        let capabilities = match self.command(&format!("EHLO {helo_name}")) {
            Ok(response) => Capabilities::from_ehlo_response(&response),
            Err(Error::Reply(_)) => {
                tracing::debug!("server doesn't support the EHLO command, trying HELO");
                match self.command(&format!("HELO {helo_name}")) {
                    Ok(_) => {}
                    Err(Error::Reply(_)) => {
                        tracing::warn!(
                            "server doesn't support the HELO command, continuing anyway"
                        );
                    }
                    Err(other) => return Err(other),
                }
                Capabilities::default()
            }
            Err(other) => return Err(other),
        };

        self.apply_capabilities(&capabilities);
        Ok(capabilities)
    }

    fn apply_capabilities(&mut self, capabilities: &Capabilities) {
        self.session.eight_bit_mime = capabilities.contains("8BITMIME");
        self.session.enhanced_status_codes = capabilities.contains("ENHANCEDSTATUSCODES");
        self.session.pipelining = capabilities.contains("PIPELINING");
        self.session.size_limit = capabilities.size_limit();
    }

    fn upgrade_tls(
        &mut self,
        factory: &dyn SocketFactory,
        host: &str,
        client_certificate_alias: Option<&str>,
    ) -> Result<(), Error> {
        // The reader is rebuilt from scratch so no plaintext buffer
        // survives into the encrypted session
        let plain = std::mem::replace(
            &mut self.stream,
            BufReader::new(NetworkStream::Closed),
        )
        .into_inner();
        let encrypted = factory.start_tls(plain, host, client_certificate_alias)?;
        self.stream = BufReader::with_capacity(1024, encrypted);
        Ok(())
    }

    /// The raw stream, for streaming a message body
    pub(crate) fn body_writer(&mut self) -> &mut NetworkStream {
        self.stream.get_mut()
    }

    pub(crate) fn set_read_timeout(&self, duration: Duration) -> Result<(), Error> {
        self.stream.get_ref().set_read_timeout(Some(duration))?;
        Ok(())
    }

    /// Best-effort teardown; never fails.
    ///
    /// QUIT is written without waiting for a reply, then the socket is
    /// shut down. Each step's failure is ignored independently.
    pub(crate) fn close(&mut self) {
        let _ = self.write_line("QUIT", false);
        self.stream.get_ref().shutdown();
    }
}

/// Derives the hostname to report in EHLO/HELO.
///
/// Uses the canonical hostname of the local address unless it is empty,
/// equal to the raw IP, or contains `_`; in those cases the bracketed
/// IPv6 literal, the bracketed IPv4 literal, or the fallback name is
/// substituted, in that order.
fn build_helo_name(local: Option<IpAddr>, canonical: Option<&str>) -> String {
    let canonical = canonical.unwrap_or("");
    let ip = local.map(|addr| addr.to_string());

    let usable = !canonical.is_empty()
        && Some(canonical) != ip.as_deref()
        && !canonical.contains('_');
    if usable {
        return canonical.to_owned();
    }

    match local {
        Some(addr @ IpAddr::V6(_)) => format!("[IPv6:{addr}]"),
        Some(addr) => format!("[{addr}]"),
        None => FALLBACK_HELO_NAME.to_owned(),
    }
}

fn connect(settings: &ServerSettings, factory: &dyn SocketFactory) -> Result<NetworkStream, Error> {
    let addresses = factory
        .resolve(&settings.host, settings.port)
        .map_err(|e| Error::Connect {
            host: settings.host.clone(),
            source: e,
        })?;

    let mut last_error: Option<io::Error> = None;
    for addr in addresses {
        tracing::debug!("connecting to {} as {}", settings.host, addr);

        let attempt = match settings.connection_security {
            ConnectionSecurity::SslTlsRequired => factory.connect_tls(
                addr,
                &settings.host,
                CONNECT_TIMEOUT,
                settings.client_certificate_alias.as_deref(),
            ),
            _ => factory.connect_plain(addr, CONNECT_TIMEOUT).map_err(Error::Io),
        };

        match attempt {
            Ok(stream) => return Ok(stream),
            Err(Error::Io(e)) => {
                tracing::warn!("could not connect to {addr}: {e}");
                last_error = Some(e);
            }
            // TLS and certificate failures are not resolved by trying
            // another address
            Err(fatal) => return Err(fatal),
        }
    }

    Err(Error::Connect {
        host: settings.host.clone(),
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::mock::MockStream;
    use super::*;

    fn connection(transcript: &str) -> (SmtpConnection, MockStream) {
        let stream = MockStream::new(transcript);
        let conn = SmtpConnection::from_stream(NetworkStream::Mock(stream.clone()));
        (conn, stream)
    }

    #[test]
    fn accumulates_multiline_response() {
        let (mut conn, _) = connection("250-localhost greets you\r\n250-SIZE 1000\r\n250 AUTH PLAIN\r\n");
        let response = conn.read_checked_response().unwrap();

        assert_eq!(response.code(), Some(250));
        assert_eq!(
            response.texts(),
            &[
                "localhost greets you".to_owned(),
                "SIZE 1000".to_owned(),
                "AUTH PLAIN".to_owned(),
            ]
        );
    }

    #[test]
    fn bare_code_lines_are_accepted() {
        let (mut conn, _) = connection("250\r\n");
        let response = conn.read_checked_response().unwrap();
        assert_eq!(response.code(), Some(250));
        assert_eq!(response.texts(), &[] as &[String]);
    }

    #[test]
    fn negative_reply_is_classified() {
        let (mut conn, _) = connection("550 5.1.1 User unknown\r\n");
        match conn.read_checked_response() {
            Err(Error::Reply(reply)) => {
                assert_eq!(reply.code, Some(550));
                assert_eq!(reply.text, "5.1.1 User unknown");
                assert_eq!(reply.enhanced, None);
                assert!(reply.is_permanent());
            }
            other => panic!("expected negative reply, got {other:?}"),
        }
    }

    #[test]
    fn negative_reply_parses_enhanced_code_when_advertised() {
        let (mut conn, _) = connection("550 5.1.1 User unknown\r\n");
        conn.session.enhanced_status_codes = true;

        match conn.read_checked_response() {
            Err(Error::Reply(reply)) => {
                assert_eq!(reply.text, "User unknown");
                assert_eq!(reply.enhanced.unwrap().to_string(), "5.1.1");
            }
            other => panic!("expected negative reply, got {other:?}"),
        }
    }

    #[test]
    fn empty_response_is_a_protocol_error() {
        let (mut conn, _) = connection("");
        assert!(matches!(
            conn.read_checked_response(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn ehlo_populates_capabilities_and_session() {
        let (mut conn, stream) = connection(
            "250-localhost Hello\r\n250-8BITMIME\r\n250-PIPELINING\r\n250-ENHANCEDSTATUSCODES\r\n250 SIZE 1000\r\n",
        );
        let capabilities = conn.hello("client.example").unwrap();

        assert_eq!(stream.written_string(), "EHLO client.example\r\n");
        assert!(capabilities.contains("8BITMIME"));
        assert!(conn.session.eight_bit_mime);
        assert!(conn.session.pipelining);
        assert!(conn.session.enhanced_status_codes);
        assert_eq!(conn.session.size_limit, Some(1000));
    }

    #[test]
    fn ehlo_falls_back_to_helo_once() {
        let (mut conn, stream) =
            connection("502 5.5.1 unrecognized command\r\n250 localhost\r\n");
        let capabilities = conn.hello("client.example").unwrap();

        assert_eq!(
            stream.written_string(),
            "EHLO client.example\r\nHELO client.example\r\n"
        );
        assert_eq!(capabilities, Capabilities::default());
    }

    #[test]
    fn rejected_helo_is_not_fatal() {
        let (mut conn, stream) =
            connection("502 unrecognized\r\n502 still unrecognized\r\n");
        let capabilities = conn.hello("client.example").unwrap();

        assert_eq!(
            stream.written_string(),
            "EHLO client.example\r\nHELO client.example\r\n"
        );
        assert_eq!(capabilities, Capabilities::default());
        assert_eq!(stream.unread_input(), b"");
    }

    #[test]
    fn ehlo_after_negotiation_replaces_capability_flags() {
        let (mut conn, _) = connection(
            "250-localhost\r\n250 PIPELINING\r\n250-localhost\r\n250 8BITMIME\r\n",
        );
        conn.hello("client.example").unwrap();
        assert!(conn.session.pipelining);
        assert!(!conn.session.eight_bit_mime);

        conn.hello("client.example").unwrap();
        assert!(!conn.session.pipelining);
        assert!(conn.session.eight_bit_mime);
    }

    #[test]
    fn close_never_panics_and_writes_quit() {
        let (mut conn, stream) = connection("");
        conn.close();
        assert_eq!(stream.written_string(), "QUIT\r\n");
    }

    #[test]
    fn helo_name_prefers_canonical_hostname() {
        let local = Some("192.0.2.1".parse().unwrap());
        assert_eq!(
            build_helo_name(local, Some("client.example.org")),
            "client.example.org"
        );
    }

    #[test]
    fn helo_name_falls_back_to_bracketed_ip() {
        let v4 = Some("192.0.2.1".parse().unwrap());
        assert_eq!(build_helo_name(v4, Some("")), "[192.0.2.1]");
        assert_eq!(build_helo_name(v4, Some("192.0.2.1")), "[192.0.2.1]");
        assert_eq!(build_helo_name(v4, Some("host_name")), "[192.0.2.1]");
        assert_eq!(build_helo_name(v4, None), "[192.0.2.1]");

        let v6 = Some("2001:db8::1".parse().unwrap());
        assert_eq!(build_helo_name(v6, Some("bad_host")), "[IPv6:2001:db8::1]");
    }

    #[test]
    fn helo_name_last_resort_is_fixed() {
        assert_eq!(build_helo_name(None, None), FALLBACK_HELO_NAME);
        assert_eq!(build_helo_name(None, Some("under_score")), FALLBACK_HELO_NAME);
    }
}
