//! The envoyer crate sends email over the SMTP submission protocol.
//!
//! This client follows [RFC 5321](https://tools.ietf.org/html/rfc5321)
//! and is designed to submit messages from an application to its
//! configured relay server, not to deliver directly to destination
//! hosts. It implements the following extensions:
//!
//! * STARTTLS ([RFC 2487](https://tools.ietf.org/html/rfc2487))
//! * AUTH ([RFC 4954](https://tools.ietf.org/html/rfc4954)) with the
//!   PLAIN, LOGIN, CRAM-MD5, EXTERNAL and XOAUTH2 mechanisms
//! * PIPELINING ([RFC 2920](https://tools.ietf.org/html/rfc2920))
//! * 8BITMIME ([RFC 6152](https://tools.ietf.org/html/rfc6152))
//! * Enhanced status codes ([RFC 2034](https://tools.ietf.org/html/rfc2034),
//!   [RFC 3463](https://tools.ietf.org/html/rfc3463)), surfaced on every
//!   classified error so callers can tell retryable failures from
//!   permanent ones
//!
//! Message building, token refresh, and socket/TLS policy stay outside
//! the crate, behind the [`OutgoingMessage`], [`OAuth2TokenProvider`](auth::OAuth2TokenProvider)
//! and [`SocketFactory`](client::net::SocketFactory) traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::io::{self, Write};
//!
//! use envoyer::{OutgoingMessage, ServerSettings, SmtpTransport};
//!
//! struct Note;
//!
//! impl OutgoingMessage for Note {
//!     fn from_address(&self) -> &str {
//!         "alice@example.com"
//!     }
//!
//!     fn recipients(&self) -> Vec<String> {
//!         vec!["bob@example.org".to_owned()]
//!     }
//!
//!     fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
//!         out.write_all(b"Subject: hello\r\n\r\nbe happy!\r\n")
//!     }
//! }
//!
//! # fn main() -> Result<(), envoyer::Error> {
//! let settings =
//!     ServerSettings::from_uri("smtp+tls+://alice:secret:PLAIN@mail.example.com:587")?;
//! let mut transport = SmtpTransport::new(settings)?;
//! transport.send_message(&mut Note)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod error;
pub mod extension;
pub mod response;
pub mod settings;
pub mod status;
pub mod transport;

pub use crate::error::Error;
pub use crate::settings::{AuthType, ConnectionSecurity, ServerSettings};
pub use crate::transport::{OutgoingMessage, SmtpTransport};

// Registered port numbers:
// https://www.iana.org/assignments/service-names-port-numbers/service-names-port-numbers.xhtml

/// Default SMTP relay port
pub const SMTP_PORT: u16 = 25;
/// Default submission port
pub const SUBMISSION_PORT: u16 = 587;
/// Default submission-over-TLS port
///
/// <https://tools.ietf.org/html/rfc8314>
pub const SUBMISSIONS_PORT: u16 = 465;
