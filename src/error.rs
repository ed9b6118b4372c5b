//! Error and result types for the SMTP client

use std::fmt::{self, Display, Formatter};
use std::io;

use crate::response::{Response, Severity};
use crate::status::{self, EnhancedStatusCode};

/// A 4yz or 5yz reply received from the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegativeReply {
    /// Reply severity, derived from the leading digit
    pub severity: Severity,
    /// The 3-digit reply code, when it could be parsed
    pub code: Option<u16>,
    /// Reply text with enhanced status code tokens stripped
    pub text: String,
    /// Enhanced status code, when the server advertised
    /// `ENHANCEDSTATUSCODES` and the reply carried one
    pub enhanced: Option<EnhancedStatusCode>,
}

impl NegativeReply {
    pub(crate) fn from_response(response: Response, enhanced_status_codes: bool) -> NegativeReply {
        let severity = response.severity();
        let code = response.code();
        let (enhanced, text) = if enhanced_status_codes {
            status::split_status_code(response.texts())
        } else {
            (None, response.joined_text())
        };

        NegativeReply {
            severity,
            code,
            text,
            enhanced,
        }
    }

    /// Tells if this is a 5yz reply
    pub fn is_permanent(&self) -> bool {
        self.severity == Severity::PermanentNegative
    }
}

impl Display for NegativeReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} {}", code, self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// Why certificate validation is considered to have failed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CertificateReason {
    /// The TLS handshake itself failed
    Handshake,
    /// STARTTLS is required by the configuration but the server did not
    /// advertise it
    StartTlsNotAdvertised,
    /// Client-certificate authentication is configured but the server did
    /// not offer `AUTH EXTERNAL`; servers commonly hide the mechanism
    /// instead of reporting a rejected certificate
    MissingExternalCapability,
}

impl Display for CertificateReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CertificateReason::Handshake => "TLS handshake failed",
            CertificateReason::StartTlsNotAdvertised => "STARTTLS not available",
            CertificateReason::MissingExternalCapability => "AUTH EXTERNAL not available",
        })
    }
}

/// The errors that may occur while submitting mail
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The server answered a command with a 4yz or 5yz reply
    #[error("negative reply from server: {0}")]
    Reply(NegativeReply),

    /// A reply code 535 was received while authenticating; callers can
    /// use this to ask the user for new credentials
    #[error("{mechanism} authentication failed: {reply}")]
    Authentication {
        /// The SASL exchange that was rejected
        mechanism: &'static str,
        /// The rejecting reply
        reply: NegativeReply,
    },

    /// Certificate validation failed, directly or by implication
    #[error("certificate validation failed: {reason}")]
    CertificateValidation {
        /// What failed
        reason: CertificateReason,
        /// Underlying TLS error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A required SMTP extension was not advertised by the server
    #[error("server does not support {0}")]
    MissingCapability(&'static str),

    /// The client configuration cannot be acted on
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server response could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No resolved address of the server accepted a connection
    #[error("cannot connect to {host}")]
    Connect {
        /// The configured server host
        host: String,
        /// The last connection attempt's error
        #[source]
        source: io::Error,
    },

    /// Network I/O failed mid-session
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// The message exceeds the size limit announced by the server
    #[error("message too large for server ({size} > {limit})")]
    TooLarge {
        /// Computed message size
        size: u64,
        /// Advertised `SIZE` limit
        limit: u64,
    },

    /// Transmission failed for a reason other than a negative reply
    #[error("unable to send message")]
    Send {
        /// True once the body terminator was attempted: the server may
        /// have accepted the message, so a blind retry risks duplication
        possibly_sent: bool,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns true if the failure is permanent and retrying without
    /// reconfiguration is pointless
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Reply(reply) => reply.is_permanent(),
            Error::Authentication { reply, .. } => reply.is_permanent(),
            Error::CertificateValidation { .. }
            | Error::MissingCapability(_)
            | Error::Configuration(_)
            | Error::TooLarge { .. } => true,
            Error::Send {
                possibly_sent,
                source,
            } => *possibly_sent || source.is_permanent(),
            _ => false,
        }
    }

    /// Returns true if the failure is a transient server condition
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Reply(reply) | Error::Authentication { reply, .. } => {
                reply.severity == Severity::TransientNegative
            }
            _ => false,
        }
    }

    /// Returns the server reply code, if the error carries one
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Error::Reply(reply) | Error::Authentication { reply, .. } => reply.code,
            Error::Send { source, .. } => source.reply_code(),
            _ => None,
        }
    }

    /// Returns the enhanced status code, if the error carries one
    pub fn enhanced_status(&self) -> Option<EnhancedStatusCode> {
        match self {
            Error::Reply(reply) | Error::Authentication { reply, .. } => reply.enhanced,
            Error::Send { source, .. } => source.enhanced_status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::response::Response;
    use crate::status::{StatusCodeClass, StatusCodeDetail, StatusCodeSubject};

    #[test]
    fn plain_negative_reply_keeps_code_and_text() {
        let response =
            Response::new(550, vec!["5.1.1 Mailbox unavailable".to_owned()]);
        let reply = NegativeReply::from_response(response, false);

        assert_eq!(reply.code, Some(550));
        assert_eq!(reply.text, "5.1.1 Mailbox unavailable");
        assert_eq!(reply.enhanced, None);
        assert!(reply.is_permanent());
    }

    #[test]
    fn enhanced_negative_reply_parses_status_code() {
        let response =
            Response::new(550, vec!["5.1.1 Mailbox unavailable".to_owned()]);
        let reply = NegativeReply::from_response(response, true);

        let enhanced = reply.enhanced.unwrap();
        assert_eq!(enhanced.class, StatusCodeClass::PermanentFailure);
        assert_eq!(enhanced.subject, StatusCodeSubject::Addressing);
        assert_eq!(
            enhanced.detail_code(),
            Some(StatusCodeDetail::BadDestinationMailboxAddress)
        );
        assert_eq!(reply.text, "Mailbox unavailable");
    }

    #[test]
    fn enhanced_session_without_code_falls_back() {
        let response = Response::new(421, vec!["Temporary system problem".to_owned()]);
        let reply = NegativeReply::from_response(response, true);

        assert_eq!(reply.enhanced, None);
        assert_eq!(reply.text, "Temporary system problem");
        assert!(!reply.is_permanent());
    }

    #[test]
    fn transient_classification() {
        let reply = NegativeReply::from_response(Response::new(451, vec![]), false);
        let error = Error::Reply(reply);

        assert!(error.is_transient());
        assert!(!error.is_permanent());
        assert_eq!(error.reply_code(), Some(451));
    }

    #[test]
    fn send_error_after_terminator_is_permanent() {
        let error = Error::Send {
            possibly_sent: true,
            source: Box::new(Error::Io(std::io::Error::other("broken pipe"))),
        };
        assert!(error.is_permanent());

        let error = Error::Send {
            possibly_sent: false,
            source: Box::new(Error::Io(std::io::Error::other("broken pipe"))),
        };
        assert!(!error.is_permanent());
    }
}
