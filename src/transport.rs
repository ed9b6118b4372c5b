//! The transport facade tying connection, envelope, and body together

use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use crate::auth::OAuth2TokenProvider;
use crate::client::codec::{
    DotStuffingWriter, EolNormalizingWriter, LineWrapWriter, MAX_LINE_LENGTH,
};
use crate::client::net::{NativeTlsFactory, SocketFactory};
use crate::client::{pipeline, SmtpConnection, DATA_READ_TIMEOUT};
use crate::error::Error;
use crate::settings::ServerSettings;

/// A message ready for submission
///
/// The transport neither builds nor inspects message content; it only
/// needs the envelope data and a way to stream the bytes.
pub trait OutgoingMessage {
    /// The envelope sender address
    fn from_address(&self) -> &str;

    /// All recipient addresses, already resolved to plain address
    /// strings (To, Cc, and Bcc alike)
    fn recipients(&self) -> Vec<String>;

    /// Whether the message carries attachments; gates the size check
    fn has_attachments(&self) -> bool {
        false
    }

    /// The size of the serialized message in octets
    fn size(&self) -> u64 {
        0
    }

    /// Re-encodes the message for the given charset before a
    /// transmission to recipients that need it
    fn set_charset(&mut self, _charset: &str) {}

    /// Streams the serialized message
    fn write_to(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Transport for submitting messages to one configured server
///
/// Every transmission opens a fresh connection and unconditionally closes
/// it afterwards. A transport runs one operation at a time; callers that
/// need concurrent submissions use independent transports.
pub struct SmtpTransport {
    settings: ServerSettings,
    socket_factory: Arc<dyn SocketFactory>,
    token_provider: Option<Arc<dyn OAuth2TokenProvider>>,
}

impl SmtpTransport {
    /// Creates a transport using the operating system resolver and
    /// native TLS
    pub fn new(settings: ServerSettings) -> Result<SmtpTransport, Error> {
        Ok(SmtpTransport::with_factory(
            settings,
            Arc::new(NativeTlsFactory::new()?),
            None,
        ))
    }

    /// Creates a transport with a custom socket capability and an
    /// optional OAuth 2.0 token provider
    pub fn with_factory(
        settings: ServerSettings,
        socket_factory: Arc<dyn SocketFactory>,
        token_provider: Option<Arc<dyn OAuth2TokenProvider>>,
    ) -> SmtpTransport {
        SmtpTransport {
            settings,
            socket_factory,
            token_provider,
        }
    }

    /// Sets the token provider used for XOAUTH2
    pub fn token_provider(mut self, provider: Arc<dyn OAuth2TokenProvider>) -> SmtpTransport {
        self.token_provider = Some(provider);
        self
    }

    /// Submits a message to all of its recipients.
    ///
    /// Recipients are grouped by the charset needed to represent their
    /// address; each group gets its own connection and full
    /// transmission, since one envelope cannot mix charset declarations.
    /// A message without recipients is a no-op.
    pub fn send_message(&mut self, message: &mut dyn OutgoingMessage) -> Result<(), Error> {
        let recipients = dedup(message.recipients());
        if recipients.is_empty() {
            tracing::debug!("message has no recipients, nothing to send");
            return Ok(());
        }

        for (charset, group) in group_by_charset(recipients) {
            message.set_charset(charset);
            self.send_to(&group, message)?;
        }
        Ok(())
    }

    /// Opens and immediately closes a session, verifying that the
    /// settings can produce a working, authenticated connection
    pub fn check_settings(&mut self) -> Result<(), Error> {
        let mut conn = self.open()?;
        conn.close();
        Ok(())
    }

    fn open(&self) -> Result<SmtpConnection, Error> {
        SmtpConnection::open(
            &self.settings,
            self.socket_factory.as_ref(),
            self.token_provider.as_deref(),
        )
    }

    fn send_to(
        &mut self,
        recipients: &[String],
        message: &mut dyn OutgoingMessage,
    ) -> Result<(), Error> {
        let mut conn = self.open()?;

        // When the server announced a limit and the message has
        // attachments, size it up front instead of wasting a full-body
        // upload on a guaranteed rejection
        if let Some(limit) = conn.session().size_limit {
            if message.has_attachments() && message.size() > limit {
                conn.close();
                return Err(Error::TooLarge {
                    size: message.size(),
                    limit,
                });
            }
        }

        let mut terminator_attempted = false;
        let result = transmit(&mut conn, recipients, message, &mut terminator_attempted);
        conn.close();

        result.map_err(|error| match error {
            reply @ Error::Reply(_) => reply,
            other => Error::Send {
                possibly_sent: terminator_attempted,
                source: Box::new(other),
            },
        })
    }
}

fn transmit(
    conn: &mut SmtpConnection,
    recipients: &[String],
    message: &dyn OutgoingMessage,
    terminator_attempted: &mut bool,
) -> Result<(), Error> {
    let session = *conn.session();

    let mail_from = build_mail_from(message.from_address(), session.eight_bit_mime);
    let commands = pipeline::build_envelope(mail_from, recipients);
    pipeline::execute(conn, &commands, session.pipelining)?;

    // Large messages can make the reply to the terminator slow to arrive
    conn.set_read_timeout(DATA_READ_TIMEOUT)?;

    {
        let buffered = BufWriter::with_capacity(1024, conn.body_writer());
        let mut body = EolNormalizingWriter::new(LineWrapWriter::new(
            DotStuffingWriter::new(buffered),
            MAX_LINE_LENGTH,
        ));
        message.write_to(&mut body)?;
        body.end_with_crlf_and_flush()?;
    }

    // From here on the server may already have accepted the message
    *terminator_attempted = true;
    conn.command(".")?;
    Ok(())
}

fn build_mail_from(from: &str, eight_bit_mime: bool) -> String {
    if eight_bit_mime {
        format!("MAIL FROM:<{from}> BODY=8BITMIME")
    } else {
        tracing::debug!("server does not support 8-bit transfer encoding");
        format!("MAIL FROM:<{from}>")
    }
}

/// The charset needed to represent an address on the wire
fn charset_for_address(address: &str) -> &'static str {
    if address.is_ascii() {
        "US-ASCII"
    } else {
        "UTF-8"
    }
}

fn dedup(recipients: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if !seen.contains(&recipient) {
            seen.push(recipient);
        }
    }
    seen
}

/// Groups recipients by required charset, preserving first-seen order of
/// both groups and members
fn group_by_charset(recipients: Vec<String>) -> Vec<(&'static str, Vec<String>)> {
    let mut groups: Vec<(&'static str, Vec<String>)> = Vec::new();
    for recipient in recipients {
        let charset = charset_for_address(&recipient);
        match groups.iter_mut().find(|(c, _)| *c == charset) {
            Some((_, group)) => group.push(recipient),
            None => groups.push((charset, vec![recipient])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mail_from_appends_body_parameter_only_with_8bitmime() {
        assert_eq!(
            build_mail_from("user@example.com", true),
            "MAIL FROM:<user@example.com> BODY=8BITMIME"
        );
        assert_eq!(
            build_mail_from("user@example.com", false),
            "MAIL FROM:<user@example.com>"
        );
    }

    #[test]
    fn ascii_addresses_need_no_unicode_charset() {
        assert_eq!(charset_for_address("user@example.com"), "US-ASCII");
        assert_eq!(charset_for_address("jörg@example.com"), "UTF-8");
        assert_eq!(charset_for_address("user@bücher.example"), "UTF-8");
    }

    #[test]
    fn duplicate_recipients_are_sent_once() {
        let recipients = dedup(vec![
            "a@example.com".to_owned(),
            "b@example.com".to_owned(),
            "a@example.com".to_owned(),
        ]);
        assert_eq!(
            recipients,
            vec!["a@example.com".to_owned(), "b@example.com".to_owned()]
        );
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let groups = group_by_charset(vec![
            "a@example.com".to_owned(),
            "jörg@example.com".to_owned(),
            "b@example.com".to_owned(),
        ]);

        assert_eq!(
            groups,
            vec![
                (
                    "US-ASCII",
                    vec!["a@example.com".to_owned(), "b@example.com".to_owned()]
                ),
                ("UTF-8", vec!["jörg@example.com".to_owned()]),
            ]
        );
    }
}
