//! Envelope command sequencing, batched when the server supports it
//!
//! The MAIL FROM / RCPT TO / DATA sequence is modeled as an explicit
//! ordered queue so that pipelined responses can be correlated with their
//! commands by position.

use crate::client::SmtpConnection;
use crate::error::Error;

/// What a queued envelope command is, for response correlation
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
enum CommandKind {
    MailFrom,
    Recipient,
    Data,
}

/// One queued envelope command
#[derive(Clone, Debug)]
pub(crate) struct EnvelopeCommand {
    line: String,
    kind: CommandKind,
}

/// Builds the envelope queue for one transmission
pub(crate) fn build_envelope(mail_from: String, recipients: &[String]) -> Vec<EnvelopeCommand> {
    let mut commands = Vec::with_capacity(recipients.len() + 2);
    commands.push(EnvelopeCommand {
        line: mail_from,
        kind: CommandKind::MailFrom,
    });
    for recipient in recipients {
        commands.push(EnvelopeCommand {
            line: format!("RCPT TO:<{recipient}>"),
            kind: CommandKind::Recipient,
        });
    }
    commands.push(EnvelopeCommand {
        line: "DATA".to_owned(),
        kind: CommandKind::Data,
    });
    commands
}

/// Executes the envelope queue and leaves the connection ready for the
/// message body.
///
/// With pipelining every command is written before any response is read;
/// responses then come back one per command, in order. A rejected
/// recipient is recorded while the remaining responses are still drained,
/// so the connection never desynchronizes; a rejected DATA aborts
/// immediately. When a recipient was rejected but DATA was accepted, the
/// transaction is closed with an empty body terminator before the
/// recorded error is raised.
///
/// Without pipelining the same queue runs one command at a time, failing
/// on the first negative reply.
pub(crate) fn execute(
    conn: &mut SmtpConnection,
    commands: &[EnvelopeCommand],
    pipelining: bool,
) -> Result<(), Error> {
    if !pipelining {
        for command in commands {
            conn.command(&command.line)?;
        }
        return Ok(());
    }

    for command in commands {
        conn.write_line(&command.line, false)?;
    }

    let mut first_error: Option<Error> = None;
    for command in commands {
        match conn.read_checked_response() {
            Ok(_) => {}
            Err(error @ Error::Reply(_)) => {
                if command.kind == CommandKind::Data {
                    return Err(error);
                }
                tracing::debug!("{:?} rejected while pipelining: {error}", command.kind);
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            // I/O and parse failures mean the response stream is gone
            Err(error) => return Err(error),
        }
    }

    match first_error {
        Some(error) => {
            // DATA was accepted, so the transaction has to be closed
            // before the failure can be reported
            if conn.command(".").is_err() {
                tracing::debug!("server rejected the empty message closing the transaction");
            }
            Err(error)
        }
        None => Ok(()),
    }
}
