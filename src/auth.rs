//! SASL authentication mechanisms for the submission session
//!
//! Mechanism selection happens once per open, driven by the configured
//! [`AuthType`](crate::settings::AuthType) and the server's advertised
//! `AUTH` parameter. Each mechanism is an independent exchange with its
//! own failure modes; a reply code 535 from any of them is surfaced as
//! [`Error::Authentication`] so callers can prompt for new credentials.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::client::SmtpConnection;
use crate::error::{CertificateReason, Error};
use crate::extension::Capabilities;
use crate::settings::{AuthType, ServerSettings};

const SMTP_CONTINUE_REQUEST: u16 = 334;
const SMTP_AUTHENTICATION_FAILURE: u16 = 535;

/// How long a token provider may take to produce a token
pub const OAUTH2_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of OAuth 2.0 bearer tokens for XOAUTH2
///
/// Token acquisition and refresh live outside this crate; the engine only
/// asks for the current token and reports back when the server rejected
/// it.
pub trait OAuth2TokenProvider: Send + Sync {
    /// Returns a bearer token for the user, fetching a fresh one if none
    /// is cached
    fn token(&self, username: &str, timeout: Duration) -> Result<String, Error>;

    /// Discards the cached token after the server rejected it
    fn invalidate_token(&self, username: &str);
}

/// Runs the authentication exchange selected by the settings.
///
/// Does nothing unless a username is configured and a password is
/// present or the mechanism does not need one (EXTERNAL, XOAUTH2).
pub(crate) fn authenticate(
    conn: &mut SmtpConnection,
    settings: &ServerSettings,
    capabilities: &Capabilities,
    encrypted: bool,
    token_provider: Option<&dyn OAuth2TokenProvider>,
) -> Result<(), Error> {
    let username = match settings.username.as_deref() {
        Some(username) => username,
        None => return Ok(()),
    };
    let auth_type = settings.authentication_type;
    if settings.password.is_none()
        && auth_type != AuthType::External
        && auth_type != AuthType::Xoauth2
    {
        return Ok(());
    }
    let password = settings.password.as_deref().unwrap_or_default();

    match auth_type {
        // LOGIN is an obsolete choice kept for imported settings; both it
        // and PLAIN prefer the PLAIN mechanism for its explicit UTF-8
        // support.
        AuthType::Plain | AuthType::Login => {
            if capabilities.supports_auth("PLAIN") {
                sasl_plain(conn, username, password)
            } else if capabilities.supports_auth("LOGIN") {
                sasl_login(conn, username, password)
            } else {
                Err(Error::MissingCapability("AUTH PLAIN"))
            }
        }
        AuthType::CramMd5 => {
            if capabilities.supports_auth("CRAM-MD5") {
                sasl_cram_md5(conn, username, password)
            } else {
                Err(Error::MissingCapability("AUTH CRAM-MD5"))
            }
        }
        AuthType::External => {
            if capabilities.supports_auth("EXTERNAL") {
                sasl_external(conn, username)
            } else {
                // Some servers provide no error indication when a client
                // certificate fails to validate, other than not offering
                // AUTH EXTERNAL.
                Err(Error::CertificateValidation {
                    reason: CertificateReason::MissingExternalCapability,
                    source: None,
                })
            }
        }
        AuthType::Xoauth2 => match token_provider {
            Some(provider) if capabilities.supports_auth("XOAUTH2") => {
                sasl_xoauth2(conn, username, &settings.host, provider)
            }
            Some(_) => Err(Error::MissingCapability("AUTH XOAUTH2")),
            None => Err(Error::Configuration(
                "no OAuth 2.0 token provider configured".to_owned(),
            )),
        },
        // AUTOMATIC is an obsolete choice kept for imported settings.
        AuthType::Automatic => {
            if encrypted {
                if capabilities.supports_auth("PLAIN") {
                    sasl_plain(conn, username, password)
                } else if capabilities.supports_auth("LOGIN") {
                    sasl_login(conn, username, password)
                } else if capabilities.supports_auth("CRAM-MD5") {
                    sasl_cram_md5(conn, username, password)
                } else {
                    Err(Error::MissingCapability("AUTH"))
                }
            } else if capabilities.supports_auth("CRAM-MD5") {
                sasl_cram_md5(conn, username, password)
            } else {
                // Passwords are never sent in the clear under AUTOMATIC;
                // affected accounts must pick an explicit setting.
                Err(Error::Configuration(
                    "AUTOMATIC authentication is unavailable on unencrypted connections; \
                     update the outgoing server authentication setting"
                        .to_owned(),
                ))
            }
        }
    }
}

fn sasl_plain(conn: &mut SmtpConnection, username: &str, password: &str) -> Result<(), Error> {
    let payload = BASE64.encode(format!("\u{0}{username}\u{0}{password}"));
    conn.sensitive_command(&format!("AUTH PLAIN {payload}"))
        .map(drop)
        .map_err(|e| into_auth_failure("AUTH PLAIN", e))
}

fn sasl_login(conn: &mut SmtpConnection, username: &str, password: &str) -> Result<(), Error> {
    let exchange = |conn: &mut SmtpConnection| -> Result<(), Error> {
        conn.command("AUTH LOGIN")?;
        conn.sensitive_command(&BASE64.encode(username))?;
        conn.sensitive_command(&BASE64.encode(password))?;
        Ok(())
    };
    exchange(conn).map_err(|e| into_auth_failure("AUTH LOGIN", e))
}

fn sasl_cram_md5(conn: &mut SmtpConnection, username: &str, password: &str) -> Result<(), Error> {
    let response = conn.command("AUTH CRAM-MD5")?;
    let nonce = match response.texts() {
        [nonce] => nonce,
        _ => {
            return Err(Error::Protocol(
                "unable to negotiate CRAM-MD5".to_owned(),
            ))
        }
    };

    let digest = compute_cram_md5(username, password, nonce)?;
    conn.sensitive_command(&digest)
        .map(drop)
        .map_err(|e| into_auth_failure("AUTH CRAM-MD5", e))
}

fn sasl_external(conn: &mut SmtpConnection, username: &str) -> Result<(), Error> {
    conn.command(&format!("AUTH EXTERNAL {}", BASE64.encode(username)))
        .map(drop)
}

fn sasl_xoauth2(
    conn: &mut SmtpConnection,
    username: &str,
    host: &str,
    provider: &dyn OAuth2TokenProvider,
) -> Result<(), Error> {
    let mut retry_with_new_token = true;
    match attempt_xoauth2(conn, username, host, provider, &mut retry_with_new_token) {
        Err(Error::Reply(reply)) if reply.code == Some(SMTP_AUTHENTICATION_FAILURE) => {
            provider.invalidate_token(username);

            if !retry_with_new_token {
                Err(Error::Authentication {
                    mechanism: "AUTH XOAUTH2",
                    reply,
                })
            } else {
                // The token may simply have expired; there is no way to
                // know before using it, so one retry with a fresh token.
                tracing::debug!("XOAUTH2 rejected, retrying with a new token");
                match attempt_xoauth2(conn, username, host, provider, &mut retry_with_new_token) {
                    Err(Error::Reply(reply))
                        if reply.code == Some(SMTP_AUTHENTICATION_FAILURE) =>
                    {
                        provider.invalidate_token(username);
                        Err(Error::Authentication {
                            mechanism: "AUTH XOAUTH2",
                            reply,
                        })
                    }
                    other => other,
                }
            }
        }
        other => other,
    }
}

fn attempt_xoauth2(
    conn: &mut SmtpConnection,
    username: &str,
    host: &str,
    provider: &dyn OAuth2TokenProvider,
    retry_with_new_token: &mut bool,
) -> Result<(), Error> {
    let token = provider.token(username, OAUTH2_TIMEOUT)?;
    let initial = xoauth2_initial_response(username, &token);
    let response = conn.sensitive_command(&format!("AUTH XOAUTH2 {initial}"))?;

    if response.code() == Some(SMTP_CONTINUE_REQUEST) {
        // The continuation carries a base64 JSON error frame instead of a
        // success; decide whether a fresh token could still work, then
        // send the empty line that closes the exchange.
        *retry_with_new_token = should_retry_challenge(&response.texts().concat(), host);
        conn.command("")?;
    }

    Ok(())
}

/// Builds the XOAUTH2 initial client response for a user and bearer token
pub(crate) fn xoauth2_initial_response(username: &str, token: &str) -> String {
    BASE64.encode(format!("user={username}\u{1}auth=Bearer {token}\u{1}\u{1}"))
}

/// Decides from a XOAUTH2 error frame whether retrying with a fresh token
/// makes sense.
///
/// The frame is a base64 JSON object; a `status` other than `"400"` means
/// the token itself was rejected for good, so a retry is pointless.
/// Anything unparseable errs on the side of retrying.
pub(crate) fn should_retry_challenge(challenge: &str, host: &str) -> bool {
    let decoded = match BASE64
        .decode(challenge.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(decoded) => decoded,
        None => return true,
    };

    match serde_json::from_str::<serde_json::Value>(&decoded) {
        Ok(frame) => match frame.get("status").and_then(|status| status.as_str()) {
            Some(status) => status == "400",
            None => true,
        },
        Err(e) => {
            tracing::debug!("error decoding XOAUTH2 challenge from {host}: {e}");
            true
        }
    }
}

/// Computes the CRAM-MD5 response for a base64-encoded server nonce
pub(crate) fn compute_cram_md5(
    username: &str,
    password: &str,
    b64_nonce: &str,
) -> Result<String, Error> {
    let nonce = BASE64
        .decode(b64_nonce)
        .map_err(|_| Error::Protocol("invalid CRAM-MD5 nonce".to_owned()))?;

    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|_| Error::Configuration("empty CRAM-MD5 secret".to_owned()))?;
    mac.update(&nonce);
    let digest = hex::encode(mac.finalize().into_bytes());

    Ok(BASE64.encode(format!("{username} {digest}")))
}

fn into_auth_failure(mechanism: &'static str, error: Error) -> Error {
    match error {
        Error::Reply(reply) if reply.code == Some(SMTP_AUTHENTICATION_FAILURE) => {
            Error::Authentication { mechanism, reply }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cram_md5_response() {
        assert_eq!(
            compute_cram_md5(
                "alice",
                "wonderland",
                "PDE3ODkzLjEzMjA2NzkxMjNAdGVzc2VyYWN0LnN1c2FtLmluPg=="
            )
            .unwrap(),
            "YWxpY2UgNjRiMmE0M2MxZjZlZDY4MDZhOTgwOTE0ZTIzZTc1ZjA="
        );
    }

    #[test]
    fn cram_md5_rejects_bad_nonce() {
        assert!(compute_cram_md5("alice", "wonderland", "not base64!").is_err());
    }

    #[test]
    fn xoauth2_initial_response_format() {
        assert_eq!(
            xoauth2_initial_response("user", "oldToken"),
            "dXNlcj11c2VyAWF1dGg9QmVhcmVyIG9sZFRva2VuAQE="
        );
    }

    #[test]
    fn challenge_with_bad_request_status_retries() {
        let frame = BASE64.encode(r#"{"status":"400","schemes":"Bearer"}"#);
        assert!(should_retry_challenge(&frame, "smtp.example.com"));
    }

    #[test]
    fn challenge_with_other_status_does_not_retry() {
        let frame = BASE64.encode(r#"{"status":"401","schemes":"Bearer"}"#);
        assert!(!should_retry_challenge(&frame, "smtp.example.com"));
    }

    #[test]
    fn unparseable_challenges_err_on_retrying() {
        assert!(should_retry_challenge("***", "smtp.example.com"));
        let not_json = BASE64.encode("broken");
        assert!(should_retry_challenge(&not_json, "smtp.example.com"));
        let missing_status = BASE64.encode(r#"{"schemes":"Bearer"}"#);
        assert!(should_retry_challenge(&missing_status, "smtp.example.com"));
    }
}
