//! Enhanced mail system status codes as defined in RFC 3463
//!
//! Servers announcing the `ENHANCEDSTATUSCODES` extension prefix the text
//! of their replies with a `class.subject.detail` code, e.g. `5.1.1` for
//! "bad destination mailbox address".

use std::fmt::{self, Display, Formatter};

/// First part of an enhanced status code
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum StatusCodeClass {
    /// 2.x.x
    Success,
    /// 4.x.x
    PersistentTransientFailure,
    /// 5.x.x
    PermanentFailure,
}

impl StatusCodeClass {
    fn parse(digits: &str) -> Option<StatusCodeClass> {
        match digits {
            "2" => Some(StatusCodeClass::Success),
            "4" => Some(StatusCodeClass::PersistentTransientFailure),
            "5" => Some(StatusCodeClass::PermanentFailure),
            _ => None,
        }
    }

    fn digit(self) -> u8 {
        match self {
            StatusCodeClass::Success => 2,
            StatusCodeClass::PersistentTransientFailure => 4,
            StatusCodeClass::PermanentFailure => 5,
        }
    }
}

/// Second part of an enhanced status code
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum StatusCodeSubject {
    /// x.0.x
    Undefined,
    /// x.1.x
    Addressing,
    /// x.2.x
    Mailbox,
    /// x.3.x
    MailSystem,
    /// x.4.x
    NetworkRouting,
    /// x.5.x
    MailDeliveryProtocol,
    /// x.6.x
    MessageContentOrMedia,
    /// x.7.x
    SecurityOrPolicyStatus,
}

impl StatusCodeSubject {
    fn parse(digits: &str) -> Option<StatusCodeSubject> {
        match digits {
            "0" => Some(StatusCodeSubject::Undefined),
            "1" => Some(StatusCodeSubject::Addressing),
            "2" => Some(StatusCodeSubject::Mailbox),
            "3" => Some(StatusCodeSubject::MailSystem),
            "4" => Some(StatusCodeSubject::NetworkRouting),
            "5" => Some(StatusCodeSubject::MailDeliveryProtocol),
            "6" => Some(StatusCodeSubject::MessageContentOrMedia),
            "7" => Some(StatusCodeSubject::SecurityOrPolicyStatus),
            _ => None,
        }
    }

    fn digit(self) -> u8 {
        match self {
            StatusCodeSubject::Undefined => 0,
            StatusCodeSubject::Addressing => 1,
            StatusCodeSubject::Mailbox => 2,
            StatusCodeSubject::MailSystem => 3,
            StatusCodeSubject::NetworkRouting => 4,
            StatusCodeSubject::MailDeliveryProtocol => 5,
            StatusCodeSubject::MessageContentOrMedia => 6,
            StatusCodeSubject::SecurityOrPolicyStatus => 7,
        }
    }
}

/// Subject-scoped detail of an enhanced status code
///
/// Covers the detail codes enumerated in RFC 3463. Servers may send
/// registered codes newer than that document; those keep their numeric
/// value on [`EnhancedStatusCode`] but resolve to `None` here.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[allow(missing_docs)]
pub enum StatusCodeDetail {
    // x.0.x
    UndefinedStatus,
    // x.1.x
    OtherAddressStatus,
    BadDestinationMailboxAddress,
    BadDestinationSystemAddress,
    BadDestinationMailboxAddressSyntax,
    DestinationMailboxAddressAmbiguous,
    DestinationAddressValid,
    DestinationMailboxHasMoved,
    BadSendersMailboxAddressSyntax,
    BadSendersSystemAddress,
    // x.2.x
    OtherMailboxStatus,
    MailboxDisabled,
    MailboxFull,
    MessageLengthExceedsAdministrativeLimit,
    MailingListExpansionProblem,
    // x.3.x
    OtherMailSystemStatus,
    MailSystemFull,
    SystemNotAcceptingNetworkMessages,
    SystemNotCapableOfSelectedFeatures,
    MessageTooBigForSystem,
    SystemIncorrectlyConfigured,
    // x.4.x
    OtherNetworkOrRoutingStatus,
    NoAnswerFromHost,
    BadConnection,
    DirectoryServerFailure,
    UnableToRoute,
    MailSystemCongestion,
    RoutingLoopDetected,
    DeliveryTimeExpired,
    // x.5.x
    OtherProtocolStatus,
    InvalidCommand,
    SyntaxError,
    TooManyRecipients,
    InvalidCommandArguments,
    WrongProtocolVersion,
    // x.6.x
    OtherMediaError,
    MediaNotSupported,
    ConversionRequiredAndProhibited,
    ConversionRequiredButNotSupported,
    ConversionWithLossPerformed,
    ConversionFailed,
    // x.7.x
    OtherSecurityStatus,
    DeliveryNotAuthorized,
    MailingListExpansionProhibited,
    SecurityConversionRequiredButNotPossible,
    SecurityFeaturesNotSupported,
    CryptographicFailure,
    CryptographicAlgorithmNotSupported,
    MessageIntegrityFailure,
}

impl StatusCodeDetail {
    /// Resolves a raw detail number within its subject
    pub fn parse(subject: StatusCodeSubject, detail: u16) -> Option<StatusCodeDetail> {
        use StatusCodeDetail::*;
        use StatusCodeSubject::*;

        match (subject, detail) {
            (Undefined, 0) => Some(UndefinedStatus),
            (Addressing, 0) => Some(OtherAddressStatus),
            (Addressing, 1) => Some(BadDestinationMailboxAddress),
            (Addressing, 2) => Some(BadDestinationSystemAddress),
            (Addressing, 3) => Some(BadDestinationMailboxAddressSyntax),
            (Addressing, 4) => Some(DestinationMailboxAddressAmbiguous),
            (Addressing, 5) => Some(DestinationAddressValid),
            (Addressing, 6) => Some(DestinationMailboxHasMoved),
            (Addressing, 7) => Some(BadSendersMailboxAddressSyntax),
            (Addressing, 8) => Some(BadSendersSystemAddress),
            (Mailbox, 0) => Some(OtherMailboxStatus),
            (Mailbox, 1) => Some(MailboxDisabled),
            (Mailbox, 2) => Some(MailboxFull),
            (Mailbox, 3) => Some(MessageLengthExceedsAdministrativeLimit),
            (Mailbox, 4) => Some(MailingListExpansionProblem),
            (MailSystem, 0) => Some(OtherMailSystemStatus),
            (MailSystem, 1) => Some(MailSystemFull),
            (MailSystem, 2) => Some(SystemNotAcceptingNetworkMessages),
            (MailSystem, 3) => Some(SystemNotCapableOfSelectedFeatures),
            (MailSystem, 4) => Some(MessageTooBigForSystem),
            (MailSystem, 5) => Some(SystemIncorrectlyConfigured),
            (NetworkRouting, 0) => Some(OtherNetworkOrRoutingStatus),
            (NetworkRouting, 1) => Some(NoAnswerFromHost),
            (NetworkRouting, 2) => Some(BadConnection),
            (NetworkRouting, 3) => Some(DirectoryServerFailure),
            (NetworkRouting, 4) => Some(UnableToRoute),
            (NetworkRouting, 5) => Some(MailSystemCongestion),
            (NetworkRouting, 6) => Some(RoutingLoopDetected),
            (NetworkRouting, 7) => Some(DeliveryTimeExpired),
            (MailDeliveryProtocol, 0) => Some(OtherProtocolStatus),
            (MailDeliveryProtocol, 1) => Some(InvalidCommand),
            (MailDeliveryProtocol, 2) => Some(SyntaxError),
            (MailDeliveryProtocol, 3) => Some(TooManyRecipients),
            (MailDeliveryProtocol, 4) => Some(InvalidCommandArguments),
            (MailDeliveryProtocol, 5) => Some(WrongProtocolVersion),
            (MessageContentOrMedia, 0) => Some(OtherMediaError),
            (MessageContentOrMedia, 1) => Some(MediaNotSupported),
            (MessageContentOrMedia, 2) => Some(ConversionRequiredAndProhibited),
            (MessageContentOrMedia, 3) => Some(ConversionRequiredButNotSupported),
            (MessageContentOrMedia, 4) => Some(ConversionWithLossPerformed),
            (MessageContentOrMedia, 5) => Some(ConversionFailed),
            (SecurityOrPolicyStatus, 0) => Some(OtherSecurityStatus),
            (SecurityOrPolicyStatus, 1) => Some(DeliveryNotAuthorized),
            (SecurityOrPolicyStatus, 2) => Some(MailingListExpansionProhibited),
            (SecurityOrPolicyStatus, 3) => Some(SecurityConversionRequiredButNotPossible),
            (SecurityOrPolicyStatus, 4) => Some(SecurityFeaturesNotSupported),
            (SecurityOrPolicyStatus, 5) => Some(CryptographicFailure),
            (SecurityOrPolicyStatus, 6) => Some(CryptographicAlgorithmNotSupported),
            (SecurityOrPolicyStatus, 7) => Some(MessageIntegrityFailure),
            _ => None,
        }
    }
}

/// A parsed `class.subject.detail` status code
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct EnhancedStatusCode {
    /// Status class (first number)
    pub class: StatusCodeClass,
    /// Status subject (second number)
    pub subject: StatusCodeSubject,
    /// Raw detail value (third number)
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses a status code token like `5.1.1`
    pub fn parse(token: &str) -> Option<EnhancedStatusCode> {
        let mut parts = token.split('.');
        let class = StatusCodeClass::parse(parts.next()?)?;
        let subject = StatusCodeSubject::parse(parts.next()?)?;
        let detail_part = parts.next()?;
        if parts.next().is_some() || detail_part.is_empty() || detail_part.len() > 3 {
            return None;
        }
        let detail = detail_part.parse::<u16>().ok()?;

        Some(EnhancedStatusCode {
            class,
            subject,
            detail,
        })
    }

    /// The RFC 3463 name of the detail value, when it has one
    pub fn detail_code(&self) -> Option<StatusCodeDetail> {
        StatusCodeDetail::parse(self.subject, self.detail)
    }
}

impl Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.class.digit(),
            self.subject.digit(),
            self.detail
        )
    }
}

/// Extracts the enhanced status code from the text lines of a negative
/// reply, returning the code and the reply message with the code tokens
/// stripped.
///
/// The code is taken from the first token of the first line. When it does
/// not parse, the reply is treated as plain text even if the server
/// advertised `ENHANCEDSTATUSCODES`; at least one popular implementation
/// omits the code on some replies.
pub(crate) fn split_status_code(texts: &[String]) -> (Option<EnhancedStatusCode>, String) {
    let first_token = texts
        .first()
        .map(|line| line.split(' ').next().unwrap_or(""))
        .unwrap_or("");

    match EnhancedStatusCode::parse(first_token) {
        Some(code) => {
            let message = texts
                .iter()
                .map(|line| line.split_once(' ').map_or("", |(_, rest)| rest))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_owned();
            (Some(code), message)
        }
        None => (None, texts.join(" ")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_permanent_addressing_code() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, StatusCodeClass::PermanentFailure);
        assert_eq!(code.subject, StatusCodeSubject::Addressing);
        assert_eq!(
            code.detail_code(),
            Some(StatusCodeDetail::BadDestinationMailboxAddress)
        );
    }

    #[test]
    fn parses_transient_code() {
        let code = EnhancedStatusCode::parse("4.7.0").unwrap();
        assert_eq!(code.class, StatusCodeClass::PersistentTransientFailure);
        assert_eq!(code.subject, StatusCodeSubject::SecurityOrPolicyStatus);
        assert_eq!(code.detail_code(), Some(StatusCodeDetail::OtherSecurityStatus));
    }

    #[test]
    fn unknown_detail_keeps_raw_value() {
        let code = EnhancedStatusCode::parse("5.7.26").unwrap();
        assert_eq!(code.detail, 26);
        assert_eq!(code.detail_code(), None);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert_eq!(EnhancedStatusCode::parse("3.1.1"), None);
        assert_eq!(EnhancedStatusCode::parse("5.9.1"), None);
        assert_eq!(EnhancedStatusCode::parse("5.1"), None);
        assert_eq!(EnhancedStatusCode::parse("5.1.1.1"), None);
        assert_eq!(EnhancedStatusCode::parse("5.1.x"), None);
        assert_eq!(EnhancedStatusCode::parse("Mailbox"), None);
    }

    #[test]
    fn display_round_trips() {
        let code = EnhancedStatusCode::parse("4.2.2").unwrap();
        assert_eq!(code.to_string(), "4.2.2");
    }

    #[test]
    fn splits_code_and_message() {
        let texts = vec!["5.1.1 Mailbox unavailable".to_owned()];
        let (code, message) = split_status_code(&texts);
        assert_eq!(code, Some(EnhancedStatusCode::parse("5.1.1").unwrap()));
        assert_eq!(message, "Mailbox unavailable");
    }

    #[test]
    fn splits_multiline_reply() {
        let texts = vec![
            "5.7.1 Username and Password not accepted. Learn more at".to_owned(),
            "5.7.1 https://example.com/answer".to_owned(),
        ];
        let (code, message) = split_status_code(&texts);
        assert_eq!(code, Some(EnhancedStatusCode::parse("5.7.1").unwrap()));
        assert_eq!(
            message,
            "Username and Password not accepted. Learn more at https://example.com/answer"
        );
    }

    #[test]
    fn falls_back_to_plain_text_without_code() {
        let texts = vec!["Temporary system problem".to_owned()];
        let (code, message) = split_status_code(&texts);
        assert_eq!(code, None);
        assert_eq!(message, "Temporary system problem");
    }
}
