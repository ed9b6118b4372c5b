//! SMTP response, containing a reply code and the response text lines

use std::fmt::{self, Display, Formatter};

/// Severity of a reply, taken from the first digit of the reply code
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Severity {
    /// 2yz and 3yz replies, including intermediate replies like 354
    Positive,
    /// 4yz replies
    TransientNegative,
    /// 5yz replies
    PermanentNegative,
}

impl Severity {
    fn from_leading_byte(byte: u8) -> Severity {
        match byte {
            b'4' => Severity::TransientNegative,
            b'5' => Severity::PermanentNegative,
            _ => Severity::Positive,
        }
    }
}

/// A complete SMTP reply, one per command.
///
/// Servers in the wild sometimes send replies that are not quite
/// well-formed, so the reply code is kept optional: classification falls
/// back to the first character of the final response line.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Response {
    code: Option<u16>,
    severity: Severity,
    texts: Vec<String>,
}

impl Response {
    /// Builds a response from the final response line and the text
    /// payloads accumulated while reading it.
    ///
    /// The final line carries the authoritative reply code. A zero-length
    /// line is rejected here; everything else is classified by its first
    /// character even when the 3-digit code cannot be parsed.
    pub(crate) fn from_final_line(line: &str, texts: Vec<String>) -> Option<Response> {
        let first = *line.as_bytes().first()?;

        let code = line.get(..3).and_then(|digits| digits.parse::<u16>().ok());

        Some(Response {
            code,
            severity: Severity::from_leading_byte(first),
            texts,
        })
    }

    #[cfg(test)]
    pub(crate) fn new(code: u16, texts: Vec<String>) -> Response {
        Response {
            code: Some(code),
            severity: Severity::from_leading_byte(code.to_string().as_bytes()[0]),
            texts,
        }
    }

    /// The 3-digit reply code, when it could be parsed
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// Reply severity
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Tells if this is a 4yz or 5yz reply
    pub fn is_negative(&self) -> bool {
        self.severity != Severity::Positive
    }

    /// Tests code equality
    pub fn has_code(&self, code: u16) -> bool {
        self.code == Some(code)
    }

    /// The response text lines, in order
    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    /// All text lines joined with a single space
    pub fn joined_text(&self) -> String {
        self.texts.join(" ")
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} {}", code, self.joined_text()),
            None => f.write_str(&self.joined_text()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_code_and_severity() {
        let response = Response::from_final_line("250 OK", vec!["OK".to_owned()]).unwrap();
        assert_eq!(response.code(), Some(250));
        assert_eq!(response.severity(), Severity::Positive);
        assert!(!response.is_negative());
    }

    #[test]
    fn intermediate_reply_is_positive() {
        let response = Response::from_final_line("354 go ahead", vec![]).unwrap();
        assert_eq!(response.severity(), Severity::Positive);
    }

    #[test]
    fn transient_and_permanent_replies_are_negative() {
        let transient = Response::from_final_line("421 try later", vec![]).unwrap();
        assert_eq!(transient.severity(), Severity::TransientNegative);
        assert!(transient.is_negative());

        let permanent = Response::from_final_line("550 no", vec![]).unwrap();
        assert_eq!(permanent.severity(), Severity::PermanentNegative);
        assert!(permanent.is_negative());
    }

    #[test]
    fn unparseable_code_still_classifies() {
        let response = Response::from_final_line("5xx broken", vec![]).unwrap();
        assert_eq!(response.code(), None);
        assert_eq!(response.severity(), Severity::PermanentNegative);
    }

    #[test]
    fn short_line_without_full_code() {
        let response = Response::from_final_line("2", vec![]).unwrap();
        assert_eq!(response.code(), None);
        assert_eq!(response.severity(), Severity::Positive);
    }

    #[test]
    fn empty_line_is_rejected() {
        assert_eq!(Response::from_final_line("", vec![]), None);
    }

    #[test]
    fn joined_text_uses_single_spaces() {
        let response = Response::from_final_line(
            "250 AUTH PLAIN LOGIN",
            vec!["localhost".to_owned(), "AUTH PLAIN LOGIN".to_owned()],
        )
        .unwrap();
        assert_eq!(response.joined_text(), "localhost AUTH PLAIN LOGIN");
    }

    #[test]
    fn has_code_matches_exactly() {
        let response = Response::from_final_line("451 later", vec![]).unwrap();
        assert!(response.has_code(451));
        assert!(!response.has_code(251));
    }
}
