//! ESMTP extension keywords negotiated through EHLO

use std::collections::HashMap;

use crate::response::Response;

/// The extensions advertised by the server in its EHLO response
///
/// Maps the uppercased extension keyword to its parameter string, which
/// may be empty. A new map is built from every EHLO response and replaces
/// the previous one wholesale; extensions may change across a STARTTLS
/// upgrade or a reconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    keywords: HashMap<String, String>,
}

impl Capabilities {
    /// Parses an EHLO response into a capability map
    ///
    /// The first response line is the server's greeting banner and carries
    /// no keyword; every following line is split on the first space into a
    /// keyword (uppercased) and its parameter string.
    pub fn from_ehlo_response(response: &Response) -> Capabilities {
        let mut keywords = HashMap::new();

        for line in response.texts().iter().skip(1) {
            let (keyword, parameter) = match line.split_once(' ') {
                Some((keyword, parameter)) => (keyword, parameter),
                None => (line.as_str(), ""),
            };
            if keyword.is_empty() {
                continue;
            }
            keywords.insert(keyword.to_uppercase(), parameter.to_owned());
        }

        Capabilities { keywords }
    }

    /// Checks if the server advertised a keyword
    pub fn contains(&self, keyword: &str) -> bool {
        self.keywords.contains_key(keyword)
    }

    /// The parameter string of a keyword, when advertised
    pub fn parameter(&self, keyword: &str) -> Option<&str> {
        self.keywords.get(keyword).map(String::as_str)
    }

    /// Checks if a SASL mechanism appears in the AUTH parameter list
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.parameter("AUTH")
            .map(|parameter| parameter.split_whitespace().any(|m| m == mechanism))
            .unwrap_or(false)
    }

    /// The largest acceptable message size from the SIZE parameter
    ///
    /// An absent, empty, zero, or unparseable parameter means the server
    /// announced no usable limit.
    pub fn size_limit(&self) -> Option<u64> {
        let parameter = self.parameter("SIZE")?;
        match parameter.split_whitespace().next()?.parse::<u64>() {
            Ok(0) => None,
            Ok(size) => Some(size),
            Err(_) => {
                tracing::debug!("SIZE parameter is not a valid integer: {parameter}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::response::Response;

    fn ehlo_response(lines: &[&str]) -> Response {
        let mut texts = vec!["localhost Hello client.localhost".to_owned()];
        texts.extend(lines.iter().map(|l| (*l).to_owned()));
        Response::new(250, texts)
    }

    #[test]
    fn banner_line_is_discarded() {
        let capabilities = Capabilities::from_ehlo_response(&ehlo_response(&[]));
        assert_eq!(capabilities, Capabilities::default());
        assert!(!capabilities.contains("LOCALHOST"));
    }

    #[test]
    fn keywords_are_uppercased() {
        let capabilities =
            Capabilities::from_ehlo_response(&ehlo_response(&["starttls", "8bitmime"]));
        assert!(capabilities.contains("STARTTLS"));
        assert!(capabilities.contains("8BITMIME"));
    }

    #[test]
    fn parameters_keep_their_case() {
        let capabilities =
            Capabilities::from_ehlo_response(&ehlo_response(&["AUTH PLAIN Login"]));
        assert_eq!(capabilities.parameter("AUTH"), Some("PLAIN Login"));
        assert!(capabilities.supports_auth("PLAIN"));
        assert!(!capabilities.supports_auth("LOGIN"));
    }

    #[test]
    fn auth_mechanisms_are_matched_whole() {
        let capabilities =
            Capabilities::from_ehlo_response(&ehlo_response(&["AUTH PLAIN CRAM-MD5 XOAUTH2"]));
        assert!(capabilities.supports_auth("CRAM-MD5"));
        assert!(capabilities.supports_auth("XOAUTH2"));
        assert!(!capabilities.supports_auth("CRAM"));
        assert!(!capabilities.supports_auth("EXTERNAL"));
    }

    #[test]
    fn size_limit_parses_first_parameter() {
        let capabilities =
            Capabilities::from_ehlo_response(&ehlo_response(&["SIZE 35882577"]));
        assert_eq!(capabilities.size_limit(), Some(35_882_577));
    }

    #[test]
    fn unusable_size_parameters_mean_no_limit() {
        for parameter in ["SIZE", "SIZE 0", "SIZE banana"] {
            let capabilities = Capabilities::from_ehlo_response(&ehlo_response(&[parameter]));
            assert_eq!(capabilities.size_limit(), None, "{parameter}");
        }
    }
}
