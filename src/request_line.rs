use std::fmt;

use crate::error::ProxyError;

/// The three tokens of a proxied request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Splits on whitespace, ignoring repeated separators. Anything other than
    /// exactly three tokens is rejected.
    pub fn parse(line: &[u8]) -> Result<Self, ProxyError> {
        let text = String::from_utf8_lossy(line);
        let mut tokens = text.split_ascii_whitespace();
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(target), Some(version), None) => Ok(Self {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
            }),
            _ => Err(ProxyError::MalformedRequestLine(text.into_owned())),
        }
    }

    /// Case-insensitive, the method is otherwise kept verbatim.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_tokens() {
        let line = RequestLine::parse(b"GET http://example.com/about.txt HTTP/1.1").unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "http://example.com/about.txt");
        assert_eq!(line.version, "HTTP/1.1");
        assert!(!line.is_connect());
    }

    #[test]
    fn repeated_separators_are_ignored() {
        let line = RequestLine::parse(b"CONNECT   example.com:443  HTTP/1.0 ").unwrap();
        assert_eq!(line.target, "example.com:443");
        assert_eq!(line.version, "HTTP/1.0");
    }

    #[test]
    fn connect_is_case_insensitive_but_preserved() {
        let line = RequestLine::parse(b"connect example.com:443 HTTP/1.1").unwrap();
        assert!(line.is_connect());
        assert_eq!(line.method, "connect");
    }

    #[test]
    fn wrong_token_count_is_fatal() {
        for input in [
            &b"GETexample.com"[..],
            b"GET http://example.com/",
            b"GET http://example.com/ HTTP/1.1 extra",
            b"",
        ] {
            let err = RequestLine::parse(input).unwrap_err();
            assert!(matches!(err, ProxyError::MalformedRequestLine(_)), "{input:?}");
        }
    }

    #[test]
    fn display_round_trips_tokens() {
        let line = RequestLine::parse(b"PATCH  http://h/x   HTTP/1.1").unwrap();
        assert_eq!(line.to_string(), "PATCH http://h/x HTTP/1.1");
    }
}
