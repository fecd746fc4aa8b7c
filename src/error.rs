use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("Malformed target: {0}")]
    MalformedTarget(String),

    #[error("Failed to connect to upstream {target}: {source}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer closed the connection during {0}")]
    PeerClosed(&'static str),

    #[error("Connection closed before the header block was complete")]
    IncompleteHeaders,

    #[error("Header section exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Timed out waiting for the request header section")]
    HeaderTimeout,

    #[error("Timed out connecting to upstream {0}")]
    ConnectTimeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Proxy refused tunnel with status {0:?}")]
    TunnelRefused(String),
}

impl ProxyError {
    /// Status to report to the client before closing, when error responses are enabled.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::MalformedRequestLine(_)
            | ProxyError::MalformedTarget(_)
            | ProxyError::Url(_) => Some(StatusCode::BAD_REQUEST),
            ProxyError::HeaderTooLarge(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            ProxyError::UpstreamConnect { .. } => Some(StatusCode::BAD_GATEWAY),
            ProxyError::ConnectTimeout(_) => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyError::HeaderTimeout => Some(StatusCode::REQUEST_TIMEOUT),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_to_bad_request() {
        let err = ProxyError::MalformedRequestLine("GETexample.com".to_string());
        assert_eq!(err.response_status(), Some(StatusCode::BAD_REQUEST));
        let err = ProxyError::MalformedTarget("example.com".to_string());
        assert_eq!(err.response_status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn connect_errors_map_to_gateway_statuses() {
        let err = ProxyError::UpstreamConnect {
            target: "127.0.0.1:1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.response_status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(
            ProxyError::ConnectTimeout("example.com:443".to_string()).response_status(),
            Some(StatusCode::GATEWAY_TIMEOUT)
        );
    }

    #[test]
    fn peer_closed_has_no_response() {
        assert_eq!(ProxyError::PeerClosed("relay").response_status(), None);
        assert_eq!(ProxyError::IncompleteHeaders.response_status(), None);
    }
}
