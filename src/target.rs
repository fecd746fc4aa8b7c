//! Target resolution for the two request forms a forward proxy accepts.
//!
//! - `CONNECT host:port` (authority form) names the tunnel endpoint directly.
//! - Any other method carries an absolute URI; the host and port come from its
//!   authority and the path and query are reused for the rewritten request line.

use std::fmt;

use url::Url;

use crate::error::ProxyError;

/// Port used when an absolute URI carries none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Host and port of the upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Upstream target plus the origin-form path of a rewritten request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub target: Target,
    pub path: String,
    pub query: Option<String>,
}

impl ProxyTarget {
    /// `path[?query]`, as written on the outbound request line.
    pub fn origin_form(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// Resolves a CONNECT target of the form `host:port`.
pub fn resolve_connect_target(target: &str) -> Result<Target, ProxyError> {
    let parts: Vec<&str> = target.split(':').collect();
    let [host, port] = parts.as_slice() else {
        return Err(ProxyError::MalformedTarget(format!(
            "CONNECT target {target:?} is not host:port"
        )));
    };
    if host.is_empty() || port.is_empty() {
        return Err(ProxyError::MalformedTarget(format!(
            "CONNECT target {target:?} has an empty host or port"
        )));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| ProxyError::MalformedTarget(format!("invalid port in {target:?}")))?;
    Ok(Target {
        host: host.to_string(),
        port,
    })
}

/// Resolves an absolute-URI target such as `http://example.com/about.txt?x=1`.
pub fn resolve_proxy_target(target: &str) -> Result<ProxyTarget, ProxyError> {
    let url = Url::parse(target)?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ProxyError::MalformedTarget(format!("{target:?} has no host")))?;
    let path = match url.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    Ok(ProxyTarget {
        target: Target {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_HTTP_PORT),
        },
        path,
        query: url.query().map(str::to_string),
    })
}
