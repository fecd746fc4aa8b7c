//! Minimal HTTP/1.0 clients used to exercise the proxy.
//!
//! [`http_request`] fetches a URL either directly or through the proxy, reading
//! until the server closes. [`http_connect`] opens a CONNECT tunnel and hands
//! back the socket once the proxy answers `200`.

use std::collections::HashMap;
use std::net::SocketAddr;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use url::{Host, Url};

use crate::error::ProxyError;
use crate::line_buffer::{CRLF, find};
use crate::target::DEFAULT_HTTP_PORT;

/// Size of the single read [`http_connect`] performs for the proxy's answer.
const CONNECT_RESPONSE_BUFFER: usize = 10 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    /// Names and values are trimmed; a repeated name keeps its last value.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Parses a raw response. Returns `Ok(None)` while the head is incomplete.
pub fn parse_http_response(raw: &[u8]) -> Result<Option<HttpResponse>, ProxyError> {
    let Some(end) = find(raw, CRLF) else {
        return Ok(None);
    };
    let status_line = String::from_utf8_lossy(&raw[..end]);
    let status_code = status_line
        .split(' ')
        .nth(1)
        .and_then(|code| code.trim().parse::<u16>().ok())
        .ok_or_else(|| ProxyError::MalformedResponse(format!("bad status line {status_line:?}")))?;
    let mut parsed = end + CRLF.len();

    let mut headers = HashMap::new();
    loop {
        let Some(len) = find(&raw[parsed..], CRLF) else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&raw[parsed..parsed + len]);
        parsed += len + CRLF.len();
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::MalformedResponse(format!("bad header line {line:?}")))?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }

    Ok(Some(HttpResponse {
        status_code,
        headers,
        body: raw[parsed..].to_vec(),
    }))
}

/// Fetches `url` from its origin server over HTTP/1.0.
pub async fn http_request(
    url: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<HttpResponse, ProxyError> {
    let url = Url::parse(url)?;
    let addr = resolve(&url).await?;
    let target = origin_form(&url);
    exchange(addr, &url, &target, method, headers, body).await
}

/// Fetches `url` through a forward proxy, sending the absolute URI as target.
pub async fn http_request_via_proxy(
    proxy: SocketAddr,
    url: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<HttpResponse, ProxyError> {
    let url = Url::parse(url)?;
    exchange(proxy, &url, url.as_str(), method, headers, body).await
}

async fn exchange(
    addr: SocketAddr,
    url: &Url,
    request_target: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<HttpResponse, ProxyError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ProxyError::UpstreamConnect {
            target: addr.to_string(),
            source,
        })?;

    let mut head = format!(
        "{} {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n",
        method,
        request_target,
        host_header(url)
    );
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    debug!("{} {} via {}", method, request_target, addr);

    stream.write_all(head.as_bytes()).await?;
    if let Some(body) = body {
        stream.write_all(body).await?;
    }
    stream.flush().await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_http_response(&raw)?.ok_or(ProxyError::IncompleteHeaders)
}

/// Opens a tunnel to `target_host:target_port` through the proxy.
///
/// The proxy's answer is expected in a single read.
pub async fn http_connect(
    target_host: &str,
    target_port: u16,
    proxy_host: &str,
    proxy_port: u16,
) -> Result<TcpStream, ProxyError> {
    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|source| ProxyError::UpstreamConnect {
            target: format!("{proxy_host}:{proxy_port}"),
            source,
        })?;
    let request = format!("CONNECT {target_host}:{target_port} HTTP/1.0\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = vec![0u8; CONNECT_RESPONSE_BUFFER];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ProxyError::TunnelRefused(
            "proxy closed the connection".to_string(),
        ));
    }
    let response = String::from_utf8_lossy(&buf[..n]);
    let status_line = response.lines().next().unwrap_or_default();
    if status_line.split_ascii_whitespace().nth(1) != Some("200") {
        return Err(ProxyError::TunnelRefused(status_line.to_string()));
    }
    debug!("Tunnel to {}:{} established", target_host, target_port);
    Ok(stream)
}

async fn resolve(url: &Url) -> Result<SocketAddr, ProxyError> {
    let port = url.port().unwrap_or(DEFAULT_HTTP_PORT);
    match url.host() {
        Some(Host::Ipv4(ip)) => Ok(SocketAddr::from((ip, port))),
        Some(Host::Ipv6(ip)) => Ok(SocketAddr::from((ip, port))),
        Some(Host::Domain(domain)) => lookup_host((domain, port))
            .await
            .map_err(|source| ProxyError::UpstreamConnect {
                target: format!("{domain}:{port}"),
                source,
            })?
            .next()
            .ok_or_else(|| ProxyError::UpstreamConnect {
                target: format!("{domain}:{port}"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            }),
        None => Err(ProxyError::MalformedTarget(format!("{url} has no host"))),
    }
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
