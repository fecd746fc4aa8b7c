//! Per-client connection session.
//!
//! A session walks through `Parsing -> Connecting -> Relaying -> Closed`, with
//! any failure jumping straight to `Closed`. All of its state is touched from a
//! single task, one I/O completion at a time:
//!
//! - **Parsing** feeds client chunks into a [`RequestParser`] until the request
//!   line (and for CONNECT the whole header block) has arrived.
//! - **Connecting** waits for the [`Connector`] while still reading the client,
//!   queueing anything that arrives so it reaches upstream in order.
//! - **Relaying** flushes the queues and then copies bytes both ways until
//!   either side ends or errors.
//! - **Closed** shuts both sockets down exactly once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::config::Config;
use crate::connector::Connector;
use crate::error::ProxyError;
use crate::line_buffer::LineBuffer;
use crate::request_line::RequestLine;
use crate::target::{Target, resolve_connect_target, resolve_proxy_target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// CONNECT: bytes are relayed opaquely after the `200` response.
    Tunnel,
    /// Absolute-URI request: the request line is rewritten to origin form.
    Rewrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Parsing,
    Connecting,
    Relaying,
    Closed,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Tunnel => write!(f, "tunnel"),
            Mode::Rewrite => write!(f, "rewrite"),
        }
    }
}

/// Which end of the relay stopped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: u64,
    pub to_client: u64,
    pub closed_by: Side,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub header_timeout: Option<Duration>,
    pub max_header_size: usize,
    pub relay_buffer_size: usize,
    pub error_responses: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            header_timeout: None,
            max_header_size: crate::config::DEFAULT_MAX_HEADER_SIZE,
            relay_buffer_size: crate::config::DEFAULT_RELAY_BUFFER_SIZE,
            error_responses: false,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            header_timeout: config.header_timeout(),
            max_header_size: config.max_header_size,
            relay_buffer_size: config.relay_buffer_size,
            error_responses: config.error_responses,
        }
    }
}

/// Result of a completed parse: where to connect and what to send first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub mode: Mode,
    pub target: Target,
    pub version: String,
    pub to_upstream: Vec<Bytes>,
    pub to_client: Vec<Bytes>,
}

/// Incremental request parser for the `Parsing` state.
#[derive(Debug)]
pub struct RequestParser {
    buffer: LineBuffer,
    connect: Option<(RequestLine, Target)>,
}

impl RequestParser {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            buffer: LineBuffer::new(max_header_size),
            connect: None,
        }
    }

    /// Bytes held back while the request head is incomplete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True once a CONNECT line was accepted and its header block is still open.
    pub fn awaiting_headers(&self) -> bool {
        self.connect.is_some()
    }

    /// Feeds one client chunk. Returns `Ok(None)` while more input is needed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<Routed>, ProxyError> {
        self.buffer.append(chunk);

        if self.connect.is_none() {
            let Some((line, rest)) = self.buffer.try_extract_line()? else {
                return Ok(None);
            };
            let request = RequestLine::parse(&line)?;

            if !request.is_connect() {
                let resolved = resolve_proxy_target(&request.target)?;
                info!("PROXY {}", request);
                let rewritten = format!(
                    "{} {} {}\r\n",
                    request.method,
                    resolved.origin_form(),
                    request.version
                );
                let mut to_upstream = vec![Bytes::from(rewritten)];
                if !rest.is_empty() {
                    to_upstream.push(rest);
                }
                self.buffer.take_all();
                return Ok(Some(Routed {
                    mode: Mode::Rewrite,
                    target: resolved.target,
                    version: request.version,
                    to_upstream,
                    to_client: Vec::new(),
                }));
            }

            let target = resolve_connect_target(&request.target)?;
            info!("CONNECT {}", target);
            self.connect = Some((request, target));
        }

        // CONNECT headers are drained without inspection.
        let Some(header_len) = self.buffer.header_block_len()? else {
            return Ok(None);
        };
        let Some((request, target)) = self.connect.take() else {
            return Ok(None);
        };
        let headers = self.buffer.take(header_len);
        trace!("Drained {} header bytes for CONNECT {}", headers.len(), target);
        let to_upstream = if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![self.buffer.take_all()]
        };
        let response = format!("{} 200 OK\r\n\r\n", request.version);
        Ok(Some(Routed {
            mode: Mode::Tunnel,
            target,
            version: request.version,
            to_upstream,
            to_client: vec![Bytes::from(response)],
        }))
    }
}

pub struct ConnectionSession<C, K: Connector> {
    peer: String,
    client: Option<C>,
    upstream: Option<K::Stream>,
    /// Present only while parsing; dropping it marks the end of that phase.
    parse_buffer: Option<RequestParser>,
    pending_to_upstream: Vec<Bytes>,
    pending_to_client: Vec<Bytes>,
    target: Option<Target>,
    version: Option<String>,
    mode: Option<Mode>,
    state: SessionState,
    connector: Arc<K>,
    options: SessionOptions,
}

impl<C, K> ConnectionSession<C, K>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    K: Connector,
{
    pub fn new(
        client: C,
        peer: impl Into<String>,
        connector: Arc<K>,
        options: SessionOptions,
    ) -> Self {
        Self {
            peer: peer.into(),
            client: Some(client),
            upstream: None,
            parse_buffer: Some(RequestParser::new(options.max_header_size)),
            pending_to_upstream: Vec::new(),
            pending_to_client: Vec::new(),
            target: None,
            version: None,
            mode: None,
            state: SessionState::Parsing,
            connector,
            options,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Drives the session to completion and closes both sockets.
    pub async fn run(mut self) -> Result<RelayStats, ProxyError> {
        let result = self.drive().await;
        match &result {
            Ok(stats) => info!(
                "[{}] {} {} closed by {}: to_upstream={} to_client={}",
                self.peer,
                self.mode().map(|mode| mode.to_string()).unwrap_or_default(),
                self.target().map(ToString::to_string).unwrap_or_default(),
                stats.closed_by,
                stats.to_upstream,
                stats.to_client
            ),
            Err(err) => {
                debug!("[{}] session failed in {:?}: {}", self.peer, self.state(), err);
                self.report(err).await;
            }
        }
        self.close().await;
        result
    }

    async fn drive(&mut self) -> Result<RelayStats, ProxyError> {
        match self.options.header_timeout {
            Some(limit) => timeout(limit, self.parse())
                .await
                .map_err(|_| ProxyError::HeaderTimeout)??,
            None => self.parse().await?,
        }
        let flushed = self.connect().await?;
        let mut stats = self.relay().await?;
        stats.to_upstream += flushed.0;
        stats.to_client += flushed.1;
        Ok(stats)
    }

    async fn parse(&mut self) -> Result<(), ProxyError> {
        let mut chunk = vec![0u8; self.options.relay_buffer_size];
        loop {
            let client = self
                .client
                .as_mut()
                .ok_or(ProxyError::PeerClosed("parsing"))?;
            let n = client.read(&mut chunk).await?;
            let parser = self
                .parse_buffer
                .as_mut()
                .ok_or(ProxyError::PeerClosed("parsing"))?;
            if n == 0 {
                return Err(if parser.awaiting_headers() {
                    ProxyError::IncompleteHeaders
                } else {
                    ProxyError::PeerClosed("parsing")
                });
            }
            let Some(routed) = parser.feed(&chunk[..n])? else {
                trace!("[{}] {} bytes buffered", self.peer, parser.buffered());
                continue;
            };
            self.parse_buffer = None;
            self.mode = Some(routed.mode);
            self.target = Some(routed.target);
            self.version = Some(routed.version);
            self.pending_to_upstream.extend(routed.to_upstream);
            self.pending_to_client.extend(routed.to_client);
            self.state = SessionState::Connecting;
            return Ok(());
        }
    }

    /// Connects upstream, then flushes both queues. Returns the flushed byte counts.
    async fn connect(&mut self) -> Result<(u64, u64), ProxyError> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| ProxyError::MalformedTarget("no target resolved".to_string()))?;
        let connector = Arc::clone(&self.connector);
        let connecting = connector.connect(&target);
        tokio::pin!(connecting);

        let mut chunk = vec![0u8; self.options.relay_buffer_size];
        let upstream = loop {
            let client = self
                .client
                .as_mut()
                .ok_or(ProxyError::PeerClosed("connecting"))?;
            tokio::select! {
                result = &mut connecting => break result?,
                read = client.read(&mut chunk) => match read? {
                    0 => return Err(ProxyError::PeerClosed("connecting")),
                    n => {
                        trace!("[{}] queued {} bytes while connecting", self.peer, n);
                        self.pending_to_upstream.push(Bytes::copy_from_slice(&chunk[..n]));
                    }
                },
            }
        };

        let upstream = self.upstream.insert(upstream);
        let mut to_upstream = 0;
        for chunk in self.pending_to_upstream.drain(..) {
            upstream.write_all(&chunk).await?;
            to_upstream += chunk.len() as u64;
        }
        upstream.flush().await?;

        let client = self
            .client
            .as_mut()
            .ok_or(ProxyError::PeerClosed("connecting"))?;
        let mut to_client = 0;
        for chunk in self.pending_to_client.drain(..) {
            client.write_all(&chunk).await?;
            to_client += chunk.len() as u64;
        }
        client.flush().await?;

        self.state = SessionState::Relaying;
        debug!(
            "[{}] relaying ({}) to {}",
            self.peer,
            self.mode().map(|mode| mode.to_string()).unwrap_or_default(),
            target
        );
        Ok((to_upstream, to_client))
    }

    async fn relay(&mut self) -> Result<RelayStats, ProxyError> {
        let (Some(client), Some(upstream)) = (self.client.as_mut(), self.upstream.as_mut()) else {
            return Err(ProxyError::PeerClosed("relay"));
        };
        relay(client, upstream, self.options.relay_buffer_size).await
    }

    /// Writes a minimal error response when enabled and nothing was relayed yet.
    async fn report(&mut self, err: &ProxyError) {
        if !self.options.error_responses
            || matches!(self.state, SessionState::Relaying | SessionState::Closed)
        {
            return;
        }
        let Some(status) = err.response_status() else {
            return;
        };
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let version = self.version.as_deref().unwrap_or("HTTP/1.1");
        let response = format!(
            "{} {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            version,
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        if let Err(e) = client.write_all(response.as_bytes()).await {
            debug!("[{}] failed to write error response: {}", self.peer, e);
        }
    }

    /// Shuts down both sockets. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.parse_buffer = None;
        self.pending_to_upstream.clear();
        self.pending_to_client.clear();
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.shutdown().await {
                trace!("[{}] client shutdown: {}", self.peer, e);
            }
        }
        if let Some(mut upstream) = self.upstream.take() {
            if let Err(e) = upstream.shutdown().await {
                trace!("[{}] upstream shutdown: {}", self.peer, e);
            }
        }
    }
}

/// Copies bytes both ways until either side reaches EOF or fails.
///
/// The first side to stop ends the relay for both directions.
pub async fn relay<A, B>(
    client: &mut A,
    upstream: &mut B,
    buffer_size: usize,
) -> Result<RelayStats, ProxyError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut to_upstream = 0u64;
    let mut to_client = 0u64;

    let (closed_by, result) = tokio::select! {
        res = pump(&mut client_read, &mut upstream_write, buffer_size, &mut to_upstream) => (Side::Client, res),
        res = pump(&mut upstream_read, &mut client_write, buffer_size, &mut to_client) => (Side::Upstream, res),
    };

    if let Err(e) = result {
        warn!("Relay error on {} side after {}/{} bytes: {}", closed_by, to_upstream, to_client, e);
        return Err(ProxyError::Io(e));
    }
    Ok(RelayStats {
        to_upstream,
        to_client,
        closed_by,
    })
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    total: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}
