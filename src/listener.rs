//! Accept loop.
//!
//! One [`ConnectionSession`] is spawned per accepted client. Sessions live in a
//! [`JoinSet`] owned by the loop, so shutting the listener down aborts them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connector::{Connector, TcpConnector};
use crate::error::ProxyError;
use crate::session::{ConnectionSession, RelayStats, SessionOptions};

/// Pause after a failed accept so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Listener<K: Connector = TcpConnector> {
    inner: TcpListener,
    connector: Arc<K>,
    options: SessionOptions,
    connection_limit: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl Listener<TcpConnector> {
    pub async fn bind(config: &Config) -> Result<Self, ProxyError> {
        Self::bind_with_connector(config, TcpConnector::new(config.connect_timeout())).await
    }
}

impl<K: Connector + 'static> Listener<K> {
    pub async fn bind_with_connector(config: &Config, connector: K) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(config.listen_addr).await?;
        info!(
            "Forward proxy listening on {} (max_connections: {:?})",
            inner.local_addr()?,
            config.max_connections
        );
        Ok(Self {
            inner,
            connector: Arc::new(connector),
            options: SessionOptions::from(config),
            connection_limit: config
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.inner.local_addr()?)
    }

    /// Cancelling this token stops the accept loop and aborts open sessions.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Accepts clients until the shutdown token is cancelled.
    pub async fn run(self) -> Result<(), ProxyError> {
        let mut sessions = JoinSet::new();

        'accept: loop {
            // Held for the whole session so the cap covers relaying clients too.
            let permit = match &self.connection_limit {
                Some(limit) => tokio::select! {
                    _ = self.shutdown.cancelled() => break 'accept,
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break 'accept,
                    },
                },
                None => None,
            };

            let (stream, peer) = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'accept,
                    Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                        log_session_end(joined);
                    }
                    accepted = self.inner.accept() => match accepted {
                        Ok(pair) => break pair,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                }
            };

            stream.set_nodelay(true).ok();
            debug!("Accepted connection from {}", peer);

            let guard = ActiveGuard::new(Arc::clone(&self.active));
            let session = ConnectionSession::new(
                stream,
                peer.to_string(),
                Arc::clone(&self.connector),
                self.options.clone(),
            );
            sessions.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                session.run().await
            });
        }

        let open = sessions.len();
        if open > 0 {
            info!("Shutting down, aborting {} open sessions", open);
        }
        sessions.shutdown().await;
        info!("Forward proxy on {} stopped", self.inner.local_addr()?);
        Ok(())
    }

    /// Runs the accept loop on a new task.
    pub fn spawn(self) -> Result<ListenerHandle, ProxyError> {
        let local_addr = self.local_addr()?;
        let shutdown = self.shutdown_token();
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(self.run());
        Ok(ListenerHandle {
            local_addr,
            shutdown,
            active,
            task,
        })
    }
}

fn log_session_end(joined: Result<Result<RelayStats, ProxyError>, JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e @ (ProxyError::UpstreamConnect { .. } | ProxyError::ConnectTimeout(_)))) => {
            warn!("{}", e)
        }
        Ok(Err(e)) => debug!("Session ended: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Session task panicked: {}", e),
    }
}

/// Counts a session as active until dropped, aborts included.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    task: JoinHandle<Result<(), ProxyError>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stops accepting, aborts open sessions and waits for the loop to exit.
    pub async fn shutdown(self) -> Result<(), ProxyError> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Io(std::io::Error::other(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        }
    }

    async fn wait_for_active(handle: &ListenerHandle, expected: usize) {
        for _ in 0..100 {
            if handle.active_sessions() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} active sessions, found {}",
            expected,
            handle.active_sessions()
        );
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = Listener::bind(&local_config()).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(listener.active_sessions(), 0);
    }

    #[tokio::test]
    async fn shutdown_aborts_open_sessions() {
        let handle = Listener::bind(&local_config()).await.unwrap().spawn().unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"GET http://exa").await.unwrap();
        wait_for_active(&handle, 1).await;

        handle.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest).await;
        assert!(read.is_err() || rest.is_empty());
    }

    #[tokio::test]
    async fn finished_sessions_are_released() {
        let handle = Listener::bind(&local_config()).await.unwrap().spawn().unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        wait_for_active(&handle, 1).await;

        client.write_all(b"not a request line\r\n").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        wait_for_active(&handle, 0).await;
        handle.shutdown().await.unwrap();
    }
}
