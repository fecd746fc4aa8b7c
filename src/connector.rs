use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::target::Target;

/// Establishes the upstream side of a session.
///
/// Each session invokes the connector independently; implementations must not
/// share mutable state between calls.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, target: &Target) -> Result<Self::Stream, ProxyError>;
}

/// Plain TCP connector. Hostnames go through the OS resolver.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Target) -> Result<TcpStream, ProxyError> {
        let connecting = TcpStream::connect((target.host.as_str(), target.port));
        let result = match self.connect_timeout {
            Some(limit) => timeout(limit, connecting)
                .await
                .map_err(|_| ProxyError::ConnectTimeout(target.to_string()))?,
            None => connecting.await,
        };
        let stream = result.map_err(|source| ProxyError::UpstreamConnect {
            target: target.to_string(),
            source,
        })?;
        stream.set_nodelay(true).ok();
        debug!("Connected to upstream {} ({:?})", target, stream.peer_addr().ok());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = TcpConnector::new(Some(Duration::from_secs(5)));
        let target = Target {
            host: "127.0.0.1".to_string(),
            port,
        };
        let (stream, accepted) = tokio::join!(connector.connect(&target), listener.accept());
        let stream = stream.unwrap();
        let (_, peer) = accepted.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = TcpConnector::default();
        let target = Target {
            host: "127.0.0.1".to_string(),
            port,
        };
        let err = connector.connect(&target).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }), "{err}");
    }
}
