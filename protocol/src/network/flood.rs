//! # Block Flooding
//!
//! Every block this node accepts, mined or received, is pushed to every
//! configured peer except the one it came from. Deliveries run
//! concurrently and each has its own deadline, so a dead peer costs one
//! timeout and never delays the others.
//!
//! There is no dedup cache: a peer that already has the block answers
//! `BlockAccepted { known: true }` and does not flood it again, which is
//! what stops the wave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::PEER_REQUEST_TIMEOUT;
use crate::crypto::hash::short_hex;
use crate::network::rpc::{Envelope, Request, Response};
use crate::network::wire::{self, WireError};
use crate::storage::block::Block;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("peer refused: {0}")]
    Remote(String),
}

/// One request/response exchange with a peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn request(&self, addr: &str, envelope: Envelope) -> Result<Response, TransportError>;
}

/// Opens a fresh TCP connection per exchange.
#[derive(Debug, Clone, Default)]
pub struct TcpPeerClient;

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn request(&self, addr: &str, envelope: Envelope) -> Result<Response, TransportError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Ok(wire::exchange(&mut stream, &envelope).await?)
    }
}

// ---------------------------------------------------------------------------
// Flooder
// ---------------------------------------------------------------------------

/// Outcome of one flood.
#[derive(Debug, Default)]
pub struct FloodReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<(String, TransportError)>,
}

pub struct Flooder {
    /// This node's own peer-facing address, sent as the envelope origin.
    local_addr: String,
    peers: Vec<String>,
    client: Arc<dyn PeerClient>,
    timeout: Duration,
}

impl Flooder {
    pub fn new(local_addr: impl Into<String>, peers: Vec<String>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            local_addr: local_addr.into(),
            peers,
            client,
            timeout: PEER_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Send `block` to every peer except `origin`.
    pub async fn flood(&self, block: &Block, origin: Option<&str>) -> FloodReport {
        let targets: Vec<&String> = self
            .peers
            .iter()
            .filter(|p| Some(p.as_str()) != origin)
            .collect();

        let deliveries = targets.iter().map(|addr| async move {
            let envelope = Envelope::from_peer(
                self.local_addr.clone(),
                Request::Block {
                    block: block.clone(),
                },
            );
            let result =
                match tokio::time::timeout(self.timeout, self.client.request(addr, envelope)).await {
                    Ok(Ok(Response::Error { message })) => Err(TransportError::Remote(message)),
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TransportError::Timeout(self.timeout)),
                };
            (addr.to_string(), result)
        });

        let mut report = FloodReport {
            attempted: targets.len(),
            ..FloodReport::default()
        };
        for (addr, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(peer = %addr, block = %short_hex(&block.hash), error = %e, "flood delivery failed");
                    report.failures.push((addr, e));
                }
            }
        }
        debug!(
            block = %short_hex(&block.hash),
            attempted = report.attempted,
            delivered = report.delivered,
            "block flooded"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records deliveries; `dead` peers fail, `slow` peers never answer.
    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Vec<(String, Option<String>)>>,
        dead: Vec<String>,
        slow: Vec<String>,
    }

    #[async_trait]
    impl PeerClient for RecordingClient {
        async fn request(&self, addr: &str, envelope: Envelope) -> Result<Response, TransportError> {
            if self.slow.iter().any(|p| p == addr) {
                std::future::pending::<()>().await;
            }
            self.seen.lock().push((addr.to_string(), envelope.origin));
            if self.dead.iter().any(|p| p == addr) {
                return Ok(Response::error("no space left"));
            }
            Ok(Response::BlockAccepted { known: false })
        }
    }

    fn peers() -> Vec<String> {
        vec!["a:1".into(), "b:1".into(), "c:1".into()]
    }

    #[tokio::test]
    async fn skips_origin_and_stamps_local_addr() {
        let client = Arc::new(RecordingClient::default());
        let flooder = Flooder::new("me:1", peers(), client.clone());

        let report = flooder.flood(&Block::genesis(), Some("b:1")).await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        let mut seen = client.seen.lock().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a:1".to_string(), Some("me:1".to_string())),
                ("c:1".to_string(), Some("me:1".to_string())),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_collected_not_fatal() {
        let client = Arc::new(RecordingClient {
            dead: vec!["a:1".into()],
            slow: vec!["b:1".into()],
            ..RecordingClient::default()
        });
        let flooder =
            Flooder::new("me:1", peers(), client).with_timeout(Duration::from_millis(50));

        let report = flooder.flood(&Block::genesis(), None).await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .any(|(p, e)| p == "a:1" && matches!(e, TransportError::Remote(_))));
        assert!(report
            .failures
            .iter()
            .any(|(p, e)| p == "b:1" && matches!(e, TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn unreachable_tcp_peer_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpPeerClient
            .request(&addr, Envelope::client(Request::ListFiles))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
