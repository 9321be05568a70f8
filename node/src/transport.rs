//! TCP listeners for the client and miners ports.
//!
//! Each connection carries exactly one framed request and one framed
//! response. Handling runs on its own task, since a write request stays
//! open until its block has the required confirmations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use rfs_protocol::config::FRAME_READ_TIMEOUT;
use rfs_protocol::network::wire::{read_frame, write_frame};
use rfs_protocol::network::{Envelope, MinerNode, Request, WireError};

use crate::metrics::SharedMetrics;

/// Which side of the node a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Clients,
    Miners,
}

impl Port {
    fn name(self) -> &'static str {
        match self {
            Port::Clients => "clients",
            Port::Miners => "miners",
        }
    }
}

/// Accept connections on `listener` until the node shuts down.
pub async fn serve(
    listener: TcpListener,
    port: Port,
    node: Arc<MinerNode>,
    metrics: SharedMetrics,
) {
    serve_with(listener, port, node, metrics, FRAME_READ_TIMEOUT).await
}

/// [`serve`] with an explicit deadline for reading each request frame.
pub async fn serve_with(
    listener: TcpListener,
    port: Port,
    node: Arc<MinerNode>,
    metrics: SharedMetrics,
    read_timeout: Duration,
) {
    let mut shutdown = node.subscribe_shutdown();
    if let Ok(addr) = listener.local_addr() {
        info!(port = port.name(), %addr, "listening");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(port = port.name(), error = %e, "accept failed");
                        continue;
                    }
                };
                let node = node.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, port, &node, &metrics, read_timeout).await
                    {
                        debug!(port = port.name(), %remote, error = %e, "connection dropped");
                    }
                });
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    debug!(port = port.name(), "listener stopped");
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A closed channel means the node is gone, which is a shutdown too.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn handle_connection(
    mut stream: TcpStream,
    port: Port,
    node: &MinerNode,
    metrics: &SharedMetrics,
    read_timeout: Duration,
) -> Result<(), WireError> {
    let envelope: Envelope = tokio::time::timeout(read_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| WireError::Timeout(read_timeout))??;
    let kind = envelope.request.kind();
    let is_write = matches!(
        envelope.request,
        Request::CreateFile { .. } | Request::AppendRecord { .. }
    );
    let started = Instant::now();

    let response = match port {
        Port::Clients => node.handle_client(envelope).await,
        Port::Miners => node.handle_peer(envelope).await,
    };

    metrics.observe_request(kind, response.is_error());
    if is_write && !response.is_error() {
        metrics
            .op_confirmation_seconds
            .observe(started.elapsed().as_secs_f64());
    }
    write_frame(&mut stream, &response).await
}

/// Bind `addr`, reporting the address in the error.
pub async fn bind(addr: &str) -> anyhow::Result<(TcpListener, SocketAddr)> {
    use anyhow::Context;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}
