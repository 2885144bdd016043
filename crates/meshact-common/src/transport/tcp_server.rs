use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::protocol::error::{MeshError, Result};
use crate::transport::tcp::{pump, Link, Peer, TcpChannel};
use crate::transport::{Channel, Inbound, ListenHandle};

/// Async TCP server accepting stream connections.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:10101")
    ///
    /// # Errors
    ///
    /// [`MeshError::Bind`] when the address is taken or cannot be bound.
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| MeshError::Bind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| MeshError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Starts the accept loop.
    ///
    /// Each accepted connection gets its own reader task; each call read
    /// from it is handed to `inbound` on a task of its own, so one slow
    /// handler never holds up the connection. The connection is offered
    /// to `inbound` as a channel for calls back to the client, and
    /// withdrawn once the reader task ends.
    pub fn start(self, inbound: Arc<dyn Inbound>) -> Result<TcpListenHandle> {
        let addr = self.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = self.listener;

        let task = tokio::spawn(async move {
            let mut accept_shutdown = shutdown_rx.clone();
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "connection established");
                        let _ = stream.set_nodelay(true);
                        let (reader, writer) = stream.into_split();
                        let link = Link::new(peer_addr.to_string(), writer);
                        let channel: Arc<dyn Channel> = Arc::new(TcpChannel::accepted(link.clone()));
                        let replies = inbound.connected(peer_addr, channel);
                        let peer = Peer {
                            inbound: Some(inbound.clone()),
                            replies,
                            link,
                        };
                        let inbound = inbound.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            pump(reader, peer, shutdown).await;
                            inbound.disconnected(peer_addr);
                        });
                    }
                    Err(e) => {
                        error!(%addr, error = %e, "failed to accept connection");
                    }
                }
            }
            debug!(%addr, "tcp accept loop stopped");
        });

        info!(%addr, "tcp listener started");
        Ok(TcpListenHandle {
            addr,
            shutdown,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Handle to a running [`TcpServer`].
pub struct TcpListenHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl ListenHandle for TcpListenHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            // the loop exits on the signal; a panic in it is not ours to report
            let _ = task.await;
        }
        info!(addr = %self.addr, "tcp listener closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_server_local_addr() {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let second = TcpServer::bind(&addr).await;
        assert!(matches!(second, Err(MeshError::Bind { .. })));
    }
}
