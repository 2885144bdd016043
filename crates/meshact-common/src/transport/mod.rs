//! meshact Transport Layer
//!
//! This module moves envelopes between nodes. A [`Transport`] driver knows
//! how to `listen` (deliver inbound calls to an [`Inbound`]) and how to
//! `connect` (open a [`Channel`] whose replies flow into a [`ReplySink`]).
//!
//! # Drivers
//!
//! - **[`TcpTransport`]**: persistent duplex stream, `[4-byte length as u32 big-endian] + [JSON envelope]`
//! - **[`HttpTransport`]**: one `POST /act` round trip per call, plus `GET` query forms for plain clients
//! - **[`MemTransport`]**: in-process registry keyed by destination tag, no I/O
//!
//! # Message Size Limits
//!
//! The stream transport enforces a maximum frame size of 100 MB to prevent
//! memory exhaustion.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{TransportConfig, TransportKind};
use crate::protocol::envelope::{Envelope, Meta};
use crate::protocol::error::{MeshError, Result};

pub mod codec;
pub mod http;
pub mod http_server;
pub mod memtest;
pub mod tcp;
pub mod tcp_server;

pub use codec::{read_frame, write_frame, JsonCodec, MAX_MESSAGE_SIZE};
pub use http::{HttpChannel, HttpTransport, HyperRequest, HyperResponse};
pub use http_server::{HttpListenHandle, HttpServer};
pub use memtest::MemTransport;
pub use tcp::{TcpChannel, TcpTransport};
pub use tcp_server::{TcpListenHandle, TcpServer};

#[cfg(test)]
mod tests;

/// Receiving side of a listener.
#[async_trait]
pub trait Inbound: Send + Sync + 'static {
    /// Handles one decoded call and returns the reply, or `None` when the
    /// message was dropped and no reply must be sent.
    async fn receive(&self, envelope: Envelope) -> Option<Envelope>;

    /// Builds the error reply for a payload that could not be decoded.
    /// `meta` is whatever could be recovered from the payload.
    fn malformed(&self, error: MeshError, meta: Option<Meta>) -> Envelope;

    /// A stream listener accepted a connection from `peer`. `link` sends
    /// calls back over it; the returned sink receives their replies.
    /// `None` leaves the connection answer-only.
    fn connected(&self, _peer: SocketAddr, _link: Arc<dyn Channel>) -> Option<Arc<dyn ReplySink>> {
        None
    }

    /// An accepted connection ended.
    fn disconnected(&self, _peer: SocketAddr) {}
}

/// Where replies arriving on a channel are delivered, matched by id.
pub trait ReplySink: Send + Sync + 'static {
    /// Delivers a reply; false when no call was waiting for it.
    fn deliver(&self, reply: Envelope) -> bool;

    /// Fails the waiting call `id` with a transport-level error.
    fn fail(&self, id: &str, error: MeshError) -> bool;

    /// True while a call with this id still waits for its reply.
    fn is_waiting(&self, id: &str) -> bool;
}

/// What a channel needs from its owner.
#[derive(Clone)]
pub struct ChannelContext {
    pub replies: Arc<dyn ReplySink>,
    /// Handles calls the peer initiates over a duplex channel
    pub inbound: Option<Arc<dyn Inbound>>,
}

/// Outbound half of a link to one destination.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Sends one envelope. Any reply arrives through the channel's
    /// [`ReplySink`].
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Releases the link. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A running listener.
#[async_trait]
pub trait ListenHandle: Send + Sync {
    /// Bound socket address, `None` for in-process listeners.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stops accepting new work. Idempotent; calls already being handled
    /// still send their replies.
    async fn close(&self) -> Result<()>;
}

/// A transport driver.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Binds according to `config` and starts delivering calls to `inbound`.
    async fn listen(
        &self,
        config: &TransportConfig,
        inbound: Arc<dyn Inbound>,
    ) -> Result<Box<dyn ListenHandle>>;

    /// Opens a channel to the destination described by `config`.
    async fn connect(
        &self,
        config: &TransportConfig,
        context: ChannelContext,
    ) -> Result<Arc<dyn Channel>>;
}

/// The set of drivers a node can use, one per kind.
#[derive(Clone)]
pub struct Transports {
    drivers: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl Transports {
    /// An empty set.
    pub fn empty() -> Self {
        Transports {
            drivers: HashMap::new(),
        }
    }

    /// Adds or replaces the driver for its kind.
    pub fn with(mut self, driver: Arc<dyn Transport>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| MeshError::Config(format!("no driver for transport type {}", kind)))
    }
}

impl Default for Transports {
    /// TCP, HTTP and the process-wide memtest registry.
    fn default() -> Self {
        Transports::empty()
            .with(Arc::new(TcpTransport))
            .with(Arc::new(HttpTransport))
            .with(Arc::new(MemTransport::global()))
    }
}
