//! In-process transport for tests.
//!
//! Listeners register under their destination tag in a shared registry;
//! channels look the tag up at send time and deliver on a spawned task.
//! Nothing touches the network, so routing, ordering and loop behaviour
//! can be exercised without port allocation or timing noise.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::config::{TransportConfig, TransportKind};
use crate::protocol::envelope::Envelope;
use crate::protocol::error::{MeshError, Result};
use crate::transport::codec::JsonCodec;
use crate::transport::{Channel, ChannelContext, Inbound, ListenHandle, ReplySink, Transport};

type Registry = Arc<Mutex<HashMap<String, Arc<dyn Inbound>>>>;

static GLOBAL: OnceLock<MemTransport> = OnceLock::new();

/// In-process transport driver.
///
/// Each `MemTransport::new()` is an isolated network; clones share it.
/// [`MemTransport::global`] is the process-wide one used by default.
#[derive(Clone, Default)]
pub struct MemTransport {
    listeners: Registry,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Self {
        GLOBAL.get_or_init(MemTransport::new).clone()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memtest
    }

    async fn listen(
        &self,
        config: &TransportConfig,
        inbound: Arc<dyn Inbound>,
    ) -> Result<Box<dyn ListenHandle>> {
        let tag = config.dest_tag().to_string();
        {
            let mut listeners = self.listeners.lock();
            if listeners.contains_key(&tag) {
                return Err(MeshError::Bind {
                    addr: format!("memtest:{}", tag),
                    reason: "destination tag already has a listener".to_string(),
                });
            }
            listeners.insert(tag.clone(), inbound.clone());
        }
        debug!(%tag, "memtest listener registered");

        Ok(Box::new(MemListenHandle {
            tag,
            inbound,
            listeners: self.listeners.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect(
        &self,
        config: &TransportConfig,
        context: ChannelContext,
    ) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(MemChannel {
            tag: config.dest_tag().to_string(),
            listeners: self.listeners.clone(),
            replies: context.replies,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemListenHandle {
    tag: String,
    inbound: Arc<dyn Inbound>,
    listeners: Registry,
    closed: AtomicBool,
}

#[async_trait]
impl ListenHandle for MemListenHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut listeners = self.listeners.lock();
        // only remove our own registration
        let ours = listeners
            .get(&self.tag)
            .map(|current| same_inbound(current, &self.inbound))
            .unwrap_or(false);
        if ours {
            listeners.remove(&self.tag);
        }
        Ok(())
    }
}

fn same_inbound(a: &Arc<dyn Inbound>, b: &Arc<dyn Inbound>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct MemChannel {
    tag: String,
    listeners: Registry,
    replies: Arc<dyn ReplySink>,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MemChannel {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        let inbound = self.listeners.lock().get(&self.tag).cloned().ok_or_else(|| {
            MeshError::Connection(format!("no memtest listener for destination tag '{}'", self.tag))
        })?;
        // through the codec, as over a real wire
        let envelope = JsonCodec::decode(&JsonCodec::encode(&envelope)?)?;
        let replies = self.replies.clone();

        tokio::spawn(async move {
            if let Some(reply) = inbound.receive(envelope).await {
                replies.deliver(reply);
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
