use meshact_common::protocol::error::{MeshError, Result};
use meshact_common::transport::{Channel, ChannelContext, Inbound, ReplySink, Transports};
use meshact_common::{Body, Envelope, Pattern, TransportConfig};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::pending::PendingCalls;
use crate::router::{Destination, DestinationKey, PinRouter};

/// Client side of a node: its destinations, their open channels and the
/// calls waiting on replies.
///
/// All channels share one pending-call table, so a reply is matched by
/// message id whichever channel it comes back on.
pub struct MeshClient {
    transports: Transports,
    router: RwLock<PinRouter>,
    channels: RwLock<HashMap<DestinationKey, Arc<dyn Channel>>>,
    pending: Arc<PendingCalls>,
    inbound: Option<Arc<dyn Inbound>>,
    default_timeout: Duration,
    closed: AtomicBool,
}

impl MeshClient {
    /// Create a client that resolves drivers from `transports`
    pub fn new(transports: Transports, default_timeout: Duration) -> Self {
        MeshClient {
            transports,
            router: RwLock::new(PinRouter::new()),
            channels: RwLock::new(HashMap::new()),
            pending: Arc::new(PendingCalls::new()),
            inbound: None,
            default_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Handles calls that peers initiate back over duplex channels.
    pub fn with_inbound(mut self, inbound: Arc<dyn Inbound>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Registers a destination and opens its channel.
    ///
    /// Registering the same destination twice is a no-op.
    ///
    /// # Errors
    ///
    /// Config errors for a bad pin or unknown transport, connection errors
    /// when the channel cannot be opened.
    pub async fn add_destination(&self, config: TransportConfig) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        config.validate()?;
        let destination = Destination::new(config.clone())?;
        let key = destination.key();
        if self.router.read().contains(&key) {
            return Ok(());
        }

        let driver = self.transports.get(config.kind)?;
        let context = ChannelContext {
            replies: self.pending.clone(),
            inbound: self.inbound.clone(),
        };
        let channel = driver.connect(&config, context).await?;

        let added = {
            let mut router = self.router.write();
            let added = router.add(destination);
            if added {
                self.channels.write().insert(key.clone(), channel.clone());
            }
            added
        };
        if !added {
            // lost a race with an identical registration
            channel.close().await?;
            return Ok(());
        }

        info!(
            kind = %config.kind,
            dest = %config.dest_tag(),
            pin = config.pin.as_deref().unwrap_or("*"),
            "client destination added"
        );
        Ok(())
    }

    /// Registers a destination over a channel that is already open, such
    /// as a connection a listener accepted. An existing destination with
    /// the same key is kept.
    ///
    /// # Errors
    ///
    /// [`MeshError::Closed`] after [`MeshClient::close`], config errors for
    /// a bad pin.
    pub fn attach(&self, config: TransportConfig, channel: Arc<dyn Channel>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        let destination = Destination::new(config)?;
        let key = destination.key();
        let mut router = self.router.write();
        if router.add(destination) {
            self.channels.write().insert(key.clone(), channel);
            debug!(kind = %key.0, address = %key.1, "attached destination");
        }
        Ok(())
    }

    /// Withdraws a destination without closing its channel. Returns false
    /// when it was not registered.
    pub fn detach(&self, config: &TransportConfig) -> bool {
        let Ok(destination) = Destination::new(config.clone()) else {
            return false;
        };
        let key = destination.key();
        let removed = self.router.write().remove(&key).is_some();
        self.channels.write().remove(&key);
        if removed {
            debug!(kind = %key.0, address = %key.1, "detached destination");
        }
        removed
    }

    /// Where replies to this client's calls are delivered.
    pub fn replies(&self) -> Arc<dyn ReplySink> {
        self.pending.clone()
    }

    /// True when some destination would take `pattern`.
    pub fn can_route(&self, pattern: &Pattern) -> bool {
        self.router.read().route(pattern).is_some()
    }

    pub fn has_destinations(&self) -> bool {
        !self.router.read().is_empty()
    }

    /// Snapshot of the registered destinations.
    pub fn destinations(&self) -> Vec<Destination> {
        self.router.read().destinations().to_vec()
    }

    /// Calls currently waiting on a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends a call to the destination its pattern routes to and waits
    /// for the reply.
    ///
    /// The timeout is, in order: `timeout`, the destination's configured
    /// timeout, the client default. Fire-and-forget destinations return
    /// `Ok(None)` as soon as the call is sent.
    ///
    /// # Errors
    ///
    /// - [`MeshError::Routing`] before any I/O when nothing takes the call
    /// - [`MeshError::Remote`] / [`MeshError::NotFound`] as reported by the peer
    /// - [`MeshError::Timeout`] when no reply arrives in time
    pub async fn call(&self, mut envelope: Envelope, timeout: Option<Duration>) -> Result<Option<Value>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        let pattern = match &envelope.body {
            Body::Act(call) => call.pattern.clone(),
            _ => return Err(MeshError::Transport("only calls can be sent".to_string())),
        };
        let tx = envelope.meta.tx.clone();

        let (config, channel) = {
            let router = self.router.read();
            let destination = router.select(&pattern, &tx)?;
            let channel = self
                .channels
                .read()
                .get(&destination.key())
                .cloned()
                .ok_or(MeshError::Closed)?;
            (destination.config.clone(), channel)
        };
        if envelope.meta.dest.is_none() {
            envelope.meta.dest = config.dest.clone();
        }
        debug!(id = %envelope.meta.id, %tx, %pattern, kind = %config.kind, dest = %config.dest_tag(), "sending call");

        if config.fire_and_forget {
            channel.send(envelope).await?;
            return Ok(None);
        }

        let timeout = timeout
            .or_else(|| config.timeout())
            .unwrap_or(self.default_timeout);
        let handle = self.pending.register(&envelope.meta, &pattern, timeout)?;
        channel.send(envelope).await?;
        let reply = handle.wait().await?;

        match reply.body {
            Body::Result(value) => Ok(Some(value)),
            Body::Error(error) => Err(MeshError::from_wire(error, pattern.to_string(), tx)),
            Body::Act(_) => Err(MeshError::Transport(
                "peer answered a call with a call".to_string(),
            )),
        }
    }

    /// Fails pending calls with [`MeshError::Closed`] and closes every
    /// channel once. Errors from individual channels do not stop the
    /// others from closing; the first one is returned.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.fail_all();
        let channels: Vec<_> = self.channels.write().drain().map(|(_, channel)| channel).collect();

        let mut first_error = None;
        for channel in channels {
            if let Err(e) = channel.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
