use async_trait::async_trait;
use meshact_common::protocol::error::MeshError;
use meshact_common::transport::{Channel, Inbound, ReplySink};
use meshact_common::{Body, Envelope, Meta, PinFilter, TransportConfig};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::events::MeshEvent;
use crate::loop_guard::Verdict;
use crate::node::NodeInner;

/// Receives the calls a transport delivers to a node.
///
/// Holds the node weakly; once the node is gone every call is answered
/// with a closed error. With a peer pin, connections accepted by a stream
/// listener become client destinations of the node while they last.
pub struct Listener {
    node: Weak<NodeInner>,
    pin: Option<PinFilter>,
    peer_pin: Option<String>,
}

impl Listener {
    pub(crate) fn new(node: Weak<NodeInner>, pin: Option<PinFilter>) -> Self {
        Listener {
            node,
            pin,
            peer_pin: None,
        }
    }

    pub(crate) fn with_peer_pin(mut self, peer_pin: Option<String>) -> Self {
        self.peer_pin = peer_pin;
        self
    }

    fn peer_destination(&self, peer: SocketAddr) -> Option<TransportConfig> {
        let pin = self.peer_pin.as_ref()?;
        Some(
            TransportConfig::tcp(peer.port())
                .with_host(peer.ip().to_string())
                .with_pin(pin.clone()),
        )
    }

    async fn handle(&self, node: Arc<NodeInner>, envelope: Envelope) -> Option<Envelope> {
        let Envelope { mut meta, body } = envelope;
        let reply_meta = meta.reply();
        let call = match body {
            Body::Act(call) => call,
            _ => {
                let error = MeshError::Decode("expected a call".to_string());
                return Some(Envelope::error(reply_meta, error.to_wire()));
            }
        };

        match node.guard.check(&node.identity, &mut meta) {
            Verdict::Deliver => {}
            Verdict::SelfDelivery => {
                node.emit(MeshEvent::SelfDelivery {
                    node: node.identity.id().to_string(),
                    id: meta.id,
                    tx: meta.tx,
                    pattern: call.pattern.to_string(),
                });
                return None;
            }
            Verdict::MessageLoop => {
                node.emit(MeshEvent::MessageLoop {
                    node: node.identity.id().to_string(),
                    id: meta.id,
                    tx: meta.tx,
                    pattern: call.pattern.to_string(),
                    path: meta.path,
                });
                return None;
            }
        }

        let not_found = MeshError::NotFound {
            pattern: call.pattern.to_string(),
            tx: meta.tx.clone(),
        };

        if let Some(pin) = &self.pin {
            if !pin.matches(&call.pattern) {
                debug!(id = %meta.id, pattern = %call.pattern, %pin, "call outside listener pin");
                return Some(Envelope::error(reply_meta, not_found.to_wire()));
            }
        }

        if let Some(resolved) = node.registry.resolve(&call.pattern) {
            debug!(id = %meta.id, tx = %meta.tx, action = %resolved.pattern, "handling call");
            let outcome = node.invoke(resolved, call.pattern, call.args, meta).await;
            return Some(reply(reply_meta, outcome.map(Some)));
        }

        if node.client.can_route(&call.pattern) {
            let next = meta.forward(node.identity.message_id());
            debug!(id = %meta.id, next = %next.id, tx = %meta.tx, pattern = %call.pattern, "forwarding call");
            return match node.client.call(Envelope::act(next, call), None).await {
                Err(e) if e.is_timeout() => {
                    debug!(id = %meta.id, tx = %meta.tx, "forwarded call timed out, no reply");
                    None
                }
                outcome => Some(reply(reply_meta, outcome)),
            };
        }

        Some(Envelope::error(reply_meta, not_found.to_wire()))
    }
}

fn reply(meta: Meta, outcome: meshact_common::Result<Option<Value>>) -> Envelope {
    match outcome {
        Ok(value) => Envelope::result(meta, value.unwrap_or(Value::Null)),
        Err(e) => Envelope::error(meta, e.to_wire()),
    }
}

#[async_trait]
impl Inbound for Listener {
    async fn receive(&self, envelope: Envelope) -> Option<Envelope> {
        match self.node.upgrade() {
            Some(node) => self.handle(node, envelope).await,
            None => Some(Envelope::error(
                envelope.meta.reply(),
                MeshError::Closed.to_wire(),
            )),
        }
    }

    fn malformed(&self, error: MeshError, meta: Option<Meta>) -> Envelope {
        let meta = meta
            .map(|meta| meta.reply())
            .unwrap_or_else(|| Meta::new("unknown", "unknown"));
        Envelope::error(meta, error.to_wire())
    }

    fn connected(&self, peer: SocketAddr, link: Arc<dyn Channel>) -> Option<Arc<dyn ReplySink>> {
        let config = self.peer_destination(peer)?;
        let node = self.node.upgrade()?;
        match node.client.attach(config, link) {
            Ok(()) => Some(node.client.replies()),
            Err(e) => {
                warn!(%peer, error = %e, "cannot call back over accepted connection");
                None
            }
        }
    }

    fn disconnected(&self, peer: SocketAddr) {
        if let (Some(config), Some(node)) = (self.peer_destination(peer), self.node.upgrade()) {
            node.client.detach(&config);
        }
    }
}
