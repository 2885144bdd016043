use meshact_client::MeshClient;
use meshact_common::protocol::error::{MeshError, Result};
use meshact_common::transport::{ListenHandle, Transports};
use meshact_common::{
    new_tx, ActionError, Args, Call, Envelope, IntoMessage, Message, Meta, NodeIdentity, Pattern,
    TransportConfig, TxId, DEFAULT_TIMEOUT_MS,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::act::Act;
use crate::events::{MeshEvent, MeshObserver};
use crate::listener::Listener;
use crate::loop_guard::{LoopGuard, LoopGuardConfig};
use crate::registry::{ActionRegistry, Handler, MemoryRegistry, Resolved};

/// Pattern of the built-in action answering with the node identity.
pub const PING_PATTERN: &str = "role:transport,cmd:ping";

/// A meshact node: local actions, listeners and client destinations.
///
/// Calls are resolved locally first; only calls no local action matches
/// go out through the client destinations. Cloning a node is cheap and
/// every clone drives the same node.
///
/// # Example
///
/// ```no_run
/// # async fn run() -> meshact_common::Result<()> {
/// use meshact_common::{ActionError, TransportConfig};
/// use meshact_server::Node;
/// use serde_json::json;
///
/// let node = Node::builder()
///     .tag("adder")
///     .add("role:math,cmd:sum", |act: meshact_server::Act| async move {
///         let left = act.get("left").and_then(|v| v.as_i64()).unwrap_or(0);
///         let right = act.get("right").and_then(|v| v.as_i64()).unwrap_or(0);
///         Ok::<_, ActionError>(json!(left + right))
///     })
///     .build()?;
/// node.listen(TransportConfig::tcp(10101)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) identity: NodeIdentity,
    pub(crate) registry: Arc<dyn ActionRegistry>,
    pub(crate) client: MeshClient,
    pub(crate) guard: LoopGuard,
    observers: Vec<Arc<dyn MeshObserver>>,
    transports: Transports,
    listeners: Mutex<Vec<Box<dyn ListenHandle>>>,
    closed: AtomicBool,
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    tag: Option<String>,
    timeout: Duration,
    guard: LoopGuardConfig,
    observers: Vec<Arc<dyn MeshObserver>>,
    transports: Option<Transports>,
    registry: Option<Arc<dyn ActionRegistry>>,
    actions: Vec<(String, Arc<dyn Handler>)>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        NodeBuilder {
            tag: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            guard: LoopGuardConfig::default(),
            observers: Vec::new(),
            transports: None,
            registry: None,
            actions: Vec::new(),
        }
    }
}

impl NodeBuilder {
    /// Human-readable tag, used in message ids
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Default timeout of outbound calls
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn loop_guard(mut self, config: LoopGuardConfig) -> Self {
        self.guard = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Transport drivers to use instead of the defaults
    pub fn transports(mut self, transports: Transports) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Action registry to use instead of a fresh [`MemoryRegistry`]
    pub fn registry(mut self, registry: Arc<dyn ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Adds an action. The pattern is parsed by [`NodeBuilder::build`].
    pub fn add<F, Fut>(mut self, pattern: &str, handler: F) -> Self
    where
        F: Fn(Act) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ActionError>> + Send + 'static,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.actions.push((pattern.to_string(), handler));
        self
    }

    /// # Errors
    ///
    /// [`MeshError::Decode`] when an action pattern does not parse.
    pub fn build(self) -> Result<Node> {
        let mut actions = Vec::with_capacity(self.actions.len());
        for (text, handler) in self.actions {
            actions.push((Pattern::parse(&text)?, handler));
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MemoryRegistry::new()));
        registry.register(Pattern::parse(PING_PATTERN)?, Arc::new(ping));
        for (pattern, handler) in actions {
            registry.register(pattern, handler);
        }

        let identity = NodeIdentity::new(self.tag);
        let transports = self.transports.unwrap_or_default();
        let guard = LoopGuard::new(self.guard);
        let timeout = self.timeout;
        let observers = self.observers;

        let inner = Arc::new_cyclic(|node| {
            let duplex = Arc::new(Listener::new(node.clone(), None));
            NodeInner {
                client: MeshClient::new(transports.clone(), timeout).with_inbound(duplex),
                identity,
                registry,
                guard,
                observers,
                transports,
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        });
        info!(id = %inner.identity.id(), tag = %inner.identity.tag(), "node created");
        Ok(Node { inner })
    }
}

async fn ping(act: Act) -> std::result::Result<Value, ActionError> {
    let identity = act.identity();
    Ok(json!({ "id": identity.id(), "tag": identity.tag() }))
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Adds an action to a running node.
    pub fn add<F, Fut>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(Act) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ActionError>> + Send + 'static,
    {
        let pattern = Pattern::parse(pattern)?;
        self.inner.registry.register(pattern, Arc::new(handler));
        Ok(())
    }

    /// Starts a listener and returns the bound address, `None` for
    /// in-process listeners.
    ///
    /// With `config.pin` set the listener only answers calls matching the
    /// pin. With `config.peer_pin` set on a stream listener, calls matching
    /// it go back to the clients connected to the listener.
    ///
    /// # Errors
    ///
    /// [`MeshError::Bind`] when the address or tag is taken,
    /// [`MeshError::Config`] for an invalid configuration.
    pub async fn listen(&self, config: TransportConfig) -> Result<Option<SocketAddr>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        config.validate()?;
        let pin = config.pin_filter()?;
        let driver = self.inner.transports.get(config.kind)?;
        let inbound = Arc::new(
            Listener::new(Arc::downgrade(&self.inner), pin).with_peer_pin(config.peer_pin.clone()),
        );
        let handle = driver.listen(&config, inbound).await?;
        let addr = handle.local_addr();

        info!(
            node = %self.inner.identity.tag(),
            kind = %config.kind,
            dest = %config.dest_tag(),
            addr = ?addr,
            "listening"
        );
        self.inner.listeners.lock().push(handle);
        Ok(addr)
    }

    /// Adds a client destination. Calls matching `config.pin` go there;
    /// without a pin it is a catchall.
    pub async fn client(&self, config: TransportConfig) -> Result<()> {
        self.inner.client.add_destination(config).await
    }

    /// Starts a call.
    ///
    /// `tx$` joins an existing transaction, otherwise a new one is
    /// started. `id$` and `timeout$` set the message id and the timeout.
    pub async fn act(&self, message: impl IntoMessage) -> Result<Value> {
        let message = message.into_message()?;
        let tx = message.directives.tx.clone().unwrap_or_else(new_tx);
        self.inner.start(message, tx).await
    }

    /// Closes the listeners, then the client. Pending calls fail with
    /// [`MeshError::Closed`]. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listeners: Vec<_> = self.inner.listeners.lock().drain(..).collect();

        let mut first_error = None;
        for listener in listeners {
            if let Err(e) = listener.close().await {
                warn!(error = %e, "closing listener failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.inner.client.close().await {
            warn!(error = %e, "closing client failed");
            first_error.get_or_insert(e);
        }
        info!(node = %self.inner.identity.tag(), "node closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl NodeInner {
    /// Sends a new message of transaction `tx`.
    pub(crate) async fn start(self: &Arc<Self>, message: Message, tx: TxId) -> Result<Value> {
        let Message {
            pattern,
            args,
            directives,
        } = message;
        let id = directives
            .id
            .unwrap_or_else(|| self.identity.message_id());
        let timeout = directives.timeout_ms.map(Duration::from_millis);
        self.dispatch(pattern, args, Meta::new(id, tx), timeout).await
    }

    async fn dispatch(
        self: &Arc<Self>,
        pattern: Pattern,
        args: Args,
        mut meta: Meta,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }

        if let Some(resolved) = self.registry.resolve(&pattern) {
            debug!(id = %meta.id, tx = %meta.tx, action = %resolved.pattern, "local call");
            return self.invoke(resolved, pattern, args, meta).await;
        }

        if !self.client.has_destinations() {
            return Err(MeshError::NotFound {
                pattern: pattern.to_string(),
                tx: meta.tx,
            });
        }

        if meta.origin.is_none() {
            let me = self.identity.id().to_string();
            meta.origin = Some(me.clone());
            meta.path = vec![me];
        }
        let value = self
            .client
            .call(Envelope::act(meta, Call::new(pattern, args)), timeout)
            .await?;
        Ok(value.unwrap_or(Value::Null))
    }

    /// Runs a local action, turning a handler failure into
    /// [`MeshError::Remote`].
    pub(crate) async fn invoke(
        self: &Arc<Self>,
        resolved: Resolved,
        pattern: Pattern,
        args: Args,
        meta: Meta,
    ) -> Result<Value> {
        let name = pattern.to_string();
        let tx = meta.tx.clone();
        let act = Act::new(self.clone(), pattern, args, meta);
        resolved
            .handler
            .call(act)
            .await
            .map_err(|e| MeshError::Remote {
                pattern: name,
                tx,
                message: e.message,
                code: e.code,
                details: e.details,
            })
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        warn!(node = %self.identity.tag(), kind = event.kind(), tx = %event.tx(), "{}", event);
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}
