use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::config::{TransportConfig, TransportKind};
use crate::protocol::envelope::Envelope;
use crate::protocol::ids::MessageId;
use crate::protocol::error::{MeshError, Result};
use crate::transport::codec::{read_frame, write_frame, JsonCodec};
use crate::transport::tcp_server::TcpServer;
use crate::transport::{Channel, ChannelContext, Inbound, ListenHandle, ReplySink, Transport};

/// Write half of a connection, shared by every task that replies on it.
type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Stream transport driver.
///
/// Every channel is one persistent TCP connection carrying length-framed
/// JSON envelopes in both directions:
///
/// ```text
/// [4-byte length] [JSON envelope]
/// ```
///
/// Calls are multiplexed: each inbound call is handled on its own task and
/// replies are matched by message id, so they may arrive in any order.
/// Either end may start a call. When the connection drops, calls still
/// waiting on it fail with [`MeshError::Connection`] straight away.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn listen(
        &self,
        config: &TransportConfig,
        inbound: Arc<dyn Inbound>,
    ) -> Result<Box<dyn ListenHandle>> {
        let server = TcpServer::bind(&config.address()).await?;
        Ok(Box::new(server.start(inbound)?))
    }

    async fn connect(
        &self,
        config: &TransportConfig,
        context: ChannelContext,
    ) -> Result<Arc<dyn Channel>> {
        let channel = TcpChannel::connect(&config.address(), context).await?;
        Ok(Arc::new(channel))
    }
}

/// In-flight ids kept before those whose reply never came are swept out
const SWEEP_AT: usize = 256;

/// Sending side of one connection, shared by its channel and reader task.
pub(crate) struct Link {
    addr: String,
    writer: SharedWriter,
    in_flight: parking_lot::Mutex<InFlight>,
}

#[derive(Default)]
struct InFlight {
    ids: HashSet<MessageId>,
    lost: bool,
}

impl Link {
    pub(crate) fn new(addr: String, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Link {
            addr,
            writer: Arc::new(Mutex::new(writer)),
            in_flight: parking_lot::Mutex::new(InFlight::default()),
        })
    }

    /// Records a call about to be written. Fails once the connection is
    /// lost, so no call can slip in after [`Link::lose`] swept the table.
    fn track(&self, id: &str) -> Result<()> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.lost {
            return Err(MeshError::Connection(format!(
                "connection to {} was lost",
                self.addr
            )));
        }
        in_flight.ids.insert(id.to_string());
        Ok(())
    }

    fn untrack(&self, id: &str) {
        self.in_flight.lock().ids.remove(id);
    }

    /// A reply for `id` came back.
    fn settled(&self, id: &str, replies: &dyn ReplySink) {
        let mut in_flight = self.in_flight.lock();
        in_flight.ids.remove(id);
        if in_flight.ids.len() >= SWEEP_AT {
            in_flight.ids.retain(|id| replies.is_waiting(id));
        }
    }

    /// Marks the connection lost and fails every call still waiting on it.
    fn lose(&self, replies: Option<&Arc<dyn ReplySink>>, reason: &str) {
        let ids: Vec<MessageId> = {
            let mut in_flight = self.in_flight.lock();
            in_flight.lost = true;
            in_flight.ids.drain().collect()
        };
        let Some(replies) = replies else {
            return;
        };
        for id in ids {
            let error = MeshError::Connection(format!("connection to {} lost: {}", self.addr, reason));
            if replies.fail(&id, error) {
                debug!(peer = %self.addr, %id, "failed call in flight on lost connection");
            }
        }
    }
}

/// One side of a stream connection.
///
/// Channels opened with [`TcpChannel::connect`] own their reader task;
/// channels over accepted connections share the listener's.
pub struct TcpChannel {
    link: Arc<Link>,
    shutdown: Option<watch::Sender<bool>>,
    closed: AtomicBool,
}

impl TcpChannel {
    /// Connects to a remote endpoint.
    ///
    /// This method resolves the address (which may resolve to multiple
    /// addresses) and attempts to connect to each until one succeeds, then
    /// starts the reader task for the connection.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:10101")
    /// * `context` - Where replies and peer-initiated calls go
    pub async fn connect(addr: &str, context: ChannelContext) -> Result<Self> {
        let socket_addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| MeshError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        // Try each resolved address until one succeeds
        let mut last_err = None;
        let mut connected = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(&socket_addr).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let stream = connected.ok_or_else(|| {
            MeshError::Connection(format!(
                "Failed to connect to {}: {}",
                addr,
                last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string())
            ))
        })?;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let link = Link::new(addr.to_string(), writer);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let peer = Peer {
            inbound: context.inbound,
            replies: Some(context.replies),
            link: link.clone(),
        };
        tokio::spawn(pump(reader, peer, shutdown_rx));
        debug!(addr, "tcp channel connected");

        Ok(TcpChannel {
            link,
            shutdown: Some(shutdown),
            closed: AtomicBool::new(false),
        })
    }

    /// Channel over a connection a listener accepted.
    pub(crate) fn accepted(link: Arc<Link>) -> Self {
        TcpChannel {
            link,
            shutdown: None,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        let id = envelope.is_act().then(|| envelope.meta.id.clone());
        if let Some(id) = &id {
            self.link.track(id)?;
        }
        let sent = send_envelope(&self.link.writer, &envelope).await;
        if let (Err(_), Some(id)) = (&sent, &id) {
            self.link.untrack(id);
        }
        sent
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(shutdown) = &self.shutdown {
            let _ = shutdown.send(true);
        }
        let mut writer = self.link.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
            Err(e) => debug!(addr = %self.link.addr, error = %e, "tcp channel shutdown failed"),
        }
        debug!(addr = %self.link.addr, "tcp channel closed");
        Ok(())
    }
}

/// One end of a stream connection as seen by its reader task.
pub(crate) struct Peer {
    pub inbound: Option<Arc<dyn Inbound>>,
    pub replies: Option<Arc<dyn ReplySink>>,
    pub link: Arc<Link>,
}

/// Encodes and writes one envelope under the connection's write lock.
async fn send_envelope(writer: &SharedWriter, envelope: &Envelope) -> Result<()> {
    let encoded = JsonCodec::encode(envelope)?;
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &encoded).await
}

/// Reader loop of one connection.
///
/// Calls go to the inbound side on their own task, replies go to the reply
/// sink. Undecodable frames are answered with a decode error. Runs until
/// the peer disconnects or `shutdown` fires; either way the calls still
/// waiting on this connection fail with a connection error.
pub(crate) async fn pump(
    mut reader: OwnedReadHalf,
    peer: Peer,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = peer.link.addr.clone();
    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break "closed".to_string(),
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(peer = %addr, "connection closed by peer");
                break "closed by peer".to_string();
            }
            Err(e) => {
                error!(peer = %addr, error = %e, "connection error");
                break e.to_string();
            }
        };

        match JsonCodec::decode(&frame) {
            Ok(envelope) if envelope.is_act() => {
                let Some(inbound) = peer.inbound.clone() else {
                    warn!(peer = %addr, id = %envelope.meta.id, "call received on a connection without a listener");
                    continue;
                };
                let link = peer.link.clone();
                tokio::spawn(async move {
                    if let Some(reply) = inbound.receive(envelope).await {
                        if let Err(e) = send_envelope(&link.writer, &reply).await {
                            warn!(peer = %link.addr, id = %reply.meta.id, error = %e, "failed to send reply");
                        }
                    }
                });
            }
            Ok(reply) => match &peer.replies {
                Some(replies) => {
                    peer.link.settled(&reply.meta.id, replies.as_ref());
                    replies.deliver(reply);
                }
                None => {
                    warn!(peer = %addr, id = %reply.meta.id, "reply received on a connection that sent no calls")
                }
            },
            Err(e) => {
                let meta = JsonCodec::salvage_meta(&frame);
                // a broken reply still settles the call it answers
                if let (Some(replies), Some(meta)) = (&peer.replies, &meta) {
                    if replies.fail(&meta.id, MeshError::Decode(e.to_string())) {
                        peer.link.settled(&meta.id, replies.as_ref());
                        continue;
                    }
                }
                match &peer.inbound {
                    Some(inbound) => {
                        let reply = inbound.malformed(e, meta);
                        if let Err(e) = send_envelope(&peer.link.writer, &reply).await {
                            warn!(peer = %addr, error = %e, "failed to send decode error");
                        }
                    }
                    None => {
                        warn!(peer = %addr, error = %e, "undecodable frame discarded");
                    }
                }
            }
        }
    };
    peer.link.lose(peer.replies.as_ref(), &reason);
}
