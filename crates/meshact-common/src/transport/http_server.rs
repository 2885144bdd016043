use async_trait::async_trait;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::protocol::envelope::{Call, Envelope, Meta, WireError};
use crate::protocol::error::{self, MeshError, Result};
use crate::protocol::ids::{new_tx, random_id};
use crate::protocol::pattern::Message;
use crate::transport::codec::MAX_MESSAGE_SIZE;
use crate::transport::http::{HttpTransport, HyperRequest, HyperResponse};
use crate::transport::{Inbound, ListenHandle};

/// Origin tag of message ids minted for plain HTTP callers
const WEB_TAG: &str = "web";

/// HTTP server for the request/response transport.
///
/// Serves a single path (by default `/act`). Requests from meshact peers
/// carry their metadata under `meta$`; requests from plain clients get a
/// fresh id and transaction. Request bodies are capped like stream frames.
pub struct HttpServer {
    listener: TcpListener,
    path: Arc<str>,
    max_body: usize,
}

impl HttpServer {
    /// Binds the server.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to bind to (e.g., "127.0.0.1:10201")
    /// * `path` - The request path calls are accepted on
    ///
    /// # Errors
    ///
    /// [`MeshError::Bind`] when the address cannot be bound.
    pub async fn bind(addr: &str, path: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| MeshError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            path: Arc::from(path),
            max_body: MAX_MESSAGE_SIZE,
        })
    }

    /// Largest request body accepted, in bytes.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| MeshError::Transport(format!("Failed to get local address: {}", e)))
    }

    /// Starts the accept loop; every connection is served on its own task.
    pub fn start(self, inbound: Arc<dyn Inbound>) -> Result<HttpListenHandle> {
        let addr = self.local_addr()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let listener = self.listener;
        let path = self.path;
        let max_body = self.max_body;

        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let inbound = inbound.clone();
                let path = path.clone();
                let mut conn_shutdown = shutdown_rx.clone();

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let inbound = inbound.clone();
                        let path = path.clone();
                        async move { Self::handle_request(inbound, &path, max_body, req).await }
                    });

                    let conn = http1::Builder::new().serve_connection(io, service);
                    tokio::pin!(conn);
                    let served = tokio::select! {
                        served = conn.as_mut() => served,
                        _ = conn_shutdown.changed() => {
                            // finish the request in flight, refuse the next one
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(err) = served {
                        tracing::debug!("Error serving connection: {}", err);
                    }
                });
            }
            tracing::debug!("HTTP accept loop on {} stopped", addr);
        });

        tracing::info!("HTTP listener started on {}", addr);
        Ok(HttpListenHandle {
            addr,
            shutdown,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Handles an HTTP request.
    ///
    /// # Arguments
    ///
    /// * `inbound` - Where the decoded call is delivered
    /// * `path` - The accepted request path
    /// * `max_body` - Largest body accepted; larger ones get a decode error
    /// * `req` - The incoming HTTP request
    ///
    /// # Returns
    ///
    /// The HTTP rendering of the reply; never an error, failures become
    /// error responses
    pub async fn handle_request(
        inbound: Arc<dyn Inbound>,
        path: &str,
        max_body: usize,
        req: HyperRequest,
    ) -> std::result::Result<HyperResponse, Infallible> {
        if req.uri().path() != path {
            return Ok(HttpTransport::to_http_error(
                WireError::new(format!("no route for {}", req.uri().path())).with_code(error::CODE_NOT_FOUND),
            ));
        }

        let method = req.method().clone();
        let query = req.uri().query().map(str::to_string);
        let body = match Limited::new(req.into_body(), max_body).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                let err = MeshError::Decode(format!("request body exceeds {} bytes", max_body));
                return Ok(HttpTransport::to_http_error(err.to_wire()));
            }
            Err(e) => {
                let err = MeshError::Transport(format!("Failed to read request body: {}", e));
                return Ok(HttpTransport::to_http_error(err.to_wire()));
            }
        };

        let envelope = match Self::decode_call(&method, query.as_deref(), &body) {
            Ok(envelope) => envelope,
            Err((e, meta)) => {
                let reply = inbound.malformed(e, meta);
                return Ok(HttpTransport::to_http_response(Some(reply)));
            }
        };

        let reply = inbound.receive(envelope).await;
        Ok(HttpTransport::to_http_response(reply))
    }

    fn decode_call(
        method: &hyper::Method,
        query: Option<&str>,
        body: &[u8],
    ) -> std::result::Result<Envelope, (MeshError, Option<Meta>)> {
        let mut map = HttpTransport::message_from_request(method, query, body).map_err(|e| (e, None))?;
        let meta = HttpTransport::take_meta(&mut map).map_err(|e| (e, None))?;
        let message = Message::from_map(map).map_err(|e| (e, meta.clone()))?;

        let meta = meta.unwrap_or_else(|| {
            Meta::new(
                message
                    .directives
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}", random_id(10), WEB_TAG)),
                message.directives.tx.clone().unwrap_or_else(new_tx),
            )
        });
        Ok(Envelope::act(meta, Call::new(message.pattern, message.args)))
    }
}

/// Handle to a running [`HttpServer`].
pub struct HttpListenHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl ListenHandle for HttpListenHandle {
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
            let _ = task.await;
        }
        tracing::info!("HTTP listener on {} closed", self.addr);
        Ok(())
    }
}
