//! Request/response transport.
//!
//! One outbound call is one `POST` round trip. The request body is the call
//! message itself (pattern and argument attributes side by side) plus the
//! sender's metadata under `meta$`, so plain HTTP clients can post the same
//! shape without any metadata:
//!
//! ```text
//! POST /act  {"c":1,"d":"A","meta$":{"id":"k2j4h1s9d0/a","tx":"x8d7f6g5h4j3"}}
//! GET  /act?c=1&d=A
//! GET  /act?args$=c:1, d:{e:2}
//! ```
//!
//! The reply travels in the status code and body:
//!
//! - **200**: the JSON-encoded result
//! - **204**: the message was dropped, no reply follows
//! - **4xx/5xx**: `{"error":{"message":..,"code":..}}`

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::{TransportConfig, TransportKind};
use crate::protocol::envelope::{Body, Envelope, Meta, WireError};
use crate::protocol::error::{self, MeshError, Result};
use crate::protocol::pattern::{merge, META_DIRECTIVE};
use crate::protocol::text;
use crate::transport::http_server::HttpServer;
use crate::transport::{Channel, ChannelContext, Inbound, ListenHandle, ReplySink, Transport};

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// Request/response transport driver and its HTTP conversions.
pub struct HttpTransport;

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn listen(
        &self,
        config: &TransportConfig,
        inbound: Arc<dyn Inbound>,
    ) -> Result<Box<dyn ListenHandle>> {
        let server = HttpServer::bind(&config.address(), &config.path).await?;
        Ok(Box::new(server.start(inbound)?))
    }

    async fn connect(
        &self,
        config: &TransportConfig,
        context: ChannelContext,
    ) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(HttpChannel::new(config, context.replies)?))
    }
}

impl HttpTransport {
    /// Body of the `POST` carrying `envelope`.
    ///
    /// # Errors
    ///
    /// Only calls can be posted; replies travel in the HTTP response.
    pub fn request_body(envelope: &Envelope) -> Result<Vec<u8>> {
        let Body::Act(call) = &envelope.body else {
            return Err(MeshError::Transport(
                "only calls can be sent over http".to_string(),
            ));
        };
        let mut body = merge(&call.pattern, &call.args);
        body.insert(META_DIRECTIVE.to_string(), serde_json::to_value(&envelope.meta)?);
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    /// Reads the message attributes of an incoming request.
    ///
    /// `POST` bodies must be a JSON object (an empty body is an empty
    /// message); `GET` takes one attribute per query parameter, with values
    /// coerced to numbers and booleans where they parse, or a textual
    /// message in the `args$` parameter.
    pub fn message_from_request(method: &Method, query: Option<&str>, body: &[u8]) -> Result<Map<String, Value>> {
        match *method {
            Method::POST => {
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Map::new());
                }
                match serde_json::from_slice(body) {
                    Ok(Value::Object(map)) => Ok(map),
                    Ok(other) => Err(MeshError::Decode(format!(
                        "request body must be a JSON object, got {}",
                        other
                    ))),
                    Err(e) => Err(MeshError::Decode(e.to_string())),
                }
            }
            Method::GET => Self::message_from_query(query.unwrap_or("")),
            ref other => Err(MeshError::Decode(format!("method {} is not supported", other))),
        }
    }

    /// Parses `k=v&k2=v2` and `args$=k:v, k2:{..}` query strings.
    pub fn message_from_query(query: &str) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key == "args$" {
                map.extend(text::parse(&value)?);
            } else {
                map.insert(key.into_owned(), text::coerce(&value));
            }
        }
        Ok(map)
    }

    /// Removes and decodes the sender metadata from a message.
    pub fn take_meta(message: &mut Map<String, Value>) -> Result<Option<Meta>> {
        message
            .remove(META_DIRECTIVE)
            .map(|value| {
                serde_json::from_value(value).map_err(|e| MeshError::Decode(format!("{}: {}", META_DIRECTIVE, e)))
            })
            .transpose()
    }

    /// Create an HTTP response from a listener's verdict
    ///
    /// # Arguments
    ///
    /// * `reply` - The reply envelope, or `None` when the message was dropped
    ///
    /// # Returns
    ///
    /// `200` with the result, an error status with `{"error":..}`, or `204`
    pub fn to_http_response(reply: Option<Envelope>) -> HyperResponse {
        match reply.map(|envelope| envelope.body) {
            None => Self::response(StatusCode::NO_CONTENT, Bytes::new()),
            Some(Body::Result(value)) => Self::json_response(StatusCode::OK, &value),
            Some(Body::Error(error)) => Self::to_http_error(error),
            Some(Body::Act(_)) => Self::to_http_error(
                WireError::new("listener answered with a call").with_code(error::CODE_TRANSPORT),
            ),
        }
    }

    /// Create an HTTP error response; the status follows the error code
    pub fn to_http_error(error: WireError) -> HyperResponse {
        let status = Self::status_for(error.code.as_deref());
        Self::json_response(status, &json!({ "error": error }))
    }

    pub fn status_for(code: Option<&str>) -> StatusCode {
        match code {
            Some(error::CODE_NOT_FOUND) => StatusCode::NOT_FOUND,
            Some(error::CODE_DECODE) | Some(error::CODE_INVALID) => StatusCode::BAD_REQUEST,
            Some(error::CODE_TIMEOUT) => StatusCode::GATEWAY_TIMEOUT,
            Some(error::CODE_CLOSED) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuilds the reply envelope for the call `meta` from an HTTP response.
    ///
    /// Returns `Ok(None)` for `204`: the peer dropped the message.
    pub fn reply_from_response(meta: &Meta, status: StatusCode, body: &[u8]) -> Result<Option<Envelope>> {
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if status.is_success() {
            let value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(body).map_err(|e| MeshError::Decode(e.to_string()))?
            };
            return Ok(Some(Envelope::result(meta.reply(), value)));
        }

        let error = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|mut value| value.get_mut("error").map(Value::take))
            .and_then(|error| serde_json::from_value::<WireError>(error).ok())
            .unwrap_or_else(|| {
                WireError::new(format!("HTTP {}", status)).with_code(error::CODE_TRANSPORT)
            });
        Ok(Some(Envelope::error(meta.reply(), error)))
    }

    fn json_response(status: StatusCode, value: &Value) -> HyperResponse {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::response(status, Bytes::from(body))
    }

    fn response(status: StatusCode, body: Bytes) -> HyperResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        if status != StatusCode::NO_CONTENT {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        response
    }
}

/// Client side of the request/response transport.
///
/// `send` starts the round trip on its own task and returns; the reply (or
/// the failure) is delivered to the reply sink, so concurrent calls never
/// wait on each other.
pub struct HttpChannel {
    client: Client<HttpConnector, Full<Bytes>>,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    replies: Arc<dyn ReplySink>,
    closed: AtomicBool,
}

impl HttpChannel {
    pub fn new(config: &TransportConfig, replies: Arc<dyn ReplySink>) -> Result<Self> {
        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| MeshError::Config(format!("header name '{}': {}", name, e)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| MeshError::Config(format!("header value for '{}': {}", name, e)))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(HttpChannel {
            client: Client::builder(TokioExecutor::new()).build_http(),
            url: format!("http://{}{}", config.address(), config.path),
            headers,
            replies,
            closed: AtomicBool::new(false),
        })
    }

    fn build_request(&self, body: Vec<u8>) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| MeshError::Transport(format!("Failed to build request: {}", e)))
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        let request = self.build_request(HttpTransport::request_body(&envelope)?)?;
        let client = self.client.clone();
        let replies = self.replies.clone();
        let meta = envelope.meta;
        let url = self.url.clone();

        tokio::spawn(async move {
            let response = match client.request(request).await {
                Ok(response) => response,
                Err(e) => {
                    replies.fail(
                        &meta.id,
                        MeshError::Connection(format!("HTTP request to {} failed: {}", url, e)),
                    );
                    return;
                }
            };
            let status = response.status();
            let body = match response.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    replies.fail(
                        &meta.id,
                        MeshError::Transport(format!("Failed to read response: {}", e)),
                    );
                    return;
                }
            };
            match HttpTransport::reply_from_response(&meta, status, &body) {
                Ok(Some(reply)) => {
                    replies.deliver(reply);
                }
                Ok(None) => debug!(id = %meta.id, %url, "peer dropped the message"),
                Err(e) => {
                    replies.fail(&meta.id, e);
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
