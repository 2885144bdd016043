//! Transport configuration.
//!
//! One [`TransportConfig`] describes either side of a link: the address a
//! listener binds, or the destination a client connects to together with
//! its pin, timeout and static headers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::error::{MeshError, Result};
use crate::protocol::pin::PinFilter;

/// Default deadline for a call expecting a reply.
pub const DEFAULT_TIMEOUT_MS: u64 = 22_000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TCP_PORT: u16 = 10101;
pub const DEFAULT_HTTP_PORT: u16 = 10201;
pub const DEFAULT_PATH: &str = "/act";
/// Destination tag used when none is configured.
pub const DEFAULT_DEST: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent length-framed duplex stream
    #[serde(alias = "stream")]
    Tcp,
    /// One HTTP round trip per call
    #[serde(alias = "web", alias = "request-response")]
    Http,
    /// In-process delivery without I/O
    #[serde(alias = "in-process-test")]
    Memtest,
}

impl TransportKind {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tcp => DEFAULT_TCP_PORT,
            TransportKind::Http => DEFAULT_HTTP_PORT,
            TransportKind::Memtest => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Http => "http",
            TransportKind::Memtest => "memtest",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" | "stream" => Ok(TransportKind::Tcp),
            "http" | "web" | "request-response" => Ok(TransportKind::Http),
            "memtest" | "in-process-test" => Ok(TransportKind::Memtest),
            other => Err(MeshError::Config(format!("unknown transport type '{}'", other))),
        }
    }
}

/// Configuration of one listener or one client destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub host: String,
    /// `None` selects the kind's default port; `Some(0)` an ephemeral one
    pub port: Option<u16>,
    /// Subscription filter, e.g. `foo:*`; none makes a catchall
    pub pin: Option<String>,
    /// Destination tag for several listeners of one kind
    pub dest: Option<String>,
    #[serde(rename = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Static headers sent with every HTTP request
    pub headers: BTreeMap<String, String>,
    pub path: String,
    /// Send without waiting for a reply
    pub fire_and_forget: bool,
    /// Stream listeners only: connections they accept become client
    /// destinations with this pin, so calls can go back to the client
    pub peer_pin: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            kind: TransportKind::Http,
            host: DEFAULT_HOST.to_string(),
            port: None,
            pin: None,
            dest: None,
            timeout_ms: None,
            headers: BTreeMap::new(),
            path: DEFAULT_PATH.to_string(),
            fire_and_forget: false,
            peer_pin: None,
        }
    }
}

impl TransportConfig {
    pub fn new(kind: TransportKind) -> Self {
        TransportConfig {
            kind,
            ..Default::default()
        }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(TransportKind::Tcp).with_port(port)
    }

    pub fn http(port: u16) -> Self {
        Self::new(TransportKind::Http).with_port(port)
    }

    pub fn memtest() -> Self {
        Self::new(TransportKind::Memtest)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }

    pub fn with_peer_pin(mut self, pin: impl Into<String>) -> Self {
        self.peer_pin = Some(pin.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// `host:port` as used for binding and connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    pub fn dest_tag(&self) -> &str {
        self.dest.as_deref().unwrap_or(DEFAULT_DEST)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The parsed pin, or `None` for a catchall.
    pub fn pin_filter(&self) -> Result<Option<PinFilter>> {
        self.pin.as_deref().map(PinFilter::parse).transpose()
    }

    /// Reads a configuration from JSON.
    ///
    /// A bare number is taken as an HTTP port, as in `listen(30303)`, and a
    /// configuration without `type` is HTTP too.
    ///
    /// # Example
    ///
    /// ```
    /// use meshact_common::config::{TransportConfig, TransportKind};
    /// use serde_json::json;
    ///
    /// let config = TransportConfig::from_json(&json!({"type": "web", "port": 8080, "pin": "foo:*"})).unwrap();
    /// assert_eq!(config.kind, TransportKind::Http);
    /// assert_eq!(config.address(), "127.0.0.1:8080");
    /// ```
    pub fn from_json(value: &Value) -> Result<Self> {
        if let Some(port) = value.as_u64() {
            let port = u16::try_from(port)
                .map_err(|_| MeshError::Config(format!("port {} out of range", port)))?;
            return Ok(TransportConfig::http(port));
        }
        let config: TransportConfig = serde_json::from_value(value.clone())
            .map_err(|e| MeshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(MeshError::Config("host must not be empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(MeshError::Config(format!("path '{}' must start with '/'", self.path)));
        }
        if !self.headers.is_empty() && self.kind != TransportKind::Http {
            return Err(MeshError::Config(format!(
                "headers are only supported by the http transport, not {}",
                self.kind
            )));
        }
        self.pin_filter()?;
        if let Some(pin) = &self.peer_pin {
            if self.kind != TransportKind::Tcp {
                return Err(MeshError::Config(format!(
                    "peer_pin needs a stream listener, not {}",
                    self.kind
                )));
            }
            PinFilter::parse(pin)?;
        }
        Ok(())
    }
}
