//! meshact Common Types and Transport
//!
//! This crate provides the protocol definitions, the envelope codec and the
//! transport drivers shared by every meshact node.
//!
//! # Overview
//!
//! meshact is the transport and routing layer beneath a pattern-matched
//! RPC system: calls are identified by a pattern of key/value attributes
//! (`cmd:save,role:entity`), satisfied locally when a handler matches and
//! otherwise forwarded to a peer chosen by its pin.
//!
//! - **Protocol Layer**: [`Pattern`], [`PinFilter`], [`Envelope`] and its
//!   [`Meta`], message ids and the textual message parser
//! - **Transport Layer**: stream (TCP), request/response (HTTP) and
//!   in-process drivers behind the [`transport::Transport`] trait
//! - **Configuration**: [`TransportConfig`] for listeners and destinations
//!
//! # Wire protocol
//!
//! - **Stream**: `[4-byte length prefix as u32 big-endian] + [JSON envelope]`
//! - **Request/response**: `POST /act` with the message as a JSON object
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use meshact_common::{Call, Envelope, Message, Meta};
//!
//! let message = Message::parse("cmd:save, role:entity, entity:{name:x}").unwrap();
//! assert_eq!(message.pattern.to_string(), "cmd:save,role:entity");
//!
//! let envelope = Envelope::act(Meta::new("m1/a", "t1"), Call::new(message.pattern, message.args));
//! assert!(envelope.is_act());
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

pub use config::{TransportConfig, TransportKind, DEFAULT_TIMEOUT_MS};
pub use protocol::*;
