pub mod envelope;
pub mod error;
pub mod ids;
pub mod pattern;
pub mod pin;
pub mod text;

#[cfg(test)]
mod tests;

pub use envelope::{Body, Call, Envelope, Meta, WireError};
pub use error::{ActionError, MeshError, Result};
pub use ids::{new_tx, now_ms, random_id, MessageId, NodeIdentity, TxId};
pub use pattern::{Args, Directives, IntoMessage, Message, Pattern};
pub use pin::PinFilter;
