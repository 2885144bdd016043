//! meshact Server
//!
//! A [`Node`] owns local actions, the listeners that receive calls for
//! them and a client that carries everything else to other nodes. Every
//! inbound call passes the [`LoopGuard`] before it is resolved.

pub mod act;
pub mod events;
pub mod listener;
pub mod loop_guard;
pub mod node;
pub mod registry;

pub use act::Act;
pub use events::{EventLog, MeshEvent, MeshObserver};
pub use listener::Listener;
pub use loop_guard::{LoopGuard, LoopGuardConfig, Verdict, DEFAULT_MAX_HOPS};
pub use node::{Node, NodeBuilder, PING_PATTERN};
pub use registry::{ActionRegistry, Handler, MemoryRegistry, Resolved};
