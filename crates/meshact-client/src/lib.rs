//! meshact Client
//!
//! The outbound half of a node:
//!
//! - [`PinRouter`] picks one destination per call from the pins the
//!   destinations were registered with, falling back to a catchall
//! - [`PendingCalls`] tracks calls awaiting a reply, enforcing their
//!   deadlines so every call settles exactly once
//! - [`MeshClient`] ties both to the open transport channels

pub mod client;
pub mod pending;
pub mod router;

pub use client::MeshClient;
pub use pending::{PendingCalls, PendingHandle};
pub use router::{Destination, DestinationKey, PinRouter};
