//! Loop-guard events and the observers that receive them.

use parking_lot::Mutex;
use std::fmt;

/// A call the loop guard refused to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A node received a call it originated itself
    SelfDelivery {
        node: String,
        id: String,
        tx: String,
        pattern: String,
    },
    /// A call revisited a node or ran past the hop limit
    MessageLoop {
        node: String,
        id: String,
        tx: String,
        pattern: String,
        path: Vec<String>,
    },
}

impl MeshEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::SelfDelivery { .. } => "own_message",
            MeshEvent::MessageLoop { .. } => "message_loop",
        }
    }

    pub fn tx(&self) -> &str {
        match self {
            MeshEvent::SelfDelivery { tx, .. } | MeshEvent::MessageLoop { tx, .. } => tx,
        }
    }
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::SelfDelivery { node, id, pattern, .. } => {
                write!(f, "node {} received its own message {} ({})", node, id, pattern)
            }
            MeshEvent::MessageLoop { node, id, pattern, path, .. } => write!(
                f,
                "message {} ({}) looped at node {} via {}",
                id,
                pattern,
                node,
                path.join(" > ")
            ),
        }
    }
}

/// Receives loop-guard events. Closures taking `&MeshEvent` qualify.
pub trait MeshObserver: Send + Sync {
    fn on_event(&self, event: &MeshEvent);
}

impl<F> MeshObserver for F
where
    F: Fn(&MeshEvent) + Send + Sync,
{
    fn on_event(&self, event: &MeshEvent) {
        self(event)
    }
}

/// Observer that keeps every event it sees.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<MeshEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MeshEvent> {
        self.events.lock().clone()
    }

    /// Number of events of `kind` ("own_message" or "message_loop")
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl MeshObserver for EventLog {
    fn on_event(&self, event: &MeshEvent) {
        self.events.lock().push(event.clone());
    }
}
