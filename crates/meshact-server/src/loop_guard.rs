use meshact_common::{Meta, NodeIdentity};
use serde::{Deserialize, Serialize};

/// Default number of hops a call may take before it counts as a loop.
pub const DEFAULT_MAX_HOPS: usize = 8;

/// Switches for the checks run on every inbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopGuardConfig {
    /// Refuse calls this node originated itself
    pub check_own_message: bool,
    /// Refuse calls that already passed through this node or went too far
    pub check_message_loop: bool,
    pub max_hops: usize,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        LoopGuardConfig {
            check_own_message: true,
            check_message_loop: true,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// Outcome of [`LoopGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// The call came back to the node that started it
    SelfDelivery,
    /// The call revisited this node or exceeded the hop limit
    MessageLoop,
}

impl Verdict {
    pub fn is_deliver(&self) -> bool {
        matches!(self, Verdict::Deliver)
    }
}

/// Detects calls that circle back through the mesh.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopGuard {
    config: LoopGuardConfig,
}

impl LoopGuard {
    pub fn new(config: LoopGuardConfig) -> Self {
        LoopGuard { config }
    }

    pub fn config(&self) -> &LoopGuardConfig {
        &self.config
    }

    /// Records this node on the call's path and decides whether it may be
    /// delivered.
    ///
    /// A self-delivered call leaves the path untouched. With the loop
    /// check disabled the path is capped to the last `max_hops` entries so
    /// it cannot grow without bound.
    pub fn check(&self, identity: &NodeIdentity, meta: &mut Meta) -> Verdict {
        let me = identity.id();
        if self.config.check_own_message && meta.origin.as_deref() == Some(me) {
            return Verdict::SelfDelivery;
        }

        let seen = meta.path.iter().any(|hop| hop == me);
        meta.path.push(me.to_string());

        if self.config.check_message_loop {
            if seen || meta.path.len() > self.config.max_hops {
                return Verdict::MessageLoop;
            }
        } else if meta.path.len() > self.config.max_hops {
            let excess = meta.path.len() - self.config.max_hops;
            meta.path.drain(..excess);
        }
        Verdict::Deliver
    }
}
