use meshact_common::protocol::error::Result;
use meshact_common::protocol::pattern::merge;
use meshact_common::{Args, IntoMessage, Meta, NodeIdentity, Pattern};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::node::NodeInner;

/// What an action handler is called with: the call itself and a way to
/// make further calls inside the same transaction.
pub struct Act {
    node: Arc<NodeInner>,
    pattern: Pattern,
    args: Args,
    meta: Meta,
}

impl Act {
    pub(crate) fn new(node: Arc<NodeInner>, pattern: Pattern, args: Args, meta: Meta) -> Self {
        Act {
            node,
            pattern,
            args,
            meta,
        }
    }

    /// Scalar attributes of the call
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Structured arguments of the call
    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Looks an attribute up in the arguments, then in the pattern.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.get(key).or_else(|| self.pattern.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// The whole call as one object
    pub fn message(&self) -> Map<String, Value> {
        merge(&self.pattern, &self.args)
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn tx(&self) -> &str {
        &self.meta.tx
    }

    /// Identity of the node running the handler
    pub fn identity(&self) -> &NodeIdentity {
        &self.node.identity
    }

    /// Makes a nested call. It keeps this call's transaction id and gets
    /// a fresh message id; an explicit `tx$` is ignored.
    pub async fn act(&self, message: impl IntoMessage) -> Result<Value> {
        let message = message.into_message()?;
        self.node.start(message, self.meta.tx.clone()).await
    }
}
