//! Shared helpers for the node integration tests

#![allow(dead_code)]

use meshact_common::transport::{MemTransport, Transports};
use meshact_common::ActionError;
use meshact_server::{Act, Node, NodeBuilder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Transports whose memtest registry is private to one test
pub fn transports(mem: &MemTransport) -> Transports {
    Transports::default().with(Arc::new(mem.clone()))
}

pub fn builder(tag: &str) -> NodeBuilder {
    Node::builder()
        .tag(tag)
        .transports(transports(&MemTransport::new()))
        .timeout(Duration::from_secs(5))
}

/// `c:1,d:A` answers `{"s":"1-A"}`
pub async fn join(act: Act) -> Result<Value, ActionError> {
    let c = act.get("c").map(text).unwrap_or_default();
    let d = act.get("d").map(text).unwrap_or_default();
    Ok(json!({ "s": format!("{}-{}", c, d) }))
}

pub async fn bad_wire(_act: Act) -> Result<Value, ActionError> {
    Err(ActionError::new("bad-wire"))
}

/// Answers with the whole message
pub async fn echo(act: Act) -> Result<Value, ActionError> {
    Ok(Value::Object(act.message()))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
