use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ids::{now_ms, MessageId, TxId};
use crate::protocol::pattern::{Args, Pattern};

/// Per-message metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Hop-unique message id, `<random>/<origin-tag>`
    pub id: MessageId,
    /// Transaction id shared by a whole call chain
    pub tx: TxId,
    /// Milliseconds since the Unix epoch when this hop was sent
    #[serde(default)]
    pub sent: u64,
    /// Identity of the node that started this hop sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Node identities the message has traversed, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Destination tag for addressed delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

impl Meta {
    pub fn new(id: impl Into<MessageId>, tx: impl Into<TxId>) -> Self {
        Meta {
            id: id.into(),
            tx: tx.into(),
            sent: now_ms(),
            origin: None,
            path: Vec::new(),
            dest: None,
        }
    }

    /// Metadata for the reply to this message: same id and tx.
    pub fn reply(&self) -> Meta {
        Meta::new(self.id.clone(), self.tx.clone())
    }

    /// Metadata for forwarding this message one hop further.
    ///
    /// The tx, origin and path travel on; the id is replaced and the
    /// destination tag is left to the next route.
    pub fn forward(&self, id: impl Into<MessageId>) -> Meta {
        Meta {
            id: id.into(),
            tx: self.tx.clone(),
            sent: now_ms(),
            origin: self.origin.clone(),
            path: self.path.clone(),
            dest: None,
        }
    }
}

/// A call: the pattern plus its non-scalar arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub pattern: Pattern,
    #[serde(default, skip_serializing_if = "Args::is_empty")]
    pub args: Args,
}

impl Call {
    pub fn new(pattern: Pattern, args: Args) -> Self {
        Call { pattern, args }
    }
}

/// Error carried by an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        WireError {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Body {
    Act(Call),
    Result(Value),
    Error(WireError),
}

/// The unit moved by every transport.
///
/// Serialized as a flat object holding `meta` and exactly one of `act`,
/// `result` or `error`:
///
/// ```json
/// {"meta":{"id":"k2j4h1s9d0/a","tx":"x8d7f6g5h4j3","sent":1700000000000},
///  "act":{"pattern":{"c":1,"d":"A"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: Meta,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn act(meta: Meta, call: Call) -> Self {
        Envelope {
            meta,
            body: Body::Act(call),
        }
    }

    pub fn result(meta: Meta, value: Value) -> Self {
        Envelope {
            meta,
            body: Body::Result(value),
        }
    }

    pub fn error(meta: Meta, error: WireError) -> Self {
        Envelope {
            meta,
            body: Body::Error(error),
        }
    }

    pub fn is_act(&self) -> bool {
        matches!(self.body, Body::Act(_))
    }

    pub fn call(&self) -> Option<&Call> {
        match &self.body {
            Body::Act(call) => Some(call),
            _ => None,
        }
    }
}
