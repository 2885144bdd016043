use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::SystemTime;

pub type MessageId = String;
pub type TxId = String;

const TX_LEN: usize = 12;
const ID_LEN: usize = 10;

/// Random lowercase alphanumeric string of `len` characters.
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Fresh transaction id for a new call chain.
pub fn new_tx() -> TxId {
    random_id(TX_LEN)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identity of one node, created once and kept for the node's lifetime.
///
/// The id is what the loop guard records in a message path; the tag is the
/// `<origin-tag>` suffix of every message id the node mints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    id: String,
    tag: Option<String>,
}

impl NodeIdentity {
    pub fn new(tag: Option<String>) -> Self {
        NodeIdentity {
            id: random_id(TX_LEN),
            tag,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The explicit tag, or the random id when none was given.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.id)
    }

    /// Mints a message id of the form `<random>/<origin-tag>`.
    pub fn message_id(&self) -> MessageId {
        format!("{}/{}", random_id(ID_LEN), self.tag())
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}/{}", self.id, tag),
            None => f.write_str(&self.id),
        }
    }
}
