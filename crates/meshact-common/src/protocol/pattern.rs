use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::error::{MeshError, Result};
use crate::protocol::text;

/// Non-scalar attributes of a call.
pub type Args = Map<String, Value>;

/// Attribute name carrying the sender's metadata in a request/response body.
pub const META_DIRECTIVE: &str = "meta$";

/// The scalar attributes identifying a call, e.g. `{cmd: "test", role: "x"}`.
///
/// Keys are kept sorted so the display form `cmd:test,role:x` is canonical.
/// Only strings, numbers and booleans are allowed as values; decoding a
/// pattern with a nested value fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Pattern(BTreeMap<String, Value>);

impl Pattern {
    pub fn new() -> Self {
        Pattern(BTreeMap::new())
    }

    /// Adds an attribute, rejecting non-scalar values.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if !is_scalar(&value) {
            return Err(MeshError::Decode(format!(
                "pattern value for '{}' must be a string, number or boolean",
                key
            )));
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Builder-style [`Pattern::insert`] for values that are known scalars.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        self.insert(key, value.into())?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when every attribute of `self` is present in `other` with an
    /// equal value. `1` and `"1"` compare equal, as they would after a trip
    /// through a query string.
    pub fn is_subset_of(&self, other: &Pattern) -> bool {
        self.0.iter().all(|(key, value)| {
            other
                .get(key)
                .map(|candidate| scalar_text(candidate) == scalar_text(value))
                .unwrap_or(false)
        })
    }

    /// Parses the textual form, e.g. `role:transport,cmd:ping`.
    pub fn parse(text: &str) -> Result<Self> {
        let message = Message::parse(text)?;
        if !message.args.is_empty() {
            return Err(MeshError::Decode(format!(
                "pattern '{}' contains non-scalar values",
                text
            )));
        }
        Ok(message.pattern)
    }
}

impl TryFrom<Map<String, Value>> for Pattern {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        let mut pattern = Pattern::new();
        for (key, value) in map {
            pattern.insert(key, value).map_err(|e| e.to_string())?;
        }
        Ok(pattern)
    }
}

impl From<Pattern> for Map<String, Value> {
    fn from(pattern: Pattern) -> Self {
        pattern.0.into_iter().collect()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", key, scalar_text(value))?;
        }
        Ok(())
    }
}

pub fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Text of a scalar without JSON quoting (`"A"` becomes `A`).
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Per-call directives carried as `$`-suffixed attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directives {
    /// `id$`: explicit message id
    pub id: Option<String>,
    /// `tx$`: join an existing chain
    pub tx: Option<String>,
    /// `timeout$`: call timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// A call message split into its pattern, its arguments and its directives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub pattern: Pattern,
    pub args: Args,
    pub directives: Directives,
}

impl Message {
    /// Parses the textual form `key:value, key:{...}`.
    pub fn parse(input: &str) -> Result<Self> {
        Self::from_map(text::parse(input)?)
    }

    /// Splits a JSON object: top-level scalars form the pattern, all other
    /// values become arguments, `$`-suffixed names are directives.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut message = Message::default();
        for (key, value) in map {
            if key.ends_with('$') {
                message.directive(&key, value)?;
            } else if is_scalar(&value) {
                message.pattern.insert(key, value)?;
            } else {
                message.args.insert(key, value);
            }
        }
        Ok(message)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(MeshError::Decode(format!(
                "a message must be a JSON object, got {}",
                other
            ))),
        }
    }

    fn directive(&mut self, key: &str, value: Value) -> Result<()> {
        match key {
            "id$" => self.directives.id = Some(scalar_text(&value)),
            "tx$" => self.directives.tx = Some(scalar_text(&value)),
            "timeout$" => {
                let ms = value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| {
                        MeshError::Decode(format!("timeout$ must be milliseconds, got {}", value))
                    })?;
                self.directives.timeout_ms = Some(ms);
            }
            // meta$ is consumed by the transports; anything else is ignored
            _ => {}
        }
        Ok(())
    }

    /// Pattern and arguments merged back into one object.
    pub fn to_map(&self) -> Map<String, Value> {
        merge(&self.pattern, &self.args)
    }
}

/// Merges pattern and arguments into one object as a handler sees it.
pub fn merge(pattern: &Pattern, args: &Args) -> Map<String, Value> {
    let mut map: Map<String, Value> = pattern.clone().into();
    for (key, value) in args {
        map.insert(key.clone(), value.clone());
    }
    map
}

/// Anything that can be sent as a call message.
pub trait IntoMessage {
    fn into_message(self) -> Result<Message>;
}

impl IntoMessage for Message {
    fn into_message(self) -> Result<Message> {
        Ok(self)
    }
}

impl IntoMessage for &str {
    fn into_message(self) -> Result<Message> {
        Message::parse(self)
    }
}

impl IntoMessage for String {
    fn into_message(self) -> Result<Message> {
        Message::parse(&self)
    }
}

impl IntoMessage for Value {
    fn into_message(self) -> Result<Message> {
        Message::from_value(self)
    }
}

impl IntoMessage for Map<String, Value> {
    fn into_message(self) -> Result<Message> {
        Message::from_map(self)
    }
}

impl IntoMessage for Pattern {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            pattern: self,
            ..Message::default()
        })
    }
}
