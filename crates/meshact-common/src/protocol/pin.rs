use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::protocol::error::{MeshError, Result};
use crate::protocol::pattern::{is_scalar, scalar_text, Pattern};
use crate::protocol::text;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinValue {
    Any,
    Literal(String),
}

/// Subscription filter attached to a destination or a listener.
///
/// A filter matches a pattern when every filter key is present in the
/// pattern and its value is equal to the literal, or the filter value is
/// the `*` wildcard. The filter `foo:*` therefore matches `foo:1,bar:2` but
/// not `bar:2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinFilter {
    entries: BTreeMap<String, PinValue>,
}

impl PinFilter {
    /// Parses `key:value,key:*`.
    pub fn parse(input: &str) -> Result<Self> {
        let map = text::parse(input).map_err(|e| MeshError::Config(format!("pin '{}': {}", input, e)))?;
        if map.is_empty() {
            return Err(MeshError::Config(format!("pin '{}' is empty", input)));
        }
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            if !is_scalar(&value) {
                return Err(MeshError::Config(format!(
                    "pin '{}': value for '{}' must be a literal or '*'",
                    input, key
                )));
            }
            entries.insert(key, pin_value(&value));
        }
        Ok(PinFilter { entries })
    }

    pub fn matches(&self, pattern: &Pattern) -> bool {
        self.entries.iter().all(|(key, expected)| match pattern.get(key) {
            None => false,
            Some(_) if *expected == PinValue::Any => true,
            Some(actual) => PinValue::Literal(scalar_text(actual)) == *expected,
        })
    }

    /// Number of filter keys; more keys is more specific.
    pub fn specificity(&self) -> usize {
        self.entries.len()
    }
}

fn pin_value(value: &Value) -> PinValue {
    let text = scalar_text(value);
    if text == WILDCARD {
        PinValue::Any
    } else {
        PinValue::Literal(text)
    }
}

impl FromStr for PinFilter {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        PinFilter::parse(s)
    }
}

impl fmt::Display for PinFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match value {
                PinValue::Any => write!(f, "{}:{}", key, WILDCARD)?,
                PinValue::Literal(literal) => write!(f, "{}:{}", key, literal)?,
            }
        }
        Ok(())
    }
}
