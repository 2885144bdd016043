//! Parser for the textual message form.
//!
//! Accepts `key:value, key:value` with optional surrounding braces, nested
//! `{..}` objects, `[..]` arrays and single- or double-quoted strings. Bare
//! values are coerced to numbers, booleans or `null` when they parse as
//! such and are kept as strings otherwise, so `id$:aaa/AAA` and `foo:*`
//! both survive unchanged.

use serde_json::{Map, Number, Value};

use crate::protocol::error::{MeshError, Result};

/// Parses a textual message into a JSON object.
///
/// # Example
///
/// ```
/// use meshact_common::protocol::text;
/// use serde_json::json;
///
/// let map = text::parse("a:1, b:x, c:{d:3}").unwrap();
/// assert_eq!(serde_json::Value::Object(map), json!({"a": 1, "b": "x", "c": {"d": 3}}));
/// ```
pub fn parse(input: &str) -> Result<Map<String, Value>> {
    let mut parser = Parser::new(input);
    parser.skip_ws();
    let map = if parser.peek() == Some('{') {
        parser.bump();
        let map = parser.pairs(Some('}'))?;
        parser.expect('}')?;
        map
    } else {
        parser.pairs(None)?
    };
    parser.skip_ws();
    match parser.peek() {
        None => Ok(map),
        Some(c) => Err(parser.error(&format!("unexpected '{}' after message", c))),
    }
}

/// Coerces a bare token to a JSON scalar.
pub fn coerce(token: &str) -> Value {
    match token {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::Number(n.into());
    }
    if looks_numeric(token) {
        if let Some(n) = token.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }
    Value::String(token.to_string())
}

// Keeps words such as "inf" or "NaN" as strings.
fn looks_numeric(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        && token.chars().any(|c| c.is_ascii_digit())
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Parser {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, reason: &str) -> MeshError {
        MeshError::Decode(format!("invalid message text at {}: {}", self.pos, reason))
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(&format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(&format!("expected '{}', found end of input", expected))),
        }
    }

    fn at_close(&self, close: Option<char>) -> bool {
        match (self.peek(), close) {
            (None, None) => true,
            (Some(c), Some(close)) => c == close,
            _ => false,
        }
    }

    fn pairs(&mut self, close: Option<char>) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.at_close(close) {
                break;
            }
            let key = self.key()?;
            self.expect(':')?;
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                _ if self.at_close(close) => break,
                Some(c) => return Err(self.error(&format!("unexpected '{}'", c))),
                None => return Err(self.error("unterminated object")),
            }
        }
        Ok(map)
    }

    fn key(&mut self) -> Result<String> {
        self.skip_ws();
        if let Some(quote @ ('"' | '\'')) = self.peek() {
            self.bump();
            return self.quoted(quote);
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                ':' => break,
                ',' | '{' | '}' | '[' | ']' => {
                    return Err(self.error(&format!("expected ':' before '{}'", c)))
                }
                _ => self.pos += 1,
            }
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let key = key.trim();
        if key.is_empty() {
            return Err(self.error("empty key"));
        }
        Ok(key.to_string())
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_ws();
        match self.peek() {
            Some('{') => {
                self.bump();
                let map = self.pairs(Some('}'))?;
                self.expect('}')?;
                Ok(Value::Object(map))
            }
            Some('[') => {
                self.bump();
                self.array()
            }
            Some(quote @ ('"' | '\'')) => {
                self.bump();
                Ok(Value::String(self.quoted(quote)?))
            }
            _ => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if matches!(c, ',' | '}' | ']') {
                        break;
                    }
                    self.pos += 1;
                }
                let token: String = self.chars[start..self.pos].iter().collect();
                Ok(coerce(token.trim()))
            }
        }
    }

    fn array(&mut self) -> Result<Value> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                None => return Err(self.error("unterminated array")),
                _ => {}
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {}
                Some(c) => return Err(self.error(&format!("unexpected '{}' in array", c))),
                None => return Err(self.error("unterminated array")),
            }
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c),
            }
        }
    }
}
