//! Key/value text encoding used for frame bodies.
//!
//! A body is a sequence of `key@=value/` items terminated by a NUL byte.
//! Inside keys and values, `@` is written as `@A` and `/` as `@S`; nested
//! structures (rank lists) are themselves encoded maps escaped this way.
//!
//! Outgoing frames never need escaping, so [`encode_body`] rejects fields
//! containing a reserved character instead of escaping them.

use crate::framing::{EncodeError, FrameError};

const PAIR_SEPARATOR: &str = "@=";
const ITEM_TERMINATOR: char = '/';
const ESCAPE: char = '@';

/// Decoded frame body: field code to string value, in wire order.
///
/// Inserting an existing key replaces its value in place. Lookups of missing
/// keys return `None`; the typed accessors fall back to `0` / `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// String value of a field, empty when missing.
    pub fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// Integer value of a field, `0` when missing or not a number.
    pub fn int(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_default()
    }

    /// The `type` field that names the event kind.
    pub fn kind(&self) -> Option<&str> {
        self.get("type")
    }

    /// Iterate fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

fn is_reserved(c: char) -> bool {
    c == ESCAPE || c == ITEM_TERMINATOR || c == '\0'
}

/// Serialize a map to body bytes, NUL-terminated.
pub fn encode_body(fields: &FieldMap) -> Result<Vec<u8>, EncodeError> {
    let mut out = String::new();
    for (key, value) in fields.iter() {
        if key.chars().any(is_reserved) || value.chars().any(is_reserved) {
            return Err(EncodeError::ReservedDelimiter {
                field: key.to_string(),
            });
        }
        out.push_str(key);
        out.push_str(PAIR_SEPARATOR);
        out.push_str(value);
        out.push(ITEM_TERMINATOR);
    }
    let mut bytes = out.into_bytes();
    bytes.push(0);
    Ok(bytes)
}

/// Parse body bytes into a map.
///
/// Trailing NUL padding is ignored. Any item without a `@=` separator, an
/// unknown escape, or invalid UTF-8 fails the whole body.
pub fn decode_body(bytes: &[u8]) -> Result<FieldMap, FrameError> {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let text = std::str::from_utf8(&bytes[..end])
        .map_err(|e| FrameError::MalformedBody(format!("invalid UTF-8: {e}")))?;
    decode_text(text)
}

fn decode_text(text: &str) -> Result<FieldMap, FrameError> {
    let mut map = FieldMap::new();
    for item in text.split(ITEM_TERMINATOR).filter(|item| !item.is_empty()) {
        let (key, value) = item.split_once(PAIR_SEPARATOR).ok_or_else(|| {
            FrameError::MalformedBody(format!("item `{item}` has no key/value separator"))
        })?;
        map.insert(unescape(key)?, unescape(value)?);
    }
    Ok(map)
}

/// Decode a nested list value, e.g. a rank list, into one map per item.
///
/// `value` is a field value as returned by [`decode_body`]: items separated
/// by `/`, each item an escaped map.
pub fn decode_list(value: &str) -> Result<Vec<FieldMap>, FrameError> {
    value
        .split(ITEM_TERMINATOR)
        .filter(|item| !item.is_empty())
        .map(|item| decode_text(&unescape(item)?))
        .collect()
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('A') => out.push(ESCAPE),
            Some('S') => out.push(ITEM_TERMINATOR),
            Some(other) => {
                return Err(FrameError::MalformedBody(format!(
                    "unknown escape `@{other}`"
                )));
            }
            None => return Err(FrameError::MalformedBody("dangling escape".to_string())),
        }
    }
    Ok(out)
}
