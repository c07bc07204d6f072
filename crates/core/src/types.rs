//! Small validated value types shared across the harness.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
}

/// A string type that guarantees non-empty content.
///
/// The input is trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText`, rejecting empty or whitespace-only input.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a backend entity.
///
/// The backend hands out integer ids for most tables and string ids for a few; the harness
/// keeps whichever shape it received so the value can be sent back unchanged.
///
/// Equality, hashing and ordering go through the id text, so `Num(3)` and `Text("3")` name
/// the same entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Num(i64),
    Text(String),
}

impl EntityId {
    /// Reads an id out of a JSON value, accepting numbers and non-empty strings.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(EntityId::Num),
            serde_json::Value::String(s) if !s.trim().is_empty() => {
                Some(EntityId::Text(s.trim().to_owned()))
            }
            _ => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            EntityId::Num(n) => serde_json::Value::from(*n),
            EntityId::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl EntityId {
    fn key(&self) -> std::borrow::Cow<'_, str> {
        match self {
            EntityId::Num(n) => std::borrow::Cow::Owned(n.to_string()),
            EntityId::Text(s) => std::borrow::Cow::Borrowed(s.trim()),
        }
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EntityId::Num(a), EntityId::Num(b)) => a == b,
            _ => self.key() == other.key(),
        }
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Num(n) => write!(f, "{n}"),
            EntityId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Num(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_empty_text_trims() {
        let text = NonEmptyText::new("  admin  ").unwrap();
        assert_eq!(text.as_str(), "admin");
        assert!(matches!(NonEmptyText::new("   "), Err(TextError::Empty)));
    }

    #[test]
    fn test_entity_id_keeps_received_shape() {
        assert_eq!(EntityId::from_value(&json!(10)), Some(EntityId::Num(10)));
        assert_eq!(
            EntityId::from_value(&json!("a1b2")),
            Some(EntityId::Text("a1b2".into()))
        );
        assert_eq!(EntityId::from_value(&json!("")), None);
        assert_eq!(EntityId::from_value(&json!(null)), None);

        let ids: Vec<EntityId> = serde_json::from_value(json!([1, "x"])).unwrap();
        assert_eq!(serde_json::to_value(&ids).unwrap(), json!([1, "x"]));
    }

    #[test]
    fn test_entity_id_numeric_text_equals_number() {
        let text = EntityId::from_value(&json!("3")).unwrap();
        assert_eq!(text, EntityId::Num(3));
        assert_ne!(text, EntityId::Num(30));
        assert_eq!(EntityId::Text(" 7 ".into()), EntityId::Num(7));

        let mut seen = std::collections::HashSet::new();
        seen.insert(EntityId::Num(3));
        assert!(seen.contains(&text));
        // The received shape is still what gets sent back.
        assert_eq!(text.to_value(), json!("3"));
    }
}
