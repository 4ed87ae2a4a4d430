//! Normalization of the override `changes` document.
//!
//! The wire field has been observed as a JSON object, a JSON-encoded
//! string, null/absent, and occasionally garbage text. It is parsed once
//! here into a tagged result; nothing downstream inspects raw shapes.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The concrete fields an override may propose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.description.is_none()
    }
}

/// Normalized `changes`: parsed exactly once at the API boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Changes {
    /// No concrete change proposed (null, absent, `{}`, or `"{}"`).
    #[default]
    Empty,
    /// At least one recognized field.
    Fields(ChangeSet),
    /// Unparseable payload, preserved verbatim for diagnostics.
    Invalid(String),
}

impl Changes {
    /// Proposed amount, if one was recognized.
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            Changes::Fields(set) => set.amount,
            _ => None,
        }
    }

    /// Proposed description, if one was recognized.
    pub fn description(&self) -> Option<&str> {
        match self {
            Changes::Fields(set) => set.description.as_deref(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Changes::Empty)
    }
}

/// Normalize a raw `changes` value.
///
/// A JSON-encoded string is unwrapped one level and normalized again; an
/// object with no recognized fields collapses to `Empty`.
pub fn normalize(raw: &Value) -> Changes {
    match raw {
        Value::Null => Changes::Empty,
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Changes::Empty;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(inner @ (Value::Object(_) | Value::Null)) => normalize(&inner),
                _ => Changes::Invalid(text.clone()),
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                return Changes::Empty;
            }
            match serde_json::from_value::<ChangeSet>(raw.clone()) {
                Ok(set) if set.is_empty() => Changes::Empty,
                Ok(set) => Changes::Fields(set),
                Err(_) => Changes::Invalid(raw.to_string()),
            }
        }
        other => Changes::Invalid(other.to_string()),
    }
}

pub(crate) fn de_changes<'de, D>(deserializer: D) -> Result<Changes, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().map(normalize).unwrap_or_default())
}

impl Serialize for Changes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Changes::Empty => serde_json::Map::new().serialize(serializer),
            Changes::Fields(set) => set.serialize(serializer),
            Changes::Invalid(raw) => raw.serialize(serializer),
        }
    }
}
