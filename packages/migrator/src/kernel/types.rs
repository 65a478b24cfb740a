//! Record, key and cursor types shared by every store implementation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use super::error::StoreError;

/// Largest batch a store accepts for a single write or delete call.
pub const MAX_BATCH_ITEMS: usize = 25;

/// Attribute map of a stored item, excluding its primary key.
pub type Attributes = Map<String, Value>;

/// Partition + sort key pair. Unique within a table.
///
/// Legacy tables are keyed by `id` alone; their items use an empty sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey {
    #[serde(rename = "PK")]
    pub pk: String,
    #[serde(rename = "SK", default)]
    pub sk: String,
}

impl PrimaryKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// Key for a table with no sort key.
    pub fn partition(pk: impl Into<String>) -> Self {
        Self::new(pk, "")
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sk.is_empty() {
            write!(f, "{}", self.pk)
        } else {
            write!(f, "{}/{}", self.pk, self.sk)
        }
    }
}

/// A stored item: its key plus the remaining attributes. Serializes in the
/// flat form of [`Item::to_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct Item {
    pub key: PrimaryKey,
    pub attributes: Attributes,
}

impl Item {
    pub fn new(key: PrimaryKey, attributes: Attributes) -> Self {
        Self { key, attributes }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Flat JSON form with `PK`/`SK` inlined, as written to snapshot files.
    pub fn to_json(&self) -> Value {
        let mut flat = self.attributes.clone();
        flat.insert("PK".into(), Value::String(self.key.pk.clone()));
        if !self.key.sk.is_empty() {
            flat.insert("SK".into(), Value::String(self.key.sk.clone()));
        }
        Value::Object(flat)
    }

    /// Parse a flat JSON object. Objects without `PK` fall back to their
    /// `id` attribute, which is how legacy table dumps are keyed.
    pub fn from_json(value: Value) -> Result<Self, StoreError> {
        let Value::Object(mut attributes) = value else {
            return Err(StoreError::Backend("item is not a JSON object".into()));
        };

        let pk = match attributes.remove("PK") {
            Some(Value::String(pk)) => pk,
            Some(other) => {
                return Err(StoreError::Backend(format!("PK must be a string, got {}", other)))
            }
            None => match attributes.get("id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(StoreError::Backend("item has neither PK nor id".into())),
            },
        };
        let sk = match attributes.remove("SK") {
            Some(Value::String(sk)) => sk,
            _ => String::new(),
        };

        Ok(Self::new(PrimaryKey::new(pk, sk), attributes))
    }
}

impl From<Item> for Value {
    fn from(item: Item) -> Self {
        item.to_json()
    }
}

impl TryFrom<Value> for Item {
    type Error = StoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Item::from_json(value)
    }
}

/// Opaque scan position. Serialized verbatim into checkpoint files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub Value);

impl Cursor {
    /// Cursor positioned just after `key` (exclusive start).
    pub fn after(key: &PrimaryKey) -> Self {
        Cursor(json!({ "PK": key.pk, "SK": key.sk }))
    }

    /// Decode a cursor produced by [`Cursor::after`].
    pub fn last_key(&self) -> Option<PrimaryKey> {
        serde_json::from_value(self.0.clone()).ok()
    }
}

/// One page of a table scan. `next_cursor` is absent once the table is exhausted.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub next_cursor: Option<Cursor>,
}

/// Acknowledgement of a batch write or delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteAck {
    /// Keys the store accepted the call for but did not apply.
    pub unprocessed: Vec<PrimaryKey>,
}

impl WriteAck {
    pub fn complete() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.unprocessed.is_empty()
    }
}
