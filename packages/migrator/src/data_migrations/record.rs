//! Source and destination record types at the transformer boundary.
//!
//! Untyped legacy attribute maps stop here: a transform either yields typed
//! [`DestinationRecord`]s or a [`SkipReason`].

use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::kernel::{Attributes, Item, PrimaryKey};

/// Schema version stamped on every destination item.
pub const DYNAMO_VERSION: u64 = 1;

/// One record read from a legacy table. Never written back.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    item: Item,
}

impl SourceRecord {
    pub fn new(item: Item) -> Self {
        Self { item }
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.item.key
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    /// Attribute value, treating `null`, `""` and the string `"null"` as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self.item.get(name)? {
            Value::Null => None,
            Value::String(s) if s.is_empty() || s == "null" => None,
            other => Some(other),
        }
    }

    /// String attribute; numbers are rendered as strings.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.field(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Like [`text`](Self::text), but a missing value makes the record skippable.
    pub fn require(&self, name: &str) -> Result<String, SkipReason> {
        self.text(name)
            .ok_or_else(|| SkipReason::MissingField(name.to_string()))
    }

    /// The record id: its `id` attribute, falling back to the partition key.
    pub fn id(&self) -> String {
        self.text("id").unwrap_or_else(|| self.item.key.pk.clone())
    }

    /// Epoch-milliseconds timestamp from a number, numeric string or RFC 3339 date.
    pub fn timestamp_ms(&self, name: &str) -> Option<i64> {
        match self.field(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse::<i64>().ok().or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|d| d.timestamp_millis())
            }),
            _ => None,
        }
    }

    /// Copy each named attribute that is present into `body`.
    pub fn copy_fields(&self, body: &mut Map<String, Value>, names: &[&str]) {
        for name in names {
            if let Some(value) = self.field(name) {
                body.insert(name.to_string(), value.clone());
            }
        }
    }

    /// Copy list attributes, defaulting absent ones to `[]`.
    pub fn copy_lists(&self, body: &mut Map<String, Value>, names: &[&str]) {
        for name in names {
            let value = match self.field(name) {
                Some(Value::Array(items)) => Value::Array(items.clone()),
                _ => Value::Array(Vec::new()),
            };
            body.insert(name.to_string(), value);
        }
    }
}

/// Why a source record was not migrated. Skips are expected, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingField(String),
    MissingPayload(String),
    InvalidField { field: String, reason: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "missing required field '{}'", name),
            Self::MissingPayload(key) => write!(f, "missing payload {}", key),
            Self::InvalidField { field, reason } => write!(f, "invalid '{}': {}", field, reason),
        }
    }
}

/// Result of transforming one source record.
#[derive(Debug, Clone)]
pub enum Transformed {
    Records(Vec<DestinationRecord>),
    Skip(SkipReason),
}

impl Transformed {
    pub fn one(record: DestinationRecord) -> Self {
        Self::Records(vec![record])
    }
}

impl From<SkipReason> for Transformed {
    fn from(reason: SkipReason) -> Self {
        Self::Skip(reason)
    }
}

/// Secondary-index projection key pair (`GSI{n}PK` / `GSI{n}SK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsiKey {
    pub pk: String,
    pub sk: String,
}

/// A record under the single-table layout.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRecord {
    pub key: PrimaryKey,
    pub gsi: BTreeMap<u8, GsiKey>,
    pub date_created: i64,
    pub date_last_updated: i64,
    /// Dehydrated entity body, stored under `item`.
    pub body: Map<String, Value>,
}

impl DestinationRecord {
    pub fn new(key: PrimaryKey, body: Map<String, Value>, date_created: i64) -> Self {
        Self {
            key,
            gsi: BTreeMap::new(),
            date_created,
            date_last_updated: date_created,
            body,
        }
    }

    /// Set index `n` (1-4).
    pub fn with_gsi(mut self, n: u8, pk: impl Into<String>, sk: impl Into<String>) -> Self {
        self.gsi.insert(
            n,
            GsiKey {
                pk: pk.into(),
                sk: sk.into(),
            },
        );
        self
    }

    pub fn last_updated(mut self, ts: i64) -> Self {
        self.date_last_updated = ts;
        self
    }

    pub fn to_item(&self) -> Item {
        let mut attributes = Attributes::new();
        for (n, key) in &self.gsi {
            attributes.insert(format!("GSI{}PK", n), Value::String(key.pk.clone()));
            attributes.insert(format!("GSI{}SK", n), Value::String(key.sk.clone()));
        }
        attributes.insert("item".into(), Value::Object(self.body.clone()));
        attributes.insert("DynamoVersion".into(), Value::from(DYNAMO_VERSION));
        attributes.insert("dateCreated".into(), Value::from(self.date_created));
        attributes.insert("dateLastUpdated".into(), Value::from(self.date_last_updated));
        Item::new(self.key.clone(), attributes)
    }
}
