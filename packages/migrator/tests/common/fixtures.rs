//! Test jobs and seed data.
//!
//! `CopyWidgets` is a minimal copy job over `LOCAL_WIDGETS`; `Thing` is an
//! indexed entity whose index rows are exactly the hashes listed in its
//! `facts` attribute, so diffs can be set up by hand.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use migrator_core::data_migrations::{
    DataMigration, DestinationRecord, ExistencePolicy, IndexRow, IndexedEntity,
    MigrationContext, OwnerLookup, SourceRecord, Transformed,
};
use migrator_core::kernel::{Attributes, Item, MemoryStore, PrimaryKey, StoreError};
use serde_json::{json, Map, Value};

pub const DEST_TABLE: &str = "dest";
pub const WIDGETS_TABLE: &str = "LOCAL_WIDGETS";

// ============================================================================
// Copy job
// ============================================================================

pub struct CopyWidgets;

#[async_trait]
impl DataMigration for CopyWidgets {
    fn name(&self) -> &'static str {
        "copy_widgets"
    }

    fn source_table(&self, ctx: &MigrationContext) -> String {
        ctx.legacy_table("WIDGETS")
    }

    fn page_size(&self) -> usize {
        2
    }

    fn existence_policy(&self) -> ExistencePolicy {
        ExistencePolicy::AssumeAbsent
    }

    async fn transform(&self, source: &SourceRecord, _ctx: &MigrationContext) -> Result<Transformed> {
        if source.field("explode").and_then(Value::as_bool) == Some(true) {
            return Err(anyhow!("widget {} cannot be converted", source.id()));
        }
        let id = match source.require("id") {
            Ok(id) => id,
            Err(reason) => return Ok(reason.into()),
        };
        let owner = match source.require("owner") {
            Ok(owner) => owner,
            Err(reason) => return Ok(reason.into()),
        };

        let mut body = Map::new();
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("owner".into(), Value::String(owner));
        Ok(Transformed::one(DestinationRecord::new(
            PrimaryKey::new(format!("WIDGET#{}", id), "WIDGET"),
            body,
            0,
        )))
    }
}

pub fn widget_key(id: &str) -> PrimaryKey {
    PrimaryKey::new(format!("WIDGET#{}", id), "WIDGET")
}

/// `count` valid widgets `w01..`, each with an owner.
pub fn widgets(count: usize) -> Vec<Value> {
    (1..=count)
        .map(|n| json!({"id": format!("w{:02}", n), "owner": "u1"}))
        .collect()
}

pub async fn seeded_store(table: &str, rows: Vec<Value>) -> MemoryStore {
    let store = MemoryStore::new();
    store.seed(table, rows).await.unwrap();
    store
}

// ============================================================================
// Indexed entity
// ============================================================================

pub struct Thing;

pub fn thing_key(id: &str) -> PrimaryKey {
    PrimaryKey::new(format!("THING#{}", id), "THING")
}

pub fn thing_partition(id: &str) -> String {
    format!("HASH#THING#{}", id)
}

/// Entity row for `Thing`
pub fn thing(id: &str, owner: Option<&str>, facts: &[&str]) -> Item {
    let mut attributes = Attributes::new();
    attributes.insert("facts".into(), json!(facts));
    if let Some(owner) = owner {
        attributes.insert("owner".into(), json!(owner));
    }
    Item::new(thing_key(id), attributes)
}

/// Stored index row for `Thing`
pub fn thing_row(id: &str, hash: &str) -> Item {
    IndexRow::new(thing_partition(id), hash).to_item()
}

#[async_trait]
impl IndexedEntity for Thing {
    fn item_type(&self) -> &'static str {
        "THING"
    }

    fn entity_key(&self, id: &str) -> PrimaryKey {
        thing_key(id)
    }

    fn index_partition(&self, id: &str) -> String {
        thing_partition(id)
    }

    fn owner_of(&self, entity: &Item) -> Option<String> {
        entity
            .get_str("owner")
            .filter(|o| !o.is_empty())
            .map(str::to_string)
    }

    fn with_owner(&self, _entity: &Item, owner: &str) -> Attributes {
        let mut changes = Attributes::new();
        changes.insert("owner".into(), json!(owner));
        changes
    }

    fn touch(&self, entity: &Item, now_ms: i64) -> Attributes {
        let mut changes = Attributes::new();
        if let Some(owner) = self.owner_of(entity) {
            changes.insert("GSI1PK".into(), json!(format!("THING#OWNER#{}", owner)));
        }
        changes.insert("dateLastUpdated".into(), json!(now_ms));
        changes
    }

    async fn derive(&self, id: &str, entity: &Item, _ctx: &MigrationContext) -> Result<Vec<IndexRow>> {
        let facts = entity
            .get("facts")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("thing {} has no facts", id))?;
        Ok(facts
            .iter()
            .filter_map(Value::as_str)
            .map(|hash| IndexRow::new(thing_partition(id), hash))
            .collect())
    }
}

/// Owner lookup that always answers with the same owner.
pub struct FixedOwner(pub Option<&'static str>);

#[async_trait]
impl OwnerLookup for FixedOwner {
    async fn lookup_owner(
        &self,
        _id: &str,
        _ctx: &MigrationContext,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.0.map(str::to_string))
    }
}
