//! Index reconciliation: keep an entity's denormalized index rows equal to
//! what its current state derives, writing only the symmetric difference.
//!
//! Per entity:
//! 1. repair a missing owner (the derivation depends on it), rewriting the
//!    entity's own projection keys in the same update
//! 2. derive the target rows from current state
//! 3. query the rows currently stored
//! 4. diff by hash identity
//! 5. delete stale rows, then insert new ones

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

use super::MigrationContext;
use crate::kernel::{
    Attributes, BaseStoreClient, Item, PrimaryKey, StoreError, MAX_BATCH_ITEMS,
};

/// One materialized membership fact, keyed by `(partition, hash)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub partition: String,
    pub hash: String,
    /// Projection keys and denormalized display fields
    pub attributes: Attributes,
}

impl IndexRow {
    pub fn new(partition: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            hash: hash.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn key(&self) -> PrimaryKey {
        PrimaryKey::new(self.partition.clone(), self.hash.clone())
    }

    pub fn to_item(&self) -> Item {
        Item::new(self.key(), self.attributes.clone())
    }

    pub fn from_item(item: Item) -> Self {
        Self {
            partition: item.key.pk,
            hash: item.key.sk,
            attributes: item.attributes,
        }
    }
}

#[derive(Debug, Default)]
pub struct IndexDiff {
    pub to_add: Vec<IndexRow>,
    pub to_remove: Vec<IndexRow>,
    /// Hashes present on both sides; never rewritten
    pub unchanged: Vec<String>,
}

/// `to_add = target - current`, `to_remove = current - target`,
/// `unchanged = target ∩ current`, by hash. Duplicate target hashes collapse
/// to their first occurrence.
pub fn diff_index_rows(target: Vec<IndexRow>, current: Vec<IndexRow>) -> IndexDiff {
    let mut wanted: BTreeMap<String, IndexRow> = BTreeMap::new();
    for row in target {
        wanted.entry(row.hash.clone()).or_insert(row);
    }

    let mut present = HashSet::new();
    let mut diff = IndexDiff::default();
    for row in current {
        if !present.insert(row.hash.clone()) {
            continue;
        }
        if !wanted.contains_key(&row.hash) {
            diff.to_remove.push(row);
        }
    }

    for (hash, row) in wanted {
        if present.contains(&hash) {
            diff.unchanged.push(hash);
        } else {
            diff.to_add.push(row);
        }
    }

    diff
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Apply,
    /// Compute everything, write nothing
    DryRun,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub owner_fixed: bool,
}

impl ReconcileOutcome {
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.removed > 0 || self.owner_fixed
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub entity_id: String,
    pub outcome: ReconcileOutcome,
    pub owner: Option<String>,
    pub added_hashes: Vec<String>,
    pub removed_hashes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{item_type} {id} not found")]
    EntityNotFound { item_type: &'static str, id: String },

    #[error("owner of {item_type} {id} could not be resolved")]
    OwnerUnresolved { item_type: &'static str, id: String },

    #[error("index derivation failed for {id}: {source}")]
    Derivation {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{unprocessed} index rows of {id} were not applied")]
    Incomplete { id: String, unprocessed: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An entity type whose index rows can be derived from its current state.
#[async_trait]
pub trait IndexedEntity: Send + Sync {
    /// Item type label, e.g. `CUBE`
    fn item_type(&self) -> &'static str;

    fn entity_key(&self, id: &str) -> PrimaryKey;

    /// Partition the entity's index rows live under
    fn index_partition(&self, id: &str) -> String;

    /// The entity's owner, if set and valid
    fn owner_of(&self, entity: &Item) -> Option<String>;

    /// Attribute changes that set `owner` on the entity
    fn with_owner(&self, entity: &Item, owner: &str) -> Attributes;

    /// Whether the entity's own projection keys are computed from its owner
    fn projection_depends_on_owner(&self) -> bool {
        true
    }

    /// Attribute changes that rewrite the entity's own projection keys
    fn touch(&self, entity: &Item, now_ms: i64) -> Attributes;

    /// Every index row the entity should have. Must not read stored rows.
    async fn derive(
        &self,
        id: &str,
        entity: &Item,
        ctx: &MigrationContext,
    ) -> anyhow::Result<Vec<IndexRow>>;
}

/// Secondary source for owners missing on the entity itself.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn lookup_owner(
        &self,
        id: &str,
        ctx: &MigrationContext,
    ) -> Result<Option<String>, StoreError>;
}

pub struct IndexReconciler<'a> {
    ctx: &'a MigrationContext,
    entity: &'a dyn IndexedEntity,
    owners: Option<&'a dyn OwnerLookup>,
}

impl<'a> IndexReconciler<'a> {
    pub fn new(
        ctx: &'a MigrationContext,
        entity: &'a dyn IndexedEntity,
        owners: Option<&'a dyn OwnerLookup>,
    ) -> Self {
        Self {
            ctx,
            entity,
            owners,
        }
    }

    fn store(&self) -> &dyn BaseStoreClient {
        self.ctx.store.as_ref()
    }

    /// Reconcile one entity. `owner_hint` is used when the entity has no owner.
    pub async fn reconcile(
        &self,
        id: &str,
        owner_hint: Option<&str>,
        mode: ApplyMode,
    ) -> Result<ReconcileReport, ReconcileError> {
        let table = self.ctx.destination_table.as_str();
        let item_type = self.entity.item_type();
        let key = self.entity.entity_key(id);

        let mut entity = self
            .store()
            .get(table, &key)
            .await?
            .ok_or_else(|| ReconcileError::EntityNotFound {
                item_type,
                id: id.to_string(),
            })?;

        let mut owner_fixed = false;
        let owner = match self.entity.owner_of(&entity) {
            Some(owner) => owner,
            None => {
                let owner = self.resolve_owner(id, owner_hint).await?.ok_or_else(|| {
                    ReconcileError::OwnerUnresolved {
                        item_type,
                        id: id.to_string(),
                    }
                })?;
                let mut changes = self.entity.with_owner(&entity, &owner);
                if self.entity.projection_depends_on_owner() {
                    let mut repaired = entity.clone();
                    repaired.attributes.extend(changes.clone());
                    changes.extend(self.entity.touch(&repaired, Utc::now().timestamp_millis()));
                }
                // Owner and projection keys are written together
                entity = match mode {
                    ApplyMode::Apply => self.store().update(table, &key, changes).await?,
                    ApplyMode::DryRun => {
                        entity.attributes.extend(changes);
                        entity
                    }
                };
                owner_fixed = true;
                info!(
                    item_type,
                    id,
                    owner = %owner,
                    dry_run = mode == ApplyMode::DryRun,
                    "Repaired missing owner"
                );
                owner
            }
        };

        let target = self
            .entity
            .derive(id, &entity, self.ctx)
            .await
            .map_err(|source| ReconcileError::Derivation {
                id: id.to_string(),
                source,
            })?;
        let current: Vec<IndexRow> = self
            .store()
            .query(table, &self.entity.index_partition(id))
            .await?
            .into_iter()
            .map(IndexRow::from_item)
            .collect();

        let diff = diff_index_rows(target, current);
        let outcome = ReconcileOutcome {
            added: diff.to_add.len(),
            removed: diff.to_remove.len(),
            unchanged: diff.unchanged.len(),
            owner_fixed,
        };
        debug!(
            item_type,
            id,
            added = outcome.added,
            removed = outcome.removed,
            unchanged = outcome.unchanged,
            "Computed index diff"
        );

        if mode == ApplyMode::Apply {
            self.apply(id, &diff).await?;
        }

        Ok(ReconcileReport {
            entity_id: id.to_string(),
            outcome,
            owner: Some(owner),
            added_hashes: diff.to_add.iter().map(|r| r.hash.clone()).collect(),
            removed_hashes: diff.to_remove.iter().map(|r| r.hash.clone()).collect(),
        })
    }

    async fn resolve_owner(
        &self,
        id: &str,
        owner_hint: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        if let Some(hint) = owner_hint.filter(|h| !h.is_empty()) {
            return Ok(Some(hint.to_string()));
        }
        match self.owners {
            Some(lookup) => lookup.lookup_owner(id, self.ctx).await,
            None => Ok(None),
        }
    }

    /// Deletes first, then inserts, each in store-sized batches.
    async fn apply(&self, id: &str, diff: &IndexDiff) -> Result<(), ReconcileError> {
        let table = self.ctx.destination_table.as_str();
        let mut unprocessed = 0;

        for chunk in diff.to_remove.chunks(MAX_BATCH_ITEMS) {
            let keys = chunk.iter().map(IndexRow::key).collect();
            unprocessed += self.store().batch_delete(table, keys).await?.unprocessed.len();
        }
        for chunk in diff.to_add.chunks(MAX_BATCH_ITEMS) {
            let items = chunk.iter().map(IndexRow::to_item).collect();
            unprocessed += self.store().batch_write(table, items).await?.unprocessed.len();
        }

        if unprocessed > 0 {
            return Err(ReconcileError::Incomplete {
                id: id.to_string(),
                unprocessed,
            });
        }
        Ok(())
    }
}
