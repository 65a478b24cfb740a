//! Repair cube hash rows and cube projection keys in the single table.
//!
//! Every cube owns a set of index rows under `HASH#CUBE#{id}`, one per
//! membership fact (`cube:all`, tags, name keywords, categories, ...). Rows
//! are identified by the hash of that fact, so reconciling a cube only ever
//! touches the facts that changed.
//!
//! Cubes whose owner was lost during the copy get it back from the legacy
//! `{prefix}_CUBES` table; their own GSI keys are then rewritten.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::reconciler::{IndexRow, IndexedEntity, OwnerLookup};
use super::{IndexRepair, MigrationContext};
use crate::common::{hash_partition, index_hash, padded_sort_key, shard_of, typed_key};
use crate::kernel::{Attributes, Item, PrimaryKey, StoreError};

const CUBE: &str = "CUBE";

pub const REPAIR_CUBE_HASHES: &str = "repair_cube_hashes";

const FORMATS: [&str; 5] = ["Vintage", "Legacy", "Modern", "Pioneer", "Standard"];

// ============================================================================
// Cube metadata
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OwnerRef {
    Id(String),
    Object { id: String },
}

impl OwnerRef {
    fn id(&self) -> Option<&str> {
        let id = match self {
            Self::Id(id) => id.as_str(),
            Self::Object { id } => id.as_str(),
        };
        (!id.is_empty() && id != "null").then_some(id)
    }
}

/// The parts of a cube the index rows are derived from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CubeMetadata {
    pub short_id: Option<String>,
    pub name: String,
    pub featured: bool,
    pub category_override: Option<String>,
    pub category_prefixes: Vec<String>,
    pub tags: Vec<String>,
    pub following: Vec<Value>,
    pub card_count: u64,
    pub date_last_updated: Option<i64>,
    /// Creation date, the sort fallback when the cube was never updated
    #[serde(skip)]
    pub date: Option<i64>,
    pub visibility: Option<String>,
    owner: Option<OwnerRef>,
}

impl CubeMetadata {
    pub fn from_entity(entity: &Item) -> Result<Self> {
        let body = without_nulls(cube_body(entity));
        let date = body
            .get("date")
            .or_else(|| entity.get("date"))
            .and_then(Value::as_i64);
        let mut metadata: Self = serde_json::from_value(Value::Object(body))
            .with_context(|| format!("cube {} has malformed metadata", entity.key))?;

        if metadata.date_last_updated.is_none() {
            metadata.date_last_updated = entity.get("dateLastUpdated").and_then(Value::as_i64);
        }
        metadata.date = date;
        Ok(metadata)
    }

    /// Sort date of the cube's index rows
    pub fn sort_date(&self) -> i64 {
        self.date_last_updated
            .or(self.date)
            .unwrap_or_else(|| Utc::now().timestamp_millis())
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_ref().and_then(OwnerRef::id)
    }

    /// Membership facts as `(type, value)` pairs, card facts excluded.
    pub fn facts(&self) -> Vec<(&'static str, String)> {
        let mut facts = vec![("cube", "all".to_string())];

        if let Some(short_id) = self.short_id.as_deref().filter(|s| !s.is_empty()) {
            facts.push(("shortid", short_id.to_string()));
        }
        if self.featured {
            facts.push(("featured", "true".to_string()));
        }
        if let Some(category) = self.category_override() {
            facts.push(("category", category.to_lowercase()));
            for prefix in &self.category_prefixes {
                facts.push(("category", prefix.to_lowercase()));
            }
        }
        for tag in &self.tags {
            facts.push(("tag", tag.to_lowercase()));
        }
        for slice in keyword_slices(&self.name) {
            facts.push(("keywords", slice));
        }

        facts
    }

    fn category_override(&self) -> Option<&str> {
        self.category_override.as_deref().filter(|c| !c.is_empty())
    }
}

/// The cube body lives under `item`; older rows stored it flat.
fn cube_body(entity: &Item) -> Map<String, Value> {
    match entity.get("item") {
        Some(Value::Object(body)) => body.clone(),
        _ => entity.attributes.clone(),
    }
}

fn without_nulls(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

fn owner_from(value: &Value) -> Option<String> {
    serde_json::from_value::<OwnerRef>(value.clone())
        .ok()
        .and_then(|owner| owner.id().map(str::to_string))
}

/// Every contiguous word run of the punctuation-stripped, lower-cased name.
pub fn keyword_slices(name: &str) -> Vec<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    let words: Vec<&str> = cleaned.split(' ').filter(|w| !w.is_empty()).collect();

    let mut slices = Vec::new();
    for start in 0..words.len() {
        for end in start + 1..=words.len() {
            slices.push(words[start..end].join(" "));
        }
    }
    slices
}

// ============================================================================
// Card-derived facts
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct CubeCards {
    #[serde(default)]
    mainboard: Vec<CubeCard>,
}

#[derive(Debug, Deserialize)]
struct CubeCard {
    #[serde(default)]
    oracle_id: Option<String>,
    #[serde(default)]
    details: Option<CardDetails>,
}

#[derive(Debug, Deserialize)]
struct CardDetails {
    #[serde(default)]
    legalities: Map<String, Value>,
    #[serde(default)]
    rarity: Option<String>,
    #[serde(default)]
    oracle_id: Option<String>,
}

impl CardDetails {
    fn is_legal(&self, format: &str) -> bool {
        matches!(
            self.legalities.get(format).and_then(Value::as_str),
            Some("legal") | Some("banned")
        )
    }
}

impl CubeCard {
    fn oracle_id(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.oracle_id.as_deref())
            .or(self.oracle_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Format and rarity categories of a card list, or `None` when some card
/// lacks the details needed to decide.
fn card_categories(cards: &[CubeCard]) -> Option<Vec<String>> {
    let details: Vec<&CardDetails> = cards
        .iter()
        .map(|card| card.details.as_ref())
        .collect::<Option<_>>()?;
    if details.is_empty() {
        return None;
    }

    let mut pauper = true;
    let mut peasant = false;
    let mut format = FORMATS.len() - 1;
    for card in details {
        if pauper && !card.is_legal("Pauper") {
            pauper = false;
            peasant = true;
        }
        if !pauper
            && peasant
            && !matches!(card.rarity.as_deref(), Some("common") | Some("uncommon"))
        {
            peasant = false;
        }
        while format > 0 && !card.is_legal(FORMATS[format]) {
            format -= 1;
        }
    }

    let mut categories = vec![FORMATS[format].to_string()];
    if pauper {
        categories.push("Pauper".to_string());
    } else if peasant {
        categories.push("Peasant".to_string());
    }
    Some(categories)
}

// ============================================================================
// Indexed entity
// ============================================================================

pub struct CubeIndex;

impl CubeIndex {
    async fn load_cards(&self, id: &str, ctx: &MigrationContext) -> Result<Option<CubeCards>> {
        let key = format!("cube/{}.json", id);
        let Some(blob) = ctx
            .blobs
            .get_json(&key)
            .await
            .with_context(|| format!("failed to load {}", key))?
        else {
            return Ok(None);
        };
        let cards = serde_json::from_value(blob).with_context(|| format!("{} is malformed", key))?;
        Ok(Some(cards))
    }
}

#[async_trait]
impl IndexedEntity for CubeIndex {
    fn item_type(&self) -> &'static str {
        CUBE
    }

    fn entity_key(&self, id: &str) -> PrimaryKey {
        typed_key(CUBE, id)
    }

    fn index_partition(&self, id: &str) -> String {
        hash_partition(CUBE, id)
    }

    fn owner_of(&self, entity: &Item) -> Option<String> {
        cube_body(entity).get("owner").and_then(owner_from)
    }

    fn with_owner(&self, entity: &Item, owner: &str) -> Attributes {
        let mut changes = Attributes::new();
        match entity.get("item") {
            Some(Value::Object(body)) => {
                let mut body = body.clone();
                body.insert("owner".into(), Value::String(owner.to_string()));
                changes.insert("item".into(), Value::Object(body));
            }
            _ => {
                changes.insert("owner".into(), Value::String(owner.to_string()));
            }
        }
        changes
    }

    fn touch(&self, entity: &Item, now_ms: i64) -> Attributes {
        let id = entity
            .key
            .pk
            .strip_prefix("CUBE#")
            .unwrap_or(&entity.key.pk)
            .to_string();
        let body = cube_body(entity);
        let date_key = format!("DATE#{}", now_ms);

        let mut changes = Attributes::new();
        if let Some(owner) = body.get("owner").and_then(owner_from) {
            changes.insert("GSI1PK".into(), Value::String(format!("CUBE#OWNER#{}", owner)));
            changes.insert("GSI1SK".into(), Value::String(date_key.clone()));
        }
        if let Some(visibility) = body.get("visibility").and_then(Value::as_str) {
            changes.insert(
                "GSI2PK".into(),
                Value::String(format!("CUBE#VISIBILITY#{}", visibility)),
            );
            changes.insert("GSI2SK".into(), Value::String(date_key));
        }
        changes.insert("GSI3PK".into(), Value::String(format!("CUBE#{}", shard_of(&id))));
        changes.insert("GSI3SK".into(), Value::String(id));
        changes.insert("date".into(), Value::from(now_ms));
        changes.insert("dateLastUpdated".into(), Value::from(now_ms));
        changes
    }

    async fn derive(&self, id: &str, entity: &Item, ctx: &MigrationContext) -> Result<Vec<IndexRow>> {
        let cube = CubeMetadata::from_entity(entity)?;
        let mut facts = cube.facts();

        let cards = self.load_cards(id, ctx).await?.unwrap_or_default();
        if cube.category_override().is_none() {
            for category in card_categories(&cards.mainboard).unwrap_or_default() {
                facts.push(("category", category.to_lowercase()));
            }
        }
        if ctx.maintain_card_hashes {
            for card in &cards.mainboard {
                if let Some(oracle) = card.oracle_id() {
                    facts.push(("oracle", oracle.to_string()));
                }
            }
        }

        let partition = self.index_partition(id);
        let followers = cube.following.len() as u64;
        let date = cube.sort_date().max(0) as u64;
        let mut seen = HashSet::new();

        Ok(facts
            .into_iter()
            .map(|(kind, value)| index_hash(CUBE, kind, &value))
            .filter(|hash| seen.insert(hash.clone()))
            .map(|hash| {
                IndexRow::new(partition.clone(), hash.clone())
                    .with_attr("GSI1PK", hash.clone())
                    .with_attr("GSI1SK", padded_sort_key("FOLLOWERS", followers, 10))
                    .with_attr("GSI2PK", hash.clone())
                    .with_attr("GSI2SK", format!("NAME#{}", cube.name.to_lowercase()))
                    .with_attr("GSI3PK", hash.clone())
                    .with_attr("GSI3SK", padded_sort_key("CARDS", cube.card_count, 10))
                    .with_attr("GSI4PK", hash)
                    .with_attr("GSI4SK", padded_sort_key("DATE", date, 15))
                    .with_attr("cubeName", cube.name.clone())
                    .with_attr("cubeFollowers", followers)
                    .with_attr("cubeCardCount", cube.card_count)
            })
            .collect())
    }
}

/// Owners from the legacy cube table, keyed by cube id.
pub struct LegacyOwnerLookup;

#[async_trait]
impl OwnerLookup for LegacyOwnerLookup {
    async fn lookup_owner(
        &self,
        id: &str,
        ctx: &MigrationContext,
    ) -> Result<Option<String>, StoreError> {
        let table = ctx.legacy_table("CUBES");
        let legacy = ctx.store.get(&table, &PrimaryKey::partition(id)).await?;
        Ok(legacy.and_then(|item| cube_body(&item).get("owner").and_then(owner_from)))
    }
}

// ============================================================================
// Job
// ============================================================================

pub struct RepairCubeHashes {
    index: CubeIndex,
    owners: LegacyOwnerLookup,
}

impl RepairCubeHashes {
    pub fn new() -> Self {
        Self {
            index: CubeIndex,
            owners: LegacyOwnerLookup,
        }
    }
}

impl Default for RepairCubeHashes {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRepair for RepairCubeHashes {
    fn name(&self) -> &'static str {
        REPAIR_CUBE_HASHES
    }

    fn description(&self) -> &'static str {
        "Reconcile cube hash rows and repair missing cube owners"
    }

    fn entity_label(&self) -> &'static str {
        "cube"
    }

    fn source_table(&self, ctx: &MigrationContext) -> String {
        ctx.destination_table.clone()
    }

    fn entity_id_of(&self, item: &Item) -> Option<String> {
        if item.key.sk != CUBE {
            return None;
        }
        item.key
            .pk
            .strip_prefix("CUBE#")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn indexed_entity(&self) -> &dyn IndexedEntity {
        &self.index
    }

    fn owner_lookup(&self) -> Option<&dyn OwnerLookup> {
        Some(&self.owners)
    }
}
