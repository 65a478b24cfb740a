//! Copy legacy drafts (`{prefix}_DRAFT`) into the single table.
//!
//! Card lists and seats stay in the blob store (`cardlist/{id}.json`,
//! `seats/{id}.json`); a draft missing either payload cannot be opened and is
//! skipped. Index layout, all sorted by `DATE#{date}`:
//!
//! - GSI1: `DRAFT#OWNER#{owner}`
//! - GSI2: `DRAFT#CUBE#{cube}`
//! - GSI3: `DRAFT#CUBEOWNER#{cubeOwner}`
//! - GSI4: `DRAFT#TYPE#{type}`

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use super::existence::ExistencePolicy;
use super::record::{DestinationRecord, SkipReason, SourceRecord, Transformed};
use super::{DataMigration, MigrationContext};
use crate::common::{index_partition, typed_key};

const DRAFT: &str = "DRAFT";

const OPTIONAL_FIELDS: &[&str] = &["type", "complete", "name", "seatNames", "DraftmancerLog"];

pub struct MigrateDraftsMigration;

#[async_trait]
impl DataMigration for MigrateDraftsMigration {
    fn name(&self) -> &'static str {
        "migrate_drafts"
    }

    fn description(&self) -> &'static str {
        "Copy legacy drafts into the single table, verifying their card and seat payloads"
    }

    fn source_table(&self, ctx: &MigrationContext) -> String {
        ctx.legacy_table("DRAFT")
    }

    fn page_size(&self) -> usize {
        100
    }

    fn existence_policy(&self) -> ExistencePolicy {
        ExistencePolicy::AssumeAbsent
    }

    async fn transform(&self, source: &SourceRecord, ctx: &MigrationContext) -> Result<Transformed> {
        let id = match source.require("id") {
            Ok(value) => value,
            Err(reason) => return Ok(reason.into()),
        };
        let cube = match source.require("cube") {
            Ok(value) => value,
            Err(reason) => return Ok(reason.into()),
        };
        let owner = match source.require("owner") {
            Ok(value) => value,
            Err(reason) => return Ok(reason.into()),
        };
        let cube_owner = match source.require("cubeOwner") {
            Ok(value) => value,
            Err(reason) => return Ok(reason.into()),
        };

        let cardlist_key = format!("cardlist/{}.json", id);
        let card_count = match ctx
            .blobs
            .get_json(&cardlist_key)
            .await
            .with_context(|| format!("failed to load {}", cardlist_key))?
        {
            Some(Value::Array(cards)) if !cards.is_empty() => cards.len(),
            Some(Value::Array(_)) | None => {
                return Ok(SkipReason::MissingPayload(cardlist_key).into())
            }
            Some(_) => {
                return Ok(SkipReason::InvalidField {
                    field: cardlist_key,
                    reason: "expected a card array".into(),
                }
                .into())
            }
        };

        let seats_key = format!("seats/{}.json", id);
        let seats_blob = ctx
            .blobs
            .get_json(&seats_key)
            .await
            .with_context(|| format!("failed to load {}", seats_key))?;
        let (seat_count, basics, initial_state) = match &seats_blob {
            Some(Value::Object(data)) => match data.get("seats") {
                Some(Value::Array(seats)) if !seats.is_empty() => (
                    seats.len(),
                    data.get("basics").cloned().unwrap_or(Value::Array(Vec::new())),
                    data.get("InitialState")
                        .filter(|state| !state.is_null())
                        .cloned()
                        .unwrap_or(Value::Object(Map::new())),
                ),
                _ => return Ok(SkipReason::MissingPayload(seats_key).into()),
            },
            _ => return Ok(SkipReason::MissingPayload(seats_key).into()),
        };

        let date = source
            .timestamp_ms("date")
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let date_key = format!("DATE#{}", date);

        let mut body = Map::new();
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("cube".into(), Value::String(cube.clone()));
        body.insert("owner".into(), Value::String(owner.clone()));
        body.insert("cubeOwner".into(), Value::String(cube_owner.clone()));
        body.insert("date".into(), Value::from(date));
        source.copy_fields(&mut body, OPTIONAL_FIELDS);
        body.insert("cardCount".into(), Value::from(card_count));
        body.insert("seatCount".into(), Value::from(seat_count));
        body.insert("basics".into(), basics);
        body.insert("InitialState".into(), initial_state);

        let mut record = DestinationRecord::new(typed_key(DRAFT, &id), body, date)
            .with_gsi(1, index_partition(DRAFT, "OWNER", &owner), date_key.clone())
            .with_gsi(2, index_partition(DRAFT, "CUBE", &cube), date_key.clone())
            .with_gsi(3, index_partition(DRAFT, "CUBEOWNER", &cube_owner), date_key.clone());
        if let Some(draft_type) = source.text("type") {
            record = record.with_gsi(4, index_partition(DRAFT, "TYPE", &draft_type), date_key);
        }

        Ok(Transformed::one(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Item, MemoryBlobStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(blobs: MemoryBlobStore) -> MigrationContext {
        MigrationContext::new(Arc::new(MemoryStore::new()), Arc::new(blobs), "dest")
    }

    fn draft() -> SourceRecord {
        SourceRecord::new(
            Item::from_json(json!({
                "id": "d1",
                "cube": "c1",
                "owner": "u1",
                "cubeOwner": "u2",
                "date": 1000,
                "type": "g",
                "name": "Friday draft"
            }))
            .unwrap(),
        )
    }

    fn full_blobs() -> MemoryBlobStore {
        MemoryBlobStore::new()
            .with_blob("cardlist/d1.json", json!([{"cardID": "a"}, {"cardID": "b"}]))
            .with_blob(
                "seats/d1.json",
                json!({
                    "seats": [{"name": "p1"}],
                    "basics": [1, 2],
                    "InitialState": {"packs": [[{"cardID": "a"}]]}
                }),
            )
    }

    #[tokio::test]
    async fn test_draft_indexes_and_payload_counts() {
        let result = MigrateDraftsMigration
            .transform(&draft(), &ctx(full_blobs()))
            .await
            .unwrap();
        let Transformed::Records(records) = result else {
            panic!("expected records");
        };

        let item = records[0].to_item();
        assert_eq!(item.key.pk, "DRAFT#d1");
        assert_eq!(item.get_str("GSI1PK"), Some("DRAFT#OWNER#u1"));
        assert_eq!(item.get_str("GSI3PK"), Some("DRAFT#CUBEOWNER#u2"));
        assert_eq!(item.get_str("GSI4PK"), Some("DRAFT#TYPE#g"));
        assert_eq!(item.get_str("GSI2SK"), Some("DATE#1000"));
        let body = item.get("item").unwrap();
        assert_eq!(body["cardCount"], 2);
        assert_eq!(body["seatCount"], 1);
        assert_eq!(body["basics"], json!([1, 2]));
        assert_eq!(body["InitialState"]["packs"][0][0]["cardID"], "a");
        assert_eq!(body["name"], "Friday draft");
    }

    #[tokio::test]
    async fn test_missing_initial_state_defaults_to_empty() {
        let blobs = MemoryBlobStore::new()
            .with_blob("cardlist/d1.json", json!([{"cardID": "a"}]))
            .with_blob("seats/d1.json", json!({"seats": [{"name": "p1"}]}));
        let result = MigrateDraftsMigration
            .transform(&draft(), &ctx(blobs))
            .await
            .unwrap();
        let Transformed::Records(records) = result else {
            panic!("expected records");
        };

        let body = records[0].to_item().get("item").cloned().unwrap();
        assert_eq!(body["InitialState"], json!({}));
        assert_eq!(body["basics"], json!([]));
    }

    #[tokio::test]
    async fn test_draft_without_seats_is_skipped() {
        let blobs = MemoryBlobStore::new()
            .with_blob("cardlist/d1.json", json!([{"cardID": "a"}]))
            .with_blob("seats/d1.json", json!({"seats": []}));
        let result = MigrateDraftsMigration
            .transform(&draft(), &ctx(blobs))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Transformed::Skip(SkipReason::MissingPayload(key)) if key == "seats/d1.json"
        ));
    }

    #[tokio::test]
    async fn test_malformed_cardlist_is_invalid() {
        let blobs = MemoryBlobStore::new().with_blob("cardlist/d1.json", json!({"cards": []}));
        let result = MigrateDraftsMigration
            .transform(&draft(), &ctx(blobs))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Transformed::Skip(SkipReason::InvalidField { field, .. }) if field == "cardlist/d1.json"
        ));
    }

    #[tokio::test]
    async fn test_draft_without_cube_owner_is_skipped() {
        let source = SourceRecord::new(
            Item::from_json(json!({"id": "d2", "cube": "c1", "owner": "u1"})).unwrap(),
        );
        let result = MigrateDraftsMigration
            .transform(&source, &ctx(full_blobs()))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Transformed::Skip(SkipReason::MissingField(field)) if field == "cubeOwner"
        ));
    }
}
