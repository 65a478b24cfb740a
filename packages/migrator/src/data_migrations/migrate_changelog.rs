//! Copy cube changelog metadata (`{prefix}_CHANGELOG`) into the single table.
//! The changelog bodies stay in the blob store.
//!
//! - PK: `CHANGELOG#{id}`, SK: `CHANGELOG`
//! - GSI1: `CHANGELOG#CUBE#{cube}` / `DATE#{date}`

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::existence::ExistencePolicy;
use super::record::{DestinationRecord, SkipReason, SourceRecord, Transformed};
use super::{DataMigration, MigrationContext};
use crate::common::{index_partition, typed_key};

const CHANGELOG: &str = "CHANGELOG";

pub struct MigrateChangelogMigration;

#[async_trait]
impl DataMigration for MigrateChangelogMigration {
    fn name(&self) -> &'static str {
        "migrate_changelog"
    }

    fn description(&self) -> &'static str {
        "Copy cube changelog metadata into the single table, keyed CHANGELOG#{id}"
    }

    fn source_table(&self, ctx: &MigrationContext) -> String {
        ctx.legacy_table("CHANGELOG")
    }

    fn page_size(&self) -> usize {
        1000
    }

    fn existence_policy(&self) -> ExistencePolicy {
        ExistencePolicy::AssumeAbsent
    }

    async fn transform(&self, source: &SourceRecord, _ctx: &MigrationContext) -> Result<Transformed> {
        let id = match source.require("id") {
            Ok(id) => id,
            Err(reason) => return Ok(reason.into()),
        };
        let cube = match source.require("cube") {
            Ok(cube) => cube,
            Err(reason) => return Ok(reason.into()),
        };
        let Some(date) = source.timestamp_ms("date") else {
            return Ok(SkipReason::MissingField("date".into()).into());
        };
        let created = source.timestamp_ms("dateCreated").unwrap_or(date);
        let updated = source.timestamp_ms("dateLastUpdated").unwrap_or(date);

        let mut body = Map::new();
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("cube".into(), Value::String(cube.clone()));
        body.insert("date".into(), Value::from(date));
        body.insert("dateCreated".into(), Value::from(created));
        body.insert("dateLastUpdated".into(), Value::from(updated));

        let record = DestinationRecord::new(typed_key(CHANGELOG, &id), body, created)
            .last_updated(updated)
            .with_gsi(
                1,
                index_partition(CHANGELOG, "CUBE", &cube),
                format!("DATE#{}", date),
            );

        Ok(Transformed::one(record))
    }
}
