//! Copy legacy users (`{prefix}_USERS`) into the single table.
//!
//! - PK: `USER#{id}`, SK: `USER`
//! - GSI1: `USER#USERNAME#{username lower}` / `USER`
//! - GSI2: `USER#EMAIL#{email lower}` / `USER` (only when an email is set)
//!
//! Password hashes and emails are preserved. A user whose existence check
//! fails is skipped, never overwritten: users edited after an earlier run
//! must not be clobbered by their stale legacy copy.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use super::existence::ExistencePolicy;
use super::record::{DestinationRecord, SourceRecord, Transformed};
use super::{DataMigration, MigrationContext};
use crate::common::{index_partition, typed_key};

const USER: &str = "USER";

const OPTIONAL_FIELDS: &[&str] = &[
    "about",
    "hideTagColors",
    "imageName",
    "theme",
    "hideFeatured",
    "patron",
    "defaultPrinting",
    "gridTightness",
    "autoBlog",
    "consentToHashedEmail",
    "token",
    "passwordHash",
    "email",
];

const LIST_FIELDS: &[&str] = &["followedCubes", "followedUsers", "following", "roles"];

pub struct MigrateUsersMigration;

#[async_trait]
impl DataMigration for MigrateUsersMigration {
    fn name(&self) -> &'static str {
        "migrate_users"
    }

    fn description(&self) -> &'static str {
        "Copy legacy users into the single table, keyed USER#{id}"
    }

    fn source_table(&self, ctx: &MigrationContext) -> String {
        ctx.legacy_table("USERS")
    }

    fn existence_policy(&self) -> ExistencePolicy {
        ExistencePolicy::AssumePresent
    }

    async fn transform(&self, source: &SourceRecord, _ctx: &MigrationContext) -> Result<Transformed> {
        let id = match source.require("id") {
            Ok(id) => id,
            Err(reason) => return Ok(reason.into()),
        };
        let username = match source.require("username") {
            Ok(username) => username,
            Err(reason) => return Ok(reason.into()),
        };
        let username_lower = username.to_lowercase();

        let now = Utc::now().timestamp_millis();
        let created = source.timestamp_ms("dateCreated").unwrap_or(now);
        let updated = source.timestamp_ms("dateLastUpdated").unwrap_or(now);

        let mut body = Map::new();
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("username".into(), Value::String(username));
        body.insert("usernameLower".into(), Value::String(username_lower.clone()));
        body.insert("cubes".into(), Value::Array(cube_ids(source)));
        source.copy_lists(&mut body, LIST_FIELDS);
        source.copy_fields(&mut body, OPTIONAL_FIELDS);
        body.insert("dateCreated".into(), Value::from(created));
        body.insert("dateLastUpdated".into(), Value::from(updated));

        let email = source.text("email").map(|e| e.to_lowercase());

        let mut record = DestinationRecord::new(typed_key(USER, &id), body, created)
            .last_updated(updated)
            .with_gsi(1, index_partition(USER, "USERNAME", &username_lower), USER);
        if let Some(email) = email {
            record = record.with_gsi(2, index_partition(USER, "EMAIL", &email), USER);
        }

        Ok(Transformed::one(record))
    }
}

/// Owned cubes as ids; legacy rows sometimes hold `{ id, .. }` objects.
fn cube_ids(source: &SourceRecord) -> Vec<Value> {
    let Some(Value::Array(cubes)) = source.field("cubes") else {
        return Vec::new();
    };
    cubes
        .iter()
        .filter_map(|cube| match cube {
            Value::String(id) => Some(Value::String(id.clone())),
            Value::Object(obj) => obj.get("id").cloned(),
            _ => None,
        })
        .collect()
}
