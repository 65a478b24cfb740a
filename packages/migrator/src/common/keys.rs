//! Single-table key scheme helpers.

use crate::kernel::PrimaryKey;

/// `{TYPE}#{id}` / `{TYPE}`: the primary key of an entity's own record.
pub fn typed_key(item_type: &str, id: &str) -> PrimaryKey {
    PrimaryKey::new(format!("{}#{}", item_type, id), item_type)
}

/// `{TYPE}#{qualifier}#{value}`: a secondary-index partition value.
pub fn index_partition(item_type: &str, qualifier: &str, value: &str) -> String {
    format!("{}#{}#{}", item_type, qualifier, value)
}

/// Partition holding an entity's index rows, e.g. `HASH#CUBE#{id}`.
pub fn hash_partition(item_type: &str, id: &str) -> String {
    format!("HASH#{}#{}", item_type, id)
}

/// Shard bucket 0-9 from the last character of an id.
pub fn shard_of(id: &str) -> u32 {
    id.chars().last().map_or(0, |c| c as u32 % 10)
}

/// Zero-padded numeric sort key, e.g. `FOLLOWERS#0000000042`.
pub fn padded_sort_key(label: &str, value: u64, width: usize) -> String {
    format!("{}#{:0width$}", label, value, width = width)
}
