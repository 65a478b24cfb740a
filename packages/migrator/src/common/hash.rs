use sha2::{Digest, Sha256};

/// Hash an attribute set into the identity string of an index row.
///
/// Pairs are rendered as `key:value`, sorted, and joined with `,` before
/// hashing, so the result does not depend on the order they are given in.
pub fn hash_row_string(pairs: &[(&str, &str)]) -> String {
    let mut rendered: Vec<String> = pairs
        .iter()
        .map(|(key, value)| format!("{}:{}", key, value))
        .collect();
    rendered.sort();

    let mut hasher = Sha256::new();
    hasher.update(rendered.join(",").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity of one `(type, value)` membership fact for an entity type.
pub fn index_hash(item_type: &str, kind: &str, value: &str) -> String {
    hash_row_string(&[("type", kind), ("value", value), ("ItemType", item_type)])
}
