//! Composite keys for tracked downloads.
//!
//! A job is named by its movie id when known and by its lottery id
//! otherwise, matching the torrent client's category naming.

use std::collections::BTreeMap;

use lotto_download::JobRecord;

pub const PRIMARY_PREFIX: &str = "movie-";
pub const CONTAINER_PREFIX: &str = "lottery-";

/// Trims an identifier; empty strings count as absent.
pub fn normalize(id: Option<&str>) -> Option<String> {
    id.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn derive_key(primary_id: Option<&str>, container_id: Option<&str>) -> Option<String> {
    if let Some(primary) = normalize(primary_id) {
        return Some(format!("{PRIMARY_PREFIX}{primary}"));
    }
    normalize(container_id).map(|container| format!("{CONTAINER_PREFIX}{container}"))
}

/// Finds the key of an already tracked job.
///
/// Falls back to matching the stored ids, so a job registered before its
/// movie id was known (and keyed `lottery-<id>`) is found by either id.
pub fn resolve_existing_key(
    primary_id: Option<&str>,
    container_id: Option<&str>,
    records: &BTreeMap<String, JobRecord>,
) -> Option<String> {
    let derived = derive_key(primary_id, container_id)?;
    if records.contains_key(&derived) {
        return Some(derived);
    }

    if let Some(key) = find_by_primary(primary_id, records) {
        return Some(key);
    }
    let container = normalize(container_id)?;
    records
        .values()
        .find(|r| r.container_id.as_deref() == Some(container.as_str()))
        .map(|r| r.key.clone())
}

/// Key of the record whose stored movie id matches, whatever its key.
pub fn find_by_primary(
    primary_id: Option<&str>,
    records: &BTreeMap<String, JobRecord>,
) -> Option<String> {
    let primary = normalize(primary_id)?;
    records
        .values()
        .find(|r| r.primary_id.as_deref() == Some(primary.as_str()))
        .map(|r| r.key.clone())
}
