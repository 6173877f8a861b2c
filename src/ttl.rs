/* src/ttl.rs */

use crate::error::ResolveError;
use crate::models::RecordSet;
use crate::storage::Storage;
use fancy_log::{LogLevel, log};

/// Effective TTL of a record set: its own when set, else its zone's.
///
/// The store is only touched on the fallback path. A missing zone is an
/// error; no TTL is ever made up.
pub async fn resolve_ttl(storage: &dyn Storage, record_set: &RecordSet) -> Result<u32, ResolveError> {
    if let Some(ttl) = record_set.ttl {
        return Ok(ttl);
    }

    log(
        LogLevel::Debug,
        &format!("Using TTL from domain {}", record_set.domain_id),
    );
    storage
        .get_zone_by_id(&record_set.domain_id)
        .await
        .map(|zone| zone.ttl)
        .map_err(|source| ResolveError::ZoneLookup {
            zone: record_set.domain_id.clone(),
            source,
        })
}
