//! Retention enforcement: keep the newest `max_backups` under a prefix.

use kvbackup_common::backend::StorageBackend;
use kvbackup_common::keyspace::KeySpace;
use tracing::{debug, info, warn};

use crate::error::BackupError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Full storage keys removed, oldest first.
    pub deleted: Vec<String>,
    pub retained: usize,
}

/// Delete the oldest backups under `keyspace` so at most `max_backups`
/// remain. `max_backups <= 0` disables purging.
///
/// Works from a single listing taken up front, sorted by backup id. Stops
/// at the first failed delete and returns `PurgePartial` naming the keys
/// that were and were not removed; the next cycle picks up the rest.
pub async fn purge(
    backend: &dyn StorageBackend,
    keyspace: &KeySpace,
    max_backups: i64,
) -> Result<PurgeReport, BackupError> {
    if max_backups <= 0 {
        debug!(prefix = %keyspace.prefix(), max_backups, "Purge disabled");
        return Ok(PurgeReport::default());
    }
    let max = usize::try_from(max_backups).unwrap_or(usize::MAX);

    let entries = keyspace.list(backend).await?;
    if entries.len() <= max {
        return Ok(PurgeReport {
            deleted: Vec::new(),
            retained: entries.len(),
        });
    }

    let excess = entries.len() - max;
    let candidates: Vec<String> = entries[..excess]
        .iter()
        .map(|e| keyspace.object_key(&e.id))
        .collect();

    let mut deleted = Vec::with_capacity(candidates.len());
    for (i, key) in candidates.iter().enumerate() {
        if let Err(e) = backend.delete(key).await {
            warn!(key = %key, error = %e, deleted = deleted.len(), "Purge stopped at failed delete");
            return Err(BackupError::PurgePartial {
                deleted,
                remaining: candidates[i..].to_vec(),
                source: e,
            });
        }
        debug!(key = %key, "Purged backup");
        deleted.push(key.clone());
    }

    info!(
        prefix = %keyspace.prefix(),
        deleted = deleted.len(),
        retained = max,
        "Retention purge complete"
    );
    Ok(PurgeReport {
        deleted,
        retained: max,
    })
}
