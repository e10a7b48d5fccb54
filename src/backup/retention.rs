// pgstash/src/backup/retention.rs
use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: Vec<String>,
    pub delete: Vec<String>,
}

/// Keeps the `retention_count` newest timestamps and marks the rest for deletion.
///
/// Timestamps are fixed-width, so descending string order is newest first.
pub fn plan_retention(mut timestamps: Vec<String>, retention_count: usize) -> RetentionPlan {
    timestamps.sort_unstable_by(|a, b| b.cmp(a));
    timestamps.dedup();
    let delete = timestamps.split_off(retention_count.min(timestamps.len()));
    RetentionPlan {
        keep: timestamps,
        delete,
    }
}

/// Stored backups for this instance, newest first, as bare timestamp segments.
///
/// Entries under the prefix that are not timestamps in `date_time_layout` are
/// ignored, so foreign objects are never purged.
pub async fn list_backups(storage: &dyn StorageBackend, date_time_layout: &str) -> Result<Vec<String>> {
    let keys = storage.list().await?;
    if keys.is_empty() {
        info!("No backups found");
        return Ok(Vec::new());
    }

    let mut timestamps: Vec<String> = storage
        .trim_prefix(&keys)
        .into_iter()
        .filter(|ts| {
            let valid = NaiveDateTime::parse_from_str(ts, date_time_layout).is_ok();
            if !valid {
                warn!(entry = %ts, "Ignoring entry that is not a backup timestamp");
            }
            valid
        })
        .collect();
    timestamps.sort_unstable_by(|a, b| b.cmp(a));
    Ok(timestamps)
}

/// Deletes every backup beyond the `retention_count` newest and returns how many
/// were removed. Stops at the first failed delete; the next run picks up the rest.
pub async fn purge(storage: &dyn StorageBackend, retention_count: usize, date_time_layout: &str) -> Result<usize> {
    let backups = list_backups(storage, date_time_layout).await?;
    if backups.len() <= retention_count {
        info!(found = backups.len(), retention_count, "No backups to delete");
        return Ok(0);
    }

    let plan = plan_retention(backups, retention_count);
    info!(
        count = plan.delete.len(),
        kept = plan.keep.len(),
        retention_count,
        keys = ?plan.delete,
        "Found backups to delete"
    );

    let prefix = storage.prefix();
    for timestamp in &plan.delete {
        let key = format!("{}{}", prefix, timestamp);
        info!(key = %key, "Deleting backup");
        if let Err(e) = storage.delete(&key, true).await {
            error!(key = %key, error = %e, "Error deleting backup");
            return Err(e);
        }
    }

    info!(deleted = plan.delete.len(), "Deletion completed successfully");
    Ok(plan.delete.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackupError;
    use crate::storage::testing::MemoryStorage;

    const LAYOUT: &str = "%Y%m%d%H%M%S";

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_keeps_newest() {
        let plan = plan_retention(strings(&["20240101120000", "20240103090000", "20240102000000"]), 2);
        assert_eq!(plan.keep, strings(&["20240103090000", "20240102000000"]));
        assert_eq!(plan.delete, strings(&["20240101120000"]));
    }

    #[test]
    fn test_plan_under_limit_deletes_nothing() {
        let plan = plan_retention(strings(&["20240101120000", "20240102000000"]), 2);
        assert_eq!(plan.keep.len(), 2);
        assert!(plan.delete.is_empty());

        let plan = plan_retention(vec![], 5);
        assert!(plan.keep.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[tokio::test]
    async fn test_purge_deletes_oldest_recursively() -> anyhow::Result<()> {
        let storage = MemoryStorage::with_runs(&["20240101120000", "20240103090000", "20240102000000"]);

        let deleted = purge(&storage, 2, LAYOUT).await?;

        assert_eq!(deleted, 1);
        assert_eq!(
            storage.delete_calls(),
            vec![("backups/db-host-1/20240101120000".to_string(), true)]
        );
        assert_eq!(
            list_backups(&storage, LAYOUT).await?,
            strings(&["20240103090000", "20240102000000"])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_under_limit_makes_no_delete_calls() -> anyhow::Result<()> {
        let storage = MemoryStorage::with_runs(&["20240101120000", "20240102000000"]);
        assert_eq!(purge(&storage, 2, LAYOUT).await?, 0);
        assert!(storage.delete_calls().is_empty());

        let empty = MemoryStorage::with_runs(&[]);
        assert_eq!(purge(&empty, 2, LAYOUT).await?, 0);
        assert!(empty.delete_calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_stops_at_first_failure() -> anyhow::Result<()> {
        let storage = MemoryStorage::with_runs(&[
            "20240101000000",
            "20240102000000",
            "20240103000000",
            "20240104000000",
        ]);
        storage.fail_delete_of("backups/db-host-1/20240102000000");

        let result = purge(&storage, 1, LAYOUT).await;

        assert!(matches!(result, Err(BackupError::StorageDelete(_))));
        // Newest-first order: 0103 deleted, 0102 failed, 0101 never attempted.
        assert_eq!(
            storage.delete_calls(),
            vec![
                ("backups/db-host-1/20240103000000".to_string(), true),
                ("backups/db-host-1/20240102000000".to_string(), true),
            ]
        );
        assert_eq!(
            list_backups(&storage, LAYOUT).await?,
            strings(&["20240104000000", "20240102000000", "20240101000000"])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_entries_are_ignored() -> anyhow::Result<()> {
        let storage = MemoryStorage::with_runs(&["20240101000000", "README.txt", "20240102000000", "latest"]);
        assert_eq!(
            list_backups(&storage, LAYOUT).await?,
            strings(&["20240102000000", "20240101000000"])
        );
        assert_eq!(purge(&storage, 1, LAYOUT).await?, 1);
        assert_eq!(
            storage.delete_calls(),
            vec![("backups/db-host-1/20240101000000".to_string(), true)]
        );
        Ok(())
    }
}
