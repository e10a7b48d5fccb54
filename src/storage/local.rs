// pgstash/src/storage/local.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::{KeyLayout, PREFIX_SEPARATOR, StorageBackend};
use crate::errors::{BackupError, Result};

/// Filesystem backend. Keys map to paths below `root`; directories stand in for
/// the common prefixes an object store would return.
pub struct LocalStorage {
    root: PathBuf,
    layout: KeyLayout,
}

impl LocalStorage {
    pub fn new(root: PathBuf, layout: KeyLayout) -> Self {
        LocalStorage { root, layout }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split(PREFIX_SEPARATOR).filter(|s| !s.is_empty()) {
            if segment == ".." || segment == "." {
                return Err(BackupError::StorageDelete(format!("Refusing key with relative segment: {}", key)));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn init(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            BackupError::StorageConnect(format!("Failed to create storage root {}: {}", self.root.display(), e))
        })
    }

    fn name(&self) -> String {
        format!("local ({})", self.root.display())
    }

    fn prefix(&self) -> String {
        self.layout.root()
    }

    async fn upload(&self, local_path: &Path) -> Result<String> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackupError::StorageUpload(format!("Invalid upload path: {}", local_path.display())))?;
        let key = self.layout.key_for(chrono::Utc::now(), file_name);
        let dest = self.path_for(&key).map_err(|e| BackupError::StorageUpload(e.to_string()))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::StorageUpload(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        fs::copy(local_path, &dest).await.map_err(|e| {
            BackupError::StorageUpload(format!(
                "Failed to copy {} to {}: {}",
                local_path.display(),
                dest.display(),
                e
            ))
        })?;

        info!(key = %key, path = %dest.display(), "Stored backup");
        Ok(key)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let prefix = self.layout.root();
        let dir = self.path_for(&prefix).map_err(|e| BackupError::StorageList(e.to_string()))?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackupError::StorageList(format!("Failed to read {}: {}", dir.display(), e)));
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::StorageList(format!("Failed to read {}: {}", dir.display(), e)))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "Skipping entry with non UTF-8 name");
                continue;
            };
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| BackupError::StorageList(format!("Failed to stat {}: {}", entry.path().display(), e)))?
                .is_dir();
            if is_dir {
                keys.push(format!("{}{}{}", prefix, name, PREFIX_SEPARATOR));
            } else {
                keys.push(format!("{}{}", prefix, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let path = self.path_for(key)?;
        let metadata = match fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            // Deleting a missing key is not an error, matching object store semantics.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BackupError::StorageDelete(format!("Failed to stat {}: {}", path.display(), e))),
        };

        let result = if metadata.is_dir() {
            if recursive {
                warn!(path = %path.display(), "Recursively deleting backup directory");
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_dir(&path).await
            }
        } else {
            fs::remove_file(&path).await
        };
        result.map_err(|e| BackupError::StorageDelete(format!("Failed to delete {}: {}", path.display(), e)))?;

        info!(key = %key, "Deleted key");
        Ok(())
    }
}
