//! Storage backends for uploaded backup archives.
//!
//! Every backend lays keys out as `<prefix>/<instance-id>/<timestamp>/<file>`. The
//! timestamp is rendered with a fixed-width layout so that plain string ordering of
//! keys under one instance prefix matches the chronological order of the runs.

pub(crate) mod local;
pub(crate) mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::config::{AppConfig, StorageBackendConfig};
use crate::errors::Result;

pub const PREFIX_SEPARATOR: &str = "/";

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Establishes any session state needed by the other operations.
    async fn init(&mut self) -> Result<()>;

    fn name(&self) -> String;

    /// The instance root, always ending with `/`.
    fn prefix(&self) -> String;

    /// Uploads `local_path` under a fresh timestamped key and returns that key.
    async fn upload(&self, local_path: &Path) -> Result<String>;

    /// Lists the entries one level below the instance root. Never recursive.
    async fn list(&self) -> Result<Vec<String>>;

    /// Deletes `key`. With `recursive`, every object below `key/` goes first.
    /// Already-deleted objects stay deleted if a later delete fails.
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;

    /// Strips the instance root and any trailing separator from listed keys.
    fn trim_prefix(&self, keys: &[String]) -> Vec<String> {
        let prefix = self.prefix();
        keys.iter()
            .map(|key| {
                key.strip_prefix(&prefix)
                    .unwrap_or(key)
                    .trim_end_matches(PREFIX_SEPARATOR)
                    .to_string()
            })
            .collect()
    }
}

/// Builds storage keys for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub prefix: Option<String>,
    pub instance_id: String,
    pub date_time_layout: String,
}

impl KeyLayout {
    pub fn from_config(app_config: &AppConfig) -> Self {
        KeyLayout {
            prefix: app_config.storage.prefix.clone(),
            instance_id: app_config.instance_id.clone(),
            date_time_layout: app_config.backup.date_time_layout.clone(),
        }
    }

    /// `<prefix>/<instance-id>/`, skipping empty segments.
    pub fn root(&self) -> String {
        let segments: Vec<&str> = [self.prefix.as_deref(), Some(self.instance_id.as_str())]
            .into_iter()
            .flatten()
            .map(|s| s.trim_matches('/'))
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            return String::new();
        }
        format!("{}{}", segments.join(PREFIX_SEPARATOR), PREFIX_SEPARATOR)
    }

    pub fn timestamp(&self, at: DateTime<Utc>) -> String {
        at.format(&self.date_time_layout).to_string()
    }

    pub fn key_for(&self, at: DateTime<Utc>, file_name: &str) -> String {
        format!("{}{}{}{}", self.root(), self.timestamp(at), PREFIX_SEPARATOR, file_name)
    }
}

/// Creates a fresh, uninitialised backend for each run.
pub type StorageFactory = Arc<dyn Fn() -> Box<dyn StorageBackend> + Send + Sync>;

pub fn factory_from_config(app_config: &AppConfig) -> StorageFactory {
    let layout = KeyLayout::from_config(app_config);
    match &app_config.storage.backend {
        StorageBackendConfig::S3(spaces_config) => {
            let spaces_config = spaces_config.clone();
            Arc::new(move || {
                Box::new(s3::S3Storage::new(spaces_config.clone(), layout.clone())) as Box<dyn StorageBackend>
            })
        }
        StorageBackendConfig::Local { root } => {
            let root = root.clone();
            Arc::new(move || Box::new(local::LocalStorage::new(root.clone(), layout.clone())) as Box<dyn StorageBackend>)
        }
    }
}
