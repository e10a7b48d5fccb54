// pgstash/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::{info, warn};

use super::{KeyLayout, PREFIX_SEPARATOR, StorageBackend};
use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3Storage {
    spaces_config: SpacesConfig,
    layout: KeyLayout,
    client: Option<s3::Client>,
}

impl S3Storage {
    pub fn new(spaces_config: SpacesConfig, layout: KeyLayout) -> Self {
        S3Storage {
            spaces_config,
            layout,
            client: None,
        }
    }

    fn client(&self) -> Result<&s3::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| BackupError::StorageConnect("S3 client used before init".to_string()))
    }

    /// Lists every object key below `prefix`, following continuation tokens.
    async fn list_recursive(&self, prefix: &str) -> Result<Vec<String>> {
        let client = self.client()?;
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let resp = client
                .list_objects_v2()
                .bucket(&self.spaces_config.bucket_name)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| {
                    BackupError::StorageDelete(format!(
                        "Failed to list objects under s3://{}/{}: {}",
                        self.spaces_config.bucket_name,
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            keys.extend(resp.contents().iter().filter_map(|obj| obj.key().map(str::to_string)));

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client()?
            .delete_object()
            .bucket(&self.spaces_config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BackupError::StorageDelete(format!(
                    "Failed to delete s3://{}/{}: {}",
                    self.spaces_config.bucket_name,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn init(&mut self) -> Result<()> {
        info!(endpoint = %self.spaces_config.endpoint_url, "Connecting to S3 storage");

        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&self.spaces_config.endpoint_url)
            .region(Region::new(self.spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &self.spaces_config.access_key_id,
                &self.spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(self.spaces_config.force_path_style)
            .build();
        let client = s3::Client::from_conf(s3_config);

        client
            .head_bucket()
            .bucket(&self.spaces_config.bucket_name)
            .send()
            .await
            .map_err(|e| {
                BackupError::StorageConnect(format!(
                    "Could not access bucket {} at {}: {}",
                    self.spaces_config.bucket_name,
                    self.spaces_config.endpoint_url,
                    DisplayErrorContext(&e)
                ))
            })?;

        self.client = Some(client);
        Ok(())
    }

    fn name(&self) -> String {
        format!("s3 ({})", self.spaces_config.bucket_name)
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

        info!(
            file = %local_path.display(),
            bucket = %self.spaces_config.bucket_name,
            key = %key,
            "Uploading backup"
        );

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            BackupError::StorageUpload(format!(
                "Failed to create ByteStream from file {}: {}",
                local_path.display(),
                e
            ))
        })?;

        self.client()?
            .put_object()
            .bucket(&self.spaces_config.bucket_name)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::StorageUpload(format!(
                    "Failed to upload {} to s3://{}/{}: {}",
                    local_path.display(),
                    self.spaces_config.bucket_name,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!(key = %key, "Uploaded backup");
        Ok(key)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let client = self.client()?;
        let prefix = self.layout.root();
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let resp = client
                .list_objects_v2()
                .bucket(&self.spaces_config.bucket_name)
                .prefix(&prefix)
                .delimiter(PREFIX_SEPARATOR)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| {
                    BackupError::StorageList(format!(
                        "Failed to list s3://{}/{}: {}",
                        self.spaces_config.bucket_name,
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter(|key| *key != prefix)
                    .map(str::to_string),
            );
            keys.extend(
                resp.common_prefixes()
                    .iter()
                    .filter_map(|cp| cp.prefix())
                    .map(str::to_string),
            );

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = key.trim_end_matches(PREFIX_SEPARATOR);

        if recursive {
            let dir_prefix = format!("{}{}", key, PREFIX_SEPARATOR);
            warn!(bucket = %self.spaces_config.bucket_name, prefix = %dir_prefix, "Recursively deleting objects");
            let children = self.list_recursive(&dir_prefix).await?;
            info!(count = children.len(), prefix = %dir_prefix, "Found objects to delete");

            for child in &children {
                self.delete_object(child).await?;
                info!(key = %child, "Deleted object");
            }
        }

        self.delete_object(key).await?;
        info!(key = %key, "Deleted key");
        Ok(())
    }
}
