// pgstash/src/backup/encrypt.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use which::which;

use crate::config::GpgConfig;
use crate::errors::{BackupError, Result};

const ARMORED_KEY_HEADER: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Encrypts archives to a single recipient public key.
pub struct Encryptor {
    gpg_config: GpgConfig,
    key_cache_dir: PathBuf,
    http: reqwest::Client,
}

impl Encryptor {
    pub fn new(gpg_config: GpgConfig, key_cache_dir: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(KEY_FETCH_TIMEOUT)
            .build()
            .map_err(|e| BackupError::Encryption(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Encryptor {
            gpg_config,
            key_cache_dir,
            http,
        })
    }

    fn key_id(&self) -> &str {
        let id = self.gpg_config.key_id.trim();
        id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")).unwrap_or(id)
    }

    fn cached_key_path(&self) -> PathBuf {
        self.key_cache_dir.join(format!("{}.asc", self.key_id()))
    }

    /// Returns the path of the armored public key, downloading it from the key server
    /// on first use.
    pub async fn resolve_key(&self) -> Result<PathBuf> {
        let key_path = self.cached_key_path();
        if let Ok(metadata) = tokio::fs::metadata(&key_path).await {
            if metadata.len() > 0 {
                info!(key_id = %self.key_id(), "Using cached public key");
                return Ok(key_path);
            }
        }

        let url = key_server_lookup_url(&self.gpg_config.key_server);
        info!(key_id = %self.key_id(), url = %url, "Downloading public key");

        let search = format!("0x{}", self.key_id());
        let response = self
            .http
            .get(&url)
            .query(&[("op", "get"), ("options", "mr"), ("search", search.as_str())])
            .send()
            .await
            .map_err(|e| BackupError::Encryption(format!("Failed to fetch key {}: {}", self.key_id(), e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackupError::Encryption(format!(
                "Key server returned {} for key {}",
                status,
                self.key_id()
            )));
        }

        let armored = response
            .text()
            .await
            .map_err(|e| BackupError::Encryption(format!("Failed to read key {}: {}", self.key_id(), e)))?;
        if !armored.contains(ARMORED_KEY_HEADER) {
            return Err(BackupError::Encryption(format!(
                "Key server response for {} does not contain a public key",
                self.key_id()
            )));
        }

        tokio::fs::create_dir_all(&self.key_cache_dir).await.map_err(|e| {
            BackupError::Encryption(format!(
                "Failed to create key cache {}: {}",
                self.key_cache_dir.display(),
                e
            ))
        })?;
        tokio::fs::write(&key_path, armored.as_bytes())
            .await
            .map_err(|e| BackupError::Encryption(format!("Failed to cache key at {}: {}", key_path.display(), e)))?;

        Ok(key_path)
    }

    /// Writes `<archive>.gpg` next to `archive_path` and returns its path.
    pub async fn encrypt_file(&self, archive_path: &Path) -> Result<PathBuf> {
        let key_path = self.resolve_key().await?;
        let gpg_path = which("gpg")
            .map_err(|e| BackupError::Encryption(format!("gpg executable not found in PATH: {}", e)))?;

        let mut encrypted_name = archive_path.as_os_str().to_owned();
        encrypted_name.push(".gpg");
        let encrypted_path = PathBuf::from(encrypted_name);

        info!(file = %archive_path.display(), key_id = %self.key_id(), "Encrypting archive");
        let output = Command::new(gpg_path)
            .arg("--batch")
            .arg("--yes")
            .arg("--trust-model")
            .arg("always")
            .arg("--recipient-file")
            .arg(&key_path)
            .arg("--output")
            .arg(&encrypted_path)
            .arg("--encrypt")
            .arg(archive_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Encryption(format!("Failed to execute gpg: {}", e)))?;

        if !output.status.success() {
            if let Err(e) = tokio::fs::remove_file(&encrypted_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %encrypted_path.display(), error = %e, "Failed to remove partial encrypted file");
                }
            }
            return Err(BackupError::Encryption(format!(
                "gpg exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(file = %encrypted_path.display(), "Encrypted archive");
        Ok(encrypted_path)
    }
}

/// `<server>/pks/lookup`, defaulting to https when the server has no scheme.
pub fn key_server_lookup_url(key_server: &str) -> String {
    let server = key_server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        format!("{}/pks/lookup", server)
    } else {
        format!("https://{}/pks/lookup", server)
    }
}
