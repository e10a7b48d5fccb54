// pgstash/src/config/mod.rs
use anyhow::{Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const ENV_PREFIX: &str = "PGSTASH";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const SYSTEM_CONFIG_DIR: &str = "/etc/pgstash";
pub const DEFAULT_RETENTION_COUNT: usize = 30;
pub const DEFAULT_DATE_TIME_LAYOUT: &str = "%Y%m%d%H%M%S";
pub const DEFAULT_CRON: &str = "0 0 * * *";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JsonAppConfig {
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JsonPostgresConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JsonStorageConfig {
    pub backend: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub local_path: Option<PathBuf>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JsonBackupConfig {
    pub retention_count: Option<usize>,
    pub date_time_layout: Option<String>,
    pub cron: Option<String>,
    pub encrypt: Option<bool>,
    pub exclude_databases: Option<Vec<String>>,
    pub work_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JsonGpgConfig {
    pub key_server: Option<String>,
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonEncryptionConfig {
    pub gpg: Option<JsonGpgConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDiscordConfig {
    pub enabled: Option<bool>,
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotifiersConfig {
    pub enabled: Option<bool>,
    pub discord: Option<JsonDiscordConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonLoggerConfig {
    pub level: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub app: Option<JsonAppConfig>,
    pub postgres: Option<JsonPostgresConfig>,
    pub storage: Option<JsonStorageConfig>,
    pub backup: Option<JsonBackupConfig>,
    pub encryption: Option<JsonEncryptionConfig>,
    pub notifiers: Option<JsonNotifiersConfig>,
    pub logger: Option<JsonLoggerConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    /// Address buckets as `<endpoint>/<bucket>` instead of `<bucket>.<endpoint>`.
    pub force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendConfig {
    S3(SpacesConfig),
    Local { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub prefix: Option<String>,
    pub backend: StorageBackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub retention_count: usize,
    pub date_time_layout: String,
    pub cron: String,
    pub exclude_databases: Vec<String>,
    pub work_dir: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgConfig {
    pub key_server: String,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordConfig {
    pub webhook: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifiersConfig {
    pub enabled: bool,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    pub level: tracing::Level,
    pub mode: LogMode,
}

/// Fully validated configuration, built once at startup and passed by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub instance_id: String,
    pub postgres: PostgresConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    /// `None` when encryption is disabled, either explicitly or by the load-time sanity check.
    pub encryption: Option<GpgConfig>,
    pub notifiers: NotifiersConfig,
    pub logger: LoggerConfig,
    /// File the settings were read from, `None` when only env and defaults apply.
    pub config_file: Option<PathBuf>,
    /// Policy decisions taken while loading, reported once logging is set up.
    pub load_warnings: Vec<String>,
}

/// Resolves `PGSTASH_<SECTION>_<KEY>` overrides through an injectable lookup.
struct EnvOverrides<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvOverrides<'_> {
    fn key(section: &str, key: &str) -> String {
        format!("{}_{}_{}", ENV_PREFIX, section, key)
            .replace(['-', '.'], "_")
            .to_uppercase()
    }

    fn string(&self, section: &str, key: &str, file_value: Option<String>) -> Option<String> {
        (self.lookup)(&Self::key(section, key)).or(file_value)
    }

    fn parse<T>(&self, section: &str, key: &str, file_value: Option<T>) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let env_key = Self::key(section, key);
        match (self.lookup)(&env_key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .with_context(|| format!("Invalid value '{}' in {}", raw, env_key)),
            None => Ok(file_value),
        }
    }

    fn list(&self, section: &str, key: &str, file_value: Option<Vec<String>>) -> Option<Vec<String>> {
        match (self.lookup)(&Self::key(section, key)) {
            Some(raw) => Some(
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            None => file_value,
        }
    }
}

impl AppConfig {
    /// Loads configuration from an explicit path or the default search locations,
    /// then applies environment overrides and load-time sanity checks.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = config_path.map(Path::to_path_buf).or_else(find_default_config);
        let raw = match &config_file {
            Some(path) => read_raw_config(path)?,
            None => RawJsonConfig::default(),
        };

        let mut config = Self::from_raw(raw, &|key: &str| std::env::var(key).ok())?;
        if config_file.is_none() {
            config
                .load_warnings
                .insert(0, "No config file found, relying on environment variables and defaults".to_string());
        }
        config.config_file = config_file;
        Ok(config)
    }

    /// Logs where the settings came from and every warning raised by `load`.
    /// Called after the subscriber is installed, since `load` runs before it.
    pub fn report_load_messages(&self) {
        if let Some(path) = &self.config_file {
            info!(file = %path.display(), "Using config file");
        }
        for warning in &self.load_warnings {
            warn!("{}", warning);
        }
    }

    pub fn from_raw(raw: RawJsonConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvOverrides { lookup: env };
        let mut load_warnings = Vec::new();

        let app = raw.app.unwrap_or_default();
        let instance_id = non_empty(env.string("app", "instance-id", app.instance_id))
            .or_else(detect_hostname)
            .context("app.instance-id is not set and the host name could not be detected")?;
        if instance_id.contains('/') {
            anyhow::bail!("app.instance-id must not contain '/': {}", instance_id);
        }

        let pg = raw.postgres.unwrap_or_default();
        let postgres = PostgresConfig {
            host: non_empty(env.string("postgres", "host", pg.host)).unwrap_or_else(|| "localhost".to_string()),
            port: env.parse("postgres", "port", pg.port)?.unwrap_or(5432),
            user: non_empty(env.string("postgres", "user", pg.user)).unwrap_or_else(|| "postgres".to_string()),
            password: env.string("postgres", "password", pg.password).unwrap_or_default(),
        };

        let storage = load_storage_config(raw.storage.unwrap_or_default(), &env)?;
        let backup_raw = raw.backup.unwrap_or_default();
        let backup = load_backup_config(backup_raw.clone(), &env)?;

        let encrypt = env.parse("backup", "encrypt", backup_raw.encrypt)?.unwrap_or(false);
        let gpg = raw.encryption.and_then(|e| e.gpg).unwrap_or_default();
        let key_server = non_empty(env.string("encryption.gpg", "key-server", gpg.key_server));
        let key_id = non_empty(env.string("encryption.gpg", "key-id", gpg.key_id));
        let encryption = match (encrypt, key_server, key_id) {
            (false, _, _) => None,
            (true, Some(key_server), Some(key_id)) => Some(GpgConfig { key_server, key_id }),
            (true, _, _) => {
                load_warnings
                    .push("GPG encryption enabled but key-server/key-id not set; disabling encryption".to_string());
                None
            }
        };

        let notifiers_raw = raw.notifiers.unwrap_or_default();
        let discord_raw = notifiers_raw.discord.unwrap_or_default();
        let discord_enabled = env.parse("notifiers.discord", "enabled", discord_raw.enabled)?.unwrap_or(false);
        let discord = match non_empty(env.string("notifiers.discord", "webhook", discord_raw.webhook)) {
            Some(webhook) if discord_enabled => Some(DiscordConfig { webhook }),
            Some(_) => None,
            None => {
                if discord_enabled {
                    load_warnings.push("Discord notifier disabled (missing webhook)".to_string());
                }
                None
            }
        };
        let notifiers = NotifiersConfig {
            enabled: env.parse("notifiers", "enabled", notifiers_raw.enabled)?.unwrap_or(false),
            discord,
        };

        let logger_raw = raw.logger.unwrap_or_default();
        let level = match non_empty(env.string("logger", "level", logger_raw.level)) {
            Some(level) => level
                .parse::<tracing::Level>()
                .map_err(|e| anyhow::anyhow!("Invalid logger.level '{}': {}", level, e))?,
            None => tracing::Level::INFO,
        };
        let mode = match non_empty(env.string("logger", "mode", logger_raw.mode)).as_deref() {
            None | Some("text") | Some("pretty") => LogMode::Text,
            Some("json") => LogMode::Json,
            Some(other) => anyhow::bail!("Invalid logger.mode '{}': expected 'text' or 'json'", other),
        };

        Ok(AppConfig {
            instance_id,
            postgres,
            storage,
            backup,
            encryption,
            notifiers,
            logger: LoggerConfig { level, mode },
            config_file: None,
            load_warnings,
        })
    }
}

fn read_raw_config(config_path: &Path) -> Result<RawJsonConfig> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Failed to parse JSON from config file at {}",
            config_path.display()
        )
    })?;
    Ok(raw)
}

fn find_default_config() -> Option<PathBuf> {
    [
        PathBuf::from(DEFAULT_CONFIG_FILE),
        Path::new(SYSTEM_CONFIG_DIR).join(DEFAULT_CONFIG_FILE),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

fn load_storage_config(raw: JsonStorageConfig, env: &EnvOverrides<'_>) -> Result<StorageConfig> {
    let prefix = non_empty(env.string("storage", "prefix", raw.prefix))
        .map(|p| p.trim_matches('/').to_string())
        .filter(|p| !p.is_empty());

    let backend = non_empty(env.string("storage", "backend", raw.backend)).unwrap_or_else(|| "s3".to_string());
    let backend = match backend.as_str() {
        "s3" => {
            let endpoint = non_empty(env.string("storage", "endpoint", raw.endpoint));
            let region = non_empty(env.string("storage", "region", raw.region));
            let access_key = non_empty(env.string("storage", "access-key", raw.access_key));
            let secret_key = non_empty(env.string("storage", "secret-key", raw.secret_key));
            let bucket = non_empty(env.string("storage", "bucket", raw.bucket));
            let force_path_style = env
                .parse("storage", "force-path-style", raw.force_path_style)?
                .unwrap_or(false);
            match (endpoint, region, access_key, secret_key, bucket) {
                (Some(endpoint_url), Some(region), Some(access_key_id), Some(secret_access_key), Some(bucket_name)) => {
                    StorageBackendConfig::S3(SpacesConfig {
                        endpoint_url,
                        region,
                        access_key_id,
                        secret_access_key,
                        bucket_name,
                        force_path_style,
                    })
                }
                _ => anyhow::bail!(
                    "S3 storage requires endpoint, region, access-key, secret-key and bucket to be set"
                ),
            }
        }
        "local" => {
            let root = env
                .string("storage", "local-path", raw.local_path.map(|p| p.to_string_lossy().into_owned()))
                .filter(|p| !p.trim().is_empty())
                .context("storage.local-path must be set for the local storage backend")?;
            StorageBackendConfig::Local { root: PathBuf::from(root) }
        }
        other => anyhow::bail!("Unknown storage backend '{}': expected 's3' or 'local'", other),
    };

    Ok(StorageConfig { prefix, backend })
}

fn load_backup_config(raw: JsonBackupConfig, env: &EnvOverrides<'_>) -> Result<BackupConfig> {
    let retention_count = env
        .parse("backup", "retention-count", raw.retention_count)?
        .unwrap_or(DEFAULT_RETENTION_COUNT);
    if retention_count == 0 {
        anyhow::bail!("backup.retention-count must be at least 1");
    }

    let date_time_layout = non_empty(env.string("backup", "date-time-layout", raw.date_time_layout))
        .unwrap_or_else(|| DEFAULT_DATE_TIME_LAYOUT.to_string());
    validate_date_time_layout(&date_time_layout)?;

    let timeout = env
        .parse("backup", "timeout-secs", raw.timeout_secs)?
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let cron = non_empty(env.string("backup", "cron", raw.cron)).unwrap_or_else(|| DEFAULT_CRON.to_string());
    crate::scheduler::parse_schedule(&cron)?;

    Ok(BackupConfig {
        retention_count,
        date_time_layout,
        cron,
        exclude_databases: env
            .list("backup", "exclude-databases", raw.exclude_databases)
            .unwrap_or_default(),
        work_dir: env
            .string("backup", "work-dir", raw.work_dir.map(|p| p.to_string_lossy().into_owned()))
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        timeout,
    })
}

/// Rejects layouts whose rendered timestamps would not sort chronologically as strings.
///
/// The layout must render fixed-width, `/`-free output and round-trip through parsing,
/// since retention relies on plain string ordering of the timestamp segment.
pub fn validate_date_time_layout(layout: &str) -> Result<()> {
    if StrftimeItems::new(layout).any(|item| matches!(item, Item::Error)) {
        anyhow::bail!("backup.date-time-layout '{}' is not a valid strftime format", layout);
    }

    let samples = [
        (2001, 2, 3, 4, 5, 6),
        (2001, 2, 3, 4, 5, 7),
        (2001, 2, 3, 4, 6, 0),
        (2001, 2, 3, 5, 0, 0),
        (2001, 2, 4, 0, 0, 0),
        (2001, 3, 1, 0, 0, 0),
        (2002, 1, 1, 0, 0, 0),
        (2099, 12, 31, 23, 59, 59),
    ];
    let mut rendered = Vec::with_capacity(samples.len());
    for (y, mo, d, h, mi, s) in samples {
        let dt = NaiveDate::from_ymd_opt(y, mo, d)
            .and_then(|date| date.and_hms_opt(h, mi, s))
            .context("invalid sample timestamp")?;
        let text = dt.format(layout).to_string();
        if text.is_empty() || text.contains('/') {
            anyhow::bail!("backup.date-time-layout '{}' must render a non-empty value without '/'", layout);
        }
        if NaiveDateTime::parse_from_str(&text, layout).ok() != Some(dt) {
            anyhow::bail!("backup.date-time-layout '{}' must include the date and time down to seconds", layout);
        }
        rendered.push(text);
    }

    let fixed_width = rendered.windows(2).all(|w| w[0].len() == w[1].len());
    let sortable = rendered.windows(2).all(|w| w[0] < w[1]);
    if !fixed_width || !sortable {
        anyhow::bail!(
            "backup.date-time-layout '{}' must be fixed-width and lexicographically sortable",
            layout
        );
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn detect_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    pub(crate) fn local_config(root: &Path, work_dir: &Path) -> AppConfig {
        AppConfig {
            instance_id: "db-host-1".to_string(),
            postgres: PostgresConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: String::new(),
            },
            storage: StorageConfig {
                prefix: Some("backups".to_string()),
                backend: StorageBackendConfig::Local { root: root.to_path_buf() },
            },
            backup: BackupConfig {
                retention_count: 2,
                date_time_layout: DEFAULT_DATE_TIME_LAYOUT.to_string(),
                cron: DEFAULT_CRON.to_string(),
                exclude_databases: vec![],
                work_dir: work_dir.to_path_buf(),
                timeout: None,
            },
            encryption: None,
            notifiers: NotifiersConfig { enabled: false, discord: None },
            logger: LoggerConfig { level: tracing::Level::INFO, mode: LogMode::Text },
            config_file: None,
            load_warnings: Vec::new(),
        }
    }

    fn raw(value: serde_json::Value) -> anyhow::Result<RawJsonConfig> {
        Ok(serde_json::from_value(value)?)
    }

    fn s3_section() -> serde_json::Value {
        json!({
            "endpoint": "https://fra1.digitaloceanspaces.com",
            "region": "fra1",
            "access-key": "AKIA",
            "secret-key": "secret",
            "bucket": "db-backups",
            "prefix": "/pg/"
        })
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_applied() -> anyhow::Result<()> {
        let cfg = AppConfig::from_raw(
            raw(json!({ "app": { "instance-id": "node-a" }, "storage": s3_section() }))?,
            &no_env,
        )?;

        assert_eq!(cfg.instance_id, "node-a");
        assert_eq!(cfg.postgres.host, "localhost");
        assert_eq!(cfg.postgres.port, 5432);
        assert_eq!(cfg.backup.retention_count, DEFAULT_RETENTION_COUNT);
        assert_eq!(cfg.backup.date_time_layout, DEFAULT_DATE_TIME_LAYOUT);
        assert_eq!(cfg.backup.cron, DEFAULT_CRON);
        assert_eq!(cfg.backup.timeout, None);
        assert_eq!(cfg.storage.prefix.as_deref(), Some("pg"));
        assert!(cfg.encryption.is_none());
        assert!(!cfg.notifiers.enabled);
        assert_eq!(cfg.logger.level, tracing::Level::INFO);
        assert_eq!(cfg.logger.mode, LogMode::Text);
        Ok(())
    }

    #[test]
    fn test_env_overrides_file_values() -> anyhow::Result<()> {
        let env: HashMap<&str, &str> = [
            ("PGSTASH_POSTGRES_HOST", "db.internal"),
            ("PGSTASH_POSTGRES_PORT", "6543"),
            ("PGSTASH_BACKUP_RETENTION_COUNT", "7"),
            ("PGSTASH_BACKUP_EXCLUDE_DATABASES", "scratch, analytics ,"),
            ("PGSTASH_STORAGE_BUCKET", "other-bucket"),
            ("PGSTASH_STORAGE_FORCE_PATH_STYLE", "true"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "postgres": { "host": "file-host", "port": 5432 },
                "backup": { "retention-count": 3 },
                "storage": s3_section()
            }))?,
            &lookup,
        )?;

        assert_eq!(cfg.postgres.host, "db.internal");
        assert_eq!(cfg.postgres.port, 6543);
        assert_eq!(cfg.backup.retention_count, 7);
        assert_eq!(cfg.backup.exclude_databases, vec!["scratch", "analytics"]);
        match cfg.storage.backend {
            StorageBackendConfig::S3(s3) => {
                assert_eq!(s3.bucket_name, "other-bucket");
                assert!(s3.force_path_style);
            }
            other => panic!("unexpected backend {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_invalid_env_value_is_rejected() -> anyhow::Result<()> {
        let lookup = |key: &str| (key == "PGSTASH_POSTGRES_PORT").then(|| "not-a-port".to_string());
        let result = AppConfig::from_raw(
            raw(json!({ "app": { "instance-id": "node-a" }, "storage": s3_section() }))?,
            &lookup,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_encryption_disabled_without_key_settings() -> anyhow::Result<()> {
        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "backup": { "encrypt": true },
                "encryption": { "gpg": { "key-server": "keys.openpgp.org" } }
            }))?,
            &no_env,
        )?;
        assert!(cfg.encryption.is_none());
        assert_eq!(
            cfg.load_warnings,
            vec!["GPG encryption enabled but key-server/key-id not set; disabling encryption"]
        );

        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "backup": { "encrypt": true },
                "encryption": { "gpg": { "key-server": "keys.openpgp.org", "key-id": "ABCDEF01" } }
            }))?,
            &no_env,
        )?;
        assert_eq!(
            cfg.encryption,
            Some(GpgConfig {
                key_server: "keys.openpgp.org".to_string(),
                key_id: "ABCDEF01".to_string()
            })
        );
        assert!(cfg.load_warnings.is_empty());
        Ok(())
    }

    #[test]
    fn test_discord_disabled_without_webhook() -> anyhow::Result<()> {
        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "notifiers": { "enabled": true, "discord": { "enabled": true, "webhook": "" } }
            }))?,
            &no_env,
        )?;
        assert!(cfg.notifiers.enabled);
        assert!(cfg.notifiers.discord.is_none());
        assert_eq!(cfg.load_warnings, vec!["Discord notifier disabled (missing webhook)"]);

        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "notifiers": { "enabled": true, "discord": { "enabled": true, "webhook": "https://discord.test/hook" } }
            }))?,
            &no_env,
        )?;
        assert_eq!(
            cfg.notifiers.discord,
            Some(DiscordConfig { webhook: "https://discord.test/hook".to_string() })
        );
        Ok(())
    }

    #[test]
    fn test_load_warnings_are_logged() -> anyhow::Result<()> {
        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "backup": { "encrypt": true },
                "notifiers": { "enabled": true, "discord": { "enabled": true } }
            }))?,
            &no_env,
        )?;
        assert_eq!(cfg.load_warnings.len(), 2);

        let captured = CapturedLog::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || cfg.report_load_messages());

        let output = captured.contents()?;
        assert!(output.contains("WARN"));
        assert!(output.contains("disabling encryption"));
        assert!(output.contains("Discord notifier disabled (missing webhook)"));
        Ok(())
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn contents(&self) -> anyhow::Result<String> {
            let bytes = self.0.lock().map_err(|_| anyhow::anyhow!("log buffer poisoned"))?;
            Ok(String::from_utf8(bytes.clone())?)
        }
    }

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut bytes = self.0.lock().map_err(|_| std::io::Error::other("log buffer poisoned"))?;
            bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_incomplete_s3_config_is_rejected() -> anyhow::Result<()> {
        let result = AppConfig::from_raw(
            raw(json!({ "app": { "instance-id": "node-a" }, "storage": { "bucket": "b" } }))?,
            &no_env,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_local_backend() -> anyhow::Result<()> {
        let cfg = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": { "backend": "local", "local-path": "/var/backups/pg" }
            }))?,
            &no_env,
        )?;
        assert_eq!(
            cfg.storage.backend,
            StorageBackendConfig::Local { root: PathBuf::from("/var/backups/pg") }
        );

        let missing = AppConfig::from_raw(
            raw(json!({ "app": { "instance-id": "node-a" }, "storage": { "backend": "local" } }))?,
            &no_env,
        );
        assert!(missing.is_err());
        Ok(())
    }

    #[test]
    fn test_zero_retention_rejected() -> anyhow::Result<()> {
        let result = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "backup": { "retention-count": 0 }
            }))?,
            &no_env,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_cron_rejected() -> anyhow::Result<()> {
        let result = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "backup": { "cron": "every night" }
            }))?,
            &no_env,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_date_time_layout_validation() {
        assert!(validate_date_time_layout(DEFAULT_DATE_TIME_LAYOUT).is_ok());
        assert!(validate_date_time_layout("%Y-%m-%dT%H-%M-%S").is_ok());
        // Not sortable: day first.
        assert!(validate_date_time_layout("%d%m%Y%H%M%S").is_err());
        // Contains a path separator.
        assert!(validate_date_time_layout("%Y/%m/%d%H%M%S").is_err());
        // Variable width month name.
        assert!(validate_date_time_layout("%Y%B%d%H%M%S").is_err());
        // Missing seconds cannot round-trip.
        assert!(validate_date_time_layout("%Y%m%d").is_err());
        assert!(validate_date_time_layout("%Q").is_err());
    }

    #[test]
    fn test_invalid_log_mode() -> anyhow::Result<()> {
        let result = AppConfig::from_raw(
            raw(json!({
                "app": { "instance-id": "node-a" },
                "storage": s3_section(),
                "logger": { "level": "debug", "mode": "xml" }
            }))?,
            &no_env,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_read_raw_config_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, json!({ "backup": { "cron": "*/5 * * * *" } }).to_string())?;
        let raw = read_raw_config(&path)?;
        assert_eq!(raw.backup.and_then(|b| b.cron).as_deref(), Some("*/5 * * * *"));

        fs::write(&path, "{ not json")?;
        assert!(read_raw_config(&path).is_err());
        Ok(())
    }
}
