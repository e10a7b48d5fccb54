// pgstash/src/backup/logic.rs
use anyhow::Context;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::archive::create_zip_archive;
use super::db_dump::{DumpTool, PgDumpTool, dump_databases, enumerate_databases};
use super::encrypt::Encryptor;
use super::retention;
use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::notify::Notifications;
use crate::storage::{StorageFactory, factory_from_config};

pub const STAGING_DIR_NAME: &str = "pg_dumps";
pub const ARCHIVE_FILE_NAME: &str = "pg_dumps.zip";
pub const KEY_CACHE_DIR_NAME: &str = "keys";
/// Advisory lock shared by every pgstash process using the same work dir.
pub const LOCK_FILE_NAME: &str = "pgstash.lock";

/// State of a single pipeline execution. Lives only as long as the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRun {
    pub staging_dir: PathBuf,
    pub archive_path: PathBuf,
    pub databases: Vec<String>,
    pub dumped: usize,
    pub artifact: Option<PathBuf>,
    pub key: Option<String>,
}

impl BackupRun {
    fn new(work_dir: &Path) -> Self {
        BackupRun {
            staging_dir: work_dir.join(STAGING_DIR_NAME),
            archive_path: work_dir.join(ARCHIVE_FILE_NAME),
            databases: Vec::new(),
            dumped: 0,
            artifact: None,
            key: None,
        }
    }

    fn encrypted_archive_path(&self) -> PathBuf {
        let mut name = self.archive_path.as_os_str().to_owned();
        name.push(".gpg");
        PathBuf::from(name)
    }

    /// Recreates an empty staging directory and drops archives left by an earlier run.
    async fn prepare(&self) -> Result<()> {
        self.cleanup().await;
        tokio::fs::create_dir_all(&self.staging_dir).await.map_err(|e| {
            BackupError::Staging(format!(
                "Failed to create staging directory {}: {}",
                self.staging_dir.display(),
                e
            ))
        })?;
        info!(path = %self.staging_dir.display(), "Prepared staging directory");
        Ok(())
    }

    async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.staging_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.staging_dir.display(), error = %e, "Failed to remove staging directory"),
        }
        for file in [self.archive_path.clone(), self.encrypted_archive_path()] {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), error = %e, "Failed to remove archive"),
            }
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Backup uploaded and retention applied.
    Succeeded { run: BackupRun, key: String, purged: usize },
    /// Backup uploaded, retention pass failed.
    PurgeFailed { run: BackupRun, key: String, error: BackupError },
    Failed(BackupError),
    /// Another run held the lock.
    Skipped,
}

pub struct Pipeline {
    app_config: Arc<AppConfig>,
    dump_tool: Arc<dyn DumpTool>,
    storage_factory: StorageFactory,
    notifications: Notifications,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        app_config: Arc<AppConfig>,
        dump_tool: Arc<dyn DumpTool>,
        storage_factory: StorageFactory,
        notifications: Notifications,
    ) -> Self {
        Pipeline {
            app_config,
            dump_tool,
            storage_factory,
            notifications,
            run_lock: Mutex::new(()),
        }
    }

    /// Wires the production collaborators: `psql`/`pg_dump`, the configured
    /// storage backend and notifiers.
    pub fn from_config(app_config: Arc<AppConfig>) -> anyhow::Result<Self> {
        let notifications = Notifications::from_config(&app_config).context("Failed to set up notifiers")?;
        let dump_tool = Arc::new(PgDumpTool::new(app_config.postgres.clone()));
        let storage_factory = factory_from_config(&app_config);
        Ok(Pipeline::new(app_config, dump_tool, storage_factory, notifications))
    }

    /// Runs backup then purge once. Never returns an error: every outcome is
    /// logged and, except for `Skipped`, notified.
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!(error = %BackupError::RunInProgress, "Skipping backup run");
            return RunOutcome::Skipped;
        };
        let mut lock_file = match open_lock_file(&self.app_config.backup.work_dir).await {
            Ok(lock_file) => lock_file,
            Err(e) => {
                error!(error = %e, "Backup run failed");
                self.notifications.backup_failure(&e).await;
                return RunOutcome::Failed(e);
            }
        };
        let _file_guard = match lock_file.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!(error = %BackupError::RunInProgress, "Skipping backup run, another process holds the lock");
                return RunOutcome::Skipped;
            }
            Err(e) => {
                let e = lock_error(&self.app_config.backup.work_dir, e);
                error!(error = %e, "Backup run failed");
                self.notifications.backup_failure(&e).await;
                return RunOutcome::Failed(e);
            }
        };

        let deadline = self.app_config.backup.timeout.map(|t| Instant::now() + t);
        info!(instance_id = %self.app_config.instance_id, "Starting backup run");

        let mut run = BackupRun::new(&self.app_config.backup.work_dir);
        let result = guarded(cancel, deadline, self.backup(&mut run)).await;
        run.cleanup().await;

        let key = match result {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Backup run failed");
                self.notifications.backup_failure(&e).await;
                return RunOutcome::Failed(e);
            }
        };

        info!(key = %key, databases = run.dumped, artifact = ?run.artifact, "Backup run succeeded");
        self.notifications.backup_success(run.dumped, &key).await;

        match guarded(cancel, deadline, self.purge_backups()).await {
            Ok(purged) => RunOutcome::Succeeded { run, key, purged },
            Err(e) => {
                error!(error = %e, "Purging old backups failed");
                self.notifications.purge_failure(&e).await;
                RunOutcome::PurgeFailed { run, key, error: e }
            }
        }
    }

    /// Runs only the retention pass, under the same lock as a full run.
    pub async fn purge(&self, cancel: &CancellationToken) -> Result<usize> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!(error = %BackupError::RunInProgress, "Skipping purge");
            return Err(BackupError::RunInProgress);
        };
        let mut lock_file = open_lock_file(&self.app_config.backup.work_dir).await?;
        let _file_guard = match lock_file.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!(error = %BackupError::RunInProgress, "Skipping purge, another process holds the lock");
                return Err(BackupError::RunInProgress);
            }
            Err(e) => return Err(lock_error(&self.app_config.backup.work_dir, e)),
        };

        let deadline = self.app_config.backup.timeout.map(|t| Instant::now() + t);
        match guarded(cancel, deadline, self.purge_backups()).await {
            Ok(purged) => Ok(purged),
            Err(e) => {
                error!(error = %e, "Purging old backups failed");
                self.notifications.purge_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Stored backups for this instance, newest first.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut storage = (self.storage_factory)();
        storage.init().await?;
        retention::list_backups(storage.as_ref(), &self.app_config.backup.date_time_layout).await
    }

    async fn backup(&self, run: &mut BackupRun) -> Result<String> {
        run.prepare().await?;

        run.databases = enumerate_databases(self.dump_tool.as_ref(), &self.app_config.backup.exclude_databases).await?;
        let summary = dump_databases(self.dump_tool.as_ref(), &run.databases, &run.staging_dir).await?;
        run.dumped = summary.dumped.len();

        let staging_dir = run.staging_dir.clone();
        let archive_path = run.archive_path.clone();
        let archive = tokio::task::spawn_blocking(move || create_zip_archive(&staging_dir, &archive_path))
            .await
            .map_err(|e| BackupError::Archive(format!("Archive task failed: {}", e)))??;
        if archive.skipped > 0 {
            warn!(files = archive.files, skipped = archive.skipped, "Some staged files were left out of the archive");
        }

        let artifact = match &self.app_config.encryption {
            Some(gpg_config) => {
                let key_cache_dir = self.app_config.backup.work_dir.join(KEY_CACHE_DIR_NAME);
                Encryptor::new(gpg_config.clone(), key_cache_dir)?
                    .encrypt_file(&archive.path)
                    .await?
            }
            None => archive.path,
        };
        run.artifact = Some(artifact.clone());

        let mut storage = (self.storage_factory)();
        storage.init().await?;
        info!(backend = %storage.name(), file = %artifact.display(), "Uploading backup");
        let key = storage.upload(&artifact).await?;
        run.key = Some(key.clone());
        Ok(key)
    }

    async fn purge_backups(&self) -> Result<usize> {
        let mut storage = (self.storage_factory)();
        storage.init().await?;
        retention::purge(
            storage.as_ref(),
            self.app_config.backup.retention_count,
            &self.app_config.backup.date_time_layout,
        )
        .await
    }
}

/// Opens (creating if needed) the lock file in `work_dir`. The file is never removed.
async fn open_lock_file(work_dir: &Path) -> Result<fd_lock::RwLock<std::fs::File>> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| lock_error(work_dir, e))?;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(work_dir.join(LOCK_FILE_NAME))
        .await
        .map_err(|e| lock_error(work_dir, e))?;
    Ok(fd_lock::RwLock::new(file.into_std().await))
}

fn lock_error(work_dir: &Path, e: std::io::Error) -> BackupError {
    BackupError::Staging(format!(
        "Failed to lock {}: {}",
        work_dir.join(LOCK_FILE_NAME).display(),
        e
    ))
}

/// Races `work` against cancellation and the optional run deadline.
async fn guarded<T>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let bounded = async {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .map_err(|_| BackupError::Cancelled("run exceeded its timeout".to_string()))?,
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled("shutdown requested".to_string())),
        result = bounded => result,
    }
}
