// pgstash/src/notify/mod.rs
pub mod discord;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::errors::BackupError;

pub const PROGRAM_IDENTIFIER: &str = "pgstash";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to send notification: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Notification endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A channel that receives the outcome of backup and purge runs.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify_backup_success(&self, databases: usize, key: &str) -> Result<(), NotifyError>;

    async fn notify_backup_failure(&self, err: &BackupError) -> Result<(), NotifyError>;

    async fn notify_purge_failure(&self, err: &BackupError) -> Result<(), NotifyError>;
}

/// Fans run outcomes out to every configured notifier.
///
/// Delivery errors are logged and never reach the caller.
#[derive(Clone, Default)]
pub struct Notifications {
    enabled: bool,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Notifications {
    pub fn new(enabled: bool, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Notifications { enabled, notifiers }
    }

    pub fn from_config(app_config: &AppConfig) -> Result<Self, NotifyError> {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if let Some(discord_config) = &app_config.notifiers.discord {
            notifiers.push(Arc::new(discord::DiscordNotifier::new(
                discord_config.webhook.clone(),
                app_config.instance_id.clone(),
            )?));
        }
        if app_config.notifiers.enabled && notifiers.is_empty() {
            info!("Notifiers enabled but none configured");
        }
        Ok(Notifications::new(app_config.notifiers.enabled, notifiers))
    }

    fn active(&self) -> Option<&[Arc<dyn Notifier>]> {
        if !self.enabled {
            debug!("Notifiers are disabled");
            return None;
        }
        Some(&self.notifiers)
    }

    pub async fn backup_success(&self, databases: usize, key: &str) {
        let Some(notifiers) = self.active() else { return };
        for notifier in notifiers {
            if let Err(e) = notifier.notify_backup_success(databases, key).await {
                error!(notifier = notifier.name(), error = %e, "Failed to deliver success notification");
            }
        }
    }

    pub async fn backup_failure(&self, err: &BackupError) {
        let Some(notifiers) = self.active() else { return };
        for notifier in notifiers {
            if let Err(e) = notifier.notify_backup_failure(err).await {
                error!(notifier = notifier.name(), error = %e, "Failed to deliver failure notification");
            }
        }
    }

    pub async fn purge_failure(&self, err: &BackupError) {
        let Some(notifiers) = self.active() else { return };
        for notifier in notifiers {
            if let Err(e) = notifier.notify_purge_failure(err).await {
                error!(notifier = notifier.name(), error = %e, "Failed to deliver purge failure notification");
            }
        }
    }
}
