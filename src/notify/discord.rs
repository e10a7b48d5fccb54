// pgstash/src/notify/discord.rs
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use super::{NotifyError, Notifier, PROGRAM_IDENTIFIER};
use crate::errors::BackupError;

const SUCCESS_COLOR: u32 = 1498748;
const FAILURE_COLOR: u32 = 14554702;
const DELETION_FAILURE_COLOR: u32 = 14590998;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct WebhookMessage {
    pub username: String,
    pub content: String,
    pub embeds: Vec<Embed>,
    pub components: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

pub struct DiscordNotifier {
    webhook: String,
    instance_id: String,
    http: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook: String, instance_id: String) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(DiscordNotifier {
            webhook,
            instance_id,
            http,
        })
    }

    fn message(&self, headline: &str, embed: Embed) -> WebhookMessage {
        WebhookMessage {
            username: PROGRAM_IDENTIFIER.to_string(),
            content: format!("**{}** - *{}*", headline, self.instance_id),
            embeds: vec![embed],
            components: Vec::new(),
        }
    }

    fn error_embed(err: &BackupError, color: u32) -> Embed {
        Embed {
            title: "Error".to_string(),
            description: err.to_string(),
            color,
            fields: Vec::new(),
        }
    }

    async fn send(&self, message: &WebhookMessage) -> Result<(), NotifyError> {
        let response = self.http.post(&self.webhook).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(content = %message.content, "Sent Discord notification");
        Ok(())
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> &str {
        "discord"
    }

    async fn notify_backup_success(&self, databases: usize, key: &str) -> Result<(), NotifyError> {
        let embed = Embed {
            color: SUCCESS_COLOR,
            fields: vec![
                EmbedField {
                    name: "Key".to_string(),
                    value: key.to_string(),
                    inline: false,
                },
                EmbedField {
                    name: "Databases".to_string(),
                    value: databases.to_string(),
                    inline: false,
                },
            ],
            ..Embed::default()
        };
        self.send(&self.message("PG-DB Backup Successful", embed)).await
    }

    async fn notify_backup_failure(&self, err: &BackupError) -> Result<(), NotifyError> {
        let embed = Self::error_embed(err, FAILURE_COLOR);
        self.send(&self.message("PG-DB Backup Failed", embed)).await
    }

    async fn notify_purge_failure(&self, err: &BackupError) -> Result<(), NotifyError> {
        let embed = Self::error_embed(err, DELETION_FAILURE_COLOR);
        self.send(&self.message("PG-DB Backup Deletion Failed", embed)).await
    }
}
