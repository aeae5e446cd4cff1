//! Fire-and-forget notification sinks for created shares.
//!
//! Sinks swallow their own failures: a lost notification is logged and never
//! reaches back into pipeline state.

use crate::models::share::{ShareMode, ShareResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

/// What gets announced once a batch has been shared.
#[derive(Debug, Clone, Serialize)]
pub struct ShareNotice {
    pub title: String,
    pub group: String,
    pub mode: ShareMode,
    pub file_count: usize,
    pub share: ShareResult,
}

impl ShareNotice {
    pub fn render(&self) -> String {
        let mode = match self.mode {
            ShareMode::Folder => "folder share",
            ShareMode::Files => "file bundle",
        };
        let expiry = match self.share.expiry_days {
            Some(days) => format!("{} days", days),
            None => "permanent".to_string(),
        };
        format!(
            "{} shared ({}, {} file(s))\nLink: {}\nCode: {}\nExpiry: {}",
            self.title,
            mode,
            self.file_count,
            self.share.share_url,
            self.share.receive_code.as_deref().unwrap_or("none"),
            expiry
        )
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notice: ShareNotice);
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notice: ShareNotice) {
        info!(group = %notice.group, url = %notice.share.share_url, "share created");
    }
}

/// Posts notices to a Telegram chat through the bot API.
#[derive(Clone)]
pub struct TelegramSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(TELEGRAM_TIMEOUT).build()?;
        Ok(Self {
            client,
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, notice: ShareNotice) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": notice.render(),
            "disable_web_page_preview": true,
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(group = %notice.group, "telegram notification sent");
            }
            Ok(response) => {
                warn!(status = %response.status(), "telegram notification rejected");
            }
            Err(err) => warn!("telegram notification failed: {}", err),
        }
    }
}
