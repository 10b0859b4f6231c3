/// Archive delivery to a Telegram chat through the bot API

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::core::error::{Error, Result};
use crate::utils::{format_bytes, TELEGRAM_API_BASE, TELEGRAM_UPLOAD_LIMIT};

/// Hands a finished archive to somewhere off the host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveUploader: Send + Sync {
    async fn upload(&self, archive: &Path, caption: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramUploader {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    size_limit: u64,
}

impl std::fmt::Debug for TelegramUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramUploader")
            .field("api_base", &self.api_base)
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

impl TelegramUploader {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("marzban-backup/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Upload(e.without_url().to_string()))?;

        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            size_limit: TELEGRAM_UPLOAD_LIMIT,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> Self {
        self.size_limit = size_limit;
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base.trim_end_matches('/'), self.bot_token, method)
    }
}

#[async_trait]
impl ArchiveUploader for TelegramUploader {
    async fn upload(&self, archive: &Path, caption: &str) -> Result<()> {
        let size = tokio::fs::metadata(archive)
            .await
            .map_err(|e| Error::io_at(archive, e))?
            .len();

        if size > self.size_limit {
            return Err(Error::Upload(format!(
                "archive is {}, above the {} bot API limit; it was kept at {}",
                format_bytes(size),
                format_bytes(self.size_limit),
                archive.display()
            )));
        }

        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "backup.tar.gz".to_string());
        let bytes = tokio::fs::read(archive).await.map_err(|e| Error::io_at(archive, e))?;

        let document = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/gzip")
            .map_err(|e| Error::Upload(e.without_url().to_string()))?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .part("document", document);

        tracing::info!("Uploading {} ({}) to Telegram", archive.display(), format_bytes(size));

        // errors carry the request URL, which embeds the bot token
        let response = self
            .client
            .post(self.endpoint("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Upload(e.without_url().to_string()))?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Upload(format!("HTTP {}: {}", status, e.without_url())))?;

        if !body.ok {
            return Err(Error::Upload(format!(
                "HTTP {}: {}",
                status,
                body.description.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        tracing::info!("Upload complete");
        Ok(())
    }
}
