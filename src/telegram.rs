//! Telegram client using teloxide.

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, FileId, InputFile, LinkPreviewOptions, MessageId, ParseMode, ReplyParameters,
};
use tracing::{info, warn};

/// How a text message should be sent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SendOptions {
    /// Parse as MarkdownV2.
    pub markdown: bool,
    pub reply_to: Option<i32>,
    /// Silent message without link previews.
    pub quiet: bool,
}

/// The Bot API calls the gateway and the relay need.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str, options: SendOptions) -> Result<i32, String>;

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        reply_to: Option<i32>,
    ) -> Result<i32, String>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Point Telegram at `url` unless it already is.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), String> {
        let url = reqwest::Url::parse(url).map_err(|e| format!("Invalid webhook URL: {e}"))?;
        let info = self
            .bot
            .get_webhook_info()
            .await
            .map_err(|e| format!("Failed to get webhook info: {e}"))?;
        if info.url.as_ref() == Some(&url) {
            info!("Webhook already set to {}", url);
            return Ok(());
        }

        let mut request = self
            .bot
            .set_webhook(url.clone())
            .max_connections(20)
            .drop_pending_updates(true)
            .allowed_updates(vec![
                AllowedUpdate::Message,
                AllowedUpdate::EditedMessage,
                AllowedUpdate::ChannelPost,
                AllowedUpdate::CallbackQuery,
            ]);
        if let Some(secret) = secret {
            request = request.secret_token(secret.to_string());
        }
        request.await.map_err(|e| {
            let msg = format!("Failed to set webhook: {e}");
            warn!("{}", msg);
            msg
        })?;
        info!("Webhook set to {}", url);
        Ok(())
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str, options: SendOptions) -> Result<i32, String> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);

        if options.markdown {
            request = request.parse_mode(ParseMode::MarkdownV2);
        }
        if let Some(msg_id) = options.reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id)));
        }
        if options.quiet {
            request = request
                .disable_notification(true)
                .link_preview_options(LinkPreviewOptions {
                    is_disabled: true,
                    url: None,
                    prefer_small_media: false,
                    prefer_large_media: false,
                    show_above_text: false,
                });
        }

        request.await.map(|msg| msg.id.0).map_err(|e| {
            let msg = format!("Failed to send: {e}");
            warn!("{}", msg);
            msg
        })
    }

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        reply_to: Option<i32>,
    ) -> Result<i32, String> {
        info!("📷 Sending photo {} to chat {}", url, chat_id);
        let url = reqwest::Url::parse(url).map_err(|e| format!("Invalid photo URL: {e}"))?;
        let mut request = self.bot.send_photo(ChatId(chat_id), InputFile::url(url));

        if let Some(cap) = caption {
            request = request.caption(cap);
        }
        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id)));
        }

        request.await.map(|msg| msg.id.0).map_err(|e| {
            let msg = format!("Failed to send photo: {e}");
            warn!("{}", msg);
            msg
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        info!("📥 Downloaded file ({} bytes)", data.len());
        Ok(data)
    }
}
