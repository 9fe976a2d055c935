//! Telegram update intake.
//!
//! Every accepted update is normalized into a [`RequestEnvelope`] and
//! published on the request topic, where engine queues pick it up by
//! their filter policies. Commands that only touch user settings are
//! answered here directly.

mod commands;
mod help;
mod webhook;

pub use commands::Command;
pub use webhook::{WebhookState, router};

use std::collections::HashSet;
use std::sync::Arc;

use teloxide::types::{Message, Update, UpdateKind, UserId};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bus::{BusError, DeadLetterQueue, Topic};
use crate::envelope::{MessageType, RequestEnvelope};
use crate::store::{BlobStore, Database, StoreError, UserConfig};
use crate::telegram::{Messenger, SendOptions};
use crate::voice::Transcriber;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("telegram error: {0}")]
    Telegram(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
}

/// Who may talk to the bot and how it is addressed.
#[derive(Debug, Clone, Default)]
pub struct GatewaySettings {
    /// Bot username without the leading `@`. Group messages must mention it.
    pub bot_username: Option<String>,
    /// Empty means everyone.
    pub allowed_users: HashSet<UserId>,
    pub admin_ids: HashSet<UserId>,
    pub default_engines: Vec<String>,
}

impl GatewaySettings {
    /// Everyone may talk to the bot unless `allowed_users` is set. Senders
    /// without a user (channel posts) only pass an open bot.
    pub fn is_allowed(&self, user_id: Option<UserId>) -> bool {
        self.allowed_users.is_empty() || user_id.is_some_and(|id| self.allowed_users.contains(&id))
    }

    pub fn is_admin(&self, user_id: Option<UserId>) -> bool {
        user_id.is_some_and(|id| self.admin_ids.contains(&id))
    }
}

/// A Telegram message reduced to what the bus needs.
#[derive(Debug, Clone)]
pub(crate) struct Inbound {
    pub user_id: i64,
    pub username: Option<String>,
    pub chat_id: i64,
    pub message_id: i32,
    pub update_id: u32,
    pub timestamp: i64,
    pub text: String,
    pub file: Option<String>,
    sender: Option<UserId>,
}

pub struct Gateway {
    settings: GatewaySettings,
    db: Arc<Database>,
    blobs: BlobStore,
    topic: Arc<Topic>,
    dead_letters: DeadLetterQueue,
    messenger: Arc<dyn Messenger>,
    transcriber: Option<Transcriber>,
    denied: Mutex<HashSet<UserId>>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        db: Arc<Database>,
        blobs: BlobStore,
        topic: Arc<Topic>,
        dead_letters: DeadLetterQueue,
        messenger: Arc<dyn Messenger>,
        transcriber: Option<Transcriber>,
    ) -> Self {
        Self {
            settings,
            db,
            blobs,
            topic,
            dead_letters,
            messenger,
            transcriber,
            denied: Mutex::new(HashSet::new()),
        }
    }

    /// Process one webhook update.
    pub async fn handle_update(&self, update: Update) -> Result<(), GatewayError> {
        let update_id = update.id.0;
        let msg = match update.kind {
            UpdateKind::Message(msg) | UpdateKind::EditedMessage(msg) | UpdateKind::ChannelPost(msg) => msg,
            _ => return Ok(()),
        };

        let Some(mut inbound) = self.accept(&msg, update_id).await else {
            return Ok(());
        };
        if !self.resolve_attachments(&msg, &mut inbound).await? {
            return Ok(());
        }

        let preview: String = inbound.text.chars().take(100).collect();
        info!(
            "Message from {} ({}) in chat {}: \"{preview}\"",
            inbound.username.as_deref().unwrap_or("unknown"),
            inbound.user_id,
            inbound.chat_id
        );

        match Command::parse(&inbound.text) {
            Some(command) => self.run_command(command, &inbound).await,
            None => {
                let config = self.user_config(inbound.user_id);
                self.publish(&inbound, MessageType::Text, &inbound.text, config)
            }
        }
    }

    /// Sender checks and mention stripping. `None` means ignore the update.
    async fn accept(&self, msg: &Message, update_id: u32) -> Option<Inbound> {
        let sender = msg.from.as_ref();
        let raw_text = msg.text().or_else(|| msg.caption()).unwrap_or_default();

        let is_group = msg.chat.is_group() || msg.chat.is_supergroup();
        let text = if is_group {
            let mention = format!("@{}", self.settings.bot_username.as_deref()?);
            if !raw_text.contains(&mention) {
                return None;
            }
            raw_text.replace(&mention, "").trim().to_string()
        } else {
            raw_text.trim().to_string()
        };

        let sender_id = sender.map(|u| u.id);
        if !self.settings.is_allowed(sender_id) {
            self.deny(msg, sender_id).await;
            return None;
        }

        Some(Inbound {
            user_id: sender.map(|u| u.id.0 as i64).unwrap_or(msg.chat.id.0),
            username: sender.and_then(|u| u.username.clone()),
            chat_id: msg.chat.id.0,
            message_id: msg.id.0,
            update_id,
            timestamp: msg.date.timestamp(),
            text,
            file: None,
            sender: sender_id,
        })
    }

    async fn deny(&self, msg: &Message, sender: Option<UserId>) {
        warn!("Denied message from {:?} in chat {}", sender, msg.chat.id);
        let Some(user_id) = sender else {
            return;
        };
        if !msg.chat.is_private() {
            return;
        }
        let mut denied = self.denied.lock().await;
        if denied.insert(user_id) {
            self.reply(msg.chat.id.0, msg.id.0, "Access denied.", false).await;
        }
    }

    /// Store photos and transcribe voice notes. Returns false when nothing
    /// is left to publish.
    async fn resolve_attachments(&self, msg: &Message, inbound: &mut Inbound) -> Result<bool, GatewayError> {
        if let Some(photo) = msg.photo().and_then(|sizes| sizes.iter().max_by_key(|p| p.width * p.height)) {
            if inbound.text.is_empty() {
                self.reply(inbound.chat_id, inbound.message_id, "Add a caption to ask about the photo.", false)
                    .await;
                return Ok(false);
            }
            let data = self
                .messenger
                .download_file(&photo.file.id.0)
                .await
                .map_err(GatewayError::Telegram)?;
            let key = format!("att/{}.jpg", photo.file.unique_id.0);
            self.blobs.put(&key, &data).await?;
            inbound.file = Some(key);
        }

        if let Some(voice) = msg.voice() {
            let Some(transcriber) = self.transcriber.clone() else {
                self.reply(inbound.chat_id, inbound.message_id, "Voice messages are not supported.", false)
                    .await;
                return Ok(false);
            };
            let audio = self
                .messenger
                .download_file(&voice.file.id.0)
                .await
                .map_err(GatewayError::Telegram)?;
            let text = tokio::task::spawn_blocking(move || transcriber.transcribe(&audio))
                .await
                .map_err(|e| GatewayError::Transcription(e.to_string()))?
                .map_err(GatewayError::Transcription)?;
            info!("Voice note transcribed: {}", text);
            inbound.text = text;
        }

        Ok(!inbound.text.is_empty() || inbound.file.is_some())
    }

    pub(crate) fn user_config(&self, user_id: i64) -> UserConfig {
        self.db.read_config(user_id, &self.settings.default_engines)
    }

    pub(crate) fn save_config(&self, user_id: i64, config: &UserConfig) -> Result<(), GatewayError> {
        self.db.write_config(user_id, config)?;
        Ok(())
    }

    pub(crate) fn is_admin(&self, inbound: &Inbound) -> bool {
        self.settings.is_admin(inbound.sender)
    }

    pub(crate) fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Publish a request on the topic, addressed to `config.engines`.
    pub(crate) fn publish(
        &self,
        inbound: &Inbound,
        kind: MessageType,
        text: &str,
        config: UserConfig,
    ) -> Result<(), GatewayError> {
        let envelope = RequestEnvelope {
            kind,
            user_id: inbound.user_id,
            username: inbound.username.clone(),
            chat_id: inbound.chat_id,
            message_id: inbound.message_id,
            update_id: inbound.update_id,
            text: text.to_string(),
            timestamp: inbound.timestamp,
            config,
            file: inbound.file.clone(),
        };
        let delivered = self.topic.publish_json(&envelope, envelope.attributes())?;
        info!(
            "Published {} request {} to {:?} ({} queue(s))",
            kind,
            inbound.update_id,
            envelope.engines(),
            delivered
        );
        Ok(())
    }

    pub(crate) async fn reply(&self, chat_id: i64, message_id: i32, text: &str, markdown: bool) {
        let options = SendOptions {
            markdown,
            reply_to: Some(message_id),
            quiet: false,
        };
        if let Err(e) = self.messenger.send_text(chat_id, text, options).await {
            error!("Cannot reply in chat {chat_id}: {e}");
        }
    }
}
