//! Mirrors the service log into a Telegram chat.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 50;
const MAX_LOG_LEN: usize = 4000;

/// Targets never forwarded; sending a log line logs through these.
const SKIPPED_TARGETS: [&str; 5] = ["teloxide", "reqwest", "hyper", "h2", "rustls"];

enum LogLine {
    /// WARN and ERROR, sent as they happen.
    Urgent(String),
    /// INFO, sent in batches.
    Batched(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl TelegramLogLayer {
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();

        tokio::spawn(async move {
            let mut batch: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    line = rx.recv() => match line {
                        Some(LogLine::Urgent(text)) => send_log(&bot, chat_id, &text).await,
                        Some(LogLine::Batched(text)) => {
                            batch.push(text);
                            if batch.len() >= MAX_BATCH {
                                flush(&bot, chat_id, &mut batch).await;
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => flush(&bot, chat_id, &mut batch).await,
                }
            }
        });

        Self { tx }
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() > MAX_LOG_LEN {
        let clipped: String = text.chars().take(MAX_LOG_LEN).collect();
        format!("{clipped}...")
    } else {
        text.to_string()
    }
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    if let Err(e) = bot.send_message(chat_id, clip(text)).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

async fn flush(bot: &Bot, chat_id: ChatId, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let combined = batch.join("\n");
    batch.clear();
    send_log(bot, chat_id, &combined).await;
}

fn is_skipped(target: &str) -> bool {
    SKIPPED_TARGETS
        .iter()
        .any(|t| target == *t || target.starts_with(&format!("{t}::")))
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let text = format!("{:?}", value);
            self.message = if self.message.is_empty() {
                text
            } else {
                format!("{text}, {}", self.message)
            };
        } else {
            if !self.message.is_empty() {
                self.message.push_str(", ");
            }
            self.message.push_str(&format!("{} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > Level::INFO || is_skipped(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = match level {
            Level::ERROR => LogLine::Urgent(format!("❌ {}", visitor.message)),
            Level::WARN => LogLine::Urgent(format!("⚠️ {}", visitor.message)),
            _ => LogLine::Batched(visitor.message),
        };
        if self.tx.send(line).is_err() {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
