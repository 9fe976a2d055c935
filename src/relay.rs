//! Delivers engine results back to Telegram.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::bus::{BusMessage, HandlerResult, MessageHandler};
use crate::envelope::{MessageType, ResultEnvelope};
use crate::markdown::split_long_message;
use crate::telegram::{Messenger, SendOptions};

/// Longest text sent in one message, in UTF-16 units.
pub const MAX_MESSAGE_LEN: usize = 4000;
/// Telegram's photo caption limit.
const MAX_CAPTION_LEN: usize = 1024;

fn is_url(line: &str) -> bool {
    line.starts_with("https://") || line.starts_with("http://")
}

pub struct Relay {
    messenger: Arc<dyn Messenger>,
}

impl Relay {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }

    pub async fn handle_result(&self, result: &ResultEnvelope) -> Result<(), String> {
        let message = match result.decoded_response() {
            Ok(message) => message,
            Err(e) => {
                error!("Cannot decode response from {} for chat {}: {e}", result.engine, result.chat_id);
                return Ok(());
            }
        };
        info!("Relaying {} answer to chat {}", result.engine, result.chat_id);

        match result.kind {
            MessageType::Images => self.send_images(result, &message).await,
            _ => self.send_text(result, &message, 0).await,
        }
    }

    async fn send_images(&self, result: &ResultEnvelope, message: &str) -> Result<(), String> {
        let caption: String = result.text.chars().take(MAX_CAPTION_LEN).collect();
        let caption = Some(caption.as_str()).filter(|c| !c.is_empty());
        let mut other_lines = Vec::new();
        let mut delivered = 0;

        for line in message.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !is_url(line) {
                other_lines.push(line);
                continue;
            }
            match self.messenger.send_photo_url(result.chat_id, line, caption, None).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!("Photo {line} not sent ({e}), sending the link instead");
                    other_lines.push(line);
                }
            }
        }

        if other_lines.is_empty() {
            return Ok(());
        }
        self.send_text(result, &other_lines.join("\n"), delivered).await
    }

    /// Send `message`, split into parts when too long. `delivered` counts
    /// what already went out for this result; once anything has, a failed
    /// part is logged and skipped so a redelivery cannot repeat it.
    async fn send_text(&self, result: &ResultEnvelope, message: &str, mut delivered: usize) -> Result<(), String> {
        let (rich, plain) = if message.encode_utf16().count() > MAX_MESSAGE_LEN {
            (
                split_long_message(message, &format!("*__{}__*", result.engine), MAX_MESSAGE_LEN),
                split_long_message(message, &format!("*{}*", result.engine), MAX_MESSAGE_LEN),
            )
        } else {
            (
                vec![format!("*__{}__*: {message}", result.engine)],
                vec![format!("*{}*: {message}", result.engine)],
            )
        };

        let total = rich.len();
        for (i, (rich, plain)) in rich.iter().zip(plain.iter()).enumerate() {
            match self.deliver(result, rich, plain).await {
                Ok(()) => delivered += 1,
                Err(e) if delivered == 0 => return Err(e),
                Err(e) => error!("Part {} of {total} for chat {} dropped: {e}", i + 1, result.chat_id),
            }
        }
        Ok(())
    }

    /// MarkdownV2 reply first, then plain text without reply, then plain text with reply.
    async fn deliver(&self, result: &ResultEnvelope, rich: &str, plain: &str) -> Result<(), String> {
        let reply_to = Some(result.message_id);
        if !result.plaintext {
            let options = SendOptions { markdown: true, reply_to, quiet: true };
            match self.messenger.send_text(result.chat_id, rich, options).await {
                Ok(_) => return Ok(()),
                Err(e) => warn!("MarkdownV2 message rejected: {e}"),
            }
        }

        let options = SendOptions { markdown: false, reply_to: None, quiet: true };
        match self.messenger.send_text(result.chat_id, plain, options).await {
            Ok(_) => return Ok(()),
            Err(e) => error!("Cannot send message to chat {}: {e}", result.chat_id),
        }

        let options = SendOptions { markdown: false, reply_to, quiet: true };
        self.messenger.send_text(result.chat_id, plain, options).await.map(|_| ())
    }
}

#[async_trait]
impl MessageHandler for Relay {
    async fn handle(&self, message: &BusMessage) -> HandlerResult {
        let result = match ResultEnvelope::from_json(&message.body) {
            Ok(result) => result,
            Err(e) => {
                error!("Dropping malformed result {}: {e}", message.id);
                return Ok(());
            }
        };
        self.handle_result(&result).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::envelope::encode_message;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Sent {
        Text { chat_id: i64, text: String, options: SendOptions },
        Photo { chat_id: i64, url: String, caption: Option<String> },
    }

    /// Records outgoing calls; rejects whatever the predicates say.
    #[derive(Default)]
    pub(crate) struct MockMessenger {
        pub sent: Mutex<Vec<Sent>>,
        pub reject_markdown: bool,
        pub reject_unreplied: bool,
        pub reject_photos: bool,
        /// Texts containing this are always rejected.
        pub reject_containing: Option<String>,
        pub files: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MockMessenger {
        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Text { text, .. } => Some(text),
                    Sent::Photo { .. } => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn send_text(&self, chat_id: i64, text: &str, options: SendOptions) -> Result<i32, String> {
            let rejected_text = self.reject_containing.as_deref().is_some_and(|needle| text.contains(needle));
            if rejected_text
                || (self.reject_markdown && options.markdown)
                || (self.reject_unreplied && options.reply_to.is_none())
            {
                return Err("Bad Request".to_string());
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(Sent::Text { chat_id, text: text.to_string(), options });
            Ok(sent.len() as i32)
        }

        async fn send_photo_url(
            &self,
            chat_id: i64,
            url: &str,
            caption: Option<&str>,
            _reply_to: Option<i32>,
        ) -> Result<i32, String> {
            if self.reject_photos {
                return Err("wrong file identifier".to_string());
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(Sent::Photo {
                chat_id,
                url: url.to_string(),
                caption: caption.map(str::to_string),
            });
            Ok(sent.len() as i32)
        }

        async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String> {
            self.files
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == file_id)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| format!("no file {file_id}"))
        }
    }

    fn result(kind: MessageType, response: &str, plaintext: bool) -> ResultEnvelope {
        ResultEnvelope {
            chat_id: 5,
            message_id: 50,
            engine: "Claude".to_string(),
            response: encode_message(response),
            kind,
            text: "draw a cat".to_string(),
            plaintext,
        }
    }

    #[tokio::test]
    async fn test_text_is_sent_as_markdown_reply() {
        let mock = Arc::new(MockMessenger::default());
        let relay = Relay::new(mock.clone());
        relay.handle_result(&result(MessageType::Text, r"Hi\!", false)).await.unwrap();

        assert_eq!(mock.sent(), vec![Sent::Text {
            chat_id: 5,
            text: r"*__Claude__*: Hi\!".to_string(),
            options: SendOptions { markdown: true, reply_to: Some(50), quiet: true },
        }]);
    }

    #[tokio::test]
    async fn test_markdown_failure_falls_back_to_plain_text() {
        let mock = Arc::new(MockMessenger { reject_markdown: true, ..Default::default() });
        let relay = Relay::new(mock.clone());
        relay.handle_result(&result(MessageType::Text, "broken *md", false)).await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Text { text, options, .. } => {
                assert_eq!(text, "*Claude*: broken *md");
                assert!(!options.markdown);
                assert_eq!(options.reply_to, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_resort_is_plain_reply() {
        let mock = Arc::new(MockMessenger {
            reject_markdown: true,
            reject_unreplied: true,
            ..Default::default()
        });
        let relay = Relay::new(mock.clone());
        relay.handle_result(&result(MessageType::Text, "x", false)).await.unwrap();

        match &mock.sent()[0] {
            Sent::Text { options, .. } => assert_eq!(options.reply_to, Some(50)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plaintext_skips_markdown() {
        let mock = Arc::new(MockMessenger::default());
        let relay = Relay::new(mock.clone());
        relay.handle_result(&result(MessageType::Text, "a.b", true)).await.unwrap();
        match &mock.sent()[0] {
            Sent::Text { options, .. } => assert!(!options.markdown),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_long_text_is_split() {
        let mock = Arc::new(MockMessenger::default());
        let relay = Relay::new(mock.clone());
        let long = "y".repeat(MAX_MESSAGE_LEN + 10);
        relay.handle_result(&result(MessageType::Text, &long, false)).await.unwrap();

        let texts = mock.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("*__Claude__*: 1 of 2\n"));
        assert!(texts[1].starts_with("*__Claude__*: 2 of 2\n"));
    }

    #[tokio::test]
    async fn test_failed_part_is_not_resent_on_redelivery() {
        use crate::bus::{DeadLetterQueue, Queue, RedrivePolicy};
        use std::time::Duration;

        let mock = Arc::new(MockMessenger {
            reject_containing: Some("2 of 2".to_string()),
            ..Default::default()
        });
        let relay = Relay::new(mock.clone());
        let dead_letters = DeadLetterQueue::new("dlq");
        let results = Queue::with_redrive("results", RedrivePolicy {
            dead_letter: dead_letters.clone(),
            max_receive_count: 3,
            visibility_timeout: Duration::from_millis(10),
        });
        let long = "z".repeat(MAX_MESSAGE_LEN + 10);
        results
            .send(serde_json::to_string(&result(MessageType::Text, &long, false)).unwrap())
            .unwrap();

        let message = results.receive().await.unwrap();
        assert!(relay.handle(&message).await.is_ok());

        let texts = mock.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("*__Claude__*: 1 of 2\n"));
    }

    #[tokio::test]
    async fn test_nothing_delivered_goes_back_to_bus() {
        let mock = Arc::new(MockMessenger {
            reject_containing: Some("Claude".to_string()),
            ..Default::default()
        });
        let relay = Relay::new(mock.clone());
        assert!(relay.handle_result(&result(MessageType::Text, "hi", false)).await.is_err());
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_text_after_photo_is_not_retried() {
        let mock = Arc::new(MockMessenger {
            reject_containing: Some("blocked".to_string()),
            ..Default::default()
        });
        let relay = Relay::new(mock.clone());
        let response = "https://img.example/1.png\nblocked: too spicy";
        assert!(relay.handle_result(&result(MessageType::Images, response, false)).await.is_ok());
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_emoji_text_is_split_by_utf16_length() {
        let mock = Arc::new(MockMessenger::default());
        let relay = Relay::new(mock.clone());
        let emoji = "😀".repeat(MAX_MESSAGE_LEN / 2 + 1);
        relay.handle_result(&result(MessageType::Text, &emoji, false)).await.unwrap();
        assert_eq!(mock.texts().len(), 2);
    }

    #[tokio::test]
    async fn test_images_sent_as_photos_with_caption() {
        let mock = Arc::new(MockMessenger::default());
        let relay = Relay::new(mock.clone());
        let response = "https://img.example/1.png\nhttps://img.example/2.png\nblocked: too spicy";
        relay.handle_result(&result(MessageType::Images, response, false)).await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Sent::Photo {
            chat_id: 5,
            url: "https://img.example/1.png".to_string(),
            caption: Some("draw a cat".to_string()),
        });
        assert!(matches!(&sent[2], Sent::Text { text, .. } if text.ends_with("blocked: too spicy")));
    }

    #[tokio::test]
    async fn test_failed_photo_is_sent_as_link() {
        let mock = Arc::new(MockMessenger { reject_photos: true, ..Default::default() });
        let relay = Relay::new(mock.clone());
        relay
            .handle_result(&result(MessageType::Images, "https://img.example/1.png", false))
            .await
            .unwrap();
        assert_eq!(mock.texts(), vec!["*__Claude__*: https://img.example/1.png"]);
    }

    #[tokio::test]
    async fn test_undecodable_response_is_dropped() {
        let mock = Arc::new(MockMessenger::default());
        let relay = Relay::new(mock.clone());
        let mut bad = result(MessageType::Text, "x", false);
        bad.response = "***".to_string();
        assert!(relay.handle_result(&bad).await.is_ok());
        assert!(mock.sent().is_empty());
    }
}
