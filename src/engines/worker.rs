//! Bus consumer shared by every engine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{Answer, Engine, EngineError};
use crate::bus::{BusError, BusMessage, HandlerResult, MessageHandler, Queue};
use crate::envelope::{MessageType, RequestEnvelope, ResultEnvelope, encode_message};
use crate::markdown::escape_markdown_v2;
use crate::store::{ConversationTurn, Database, JobContext, UserContext};

/// Put a result envelope on the result queue.
pub fn publish_result(results: &Queue, result: &ResultEnvelope) -> Result<(), EngineError> {
    let body = serde_json::to_string(result).map_err(BusError::from)?;
    results.send(body)?;
    Ok(())
}

/// Result envelope answering a request that was parked as a job.
pub(crate) fn job_result(job: &JobContext, engine: &str, response: &str, kind: MessageType) -> ResultEnvelope {
    ResultEnvelope {
        chat_id: job.chat_id,
        message_id: job.message_id,
        engine: engine.to_string(),
        response: encode_message(response),
        kind,
        text: job.text.clone(),
        plaintext: job.plaintext,
    }
}

/// Consumes an engine's request queue and publishes its answers.
pub struct EngineWorker {
    engine: Arc<dyn Engine>,
    db: Arc<Database>,
    results: Queue,
}

impl EngineWorker {
    pub fn new(engine: Arc<dyn Engine>, db: Arc<Database>, results: Queue) -> Self {
        Self { engine, db, results }
    }

    pub async fn process_payload(&self, request: &RequestEnvelope, request_id: &str) -> Result<(), EngineError> {
        let kind = self.engine.engine_type();
        let mut context = self.db.load_context(
            request.user_id,
            request.chat_id,
            kind.name(),
            request_id,
            request.username.as_deref(),
        );

        if request.kind == MessageType::Command {
            return self.process_command(&request.text, &mut context).await;
        }

        if request.text.contains("/ping") {
            return self.publish(request, kind.label(), "pong", MessageType::Text);
        }

        match self.engine.ask(request, &mut context).await {
            Ok(answer) => self.publish_answer(request, &context, answer),
            Err(e) if e.is_transient() => {
                warn!("{} failed for user {}: {e}", kind.label(), context.user_id);
                Err(e)
            }
            Err(e) => {
                error!("{} rejected request from {}: {e}", kind.label(), context.user_id);
                let text = self.format(request, &format!("Error: {e}"), escape_markdown_v2);
                self.publish(request, kind.label(), &text, MessageType::Text)
            }
        }
    }

    async fn process_command(&self, text: &str, context: &mut UserContext) -> Result<(), EngineError> {
        let command = text.trim().trim_start_matches('/').to_lowercase();
        info!("Processing command {} for {}", command, context.user_id);
        if command.contains("reset") {
            self.engine.reset_chat(context).await?;
            self.db.reset_conversation(context)?;
            return Ok(());
        }
        error!("Unknown command {command}");
        Ok(())
    }

    fn publish_answer(&self, request: &RequestEnvelope, context: &UserContext, answer: Answer) -> Result<(), EngineError> {
        let label = self.engine.engine_type().label();
        match answer {
            Answer::Text(text) => {
                if let Err(e) = self.db.save_conversation(context, &ConversationTurn::new(&request.text, &text)) {
                    error!("Cannot save conversation of {}: {e}", context.user_id);
                }
                let rendered = if request.config.plaintext {
                    self.engine.render_plain(&text)
                } else {
                    self.engine.render(&text)
                };
                self.publish(request, label, &rendered, MessageType::Text)
            }
            Answer::Images(urls) => {
                info!("{} generated {} image(s)", label, urls.len());
                self.publish(request, label, &urls.join("\n"), MessageType::Images)
            }
            Answer::Translations(translations) => {
                for (lang, text) in translations {
                    let text = self.format(request, &text, escape_markdown_v2);
                    let lang_label = self.format(request, &lang, escape_markdown_v2);
                    self.publish(request, &lang_label, &text, MessageType::Text)?;
                }
                Ok(())
            }
            Answer::Deferred => {
                info!("{} will answer {} later", label, context.user_id);
                Ok(())
            }
        }
    }

    fn format(&self, request: &RequestEnvelope, text: &str, markdown: fn(&str) -> String) -> String {
        if request.config.plaintext {
            text.to_string()
        } else {
            markdown(text)
        }
    }

    fn publish(&self, request: &RequestEnvelope, label: &str, text: &str, kind: MessageType) -> Result<(), EngineError> {
        publish_result(&self.results, &request.result(label, text, kind))
    }
}

#[async_trait]
impl MessageHandler for EngineWorker {
    async fn handle(&self, message: &BusMessage) -> HandlerResult {
        let request = match RequestEnvelope::from_json(&message.body) {
            Ok(request) => request,
            Err(e) => {
                error!("Dropping malformed request {}: {e}", message.id);
                return Ok(());
            }
        };
        self.process_payload(&request, &message.id).await?;
        Ok(())
    }
}
