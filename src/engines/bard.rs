use std::sync::Arc;

use async_trait::async_trait;

use super::compat::{CompletionsClient, chat_messages};
use super::{Answer, Engine, EngineError, EngineKind, conversation_history};
use crate::config::BridgeEndpoint;
use crate::envelope::RequestEnvelope;
use crate::markdown::as_markdown;
use crate::store::{Database, UserContext};

const MODEL: &str = "bard";

/// Bard through an OpenAI-compatible bridge.
pub struct BardEngine {
    client: CompletionsClient,
    db: Arc<Database>,
}

impl BardEngine {
    pub fn new(http: reqwest::Client, endpoint: BridgeEndpoint, db: Arc<Database>) -> Self {
        Self {
            client: CompletionsClient::new(http, &endpoint.url, endpoint.api_key, "Bard"),
            db,
        }
    }
}

#[async_trait]
impl Engine for BardEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Bard
    }

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError> {
        let history = conversation_history(&self.db, context);
        let messages = chat_messages(None, &history, &request.text);
        let answer = self.client.complete(MODEL, &messages, None).await?;
        Ok(Answer::Text(answer))
    }

    fn render(&self, text: &str) -> String {
        as_markdown(text)
    }
}
