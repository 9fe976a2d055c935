use std::sync::Arc;

use async_trait::async_trait;

use super::compat::{CompletionsClient, chat_messages};
use super::{Answer, Engine, EngineError, EngineKind, conversation_history};
use crate::config::BridgeEndpoint;
use crate::envelope::RequestEnvelope;
use crate::markdown::{inline_references, strip_citations};
use crate::store::{ConversationStyle, Database, UserContext};

const MODEL: &str = "bing";

fn temperature(style: ConversationStyle) -> f32 {
    match style {
        ConversationStyle::Creative => 1.0,
        ConversationStyle::Balanced => 0.7,
        ConversationStyle::Precise => 0.2,
    }
}

/// Bing chat through an OpenAI-compatible bridge.
pub struct BingEngine {
    client: CompletionsClient,
    db: Arc<Database>,
}

impl BingEngine {
    pub fn new(http: reqwest::Client, endpoint: BridgeEndpoint, db: Arc<Database>) -> Self {
        Self {
            client: CompletionsClient::new(http, &endpoint.url, endpoint.api_key, "Bing"),
            db,
        }
    }
}

#[async_trait]
impl Engine for BingEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Bing
    }

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError> {
        let history = conversation_history(&self.db, context);
        let messages = chat_messages(None, &history, &request.text);
        let answer = self
            .client
            .complete(MODEL, &messages, Some(temperature(request.config.style)))
            .await?;
        Ok(Answer::Text(answer))
    }

    fn render(&self, text: &str) -> String {
        inline_references(text)
    }

    fn render_plain(&self, text: &str) -> String {
        strip_citations(text)
    }
}
