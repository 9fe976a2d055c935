use std::sync::Arc;

use async_trait::async_trait;

use super::compat::{CompletionsClient, chat_messages};
use super::{Answer, Engine, EngineError, EngineKind, conversation_history};
use crate::envelope::RequestEnvelope;
use crate::store::{Database, UserContext};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const MODEL: &str = "gpt-4o-mini";

pub struct ChatGptEngine {
    client: CompletionsClient,
    db: Arc<Database>,
}

impl ChatGptEngine {
    pub fn new(http: reqwest::Client, api_key: String, db: Arc<Database>) -> Self {
        Self {
            client: CompletionsClient::new(http, OPENAI_API_URL, api_key, "OpenAI"),
            db,
        }
    }
}

#[async_trait]
impl Engine for ChatGptEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::ChatGpt
    }

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError> {
        let history = conversation_history(&self.db, context);
        let messages = chat_messages(None, &history, &request.text);
        let answer = self.client.complete(MODEL, &messages, None).await?;
        Ok(Answer::Text(answer))
    }
}
