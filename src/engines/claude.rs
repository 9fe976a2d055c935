use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Answer, Engine, EngineError, EngineKind, api_error, conversation_history};
use crate::envelope::RequestEnvelope;
use crate::store::{ConversationTurn, Database, UserContext};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const MODEL: &str = "claude-haiku-4-5-20251001";
const MAX_TOKENS: u32 = 4096;

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'static str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

fn api_messages<'a>(history: &'a [ConversationTurn], prompt: &'a str) -> Vec<ApiMessage<'a>> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 1);
    for turn in history {
        messages.push(ApiMessage { role: "user", content: &turn.request });
        messages.push(ApiMessage { role: "assistant", content: &turn.response });
    }
    messages.push(ApiMessage { role: "user", content: prompt });
    messages
}

/// Anthropic messages API. History is rebuilt from stored turns.
pub struct ClaudeEngine {
    api_key: String,
    http: reqwest::Client,
    db: Arc<Database>,
}

impl ClaudeEngine {
    pub fn new(http: reqwest::Client, api_key: String, db: Arc<Database>) -> Self {
        Self { api_key, http, db }
    }

    async fn message(&self, messages: Vec<ApiMessage<'_>>) -> Result<String, EngineError> {
        let request = ApiRequest {
            model: MODEL,
            max_tokens: MAX_TOKENS,
            messages,
        };

        let response = self
            .http
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error("Anthropic", response).await);
        }

        let api_response: ApiResponse = response.json().await?;
        let text: String = api_response
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect();
        if text.is_empty() {
            return Err(EngineError::response("Anthropic", "empty response"));
        }
        Ok(text)
    }
}

#[async_trait]
impl Engine for ClaudeEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Claude
    }

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError> {
        let history = conversation_history(&self.db, context);
        let answer = self.message(api_messages(&history, &request.text)).await?;
        Ok(Answer::Text(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_end_with_prompt() {
        let history = vec![ConversationTurn::new("2+2?", "4")];
        let messages = api_messages(&history, "and 3+3?");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[2].content, "and 3+3?");
    }

    #[test]
    fn test_response_skips_non_text_blocks() {
        let body = r#"{"content": [{"type": "thinking"}, {"type": "text", "text": "hi"}]}"#;
        let parsed: ApiResponse = serde_json::from_str(body).unwrap();
        let text: String = parsed.content.into_iter().filter_map(|c| c.text).collect();
        assert_eq!(text, "hi");
    }
}
