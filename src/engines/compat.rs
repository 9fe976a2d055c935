//! Client for OpenAI-compatible chat completion endpoints.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EngineError, api_error};
use crate::store::ConversationTurn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Chat messages for `prompt` following the stored turns.
pub(crate) fn chat_messages(system: Option<&str>, history: &[ConversationTurn], prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    if let Some(system) = system {
        messages.push(ChatMessage::new("system", system));
    }
    for turn in history {
        messages.push(ChatMessage::new("user", &turn.request));
        messages.push(ChatMessage::new("assistant", &turn.response));
    }
    messages.push(ChatMessage::new("user", prompt));
    messages
}

pub(crate) struct CompletionsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    vendor: &'static str,
}

impl CompletionsClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: String, vendor: &'static str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            vendor,
        }
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<String, EngineError> {
        let request = ChatRequest {
            model,
            messages,
            temperature,
        };
        let url = format!("{}/chat/completions", self.base_url);
        debug!("{} request with {} message(s)", self.vendor, messages.len());

        let mut builder = self.http.post(&url).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(api_error(self.vendor, response).await);
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| EngineError::response(self.vendor, "empty completion"))
    }
}
