//! AI engines and the worker that drives them from the bus.
//!
//! Every engine subscribes to the request topic with a filter on its own
//! name, answers through [`Engine::ask`] and leaves publishing to the
//! shared [`EngineWorker`].

mod bard;
mod bing;
mod chatgpt;
mod claude;
mod compat;
mod dalle;
mod deepl;
mod gemini;
mod ideogram;
mod llama;
mod worker;

pub use bard::BardEngine;
pub use bing::BingEngine;
pub use chatgpt::ChatGptEngine;
pub use claude::ClaudeEngine;
pub use dalle::DalleEngine;
pub use deepl::{DeeplEngine, parse_languages};
pub use gemini::GeminiEngine;
pub use ideogram::{IDEOGRAM_RESULT_QUEUE, IdeogramEngine, IdeogramResultWorker};
pub use llama::{LlamaEngine, MonsterCallback, handle_monster_callback};
pub use worker::{EngineWorker, publish_result};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::bus::{BusError, FilterPolicy, Queue};
use crate::config::Config;
use crate::envelope::{MessageType, RequestEnvelope};
use crate::markdown::escape_markdown_v2;
use crate::store::{BlobStore, ConversationTurn, Database, StoreError, UserContext};

/// Turns of stored history sent to stateless chat APIs.
pub(crate) const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Bing,
    Bard,
    ChatGpt,
    Claude,
    Gemini,
    Llama,
    Dalle,
    Ideogram,
    DeepL,
}

impl EngineKind {
    pub const ALL: [EngineKind; 9] = [
        EngineKind::Bing,
        EngineKind::Bard,
        EngineKind::ChatGpt,
        EngineKind::Claude,
        EngineKind::Gemini,
        EngineKind::Llama,
        EngineKind::Dalle,
        EngineKind::Ideogram,
        EngineKind::DeepL,
    ];

    /// Engines a user can pick with `/set_engines`.
    pub const CHAT: [EngineKind; 6] = [
        EngineKind::Bing,
        EngineKind::Bard,
        EngineKind::ChatGpt,
        EngineKind::Claude,
        EngineKind::Gemini,
        EngineKind::Llama,
    ];

    /// Parse a user-supplied engine name. Case-insensitive, accepts a few aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "bing" => Some(EngineKind::Bing),
            "bard" => Some(EngineKind::Bard),
            "chatgpt" | "gpt" => Some(EngineKind::ChatGpt),
            "claude" => Some(EngineKind::Claude),
            "gemini" => Some(EngineKind::Gemini),
            "llama" | "llama2" => Some(EngineKind::Llama),
            "dalle" | "dall-e" => Some(EngineKind::Dalle),
            "ideogram" => Some(EngineKind::Ideogram),
            "deepl" => Some(EngineKind::DeepL),
            _ => None,
        }
    }

    pub fn parse_chat(name: &str) -> Option<Self> {
        Self::parse(name).filter(|kind| kind.is_chat())
    }

    pub fn is_chat(&self) -> bool {
        Self::CHAT.contains(self)
    }

    /// Name used in user configs and bus attributes.
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Bing => "bing",
            EngineKind::Bard => "bard",
            EngineKind::ChatGpt => "chatgpt",
            EngineKind::Claude => "claude",
            EngineKind::Gemini => "gemini",
            EngineKind::Llama => "llama",
            EngineKind::Dalle => "dalle",
            EngineKind::Ideogram => "ideogram",
            EngineKind::DeepL => "deepl",
        }
    }

    /// Header shown above the engine's answers.
    pub fn label(&self) -> &'static str {
        match self {
            EngineKind::Bing => "Bing",
            EngineKind::Bard => "Bard",
            EngineKind::ChatGpt => "ChatGPT",
            EngineKind::Claude => "Claude",
            EngineKind::Gemini => "Gemini",
            EngineKind::Llama => "LLama",
            EngineKind::Dalle => "Dall-E",
            EngineKind::Ideogram => "Ideogram",
            EngineKind::DeepL => "DeepL",
        }
    }

    /// Request types this engine's queue receives.
    pub fn message_types(&self) -> &'static [MessageType] {
        match self {
            EngineKind::Dalle => &[MessageType::Images],
            EngineKind::Ideogram => &[MessageType::Ideogram],
            EngineKind::DeepL => &[MessageType::Translate],
            _ => &[MessageType::Text, MessageType::Command],
        }
    }

    /// Subscription filter for this engine's queue.
    pub fn filter_policy(&self) -> FilterPolicy {
        let types: Vec<&str> = self.message_types().iter().map(|t| t.as_str()).collect();
        FilterPolicy::new()
            .allow("engines", &[self.name()])
            .allow("type", &types)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an engine produced for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text(String),
    /// Image URLs.
    Images(Vec<String>),
    /// `(language code, translated text)` pairs.
    Translations(Vec<(String, String)>),
    /// The answer arrives later through a callback or a retrieval job.
    Deferred,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{vendor} API error ({status}): {message}")]
    Api {
        vendor: &'static str,
        status: u16,
        message: String,
    },
    #[error("unexpected {vendor} response: {message}")]
    Response { vendor: &'static str, message: String },
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl EngineError {
    pub(crate) fn response(vendor: &'static str, message: impl Into<String>) -> Self {
        EngineError::Response {
            vendor,
            message: message.into(),
        }
    }

    /// Failures worth another delivery; everything else is reported to the user.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EngineError::Api { status, .. } => *status == 429 || *status >= 500,
            EngineError::Store(_) | EngineError::Bus(_) => true,
            EngineError::Response { .. } | EngineError::Rejected(_) => false,
        }
    }
}

/// Read the body of a non-2xx vendor response into an [`EngineError::Api`].
pub(crate) async fn api_error(vendor: &'static str, response: reqwest::Response) -> EngineError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    EngineError::Api { vendor, status, message }
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn engine_type(&self) -> EngineKind;

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError>;

    /// Drop vendor-side conversation state. Stored context is cleared by the worker.
    async fn reset_chat(&self, _context: &mut UserContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close(&self) {}

    /// Format a text answer for MarkdownV2.
    fn render(&self, text: &str) -> String {
        escape_markdown_v2(text)
    }

    /// Format a text answer for users who turned MarkdownV2 off.
    fn render_plain(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Stored turns of the context's conversation, starting one if needed.
pub(crate) fn conversation_history(db: &Database, context: &mut UserContext) -> Vec<ConversationTurn> {
    let conversation_id = context.ensure_conversation().to_string();
    match db.read_history(&conversation_id, HISTORY_LIMIT) {
        Ok(turns) => turns,
        Err(e) => {
            tracing::error!("Cannot read history of {conversation_id}: {e}");
            Vec::new()
        }
    }
}

/// Shared handles engines need besides their credentials.
#[derive(Clone)]
pub struct EngineDeps {
    pub http: reqwest::Client,
    pub db: Arc<Database>,
    pub blobs: BlobStore,
    pub results: Queue,
    pub ideogram_results: Queue,
}

/// Build every engine whose credentials are configured.
pub fn build_engines(config: &Config, deps: &EngineDeps) -> Vec<Arc<dyn Engine>> {
    let creds = &config.credentials;
    let mut engines: Vec<Arc<dyn Engine>> = Vec::new();

    if let Some(ref endpoint) = creds.bing {
        engines.push(Arc::new(BingEngine::new(deps.http.clone(), endpoint.clone(), deps.db.clone())));
    }
    if let Some(ref endpoint) = creds.bard {
        engines.push(Arc::new(BardEngine::new(deps.http.clone(), endpoint.clone(), deps.db.clone())));
    }
    if !creds.openai_api_key.is_empty() {
        engines.push(Arc::new(ChatGptEngine::new(
            deps.http.clone(),
            creds.openai_api_key.clone(),
            deps.db.clone(),
        )));
        engines.push(Arc::new(DalleEngine::new(deps.http.clone(), creds.openai_api_key.clone())));
    }
    if !creds.anthropic_api_key.is_empty() {
        engines.push(Arc::new(ClaudeEngine::new(
            deps.http.clone(),
            creds.anthropic_api_key.clone(),
            deps.db.clone(),
        )));
    }
    if !creds.gemini_api_key.is_empty() {
        engines.push(Arc::new(GeminiEngine::new(
            deps.http.clone(),
            creds.gemini_api_key.clone(),
            deps.db.clone(),
            deps.blobs.clone(),
        )));
    }
    if !creds.monsterapi_token.is_empty() {
        engines.push(Arc::new(LlamaEngine::new(
            deps.http.clone(),
            creds.monsterapi_token.clone(),
            creds.monsterapi_callback_url.clone(),
            deps.db.clone(),
        )));
    }
    if !creds.ideogram_token.is_empty() {
        engines.push(Arc::new(IdeogramEngine::new(
            deps.http.clone(),
            creds.ideogram_token.clone(),
            creds.ideogram_user_id.clone(),
            deps.db.clone(),
            deps.ideogram_results.clone(),
        )));
    }
    if !creds.deepl_auth_key.is_empty() {
        engines.push(Arc::new(DeeplEngine::new(deps.http.clone(), creds.deepl_auth_key.clone())));
    }

    let names: Vec<&str> = engines.iter().map(|e| e.engine_type().name()).collect();
    info!("Engines enabled: {}", names.join(", "));
    engines
}
