//! Gemini API client for chat and image understanding.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Answer, Engine, EngineError, EngineKind, api_error, conversation_history};
use crate::envelope::RequestEnvelope;
use crate::markdown::as_markdown;
use crate::store::{BlobStore, ConversationTurn, Database, UserContext};

const GEMINI_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent";
const SAFETY_LEVEL: &str = "BLOCK_ONLY_HIGH";
const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: Vec<SafetySetting>,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Image {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 1.0,
            top_k: 32,
            max_output_tokens: 4096,
        }
    }
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

fn build_request(history: &[ConversationTurn], prompt: &str, image: Option<Vec<u8>>) -> GenerateRequest {
    let mut contents = Vec::with_capacity(history.len() * 2 + 1);
    for turn in history {
        contents.push(Content {
            role: "user",
            parts: vec![Part::Text { text: turn.request.clone() }],
        });
        contents.push(Content {
            role: "model",
            parts: vec![Part::Text { text: turn.response.clone() }],
        });
    }

    let mut parts = Vec::with_capacity(2);
    if let Some(bytes) = image {
        parts.push(Part::Image {
            inline_data: InlineData {
                mime_type: "image/jpeg",
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        });
    }
    parts.push(Part::Text { text: prompt.to_string() });
    contents.push(Content { role: "user", parts });

    GenerateRequest {
        contents,
        generation_config: GenerationConfig::default(),
        safety_settings: HARM_CATEGORIES
            .iter()
            .map(|&category| SafetySetting {
                category,
                threshold: SAFETY_LEVEL,
            })
            .collect(),
    }
}

fn answer_text(parsed: GenerateResponse) -> Result<String, EngineError> {
    if let Some(error) = parsed.error {
        return Err(EngineError::response("Gemini", error.message));
    }
    let candidate = parsed
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| EngineError::response("Gemini", "no candidates in response"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(EngineError::Rejected(format!("Gemini returned no text (finish reason: {reason})")));
    }
    Ok(text)
}

pub struct GeminiEngine {
    api_key: String,
    client: reqwest::Client,
    db: Arc<Database>,
    blobs: BlobStore,
}

impl GeminiEngine {
    pub fn new(client: reqwest::Client, api_key: String, db: Arc<Database>, blobs: BlobStore) -> Self {
        Self {
            api_key,
            client,
            db,
            blobs,
        }
    }
}

#[async_trait]
impl Engine for GeminiEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Gemini
    }

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError> {
        let history = conversation_history(&self.db, context);
        info!("conversation_id '{}'", context.conversation_id.as_deref().unwrap_or_default());

        let image = match request.file {
            Some(ref key) => {
                info!("Reading image '{key}'");
                Some(self.blobs.get(key).await?)
            }
            None => None,
        };

        let body = build_request(&history, &request.text, image);
        let response = self
            .client
            .post(GEMINI_API_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        debug!("Gemini response status: {status}");
        if !status.is_success() {
            return Err(api_error("Gemini", response).await);
        }

        let parsed: GenerateResponse = response.json().await?;
        Ok(Answer::Text(answer_text(parsed)?))
    }

    fn render(&self, text: &str) -> String {
        as_markdown(text)
    }
}
