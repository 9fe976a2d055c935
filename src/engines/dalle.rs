use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Answer, Engine, EngineError, EngineKind, api_error};
use crate::envelope::RequestEnvelope;
use crate::store::UserContext;

const IMAGES_API_URL: &str = "https://api.openai.com/v1/images/generations";
const IMAGE_COUNT: u32 = 4;
const IMAGE_SIZE: &str = "1024x1024";

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'static str,
    prompt: &'a str,
    n: u32,
    size: &'static str,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

/// Prompts the images API refused on content grounds.
fn is_content_policy(error: &EngineError) -> bool {
    match error {
        EngineError::Api { status: 400, message, .. } => {
            let message = message.to_lowercase();
            message.contains("safety system") || message.contains("content policy")
        }
        _ => false,
    }
}

/// OpenAI image generation.
pub struct DalleEngine {
    http: reqwest::Client,
    api_key: String,
}

impl DalleEngine {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        Self { http, api_key }
    }

    async fn generate(&self, prompt: &str) -> Result<Vec<String>, EngineError> {
        info!("Generating images: {}", prompt);
        let request = ImageRequest {
            model: "dall-e-2",
            prompt,
            n: IMAGE_COUNT,
            size: IMAGE_SIZE,
        };
        let response = self
            .http
            .post(IMAGES_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error("OpenAI", response).await);
        }
        let body: ImageResponse = response.json().await?;
        let urls: Vec<String> = body.data.into_iter().filter_map(|d| d.url).collect();
        if urls.is_empty() {
            return Err(EngineError::response("OpenAI", "no images in response"));
        }
        Ok(urls)
    }
}

#[async_trait]
impl Engine for DalleEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Dalle
    }

    async fn ask(&self, request: &RequestEnvelope, _context: &mut UserContext) -> Result<Answer, EngineError> {
        let prompt = request.text.trim();
        if prompt.is_empty() {
            return Err(EngineError::Rejected("empty prompt".to_string()));
        }
        match self.generate(prompt).await {
            Ok(urls) => Ok(Answer::Images(urls)),
            Err(e) if is_content_policy(&e) => {
                info!("Prompt blocked: {e}");
                match e {
                    EngineError::Api { message, .. } => Ok(Answer::Text(message)),
                    other => Err(other),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_policy_detection() {
        let blocked = EngineError::Api {
            vendor: "OpenAI",
            status: 400,
            message: "Your request was rejected as a result of our safety system.".into(),
        };
        let quota = EngineError::Api { vendor: "OpenAI", status: 400, message: "Billing hard limit".into() };
        assert!(is_content_policy(&blocked));
        assert!(!is_content_policy(&quota));
    }

    #[test]
    fn test_request_body() {
        let body = serde_json::to_value(ImageRequest {
            model: "dall-e-2",
            prompt: "a fox",
            n: IMAGE_COUNT,
            size: IMAGE_SIZE,
        })
        .unwrap();
        assert_eq!(body["n"], 4);
        assert_eq!(body["size"], "1024x1024");
    }
}
