//! Ideogram image generation.
//!
//! Generation is asynchronous: [`IdeogramEngine`] submits the prompt and
//! queues a retrieval job on [`IDEOGRAM_RESULT_QUEUE`]. The
//! [`IdeogramResultWorker`] polls the request's metadata, re-queueing itself
//! with a delay until full-resolution images exist.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::worker::{job_result, publish_result};
use super::{Answer, Engine, EngineError, EngineKind, api_error};
use crate::bus::{BusMessage, HandlerResult, MessageHandler, Queue};
use crate::envelope::{MessageType, RequestEnvelope};
use crate::markdown::escape_markdown_v2;
use crate::store::{Database, JobContext, UserContext};

pub const IDEOGRAM_RESULT_QUEUE: &str = "ideogram-result";

const BASE_URL: &str = "https://ideogram.ai";
const MIN_RESOLUTION: u32 = 1024;
const MAX_ATTEMPTS: u32 = 30;
const RETRIEVE_DELAY: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/117.0";

#[derive(Serialize)]
struct SampleRequest<'a> {
    aspect_ratio: &'static str,
    model_version: &'static str,
    use_autoprompt_option: &'static str,
    prompt: &'a str,
    raw_or_fun: &'static str,
    speed: &'static str,
    style: &'static str,
    user_id: &'a str,
    variation_strength: u32,
}

#[derive(Deserialize)]
struct SampleResponse {
    #[serde(default)]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    resolution: Option<u32>,
    #[serde(default)]
    responses: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    response_id: String,
}

impl Metadata {
    fn image_urls(&self) -> Option<Vec<String>> {
        match self.resolution {
            Some(resolution) if resolution >= MIN_RESOLUTION => Some(
                self.responses
                    .iter()
                    .map(|r| format!("{BASE_URL}/api/images/direct/{}", r.response_id))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Message on the retrieval queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RetrievalJob {
    request_id: String,
    attempt: u32,
}

#[derive(Clone)]
struct IdeogramClient {
    http: reqwest::Client,
    token: String,
}

impl IdeogramClient {
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Cookie", format!("session_cookie={};", self.token))
            .header("Origin", BASE_URL)
            .header("Referer", format!("{BASE_URL}/"))
            .header("User-Agent", USER_AGENT)
    }

    async fn submit(&self, prompt: &str, user_id: &str) -> Result<String, EngineError> {
        let body = SampleRequest {
            aspect_ratio: "1:1",
            model_version: "V_0_3",
            use_autoprompt_option: "ON",
            prompt,
            raw_or_fun: "raw",
            speed: "slow",
            style: "photo",
            user_id,
            variation_strength: 50,
        };
        let response = self
            .request(self.http.post(format!("{BASE_URL}/api/images/sample")))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error("Ideogram", response).await);
        }
        let parsed: SampleResponse = response.json().await?;
        if parsed.request_id.is_empty() {
            return Err(EngineError::response("Ideogram", "no request_id in response"));
        }
        Ok(parsed.request_id)
    }

    async fn metadata(&self, request_id: &str) -> Result<Metadata, EngineError> {
        let url = format!("{BASE_URL}/api/images/retrieve_metadata_request_id/{request_id}");
        let response = self.request(self.http.get(url)).send().await?;
        if !response.status().is_success() {
            return Err(api_error("Ideogram", response).await);
        }
        Ok(response.json().await?)
    }
}

pub struct IdeogramEngine {
    client: IdeogramClient,
    user_id: String,
    db: Arc<Database>,
    retrievals: Queue,
}

impl IdeogramEngine {
    pub fn new(http: reqwest::Client, token: String, user_id: String, db: Arc<Database>, retrievals: Queue) -> Self {
        Self {
            client: IdeogramClient { http, token },
            user_id,
            db,
            retrievals,
        }
    }
}

#[async_trait]
impl Engine for IdeogramEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Ideogram
    }

    async fn ask(&self, request: &RequestEnvelope, _context: &mut UserContext) -> Result<Answer, EngineError> {
        let prompt = request.text.trim();
        if prompt.is_empty() {
            return Err(EngineError::Rejected("empty prompt".to_string()));
        }
        let request_id = self.client.submit(prompt, &self.user_id).await?;
        info!("Ideogram request {request_id} submitted");

        self.db.save_job(&request_id, EngineKind::Ideogram.name(), &JobContext::from(request))?;
        let job = RetrievalJob { request_id, attempt: 1 };
        let body = serde_json::to_string(&job).map_err(crate::bus::BusError::from)?;
        self.retrievals.send_delayed(body, RETRIEVE_DELAY);
        Ok(Answer::Deferred)
    }
}

/// Consumer of the retrieval queue.
pub struct IdeogramResultWorker {
    client: IdeogramClient,
    db: Arc<Database>,
    retrievals: Queue,
    results: Queue,
    delay: Duration,
}

impl IdeogramResultWorker {
    pub fn new(http: reqwest::Client, token: String, db: Arc<Database>, retrievals: Queue, results: Queue) -> Self {
        Self {
            client: IdeogramClient { http, token },
            db,
            retrievals,
            results,
            delay: RETRIEVE_DELAY,
        }
    }

    async fn retrieve(&self, job: RetrievalJob) -> Result<(), EngineError> {
        let metadata = self.client.metadata(&job.request_id).await?;
        self.settle(job, metadata)
    }

    /// Publish images when ready, otherwise schedule the next attempt.
    fn settle(&self, job: RetrievalJob, metadata: Metadata) -> Result<(), EngineError> {
        let engine = EngineKind::Ideogram;
        let outcome = match metadata.image_urls() {
            Some(urls) => Ok(urls),
            None if job.attempt >= MAX_ATTEMPTS => Err(format!(
                "Error: images for {} not ready after {} attempts",
                job.request_id, job.attempt
            )),
            None => {
                info!("Republishing {} to achieve delay (attempt {})", job.request_id, job.attempt);
                let next = RetrievalJob {
                    request_id: job.request_id,
                    attempt: job.attempt + 1,
                };
                let body = serde_json::to_string(&next).map_err(crate::bus::BusError::from)?;
                self.retrievals.send_delayed(body, self.delay);
                return Ok(());
            }
        };

        let Some(request) = self.db.read_job(&job.request_id, engine.name()) else {
            warn!("No request job for Ideogram request {}", job.request_id);
            return Ok(());
        };
        let context = request.context;
        let result = match outcome {
            Ok(urls) => job_result(&context, engine.label(), &urls.join("\n"), MessageType::Images),
            Err(message) => {
                error!("{message}");
                let text = if context.plaintext { message } else { escape_markdown_v2(&message) };
                job_result(&context, engine.label(), &text, MessageType::Text)
            }
        };
        publish_result(&self.results, &result)?;
        self.db.delete_job(&job.request_id, engine.name())?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for IdeogramResultWorker {
    async fn handle(&self, message: &BusMessage) -> HandlerResult {
        let job: RetrievalJob = match serde_json::from_str(&message.body) {
            Ok(job) => job,
            Err(e) => {
                error!("Dropping malformed retrieval job {}: {e}", message.id);
                return Ok(());
            }
        };
        self.retrieve(job).await?;
        Ok(())
    }
}
