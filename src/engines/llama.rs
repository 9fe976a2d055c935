//! LLama 2 hosted on MonsterAPI.
//!
//! MonsterAPI runs generations as tasks. With a callback URL configured the
//! task is submitted, a [`RequestJob`](crate::store::RequestJob) keeps the
//! chat coordinates, and [`handle_monster_callback`] publishes the answer
//! when MonsterAPI calls back. Without one the worker polls the task status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::worker::{job_result, publish_result};
use super::{Answer, Engine, EngineError, EngineKind, api_error};
use crate::bus::Queue;
use crate::envelope::{MessageType, RequestEnvelope};
use crate::markdown::escape_markdown_v2;
use crate::store::{ConversationTurn, Database, JobContext, UserContext};

const MODEL: &str = "llama2-7b-chat";
const GENERATE_URL: &str = "https://api.monsterapi.ai/v1/generate/";
const STATUS_URL: &str = "https://api.monsterapi.ai/v1/status/";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_WAIT: Duration = Duration::from_secs(300);

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_length: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    process_id: String,
}

/// Generated text, sometimes returned as a list of alternatives.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum GeneratedText {
    One(String),
    Many(Vec<String>),
}

impl GeneratedText {
    fn into_text(self) -> String {
        match self {
            GeneratedText::One(text) => text,
            GeneratedText::Many(texts) => texts.into_iter().next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    text: Option<GeneratedText>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

/// Task status as returned by the status endpoint and posted to the callback.
#[derive(Debug, Clone, Deserialize)]
pub struct MonsterCallback {
    #[serde(default)]
    pub process_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

enum TaskOutcome {
    Pending,
    Completed(String),
    Failed(String),
}

impl MonsterCallback {
    fn outcome(self) -> TaskOutcome {
        let result = self.result.unwrap_or_default();
        match self.status.as_str() {
            "COMPLETED" => TaskOutcome::Completed(result.text.map(GeneratedText::into_text).unwrap_or_default()),
            "FAILED" => TaskOutcome::Failed(result.error_message.unwrap_or_else(|| "task failed".to_string())),
            _ => TaskOutcome::Pending,
        }
    }
}

pub struct LlamaEngine {
    http: reqwest::Client,
    token: String,
    callback_url: Option<String>,
    db: Arc<Database>,
}

impl LlamaEngine {
    pub fn new(http: reqwest::Client, token: String, callback_url: Option<String>, db: Arc<Database>) -> Self {
        Self {
            http,
            token,
            callback_url,
            db,
        }
    }

    fn generate_url(&self) -> String {
        match self.callback_url {
            Some(ref callback) => format!(
                "{GENERATE_URL}{MODEL}?callbackURL={}",
                urlencoding::encode(callback)
            ),
            None => format!("{GENERATE_URL}{MODEL}"),
        }
    }

    async fn submit(&self, prompt: &str) -> Result<String, EngineError> {
        let response = self
            .http
            .post(self.generate_url())
            .bearer_auth(&self.token)
            .header("accept", "application/json")
            .json(&GenerateRequest { prompt, max_length: 512 })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error("MonsterAPI", response).await);
        }
        let body: GenerateResponse = response.json().await?;
        info!("MonsterAPI task {} submitted", body.process_id);
        Ok(body.process_id)
    }

    async fn poll(&self, process_id: &str) -> Result<String, EngineError> {
        let started = tokio::time::Instant::now();
        loop {
            let response = self
                .http
                .get(format!("{STATUS_URL}{process_id}"))
                .bearer_auth(&self.token)
                .header("accept", "application/json")
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(api_error("MonsterAPI", response).await);
            }
            let status: MonsterCallback = response.json().await?;
            match status.outcome() {
                TaskOutcome::Completed(text) => return Ok(text),
                TaskOutcome::Failed(message) => return Err(EngineError::Rejected(message)),
                TaskOutcome::Pending if started.elapsed() >= MAX_POLL_WAIT => {
                    return Err(EngineError::response(
                        "MonsterAPI",
                        format!("task {process_id} still running after {}s", MAX_POLL_WAIT.as_secs()),
                    ));
                }
                TaskOutcome::Pending => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }
}

#[async_trait]
impl Engine for LlamaEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::Llama
    }

    async fn ask(&self, request: &RequestEnvelope, context: &mut UserContext) -> Result<Answer, EngineError> {
        let process_id = self.submit(&request.text).await?;
        context.conversation_id = Some(process_id.clone());
        context.parent_id = Some(process_id.clone());

        if self.callback_url.is_none() {
            return Ok(Answer::Text(self.poll(&process_id).await?));
        }

        let job = JobContext {
            conversation_id: context.conversation_id.clone(),
            ..JobContext::from(request)
        };
        self.db.save_job(&process_id, EngineKind::Llama.name(), &job)?;
        self.db.save_context(context)?;
        Ok(Answer::Deferred)
    }
}

/// Publish the answer of a finished MonsterAPI task to the chat it came from.
pub fn handle_monster_callback(db: &Database, results: &Queue, callback: MonsterCallback) -> Result<(), EngineError> {
    let process_id = callback.process_id.clone();
    info!("MonsterAPI callback for {process_id}: {}", callback.status);

    let (text, failed) = match callback.outcome() {
        TaskOutcome::Pending => return Ok(()),
        TaskOutcome::Completed(text) => (text, false),
        TaskOutcome::Failed(message) => {
            error!("MonsterAPI task {process_id} failed: {message}");
            (format!("Error: {message}"), true)
        }
    };

    let engine = EngineKind::Llama.name();
    let Some(job) = db.read_job(&process_id, engine) else {
        warn!("No request job for MonsterAPI task {process_id}");
        return Ok(());
    };
    let job = job.context;

    if !failed {
        let mut context = UserContext::new(job.user_id, job.chat_id, engine, &process_id, job.username.as_deref());
        context.conversation_id = Some(job.conversation_id.clone().unwrap_or_else(|| process_id.clone()));
        if let Err(e) = db.save_turn(&context, &ConversationTurn::new(&job.text, &text)) {
            error!("Cannot save conversation for task {process_id}: {e}");
        }
    }

    let response = if job.plaintext { text } else { escape_markdown_v2(&text) };
    publish_result(results, &job_result(&job, EngineKind::Llama.label(), &response, MessageType::Text))?;
    db.delete_job(&process_id, engine)?;
    Ok(())
}
