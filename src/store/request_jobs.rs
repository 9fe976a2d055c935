//! Correlation records for engines that answer asynchronously.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{Database, JOB_RETENTION_SECS, StoreError, now};
use crate::envelope::RequestEnvelope;

/// What is needed to route a deferred answer back to its chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub user_id: i64,
    pub chat_id: i64,
    pub message_id: i32,
    pub update_id: u32,
    #[serde(default)]
    pub username: Option<String>,
    pub text: String,
    #[serde(default)]
    pub plaintext: bool,
    /// Conversation the answer belongs to, fixed when the job is parked.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl From<&RequestEnvelope> for JobContext {
    fn from(envelope: &RequestEnvelope) -> Self {
        Self {
            user_id: envelope.user_id,
            chat_id: envelope.chat_id,
            message_id: envelope.message_id,
            update_id: envelope.update_id,
            username: envelope.username.clone(),
            text: envelope.text.clone(),
            plaintext: envelope.config.plaintext,
            conversation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestJob {
    pub request_id: String,
    pub engine: String,
    pub context: JobContext,
    pub timestamp: i64,
}

impl Database {
    pub fn save_job(&self, request_id: &str, engine: &str, context: &JobContext) -> Result<(), StoreError> {
        self.save_job_at(request_id, engine, context, now())
    }

    pub(crate) fn save_job_at(
        &self,
        request_id: &str,
        engine: &str,
        context: &JobContext,
        at: i64,
    ) -> Result<(), StoreError> {
        info!("Save request context for {request_id}, engine {engine}");
        let json = serde_json::to_string(context)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO request_jobs (request_id, engine, context, timestamp, exp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![request_id, engine, json, at, at + JOB_RETENTION_SECS],
        )?;
        Ok(())
    }

    pub fn read_job(&self, request_id: &str, engine: &str) -> Option<RequestJob> {
        let row: Result<Option<(String, i64)>, rusqlite::Error> = self
            .conn()
            .query_row(
                "SELECT context, timestamp FROM request_jobs
                 WHERE request_id = ?1 AND engine = ?2 AND exp > ?3",
                params![request_id, engine, now()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional();

        let (raw, timestamp) = match row {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(e) => {
                error!("Cannot read request_jobs '{request_id}'/'{engine}': {e}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(context) => Some(RequestJob {
                request_id: request_id.to_string(),
                engine: engine.to_string(),
                context,
                timestamp,
            }),
            Err(e) => {
                error!("Corrupt request job '{request_id}': {e}");
                None
            }
        }
    }

    pub fn delete_job(&self, request_id: &str, engine: &str) -> Result<(), StoreError> {
        info!("Delete request context {request_id}, engine {engine}");
        self.conn().execute(
            "DELETE FROM request_jobs WHERE request_id = ?1 AND engine = ?2",
            params![request_id, engine],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_context() -> JobContext {
        JobContext {
            user_id: 1,
            chat_id: -5,
            message_id: 77,
            update_id: 900,
            username: Some("carol".to_string()),
            text: "tell me a joke".to_string(),
            plaintext: false,
            conversation_id: Some("conv-1".to_string()),
        }
    }

    #[test]
    fn test_save_read_delete() {
        let db = Database::in_memory().unwrap();
        db.save_job("proc-1", "llama", &job_context()).unwrap();

        let job = db.read_job("proc-1", "llama").unwrap();
        assert_eq!(job.context, job_context());
        assert!(db.read_job("proc-1", "ideogram").is_none());

        db.delete_job("proc-1", "llama").unwrap();
        assert!(db.read_job("proc-1", "llama").is_none());
    }

    #[test]
    fn test_expired_job_is_not_returned() {
        let db = Database::in_memory().unwrap();
        db.save_job_at("old", "llama", &job_context(), now() - JOB_RETENTION_SECS - 5)
            .unwrap();
        assert!(db.read_job("old", "llama").is_none());
    }
}
