//! HTTP endpoints: Telegram webhook, MonsterAPI callback, health check.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use teloxide::types::Update;
use tracing::{error, warn};

use super::Gateway;
use crate::bus::Queue;
use crate::engines::{MonsterCallback, handle_monster_callback};
use crate::store::Database;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct WebhookState {
    pub gateway: Arc<Gateway>,
    pub webhook_secret: Option<String>,
    pub callback_secret: Option<String>,
    pub db: Arc<Database>,
    pub results: Queue,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/telegram", post(telegram_update))
        .route("/callbacks/monsterapi/{secret}", post(monster_callback))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn telegram_update(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    if let Some(secret) = &state.webhook_secret {
        let token = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if token != Some(secret.as_str()) {
            warn!("Webhook call with a wrong secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Unparseable update: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let update_id = update.id.0;
    if let Err(e) = state.gateway.handle_update(update).await {
        error!("Update {update_id} failed: {e}");
    }
    StatusCode::OK
}

async fn monster_callback(
    State(state): State<WebhookState>,
    Path(secret): Path<String>,
    body: Bytes,
) -> StatusCode {
    if state.callback_secret.as_deref() != Some(secret.as_str()) {
        warn!("MonsterAPI callback with an unknown secret");
        return StatusCode::NOT_FOUND;
    }

    let callback: MonsterCallback = match serde_json::from_slice(&body) {
        Ok(callback) => callback,
        Err(e) => {
            warn!("Unparseable MonsterAPI callback: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    match handle_monster_callback(&state.db, &state.results, callback) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!("MonsterAPI callback failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResultEnvelope;
    use crate::gateway::tests::{harness, published, settings};
    use crate::store::JobContext;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const UPDATE: &str = r#"{
        "update_id": 5,
        "message": {
            "message_id": 3,
            "date": 1700000000,
            "chat": {"id": 42, "type": "private", "first_name": "Alice"},
            "from": {"id": 42, "is_bot": false, "first_name": "Alice"},
            "text": "hello"
        }
    }"#;

    fn app(h: &crate::gateway::tests::Harness, results: &Queue) -> Router {
        router(WebhookState {
            gateway: h.gateway.clone(),
            webhook_secret: Some("s3cret".to_string()),
            callback_secret: Some("cb".to_string()),
            db: h.db.clone(),
            results: results.clone(),
        })
    }

    fn post_json(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(SECRET_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(settings());
        let response = app(&h, &Queue::new("results"))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_update_requires_secret_token() {
        let h = harness(settings());
        let results = Queue::new("results");

        let response = app(&h, &results)
            .oneshot(post_json("/telegram", Some("wrong"), UPDATE))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&h, &results).oneshot(post_json("/telegram", None, UPDATE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(published(&h.requests).is_empty());
    }

    #[tokio::test]
    async fn test_update_is_published() {
        let h = harness(settings());
        let response = app(&h, &Queue::new("results"))
            .oneshot(post_json("/telegram", Some("s3cret"), UPDATE))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let requests = published(&h.requests);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].update_id, 5);
    }

    #[tokio::test]
    async fn test_garbage_update_is_bad_request() {
        let h = harness(settings());
        let response = app(&h, &Queue::new("results"))
            .oneshot(post_json("/telegram", Some("s3cret"), "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_monster_callback_wrong_secret_is_not_found() {
        let h = harness(settings());
        let response = app(&h, &Queue::new("results"))
            .oneshot(post_json("/callbacks/monsterapi/guess", None, r#"{"process_id": "p", "status": "COMPLETED"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_monster_callback_publishes_result() {
        let h = harness(settings());
        let results = Queue::new("results");
        let context = JobContext {
            chat_id: 42,
            message_id: 3,
            text: "hi llama".to_string(),
            ..JobContext::default()
        };
        h.db.save_job("p-1", "llama", &context).unwrap();

        let body = r#"{"process_id": "p-1", "status": "COMPLETED", "result": {"text": "Hello there"}}"#;
        let response = app(&h, &results)
            .oneshot(post_json("/callbacks/monsterapi/cb", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let result = ResultEnvelope::from_json(&results.try_receive().unwrap().body).unwrap();
        assert_eq!(result.chat_id, 42);
        assert_eq!(result.decoded_response().unwrap(), "Hello there");
    }
}
