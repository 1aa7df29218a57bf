//! HTTP intake for webhook deliveries.
//!
//! Acknowledges each delivery as soon as it is queued; processing happens
//! in the background. Signature verification is expected upstream.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    protocol::{DELIVERY_HEADER, EVENT_HEADER, WebhookJob},
    queue::{Admission, JobHandler, JobQueue},
};

/// Intake error, reported to the sender as `400 Bad Request`.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),
    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "rejecting webhook delivery");
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// Acknowledgement body.
#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub delivery_id: String,
    pub status: &'static str,
}

/// Create the intake router (`POST /webhook`).
///
/// # Example
/// ```ignore
/// let app = Router::new().merge(webhook_router(queue));
/// ```
#[must_use]
pub fn webhook_router<H: JobHandler>(queue: JobQueue<H>) -> Router {
    Router::new()
        .route("/webhook", post(receive::<H>))
        .with_state(queue)
}

async fn receive<H: JobHandler>(
    State(queue): State<JobQueue<H>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IntakeResponse>), IntakeError> {
    let delivery_id = required_header(&headers, DELIVERY_HEADER)?;
    let event_kind = required_header(&headers, EVENT_HEADER)?;
    let payload: Value = serde_json::from_slice(&body)?;

    let job = WebhookJob::new(delivery_id.clone(), event_kind, payload);
    let (code, status) = match queue.submit(job) {
        Admission::Accepted => (StatusCode::ACCEPTED, "queued"),
        Admission::InFlight | Admission::RecentlyCompleted => (StatusCode::OK, "duplicate"),
    };

    Ok((code, Json(IntakeResponse {
        delivery_id,
        status,
    })))
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, IntakeError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or(IntakeError::MissingHeader(name))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    use super::*;
    use crate::queue::handler_fn;

    fn delivery(id: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(EVENT_HEADER, "issue_comment")
            .header("content-type", "application/json");
        if let Some(id) = id {
            builder = builder.header(DELIVERY_HEADER, id);
        }
        builder.body(Body::from(body.to_owned())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn blocked_router() -> (Router, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let handler_gate = Arc::clone(&gate);
        let queue = JobQueue::new(handler_fn(move |_job: WebhookJob| {
            let gate = Arc::clone(&handler_gate);
            async move {
                let _permit = gate.acquire().await;
                Ok::<(), crate::queue::JobError>(())
            }
        }));
        (webhook_router(queue), gate)
    }

    #[tokio::test]
    async fn test_delivery_accepted_then_duplicate() {
        let (app, _gate) = blocked_router();

        let response = app
            .clone()
            .oneshot(delivery(Some("abc-1"), r#"{"action":"created"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["delivery_id"], "abc-1");

        let response = app
            .oneshot(delivery(Some("abc-1"), r#"{"action":"created"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "duplicate");
    }

    #[tokio::test]
    async fn test_missing_delivery_header_rejected() {
        let (app, _gate) = blocked_router();
        let response = app.oneshot(delivery(None, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains(DELIVERY_HEADER));
    }

    #[tokio::test]
    async fn test_invalid_json_rejected() {
        let (app, _gate) = blocked_router();
        let response = app
            .oneshot(delivery(Some("abc-2"), "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
