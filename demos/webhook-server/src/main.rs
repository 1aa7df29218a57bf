//! Example webhook relay.
//!
//! Run with: cargo run -p webhook-server-demo
//!
//! Then point a GitHub webhook (or `curl`) at http://localhost:3000/webhook.
//! Agent sessions are simulated; each turn resumes or mints a session id.
//! With `RELAY_GITHUB_TOKEN` set, the turn's reply is posted as a comment.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{Json, Router, routing::get};
use relay_core::{AgentProvider, ConversationContext, RelayConfig, SessionStorage};
use relay_github::{GithubClient, RateLimiter};
use relay_session::{ConversationManager, storage::FileSessionStore};
use relay_webhook::{JobError, JobHandler, JobQueue, WebhookJob, http::webhook_router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Runs one agent turn per accepted delivery.
struct RelayHandler {
    manager: Arc<ConversationManager<FileSessionStore>>,
    github: Option<GithubClient>,
    provider: AgentProvider,
}

#[async_trait]
impl JobHandler for RelayHandler {
    async fn handle(&self, job: WebhookJob) -> Result<(), JobError> {
        let Some(context) = ConversationContext::from_webhook_payload(&job.payload) else {
            tracing::debug!(delivery_id = %job.id, event = %job.event_kind, "ignoring event without a conversation");
            return Ok(());
        };
        let key = context.key();

        if job.action() == Some("closed") {
            self.manager.stop(&key).await;
            return Ok(());
        }

        let turn = self.manager.begin_turn(key).await;
        let session_id = match turn.resumable_session(self.provider).await {
            Some(record) => {
                tracing::info!(key = %turn.key(), session_id = %record.session_id, "resuming session");
                record.session_id
            }
            None => Uuid::new_v4().to_string(),
        };

        let record = turn
            .record_session(session_id, context, self.provider)
            .await;

        if let Some(github) = &self.github {
            let reply = format!(
                "Session `{}` ({}) is ready for this thread.",
                record.session_id, record.provider
            );
            let comment = github
                .create_issue_comment(
                    &record.context.owner,
                    &record.context.repo,
                    record.context.issue_number,
                    &reply,
                )
                .await
                .map_err(|error| JobError::Failed(error.to_string()))?;
            tracing::info!(key = %turn.key(), comment_id = comment.id, "reply posted");
        }

        tracing::info!(
            key = %turn.key(),
            session_id = %record.session_id,
            provider = %record.provider,
            "turn complete"
        );
        turn.finish();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    let store = FileSessionStore::open(config.session_dir.clone(), config.session_ttl)
        .await
        .with_context(|| format!("failed to open {}", config.session_dir.display()))?;
    let restored = store
        .load_all_persisted()
        .await
        .context("failed to restore sessions")?;
    tracing::info!(restored, dir = %config.session_dir.display(), "session store ready");

    let manager = Arc::new(ConversationManager::new(Arc::new(store)));
    let cleanup = manager.spawn_cleanup_task(config.cleanup_interval);
    let limiter = Arc::new(RateLimiter::default());
    let github = match &config.github_token {
        Some(token) => Some(
            GithubClient::new(
                &config.github_api_url,
                token,
                Arc::clone(&limiter),
                config.max_retries,
            )
            .context("failed to build GitHub client")?,
        ),
        None => {
            tracing::warn!("RELAY_GITHUB_TOKEN not set, replies will not be posted");
            None
        }
    };

    let handler = RelayHandler {
        manager,
        github,
        provider: config.provider,
    };
    let queue = JobQueue::with_window(handler, config.dedup_window);

    // Build router
    let app = Router::new()
        .merge(webhook_router(queue))
        .route(
            "/rate-limit",
            get(move || {
                let limiter = Arc::clone(&limiter);
                async move { Json(limiter.status()) }
            }),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("Server listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Server shutting down...");
        })
        .await?;

    cleanup.abort();
    Ok(())
}
