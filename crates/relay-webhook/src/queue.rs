//! Delivery deduplication and asynchronous dispatch.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::Instant;

use crate::protocol::WebhookJob;

/// Default dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(5000);

/// Job processing error.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unsupported payload: {0}")]
    InvalidPayload(String),
    #[error("Job failed: {0}")]
    Failed(String),
}

/// Processes accepted jobs.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: WebhookJob) -> Result<(), JobError>;
}

/// [`JobHandler`] backed by an async function.
pub struct FnHandler<F>(F);

/// Wrap an async function as a [`JobHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(WebhookJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(WebhookJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: WebhookJob) -> Result<(), JobError> {
        (self.0)(job).await
    }
}

/// Outcome of submitting a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued for processing.
    Accepted,
    /// Dropped: the same delivery is being processed.
    InFlight,
    /// Dropped: the same delivery finished within the dedup window.
    RecentlyCompleted,
}

impl Admission {
    /// Whether the job will be processed.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Default)]
struct Tracker {
    in_flight: HashSet<String>,
    completed: HashMap<String, Instant>,
}

impl Tracker {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        self.completed
            .retain(|_, finished| now.duration_since(*finished) < window);
    }
}

struct Inner<H> {
    handler: H,
    window: Duration,
    tracker: Mutex<Tracker>,
}

impl<H> Inner<H> {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts each delivery at most once and processes it in the background.
///
/// `submit` never waits for processing. Ids are tracked while in flight and
/// for the dedup window after completion; nothing survives a restart.
pub struct JobQueue<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for JobQueue<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: JobHandler> JobQueue<H> {
    /// Create a queue with the default dedup window.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self::with_window(handler, DEFAULT_DEDUP_WINDOW)
    }

    /// Create a queue with a custom dedup window.
    #[must_use]
    pub fn with_window(handler: H, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                window,
                tracker: Mutex::new(Tracker::default()),
            }),
        }
    }

    /// Accept or drop a delivery. Must be called within a tokio runtime.
    pub fn submit(&self, job: WebhookJob) -> Admission {
        {
            let mut tracker = self.inner.tracker();
            tracker.prune(self.inner.window);
            if tracker.in_flight.contains(&job.id) {
                tracing::debug!(delivery_id = %job.id, "dropping delivery already in flight");
                return Admission::InFlight;
            }
            if tracker.completed.contains_key(&job.id) {
                tracing::debug!(delivery_id = %job.id, "dropping recently completed delivery");
                return Admission::RecentlyCompleted;
            }
            tracker.in_flight.insert(job.id.clone());
        }

        tracing::info!(delivery_id = %job.id, event = %job.event_kind, "delivery accepted");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let id = job.id.clone();
            let outcome = AssertUnwindSafe(inner.handler.handle(job))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => tracing::debug!(delivery_id = %id, "delivery processed"),
                Ok(Err(error)) => {
                    tracing::error!(delivery_id = %id, %error, "delivery processing failed");
                }
                Err(_) => tracing::error!(delivery_id = %id, "delivery handler panicked"),
            }

            let mut tracker = inner.tracker();
            tracker.in_flight.remove(&id);
            tracker.completed.insert(id, Instant::now());
        });

        Admission::Accepted
    }

    /// Number of deliveries being processed.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.tracker().in_flight.len()
    }

    /// Dedup window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.inner.window
    }
}
