//! Queue contracts shared by the dispatcher and the workers.
//!
//! Delivery is at-least-once. A handler reports its result as
//! `Result<Outcome, TaskError>`; the dispatcher turns that into an explicit
//! [`Disposition`] (ack, retry after a backoff, or dead-letter) using the
//! queue's [`RetryPolicy`].

pub mod dispatcher;
pub mod memory;
pub mod postgres;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use dispatcher::Dispatcher;
pub use memory::MemoryTaskQueue;
pub use postgres::PgTaskQueue;

pub type MessageId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Fetch,
    Enrichment,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Fetch => "fetch",
            QueueName::Enrichment => "enrichment",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Number of times the backoff doubles before it stays flat.
    pub max_doublings: u32,
}

impl RetryPolicy {
    /// Delay before the attempt that follows `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(self.max_doublings).min(31);
        self.min_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: QueueName,
    pub max_concurrent_dispatches: usize,
    pub max_dispatches_per_second: Option<f64>,
    pub retry: RetryPolicy,
    /// Hard wall-clock limit for one handler invocation.
    pub timeout: Duration,
}

impl QueueSettings {
    pub fn fetch() -> Self {
        Self {
            name: QueueName::Fetch,
            max_concurrent_dispatches: 15,
            max_dispatches_per_second: None,
            retry: RetryPolicy {
                max_attempts: 3,
                min_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(3600),
                max_doublings: 16,
            },
            timeout: Duration::from_secs(540),
        }
    }

    pub fn enrichment() -> Self {
        Self {
            name: QueueName::Enrichment,
            max_concurrent_dispatches: 50,
            max_dispatches_per_second: Some(10.0),
            retry: RetryPolicy {
                max_attempts: 2,
                min_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(30),
                max_doublings: 0,
            },
            timeout: Duration::from_secs(60),
        }
    }

    /// Claims outlive the handler timeout so a slow but live handler is never
    /// redelivered underneath itself.
    pub fn lease(&self) -> Duration {
        self.timeout + Duration::from_secs(60)
    }
}

/// One claimed message handed to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub queue: QueueName,
    pub payload: Value,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Delivery {
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TaskError::Terminal(format!("Invalid {} payload: {e}", self.queue)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub running: i64,
    pub dead: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message {0} not found")]
    NotFound(MessageId),
}

/// The delivery backend: a durable list of messages per queue, claimed under a lease.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        max_attempts: u32,
    ) -> Result<MessageId, QueueError>;

    /// Claim up to `limit` ready messages, bumping their attempt counter.
    /// Messages whose lease has expired are ready again.
    async fn claim(
        &self,
        queue: QueueName,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// The message was handled; remove it.
    async fn ack(&self, id: MessageId) -> Result<(), QueueError>;

    /// Release the message for another attempt no earlier than `run_at`.
    async fn retry(&self, id: MessageId, run_at: DateTime<Utc>, error: &str)
    -> Result<(), QueueError>;

    async fn dead_letter(&self, id: MessageId, error: &str) -> Result<(), QueueError>;

    async fn depth(&self, queue: QueueName) -> Result<QueueDepth, QueueError>;
}

/// Why a handler gave up on a delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Infrastructure trouble; another attempt may succeed.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot change the result.
    #[error("{0}")]
    Terminal(String),
}

impl TaskError {
    pub fn message(&self) -> &str {
        match self {
            TaskError::Retryable(msg) | TaskError::Terminal(msg) => msg,
        }
    }
}

impl From<crate::store::StoreError> for TaskError {
    fn from(e: crate::store::StoreError) -> Self {
        TaskError::Retryable(format!("Store error: {e}"))
    }
}

impl From<QueueError> for TaskError {
    fn from(e: QueueError) -> Self {
        TaskError::Retryable(format!("Queue error: {e}"))
    }
}

/// A handled delivery. Every variant is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// Nothing to do, e.g. a duplicate delivery of finished work.
    Skipped(String),
    /// A domain outcome that is final and must not consume retry budget.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry { delay: Duration, error: String },
    DeadLetter { error: String },
}

/// The retry decision for one handler result.
pub fn decide(
    policy: &RetryPolicy,
    attempt: u32,
    result: &Result<Outcome, TaskError>,
) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(TaskError::Retryable(error)) if policy.has_attempts_left(attempt) => {
            Disposition::Retry {
                delay: policy.backoff(attempt),
                error: error.clone(),
            }
        }
        Err(TaskError::Retryable(error)) | Err(TaskError::Terminal(error)) => {
            Disposition::DeadLetter {
                error: error.clone(),
            }
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, TaskError>;

    /// Called before a failed delivery is scheduled for another attempt.
    async fn on_retry(&self, _delivery: &Delivery, _error: &str) {}

    /// Called before a delivery is dead-lettered, whether its retries ran out,
    /// it timed out on the last attempt, or it failed terminally.
    async fn on_exhausted(&self, _delivery: &Delivery, _error: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPayload {
    pub task_id: String,
    pub execution_id: String,
    pub provider: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentPayload {
    pub job_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// Typed enqueue front for both logical queues.
#[derive(Clone)]
pub struct QueueClient {
    backend: Arc<dyn TaskQueue>,
    fetch: QueueSettings,
    enrichment: QueueSettings,
}

impl QueueClient {
    pub fn new(
        backend: Arc<dyn TaskQueue>,
        fetch: QueueSettings,
        enrichment: QueueSettings,
    ) -> Self {
        Self {
            backend,
            fetch,
            enrichment,
        }
    }

    pub fn backend(&self) -> Arc<dyn TaskQueue> {
        self.backend.clone()
    }

    pub fn settings(&self, queue: QueueName) -> &QueueSettings {
        match queue {
            QueueName::Fetch => &self.fetch,
            QueueName::Enrichment => &self.enrichment,
        }
    }

    pub async fn enqueue_fetch(&self, payload: &FetchPayload) -> Result<MessageId, QueueError> {
        self.backend
            .enqueue(
                QueueName::Fetch,
                serde_json::to_value(payload)?,
                self.fetch.retry.max_attempts,
            )
            .await
    }

    pub async fn enqueue_enrichment(
        &self,
        payload: &EnrichmentPayload,
    ) -> Result<MessageId, QueueError> {
        self.backend
            .enqueue(
                QueueName::Enrichment,
                serde_json::to_value(payload)?,
                self.enrichment.retry.max_attempts,
            )
            .await
    }

    pub async fn depth(&self, queue: QueueName) -> Result<QueueDepth, QueueError> {
        self.backend.depth(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_backoff_doubles_from_sixty_seconds() {
        let policy = QueueSettings::fetch().retry;
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        assert_eq!(policy.backoff(40), Duration::from_secs(3600));
    }

    #[test]
    fn enrichment_backoff_is_flat() {
        let policy = QueueSettings::enrichment().retry;
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(30));
    }

    #[test]
    fn retryable_errors_retry_until_attempts_run_out() {
        let policy = QueueSettings::fetch().retry;
        let err = Err(TaskError::Retryable("connection reset".into()));

        assert_eq!(
            decide(&policy, 1, &err),
            Disposition::Retry {
                delay: Duration::from_secs(60),
                error: "connection reset".into()
            }
        );
        assert!(matches!(decide(&policy, 2, &err), Disposition::Retry { .. }));
        assert_eq!(
            decide(&policy, 3, &err),
            Disposition::DeadLetter {
                error: "connection reset".into()
            }
        );
    }

    #[test]
    fn terminal_errors_never_retry() {
        let policy = QueueSettings::fetch().retry;
        let err = Err(TaskError::Terminal("unknown provider".into()));
        assert!(matches!(decide(&policy, 1, &err), Disposition::DeadLetter { .. }));
    }

    #[test]
    fn domain_outcomes_are_acknowledged() {
        let policy = QueueSettings::enrichment().retry;
        assert_eq!(
            decide(&policy, 1, &Ok(Outcome::Rejected("empty description".into()))),
            Disposition::Ack
        );
    }

    #[test]
    fn malformed_payload_is_terminal() {
        let delivery = Delivery {
            id: 1,
            queue: QueueName::Fetch,
            payload: serde_json::json!({"task_id": 7}),
            attempt: 1,
            max_attempts: 3,
        };
        let err = delivery.payload_as::<FetchPayload>().unwrap_err();
        assert!(matches!(err, TaskError::Terminal(_)));
    }
}
