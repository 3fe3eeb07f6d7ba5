use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Delivery, MessageId, QueueDepth, QueueError, QueueName, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageStatus {
    Pending,
    Running,
    Dead,
}

#[derive(Debug, Clone)]
struct Message {
    queue: QueueName,
    payload: Value,
    status: MessageStatus,
    attempt: u32,
    max_attempts: u32,
    run_at: DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: MessageId,
    messages: BTreeMap<MessageId, Message>,
}

/// In-process [`TaskQueue`] with the same claim/lease semantics as the
/// Postgres queue.
#[derive(Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of every message on `queue` that is not dead-lettered.
    pub async fn payloads(&self, queue: QueueName) -> Vec<Value> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .values()
            .filter(|m| m.queue == queue && m.status != MessageStatus::Dead)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Last recorded error of every dead-lettered message on `queue`.
    pub async fn dead_letters(&self, queue: QueueName) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .values()
            .filter(|m| m.queue == queue && m.status == MessageStatus::Dead)
            .map(|m| m.last_error.clone().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        max_attempts: u32,
    ) -> Result<MessageId, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.insert(
            id,
            Message {
                queue,
                payload,
                status: MessageStatus::Pending,
                attempt: 0,
                max_attempts,
                run_at: Utc::now(),
                lease_expires_at: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        queue: QueueName,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.lock().await;

        let mut ready: Vec<(DateTime<Utc>, MessageId)> = inner
            .messages
            .iter()
            .filter(|(_, m)| m.queue == queue)
            .filter(|(_, m)| match m.status {
                MessageStatus::Pending => m.run_at <= now,
                MessageStatus::Running => m.lease_expires_at.is_some_and(|at| at < now),
                MessageStatus::Dead => false,
            })
            .map(|(id, m)| (m.run_at, *id))
            .collect();
        ready.sort();

        let mut claimed = Vec::new();
        for (_, id) in ready.into_iter().take(limit) {
            if let Some(message) = inner.messages.get_mut(&id) {
                message.status = MessageStatus::Running;
                message.attempt += 1;
                message.lease_expires_at = now.checked_add_signed(lease);
                claimed.push(Delivery {
                    id,
                    queue,
                    payload: message.payload.clone(),
                    attempt: message.attempt,
                    max_attempts: message.max_attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, id: MessageId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner
            .messages
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(id))
    }

    async fn retry(
        &self,
        id: MessageId,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = inner.messages.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        message.status = MessageStatus::Pending;
        message.run_at = run_at;
        message.lease_expires_at = None;
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn dead_letter(&self, id: MessageId, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = inner.messages.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        message.status = MessageStatus::Dead;
        message.lease_expires_at = None;
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<QueueDepth, QueueError> {
        let inner = self.inner.lock().await;
        let mut depth = QueueDepth::default();
        for message in inner.messages.values().filter(|m| m.queue == queue) {
            match message.status {
                MessageStatus::Pending => depth.pending += 1,
                MessageStatus::Running => depth.running += 1,
                MessageStatus::Dead => depth.dead += 1,
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn claimed_messages_are_not_claimed_twice() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(QueueName::Fetch, json!({"n": 1}), 3).await.unwrap();

        let first = queue.claim(QueueName::Fetch, 10, LEASE).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt, 1);
        assert!(queue.claim(QueueName::Fetch, 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(QueueName::Enrichment, json!({"job_id": "a"}), 2).await.unwrap();
        assert!(queue.claim(QueueName::Fetch, 10, LEASE).await.unwrap().is_empty());
        assert_eq!(queue.claim(QueueName::Enrichment, 10, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_waits_for_run_at_and_bumps_attempt() {
        let queue = MemoryTaskQueue::new();
        let id = queue.enqueue(QueueName::Fetch, json!({}), 3).await.unwrap();
        queue.claim(QueueName::Fetch, 1, LEASE).await.unwrap();

        queue
            .retry(id, Utc::now() + chrono::Duration::seconds(60), "boom")
            .await
            .unwrap();
        assert!(queue.claim(QueueName::Fetch, 1, LEASE).await.unwrap().is_empty());

        queue.retry(id, Utc::now(), "boom").await.unwrap();
        let again = queue.claim(QueueName::Fetch, 1, LEASE).await.unwrap();
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(QueueName::Fetch, json!({}), 3).await.unwrap();
        queue.claim(QueueName::Fetch, 1, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let redelivered = queue.claim(QueueName::Fetch, 1, LEASE).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempt, 2);
    }

    #[tokio::test]
    async fn depth_counts_by_status() {
        let queue = MemoryTaskQueue::new();
        for _ in 0..3 {
            queue.enqueue(QueueName::Fetch, json!({}), 3).await.unwrap();
        }
        let claimed = queue.claim(QueueName::Fetch, 2, LEASE).await.unwrap();
        queue.dead_letter(claimed[0].id, "gone").await.unwrap();
        queue.ack(claimed[1].id).await.unwrap();

        let depth = queue.depth(QueueName::Fetch).await.unwrap();
        assert_eq!(depth, QueueDepth { pending: 1, running: 0, dead: 1 });
        assert_eq!(queue.dead_letters(QueueName::Fetch).await, vec!["gone".to_string()]);
    }
}
