use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;

use super::{Delivery, MessageId, QueueDepth, QueueError, QueueName, TaskQueue};

/// [`TaskQueue`] over the `queue_messages` table.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    payload: Json<Value>,
    attempt: i32,
    max_attempts: i32,
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        max_attempts: u32,
    ) -> Result<MessageId, QueueError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO queue_messages (queue, payload, max_attempts)
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(queue.as_str())
        .bind(Json(&payload))
        .bind(max_attempts as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Claims with SELECT FOR UPDATE SKIP LOCKED so any number of dispatchers
    /// can poll the same queue without contention. Running messages whose
    /// lease has lapsed are picked up again.
    async fn claim(
        &self,
        queue: QueueName,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let rows = sqlx::query_as::<_, ClaimedRow>(
            "WITH next AS (
                 SELECT id FROM queue_messages
                 WHERE queue = $1
                   AND ((status = 'pending' AND run_at <= NOW())
                     OR (status = 'running' AND lease_expires_at < NOW()))
                 ORDER BY run_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE queue_messages m
             SET status = 'running',
                 attempt = m.attempt + 1,
                 lease_expires_at = NOW() + make_interval(secs => $3),
                 updated_at = NOW()
             FROM next
             WHERE m.id = next.id
             RETURNING m.id, m.payload, m.attempt, m.max_attempts",
        )
        .bind(queue.as_str())
        .bind(limit as i64)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Delivery {
                id: row.id,
                queue,
                payload: row.payload.0,
                attempt: row.attempt.max(0) as u32,
                max_attempts: row.max_attempts.max(0) as u32,
            })
            .collect())
    }

    async fn ack(&self, id: MessageId) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn retry(
        &self,
        id: MessageId,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE queue_messages
             SET status = 'pending', run_at = $2, lease_expires_at = NULL, last_error = $3,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: MessageId, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE queue_messages
             SET status = 'dead', lease_expires_at = NULL, last_error = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<QueueDepth, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM queue_messages WHERE queue = $1 GROUP BY status",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut depth = QueueDepth::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => depth.pending = count,
                "running" => depth.running = count,
                "dead" => depth.dead = count,
                _ => {}
            }
        }
        Ok(depth)
    }
}
