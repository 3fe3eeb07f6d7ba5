use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::BATCH_EXECUTIONS;
use crate::store::{self, Direction, Document, Query, Store, StoreError, to_document};

/// At most this many task errors are kept on an execution.
pub const MAX_EXECUTION_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Partial => "partial",
        }
    }

    /// Final status derived from task counters.
    pub fn from_counts(completed: i64, failed: i64) -> Self {
        match (completed, failed) {
            (_, 0) => ExecutionStatus::Completed,
            (0, _) => ExecutionStatus::Failed,
            _ => ExecutionStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Api,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub task_id: String,
    pub provider: String,
    pub company: String,
    pub error: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// Aggregate of one scheduling run. Counters are only ever changed through
/// [`Store::increment`], so concurrent workers never overwrite each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecution {
    pub execution_id: String,
    pub batch_id: String,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    pub total_tasks: i64,
    #[serde(default)]
    pub completed_tasks: i64,
    #[serde(default)]
    pub failed_tasks: i64,
    #[serde(default)]
    pub total_jobs_fetched: i64,
    #[serde(default)]
    pub total_jobs_written: i64,
    #[serde(default)]
    pub enrichment_completed: i64,
    #[serde(default)]
    pub enrichment_failed: i64,
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchExecution {
    pub fn new(execution_id: &str, batch_id: &str, total_tasks: i64, trigger: Trigger) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            batch_id: batch_id.to_string(),
            status: ExecutionStatus::Running,
            trigger,
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            total_jobs_fetched: 0,
            total_jobs_written: 0,
            enrichment_completed: 0,
            enrichment_failed: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn finished_tasks(&self) -> i64 {
        self.completed_tasks + self.failed_tasks
    }

    pub fn is_done(&self) -> bool {
        self.finished_tasks() >= self.total_tasks
    }

    /// Share of finished tasks that completed, in percent.
    pub fn success_rate(&self) -> f64 {
        match self.finished_tasks() {
            0 => 0.0,
            finished => self.completed_tasks as f64 * 100.0 / finished as f64,
        }
    }

    pub async fn create(&self, store: &dyn Store) -> Result<(), StoreError> {
        store
            .upsert(BATCH_EXECUTIONS, &self.execution_id, to_document(self)?)
            .await
    }

    pub async fn get(
        store: &dyn Store,
        execution_id: &str,
    ) -> Result<Option<BatchExecution>, StoreError> {
        store::get_as(store, BATCH_EXECUTIONS, execution_id).await
    }

    pub async fn recent(
        store: &dyn Store,
        limit: usize,
    ) -> Result<Vec<BatchExecution>, StoreError> {
        let query = Query::new(BATCH_EXECUTIONS)
            .order_by("created_at", Direction::Desc)
            .limit(limit);
        store::query_as(store, &query).await
    }

    pub async fn latest(store: &dyn Store) -> Result<Option<BatchExecution>, StoreError> {
        Ok(Self::recent(store, 1).await?.into_iter().next())
    }

    pub async fn running(store: &dyn Store) -> Result<Vec<BatchExecution>, StoreError> {
        let query = Query::new(BATCH_EXECUTIONS)
            .eq("status", ExecutionStatus::Running.as_str())
            .order_by("created_at", Direction::Desc);
        store::query_as(store, &query).await
    }

    pub async fn set_status(
        store: &dyn Store,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), StoreError> {
        let completed_at = match status {
            ExecutionStatus::Running => serde_json::Value::Null,
            _ => json!(Utc::now().timestamp_millis()),
        };
        let mut update = Document::new();
        update.insert("status".into(), json!(status.as_str()));
        update.insert("completed_at".into(), completed_at);
        store.upsert(BATCH_EXECUTIONS, execution_id, update).await
    }
}

/// Management API rendering of a [`BatchExecution`]. Stored documents keep
/// their snake_case field names; responses are camelCase throughout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub execution_id: String,
    pub batch_id: String,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub total_jobs_fetched: i64,
    pub total_jobs_written: i64,
    pub enrichment_completed: i64,
    pub enrichment_failed: i64,
    pub errors: Vec<ExecutionErrorView>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorView {
    pub task_id: String,
    pub provider: String,
    pub company: String,
    pub error: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

impl From<ExecutionError> for ExecutionErrorView {
    fn from(e: ExecutionError) -> Self {
        Self {
            task_id: e.task_id,
            provider: e.provider,
            company: e.company,
            error: e.error,
            at: e.at,
        }
    }
}

impl From<BatchExecution> for ExecutionView {
    fn from(e: BatchExecution) -> Self {
        Self {
            execution_id: e.execution_id,
            batch_id: e.batch_id,
            status: e.status,
            trigger: e.trigger,
            total_tasks: e.total_tasks,
            completed_tasks: e.completed_tasks,
            failed_tasks: e.failed_tasks,
            total_jobs_fetched: e.total_jobs_fetched,
            total_jobs_written: e.total_jobs_written,
            enrichment_completed: e.enrichment_completed,
            enrichment_failed: e.enrichment_failed,
            errors: e.errors.into_iter().map(Into::into).collect(),
            created_at: e.created_at,
            completed_at: e.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn final_status_follows_counters() {
        assert_eq!(ExecutionStatus::from_counts(10, 0), ExecutionStatus::Completed);
        assert_eq!(ExecutionStatus::from_counts(0, 0), ExecutionStatus::Completed);
        assert_eq!(ExecutionStatus::from_counts(0, 4), ExecutionStatus::Failed);
        assert_eq!(ExecutionStatus::from_counts(6, 4), ExecutionStatus::Partial);
    }

    #[test]
    fn success_rate_ignores_unfinished_tasks() {
        let mut execution = BatchExecution::new("e", "b", 10, Trigger::Api);
        assert_eq!(execution.success_rate(), 0.0);
        execution.completed_tasks = 3;
        execution.failed_tasks = 1;
        assert_eq!(execution.success_rate(), 75.0);
        assert!(!execution.is_done());
    }

    #[test]
    fn view_is_camel_case_and_document_is_not() {
        let mut execution = BatchExecution::new("e", "b", 2, Trigger::Api);
        execution.errors.push(ExecutionError {
            task_id: "t".into(),
            provider: "lever".into(),
            company: "acme".into(),
            error: "boom".into(),
            at: Utc::now(),
        });
        let document = to_document(&execution).unwrap();
        assert!(document.contains_key("total_tasks"));
        assert!(document.contains_key("created_at"));

        let view = serde_json::to_value(ExecutionView::from(execution)).unwrap();
        assert_eq!(view["totalTasks"], 2);
        assert_eq!(view["executionId"], "e");
        assert_eq!(view["errors"][0]["taskId"], "t");
        assert!(view["completedAt"].is_null());
        assert!(view.get("total_tasks").is_none());
    }

    #[tokio::test]
    async fn latest_and_running_queries() {
        let store = MemoryStore::new();
        let mut older = BatchExecution::new("old", "b1", 1, Trigger::Scheduled);
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        older.status = ExecutionStatus::Completed;
        older.create(&store).await.unwrap();
        BatchExecution::new("new", "b2", 1, Trigger::Scheduled)
            .create(&store)
            .await
            .unwrap();

        let latest = BatchExecution::latest(&store).await.unwrap().unwrap();
        assert_eq!(latest.execution_id, "new");
        let running = BatchExecution::running(&store).await.unwrap();
        assert_eq!(running.len(), 1);

        BatchExecution::set_status(&store, "new", ExecutionStatus::Partial)
            .await
            .unwrap();
        let updated = BatchExecution::get(&store, "new").await.unwrap().unwrap();
        assert_eq!(updated.status, ExecutionStatus::Partial);
        assert!(updated.completed_at.is_some());
        assert!(BatchExecution::running(&store).await.unwrap().is_empty());
    }
}
