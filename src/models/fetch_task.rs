use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Source;
use crate::models::FETCH_TASKS;
use crate::store::{self, Document, Query, Store, StoreError, to_document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The status after `event`, or an error if the lifecycle does not allow it.
    ///
    /// ```text
    /// pending ──dispatched──► processing ──succeeded──► completed
    ///                           │    ▲
    ///      failed, will retry   │    │ dispatched
    ///                           ▼    │
    ///                          retrying
    /// processing ──failed, exhausted──► failed ──requeued──► pending
    /// ```
    ///
    /// `Requeued` is only issued by the operator retry path.
    pub fn next(self, event: TaskEvent) -> Result<TaskStatus, InvalidTransition> {
        use TaskEvent::*;
        use TaskStatus::*;

        match (self, event) {
            (Pending | Retrying | Processing, Dispatched) => Ok(Processing),
            (Processing, Succeeded) => Ok(Completed),
            (Processing, FailedWillRetry) => Ok(Retrying),
            (Processing, FailedExhausted) => Ok(Failed),
            (Failed, Requeued) => Ok(Pending),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Dispatched,
    Succeeded,
    FailedWillRetry,
    FailedExhausted,
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid task transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub event: TaskEvent,
}

/// One unit of fetch work: a single provider + company under an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTask {
    pub task_id: String,
    pub provider: String,
    pub company: String,
    #[serde(default)]
    pub params: Document,
    pub status: TaskStatus,
    pub execution_id: String,
    pub batch_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub jobs_fetched: Option<u64>,
    #[serde(default)]
    pub jobs_written: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filters for listing tasks; `None` matches everything.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub execution_id: Option<String>,
    pub provider: Option<String>,
    pub status: Option<TaskStatus>,
}

impl FetchTask {
    pub fn task_id_for(execution_id: &str, provider: &str, company: &str) -> String {
        format!("{execution_id}:{provider}:{company}")
    }

    pub fn new(source: &Source, execution_id: &str, batch_id: &str, max_retries: u32) -> Self {
        Self {
            task_id: Self::task_id_for(execution_id, &source.provider, &source.company),
            provider: source.provider.clone(),
            company: source.company.clone(),
            params: source.params.clone(),
            status: TaskStatus::Pending,
            execution_id: execution_id.to_string(),
            batch_id: batch_id.to_string(),
            retry_count: 0,
            max_retries,
            error: None,
            jobs_fetched: None,
            jobs_written: None,
            duration_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn source(&self) -> Source {
        Source {
            provider: self.provider.clone(),
            company: self.company.clone(),
            params: self.params.clone(),
        }
    }

    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Apply one lifecycle event, keeping `retry_count <= max_retries`.
    pub fn apply(&mut self, event: TaskEvent) -> Result<(), InvalidTransition> {
        let invalid = InvalidTransition {
            from: self.status,
            event,
        };
        if event == TaskEvent::FailedWillRetry && self.retry_count >= self.max_retries {
            return Err(invalid);
        }
        let next = self.status.next(event)?;
        let now = Utc::now();

        match event {
            TaskEvent::Dispatched => {
                self.started_at = Some(now);
            }
            TaskEvent::Succeeded => {
                self.error = None;
                self.completed_at = Some(now);
            }
            TaskEvent::FailedWillRetry => {
                self.retry_count += 1;
            }
            TaskEvent::FailedExhausted => {
                self.completed_at = Some(now);
            }
            TaskEvent::Requeued => {
                self.retry_count = 0;
                self.error = None;
                self.started_at = None;
                self.completed_at = None;
                self.jobs_fetched = None;
                self.jobs_written = None;
                self.duration_ms = None;
            }
        }
        if let (Some(started), TaskEvent::Succeeded | TaskEvent::FailedExhausted) =
            (self.started_at, event)
        {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
        self.status = next;
        Ok(())
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        to_document(self)
    }

    pub async fn get(store: &dyn Store, task_id: &str) -> Result<Option<FetchTask>, StoreError> {
        store::get_as(store, FETCH_TASKS, task_id).await
    }

    pub async fn save(&self, store: &dyn Store) -> Result<(), StoreError> {
        store.upsert(FETCH_TASKS, &self.task_id, self.to_document()?).await
    }

    pub async fn list(
        store: &dyn Store,
        filter: &TaskFilter,
    ) -> Result<Vec<FetchTask>, StoreError> {
        let mut query = Query::new(FETCH_TASKS);
        if let Some(execution_id) = &filter.execution_id {
            query = query.eq("execution_id", execution_id.as_str());
        }
        if let Some(provider) = &filter.provider {
            query = query.eq("provider", provider.as_str());
        }
        if let Some(status) = filter.status {
            query = query.eq("status", status.as_str());
        }
        store::query_as(store, &query).await
    }
}
