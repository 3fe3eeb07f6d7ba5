//! Task creation: one execution record plus one fetch task per source,
//! written in store-sized chunks and then enqueued.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::batch::{BatchWriteOptions, write_documents};
use crate::config::Source;
use crate::models::FETCH_TASKS;
use crate::models::execution::{BatchExecution, ExecutionStatus, Trigger};
use crate::models::fetch_task::FetchTask;
use crate::queue::{FetchPayload, QueueClient, QueueError, QueueName};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TaskCreationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Failed to write {failed} of {total} tasks: {error}")]
    PartialWrite {
        failed: usize,
        total: usize,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedBatch {
    pub execution_id: Option<String>,
    pub batch_id: Option<String>,
    pub tasks_created: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Created(CreatedBatch),
    /// Another execution is still running.
    Skipped { running_execution_id: String },
}

pub struct TaskCreator {
    store: Arc<dyn Store>,
    queues: QueueClient,
    write_batch_size: usize,
    stale_after: chrono::Duration,
}

impl TaskCreator {
    pub fn new(
        store: Arc<dyn Store>,
        queues: QueueClient,
        write_batch_size: usize,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            store,
            queues,
            write_batch_size,
            stale_after,
        }
    }

    /// Guarded entry point. Skips when a non-stale execution is still running,
    /// unless `force` is set. The check is read-then-decide, not a lock.
    pub async fn run_scheduled(
        &self,
        sources: &[Source],
        force: bool,
        trigger: Trigger,
    ) -> Result<ScheduleOutcome, TaskCreationError> {
        if !force && let Some(running) = self.blocking_execution().await? {
            tracing::info!(
                execution_id = %running.execution_id,
                "Execution still running, skipping task creation"
            );
            return Ok(ScheduleOutcome::Skipped {
                running_execution_id: running.execution_id,
            });
        }

        let created = self.create_all_tasks(sources, trigger).await?;
        Ok(ScheduleOutcome::Created(created))
    }

    /// The newest running execution that is recent enough to block a new run.
    /// Stale ones are closed from their counters on the way.
    async fn blocking_execution(&self) -> Result<Option<BatchExecution>, StoreError> {
        let cutoff = Utc::now() - self.stale_after;
        let mut blocking = None;
        for execution in BatchExecution::running(&*self.store).await? {
            if execution.created_at >= cutoff {
                if blocking.is_none() {
                    blocking = Some(execution);
                }
                continue;
            }

            let status = if execution.completed_tasks > 0 {
                ExecutionStatus::Partial
            } else {
                ExecutionStatus::Failed
            };
            tracing::warn!(
                execution_id = %execution.execution_id,
                completed = execution.completed_tasks,
                failed = execution.failed_tasks,
                total = execution.total_tasks,
                "Closing stale execution as {}",
                status.as_str()
            );
            BatchExecution::set_status(&*self.store, &execution.execution_id, status).await?;
        }
        Ok(blocking)
    }

    /// Create a fresh execution and one task per source. Duplicate
    /// (provider, company) pairs are dropped. If writing or enqueueing fails,
    /// the execution is marked failed and the error is returned.
    pub async fn create_all_tasks(
        &self,
        sources: &[Source],
        trigger: Trigger,
    ) -> Result<CreatedBatch, TaskCreationError> {
        let mut seen = HashSet::new();
        let sources: Vec<&Source> = sources
            .iter()
            .filter(|s| {
                let fresh = seen.insert((s.provider.as_str(), s.company.as_str()));
                if !fresh {
                    tracing::warn!(
                        provider = %s.provider,
                        company = %s.company,
                        "Duplicate source ignored"
                    );
                }
                fresh
            })
            .collect();

        if sources.is_empty() {
            tracing::info!("No sources configured, nothing to create");
            return Ok(CreatedBatch::default());
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let batch_id = format!("batch_{}", Utc::now().format("%Y%m%dT%H%M%S"));
        BatchExecution::new(&execution_id, &batch_id, sources.len() as i64, trigger)
            .create(&*self.store)
            .await?;

        match self.write_and_enqueue(&sources, &execution_id, &batch_id).await {
            Ok(tasks_created) => {
                tracing::info!(
                    execution_id = %execution_id,
                    batch_id = %batch_id,
                    "Created {tasks_created} fetch tasks"
                );
                Ok(CreatedBatch {
                    execution_id: Some(execution_id),
                    batch_id: Some(batch_id),
                    tasks_created,
                })
            }
            Err(e) => {
                tracing::error!(execution_id = %execution_id, "Task creation failed: {e}");
                if let Err(mark) =
                    BatchExecution::set_status(&*self.store, &execution_id, ExecutionStatus::Failed)
                        .await
                {
                    tracing::error!(
                        execution_id = %execution_id,
                        "Failed to mark execution failed: {mark}"
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_and_enqueue(
        &self,
        sources: &[&Source],
        execution_id: &str,
        batch_id: &str,
    ) -> Result<usize, TaskCreationError> {
        let max_retries = self
            .queues
            .settings(QueueName::Fetch)
            .retry
            .max_attempts
            .saturating_sub(1);
        let tasks: Vec<FetchTask> = sources
            .iter()
            .map(|source| FetchTask::new(source, execution_id, batch_id, max_retries))
            .collect();

        let docs = tasks
            .iter()
            .map(|task| Ok((task.task_id.clone(), task.to_document()?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let total = docs.len();
        let written = write_documents(
            &*self.store,
            FETCH_TASKS,
            docs,
            BatchWriteOptions::with_batch_size(self.write_batch_size),
        )
        .await;
        if written.failed > 0 {
            return Err(TaskCreationError::PartialWrite {
                failed: written.failed,
                total,
                error: written.errors.join("; "),
            });
        }

        for task in &tasks {
            self.queues
                .enqueue_fetch(&FetchPayload {
                    task_id: task.task_id.clone(),
                    execution_id: task.execution_id.clone(),
                    provider: task.provider.clone(),
                    company: task.company.clone(),
                })
                .await?;
        }
        Ok(tasks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fetch_task::{TaskFilter, TaskStatus};
    use crate::queue::{MemoryTaskQueue, QueueSettings};
    use crate::store::{Document, MemoryStore};

    fn sources(n: usize) -> Vec<Source> {
        (0..n)
            .map(|i| Source {
                provider: "greenhouse".into(),
                company: format!("company-{i}"),
                params: Document::new(),
            })
            .collect()
    }

    fn creator(store: Arc<MemoryStore>, queue: Arc<MemoryTaskQueue>) -> TaskCreator {
        let queues = QueueClient::new(queue, QueueSettings::fetch(), QueueSettings::enrichment());
        TaskCreator::new(store, queues, 400, chrono::Duration::hours(6))
    }

    #[tokio::test]
    async fn creates_execution_tasks_and_messages() {
        let store = Arc::new(MemoryStore::with_max_batch_size(3));
        let queue = Arc::new(MemoryTaskQueue::new());
        let creator = creator(store.clone(), queue.clone());

        let created = creator.create_all_tasks(&sources(7), Trigger::Api).await.unwrap();
        assert_eq!(created.tasks_created, 7);
        let execution_id = created.execution_id.unwrap();

        let execution = BatchExecution::get(&*store, &execution_id).await.unwrap().unwrap();
        assert_eq!(execution.total_tasks, 7);
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.trigger, Trigger::Api);

        let tasks = FetchTask::list(
            &*store,
            &TaskFilter {
                execution_id: Some(execution_id.clone()),
                status: Some(TaskStatus::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(tasks.len(), 7);
        assert!(tasks.iter().all(|t| t.max_retries == 2 && t.retry_count == 0));

        let payloads = queue.payloads(QueueName::Fetch).await;
        assert_eq!(payloads.len(), 7);
        assert!(payloads.iter().all(|p| p["execution_id"] == execution_id.as_str()));
    }

    #[tokio::test]
    async fn duplicate_and_empty_sources() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let creator = creator(store.clone(), queue.clone());

        let empty = creator.create_all_tasks(&[], Trigger::Scheduled).await.unwrap();
        assert_eq!(empty, CreatedBatch::default());
        assert!(BatchExecution::latest(&*store).await.unwrap().is_none());

        let mut doubled = sources(2);
        doubled.push(doubled[0].clone());
        let created = creator.create_all_tasks(&doubled, Trigger::Scheduled).await.unwrap();
        assert_eq!(created.tasks_created, 2);
        assert_eq!(store.count(FETCH_TASKS).await, 2);
    }

    #[tokio::test]
    async fn running_execution_blocks_scheduled_run() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let creator = creator(store.clone(), queue.clone());
        BatchExecution::new("busy", "batch-0", 3, Trigger::Scheduled)
            .create(&*store)
            .await
            .unwrap();

        let outcome = creator
            .run_scheduled(&sources(5), false, Trigger::Scheduled)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ScheduleOutcome::Skipped {
                running_execution_id: "busy".into()
            }
        );
        assert_eq!(store.count(FETCH_TASKS).await, 0);
        assert!(queue.payloads(QueueName::Fetch).await.is_empty());

        let forced = creator
            .run_scheduled(&sources(5), true, Trigger::Api)
            .await
            .unwrap();
        assert!(matches!(forced, ScheduleOutcome::Created(ref b) if b.tasks_created == 5));
    }

    #[tokio::test]
    async fn stale_execution_is_closed_and_no_longer_blocks() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let creator = creator(store.clone(), queue.clone());

        let mut stale = BatchExecution::new("stale", "batch-0", 4, Trigger::Scheduled);
        stale.created_at = Utc::now() - chrono::Duration::hours(7);
        stale.completed_tasks = 2;
        stale.create(&*store).await.unwrap();

        let outcome = creator
            .run_scheduled(&sources(1), false, Trigger::Scheduled)
            .await
            .unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Created(_)));

        let stale = BatchExecution::get(&*store, "stale").await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Partial);
        assert!(stale.completed_at.is_some());
    }

    /// Store whose batch commits always fail.
    struct BrokenCommits(MemoryStore);

    #[async_trait::async_trait]
    impl Store for BrokenCommits {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            self.0.get(collection, id).await
        }

        async fn upsert(
            &self,
            collection: &str,
            id: &str,
            data: Document,
        ) -> Result<(), StoreError> {
            self.0.upsert(collection, id, data).await
        }

        async fn increment(
            &self,
            collection: &str,
            id: &str,
            deltas: &[(&str, i64)],
        ) -> Result<(), StoreError> {
            self.0.increment(collection, id, deltas).await
        }

        async fn append_bounded(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            value: serde_json::Value,
            max_len: usize,
        ) -> Result<bool, StoreError> {
            self.0.append_bounded(collection, id, field, value, max_len).await
        }

        async fn commit(&self, batch: crate::store::WriteBatch) -> Result<(), StoreError> {
            Err(StoreError::BatchTooLarge {
                size: batch.len(),
                limit: 0,
            })
        }

        async fn query(&self, query: &crate::store::Query) -> Result<Vec<Document>, StoreError> {
            self.0.query(query).await
        }

        fn max_batch_size(&self) -> usize {
            self.0.max_batch_size()
        }
    }

    #[tokio::test]
    async fn write_failure_marks_execution_failed() {
        let store = Arc::new(BrokenCommits(MemoryStore::new()));
        let queue = Arc::new(MemoryTaskQueue::new());
        let queues = QueueClient::new(
            queue.clone(),
            QueueSettings::fetch(),
            QueueSettings::enrichment(),
        );
        let creator = TaskCreator::new(store.clone(), queues, 400, chrono::Duration::hours(6));

        let err = creator
            .create_all_tasks(&sources(2), Trigger::Scheduled)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskCreationError::PartialWrite { failed: 2, total: 2, .. }));

        let execution = BatchExecution::latest(&*store).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(queue.payloads(QueueName::Fetch).await.is_empty());
    }
}
