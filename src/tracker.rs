//! Execution tracking: atomic counters on the [`BatchExecution`] aggregate,
//! per-task metrics rows, and the operator retry path.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{BATCH_EXECUTIONS, FETCH_TASKS};
use crate::models::execution::{
    BatchExecution, ExecutionError, ExecutionStatus, ExecutionView, MAX_EXECUTION_ERRORS,
};
use crate::models::fetch_task::{FetchTask, TaskEvent, TaskFilter, TaskStatus};
use crate::models::job::{EnrichmentStatus, JobRecord};
use crate::models::metrics::{FetchMetrics, FetchMetricsView};
use crate::queue::{EnrichmentPayload, FetchPayload, QueueClient};
use crate::store::{Store, StoreError, WriteBatch, to_document};

const MAX_RECENT: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryFilter {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub include_enrichment: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub execution_id: Option<String>,
    pub tasks_retried: usize,
    pub enrichment_retried: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub tasks: u64,
    pub failed: u64,
    pub jobs_fetched: u64,
    pub jobs_written: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub execution: ExecutionView,
    pub success_rate: f64,
    pub task_counts: BTreeMap<&'static str, usize>,
    pub providers: BTreeMap<String, ProviderSummary>,
    pub fetch_metrics: Vec<FetchMetricsView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    #[serde(flatten)]
    pub execution: ExecutionView,
    pub success_rate: f64,
}

pub struct ExecutionTracker {
    store: Arc<dyn Store>,
    queues: QueueClient,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn Store>, queues: QueueClient) -> Self {
        Self { store, queues }
    }

    /// Persist a completed task and count it against its execution in one
    /// atomic commit, so the task is never marked done without being counted.
    pub async fn record_task_completed(&self, task: &FetchTask) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.upsert(FETCH_TASKS, task.task_id.clone(), task.to_document()?);
        batch.increment(
            BATCH_EXECUTIONS,
            task.execution_id.clone(),
            &[
                ("completed_tasks", 1),
                ("total_jobs_fetched", task.jobs_fetched.unwrap_or(0) as i64),
                ("total_jobs_written", task.jobs_written.unwrap_or(0) as i64),
            ],
        );
        self.store.commit(batch).await?;
        self.finalize_if_done(&task.execution_id).await
    }

    pub async fn record_task_failed(
        &self,
        task: &FetchTask,
        error: &str,
    ) -> Result<(), StoreError> {
        self.store
            .increment(BATCH_EXECUTIONS, &task.execution_id, &[("failed_tasks", 1)])
            .await?;

        let entry = ExecutionError {
            task_id: task.task_id.clone(),
            provider: task.provider.clone(),
            company: task.company.clone(),
            error: error.to_string(),
            at: Utc::now(),
        };
        let appended = self
            .store
            .append_bounded(
                BATCH_EXECUTIONS,
                &task.execution_id,
                "errors",
                serde_json::Value::Object(to_document(&entry)?),
                MAX_EXECUTION_ERRORS,
            )
            .await?;
        if !appended {
            tracing::debug!(
                execution_id = %task.execution_id,
                "Error list full, dropping error for {}",
                task.task_id
            );
        }
        self.finalize_if_done(&task.execution_id).await
    }

    pub async fn record_enrichment(
        &self,
        execution_id: &str,
        success: bool,
    ) -> Result<(), StoreError> {
        let field = if success {
            "enrichment_completed"
        } else {
            "enrichment_failed"
        };
        self.store
            .increment(BATCH_EXECUTIONS, execution_id, &[(field, 1)])
            .await
    }

    pub async fn record_fetch_metrics(&self, metrics: &FetchMetrics) -> Result<(), StoreError> {
        metrics.record(&*self.store).await
    }

    /// Close the execution once every task has reached a terminal state.
    /// Concurrent finishers all compute the same status, so the race is benign.
    pub async fn finalize_if_done(&self, execution_id: &str) -> Result<(), StoreError> {
        let Some(execution) = BatchExecution::get(&*self.store, execution_id).await? else {
            return Ok(());
        };
        if execution.status != ExecutionStatus::Running || !execution.is_done() {
            return Ok(());
        }

        let status =
            ExecutionStatus::from_counts(execution.completed_tasks, execution.failed_tasks);
        tracing::info!(
            execution_id,
            completed = execution.completed_tasks,
            failed = execution.failed_tasks,
            jobs_written = execution.total_jobs_written,
            "Execution finished as {}",
            status.as_str()
        );
        BatchExecution::set_status(&*self.store, execution_id, status).await
    }

    pub async fn get_execution_metrics(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionMetrics, AppError> {
        let execution = BatchExecution::get(&*self.store, execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {execution_id} not found")))?;

        let tasks = FetchTask::list(
            &*self.store,
            &TaskFilter {
                execution_id: Some(execution_id.to_string()),
                ..Default::default()
            },
        )
        .await?;
        let fetch_metrics = FetchMetrics::for_execution(&*self.store, execution_id).await?;

        let mut providers: BTreeMap<String, ProviderSummary> = BTreeMap::new();
        for task in &tasks {
            let summary = providers.entry(task.provider.clone()).or_default();
            summary.tasks += 1;
            if task.status == TaskStatus::Failed {
                summary.failed += 1;
            }
            summary.jobs_fetched += task.jobs_fetched.unwrap_or(0);
            summary.jobs_written += task.jobs_written.unwrap_or(0);
        }

        Ok(ExecutionMetrics {
            success_rate: execution.success_rate(),
            task_counts: count_by_status(&tasks),
            providers,
            fetch_metrics: fetch_metrics.into_iter().map(Into::into).collect(),
            execution: execution.into(),
        })
    }

    pub async fn get_recent_metrics(
        &self,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>, StoreError> {
        let executions = BatchExecution::recent(&*self.store, limit.clamp(1, MAX_RECENT)).await?;
        Ok(executions
            .into_iter()
            .map(|execution| ExecutionSummary {
                success_rate: execution.success_rate(),
                execution: execution.into(),
            })
            .collect())
    }

    /// Reset every matching failed task to pending and enqueue it once more.
    /// Without an execution id the latest execution is used.
    pub async fn retry_failed_tasks(&self, filter: &RetryFilter) -> Result<RetryReport, AppError> {
        let execution_id = match &filter.execution_id {
            Some(id) => id.clone(),
            None => match BatchExecution::latest(&*self.store).await? {
                Some(execution) => execution.execution_id,
                None => return Ok(RetryReport::default()),
            },
        };

        let failed = FetchTask::list(
            &*self.store,
            &TaskFilter {
                execution_id: Some(execution_id.clone()),
                provider: filter.provider.clone(),
                status: Some(TaskStatus::Failed),
            },
        )
        .await?;

        // Counters are settled for whatever was requeued even when a later
        // enqueue fails, so the error is held until then.
        let mut tasks_retried = 0;
        let mut requeue_error = None;
        for task in failed {
            match self.requeue_task(task).await {
                Ok(true) => tasks_retried += 1,
                Ok(false) => {}
                Err(e) => {
                    requeue_error = Some(e);
                    break;
                }
            }
        }

        if tasks_retried > 0 {
            self.store
                .increment(
                    BATCH_EXECUTIONS,
                    &execution_id,
                    &[("failed_tasks", -(tasks_retried as i64))],
                )
                .await?;
            BatchExecution::set_status(&*self.store, &execution_id, ExecutionStatus::Running)
                .await?;
        }
        if let Some(e) = requeue_error {
            return Err(e);
        }

        let mut enrichment_retried = 0;
        if filter.include_enrichment {
            for job in JobRecord::failed_enrichments(&*self.store, &execution_id).await? {
                JobRecord::set_enrichment_status(
                    &*self.store,
                    &job.job_id,
                    EnrichmentStatus::Pending,
                    None,
                )
                .await?;
                let enqueued = self
                    .queues
                    .enqueue_enrichment(&EnrichmentPayload {
                        job_id: job.job_id.clone(),
                        execution_id: Some(execution_id.clone()),
                    })
                    .await;
                if let Err(e) = enqueued {
                    JobRecord::set_enrichment_status(
                        &*self.store,
                        &job.job_id,
                        EnrichmentStatus::Failed,
                        job.enrichment_error.as_deref(),
                    )
                    .await?;
                    return Err(e.into());
                }
                enrichment_retried += 1;
            }
        }

        tracing::info!(
            execution_id = %execution_id,
            "Requeued {tasks_retried} failed tasks and {enrichment_retried} failed enrichments"
        );

        Ok(RetryReport {
            execution_id: Some(execution_id),
            tasks_retried,
            enrichment_retried,
        })
    }
    /// Move one failed task back to pending and enqueue it. If the enqueue
    /// fails the task is restored as failed so a later retry still sees it.
    async fn requeue_task(&self, task: FetchTask) -> Result<bool, AppError> {
        let original = task.clone();
        let mut task = task;
        if let Err(e) = task.apply(TaskEvent::Requeued) {
            tracing::warn!(task_id = %task.task_id, "Skipping retry: {e}");
            return Ok(false);
        }
        task.save(&*self.store).await?;

        let enqueued = self
            .queues
            .enqueue_fetch(&FetchPayload {
                task_id: task.task_id.clone(),
                execution_id: task.execution_id.clone(),
                provider: task.provider.clone(),
                company: task.company.clone(),
            })
            .await;
        if let Err(e) = enqueued {
            tracing::error!(task_id = %task.task_id, "Failed to requeue task: {e}");
            original.save(&*self.store).await?;
            return Err(e.into());
        }
        Ok(true)
    }
}

pub fn count_by_status(tasks: &[FetchTask]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for status in [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Retrying,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        counts.insert(status.as_str(), 0);
    }
    for task in tasks {
        *counts.entry(task.status.as_str()).or_insert(0) += 1;
    }
    counts
}
