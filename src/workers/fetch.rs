use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::batch::{BatchWriteOptions, write_documents};
use crate::collectors::AdapterRegistry;
use crate::models::JOBS;
use crate::models::fetch_task::{FetchTask, TaskEvent, TaskStatus};
use crate::models::metrics::FetchMetrics;
use crate::queue::{
    Delivery, EnrichmentPayload, FetchPayload, Outcome, QueueClient, TaskError, TaskHandler,
};
use crate::store::Store;
use crate::tracker::ExecutionTracker;

/// Handles one fetch task: pull the company's board through its provider
/// adapter, upsert the postings, and queue enrichment for untagged jobs.
pub struct FetchWorker {
    store: Arc<dyn Store>,
    queues: QueueClient,
    adapters: AdapterRegistry,
    tracker: Arc<ExecutionTracker>,
    write_batch_size: usize,
}

impl FetchWorker {
    pub fn new(
        store: Arc<dyn Store>,
        queues: QueueClient,
        adapters: AdapterRegistry,
        tracker: Arc<ExecutionTracker>,
        write_batch_size: usize,
    ) -> Self {
        Self {
            store,
            queues,
            adapters,
            tracker,
            write_batch_size,
        }
    }

    async fn load_task(&self, task_id: &str) -> Result<FetchTask, TaskError> {
        FetchTask::get(&*self.store, task_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("Task {task_id} not found")))
    }

    /// Load the task behind a failed delivery, unless it is gone or already settled.
    async fn task_for_failure(&self, delivery: &Delivery) -> Option<FetchTask> {
        let payload: FetchPayload = delivery.payload_as().ok()?;
        match FetchTask::get(&*self.store, &payload.task_id).await {
            Ok(Some(task)) if !task.status.is_terminal() => Some(task),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(task_id = %payload.task_id, "Failed to load task: {e}");
                None
            }
        }
    }

    /// Record a failed attempt from the dispatcher's side, which also covers
    /// timeouts and failures before the adapter ran. Counts the handler already
    /// recorded for this attempt are kept.
    async fn record_failure_metrics(&self, task: &FetchTask, delivery: &Delivery, error: &str) {
        let duration_ms = task
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let fresh = metrics_for(task, delivery, duration_ms);
        let base = match FetchMetrics::get(&*self.store, &fresh.id()).await {
            Ok(Some(existing)) if existing.attempt == delivery.attempt => existing,
            Ok(_) => fresh,
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, "Failed to load fetch metrics: {e}");
                fresh
            }
        };
        self.record_metrics(FetchMetrics {
            success: false,
            error: Some(error.to_string()),
            recorded_at: Utc::now(),
            ..base
        })
        .await;
    }

    async fn record_metrics(&self, metrics: FetchMetrics) {
        if let Err(e) = self.tracker.record_fetch_metrics(&metrics).await {
            tracing::warn!(task_id = %metrics.task_id, "Failed to record fetch metrics: {e}");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn metrics_for(task: &FetchTask, delivery: &Delivery, duration_ms: u64) -> FetchMetrics {
    FetchMetrics {
        execution_id: task.execution_id.clone(),
        task_id: task.task_id.clone(),
        provider: task.provider.clone(),
        company: task.company.clone(),
        jobs_fetched: 0,
        jobs_written: 0,
        jobs_failed: 0,
        enrichment_queued: 0,
        duration_ms,
        attempt: delivery.attempt,
        success: false,
        error: None,
        recorded_at: Utc::now(),
    }
}

#[async_trait]
impl TaskHandler for FetchWorker {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, TaskError> {
        let payload: FetchPayload = delivery.payload_as()?;
        let mut task = self.load_task(&payload.task_id).await?;

        if task.status.is_terminal() {
            let status = task.status.as_str();
            tracing::info!(task_id = %task.task_id, "Task already {status}, skipping");
            // The earlier delivery may have counted the task but died before closing the run.
            self.tracker.finalize_if_done(&task.execution_id).await?;
            return Ok(Outcome::Skipped(format!("task already {status}")));
        }

        task.apply(TaskEvent::Dispatched)
            .map_err(|e| TaskError::Terminal(e.to_string()))?;
        task.save(&*self.store).await?;

        let started = Instant::now();
        tracing::info!(
            task_id = %task.task_id,
            execution_id = %task.execution_id,
            provider = %task.provider,
            company = %task.company,
            attempt = delivery.attempt,
            "Fetching jobs"
        );

        let adapter = self
            .adapters
            .get(&task.provider)
            .ok_or_else(|| TaskError::Terminal(format!("Unknown provider '{}'", task.provider)))?;

        let jobs = match adapter.fetch(&task.company, &task.params_value()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                let error = e.to_string();
                self.record_metrics(FetchMetrics {
                    error: Some(error.clone()),
                    ..metrics_for(&task, delivery, elapsed_ms(started))
                })
                .await;
                return Err(TaskError::Retryable(error));
            }
        };

        let jobs_fetched = jobs.len() as u64;
        let seen_at = Utc::now();
        let docs = jobs
            .iter()
            .map(|job| (job.job_id(), job.upsert_document(&task.execution_id, seen_at)))
            .collect::<Vec<_>>();
        let written = write_documents(
            &*self.store,
            JOBS,
            docs,
            BatchWriteOptions::with_batch_size(self.write_batch_size),
        )
        .await;

        if written.written == 0 && written.failed > 0 {
            let error = format!(
                "All {} job writes failed: {}",
                written.failed,
                written.errors.first().map(String::as_str).unwrap_or("unknown error")
            );
            self.record_metrics(FetchMetrics {
                jobs_fetched,
                jobs_failed: written.failed as u64,
                error: Some(error.clone()),
                ..metrics_for(&task, delivery, elapsed_ms(started))
            })
            .await;
            return Err(TaskError::Retryable(error));
        }

        let mut enrichment_queued = 0u64;
        for job in jobs.iter().filter(|job| job.needs_enrichment()) {
            let payload = EnrichmentPayload {
                job_id: job.job_id(),
                execution_id: Some(task.execution_id.clone()),
            };
            match self.queues.enqueue_enrichment(&payload).await {
                Ok(_) => enrichment_queued += 1,
                Err(e) => tracing::warn!(
                    task_id = %task.task_id,
                    job_id = %payload.job_id,
                    "Failed to queue enrichment: {e}"
                ),
            }
        }

        let jobs_written = written.written as u64;
        task.apply(TaskEvent::Succeeded)
            .map_err(|e| TaskError::Terminal(e.to_string()))?;
        task.jobs_fetched = Some(jobs_fetched);
        task.jobs_written = Some(jobs_written);
        self.tracker.record_task_completed(&task).await?;

        self.record_metrics(FetchMetrics {
            jobs_fetched,
            jobs_written,
            jobs_failed: written.failed as u64,
            enrichment_queued,
            success: true,
            ..metrics_for(&task, delivery, elapsed_ms(started))
        })
        .await;

        tracing::info!(
            task_id = %task.task_id,
            provider = %task.provider,
            company = %task.company,
            jobs_fetched,
            jobs_written,
            enrichment_queued,
            "Fetch task completed"
        );
        Ok(Outcome::Completed)
    }

    async fn on_retry(&self, delivery: &Delivery, error: &str) {
        let Some(mut task) = self.task_for_failure(delivery).await else {
            return;
        };
        self.record_failure_metrics(&task, delivery, error).await;
        if task.status != TaskStatus::Processing {
            let _ = task.apply(TaskEvent::Dispatched);
        }
        if let Err(e) = task.apply(TaskEvent::FailedWillRetry) {
            tracing::warn!(task_id = %task.task_id, "Not marking task for retry: {e}");
            return;
        }
        task.error = Some(error.to_string());
        if let Err(e) = task.save(&*self.store).await {
            tracing::error!(task_id = %task.task_id, "Failed to save retrying task: {e}");
        }
    }

    async fn on_exhausted(&self, delivery: &Delivery, error: &str) {
        let Some(mut task) = self.task_for_failure(delivery).await else {
            return;
        };
        self.record_failure_metrics(&task, delivery, error).await;
        if task.status != TaskStatus::Processing {
            let _ = task.apply(TaskEvent::Dispatched);
        }
        if let Err(e) = task.apply(TaskEvent::FailedExhausted) {
            tracing::error!(task_id = %task.task_id, "Cannot fail task: {e}");
            return;
        }
        task.error = Some(error.to_string());
        if let Err(e) = task.save(&*self.store).await {
            tracing::error!(task_id = %task.task_id, "Failed to save failed task: {e}");
            return;
        }

        tracing::error!(
            task_id = %task.task_id,
            execution_id = %task.execution_id,
            provider = %task.provider,
            company = %task.company,
            retries = task.retry_count,
            "Task failed: {error}"
        );
        if let Err(e) = self.tracker.record_task_failed(&task, error).await {
            tracing::error!(task_id = %task.task_id, "Failed to record task failure: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;
    use tokio::sync::Mutex;

    use super::*;
    use crate::collectors::{AdapterError, ProviderAdapter};
    use crate::config::Source;
    use crate::models::execution::{BatchExecution, ExecutionStatus, Trigger};
    use crate::models::job::{JobRecord, NormalizedJob};
    use crate::queue::dispatcher::process_delivery;
    use crate::queue::{Disposition, MemoryTaskQueue, QueueName, QueueSettings, TaskQueue};
    use crate::store::{Document, MemoryStore, Query, StoreError, WriteBatch};

    /// Adapter that answers from a per-company script and counts calls.
    #[derive(Default)]
    struct FakeAdapter {
        boards: HashMap<String, Result<Vec<NormalizedJob>, u16>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn provider(&self) -> &'static str {
            "fake"
        }

        async fn fetch(
            &self,
            company: &str,
            _params: &Value,
        ) -> Result<Vec<NormalizedJob>, AdapterError> {
            *self.calls.lock().await += 1;
            match self.boards.get(company) {
                Some(Ok(jobs)) => Ok(jobs.clone()),
                Some(Err(status)) => Err(AdapterError::Status {
                    provider: "fake",
                    status: *status,
                    url: format!("https://fake.test/{company}"),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    fn job(id: &str, description: &str, skills: &[&str]) -> NormalizedJob {
        NormalizedJob {
            title: format!("Role {id}"),
            company: "acme".into(),
            location: None,
            description: description.into(),
            apply_url: format!("https://fake.test/acme/{id}"),
            posted_at: None,
            skills: skills.iter().map(|s| s.to_string()).collect(),
            external_id: Some(id.into()),
            provider: "fake".into(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryTaskQueue>,
        queues: QueueClient,
        worker: FetchWorker,
        adapter: Arc<FakeAdapter>,
    }

    fn harness(boards: Vec<(&str, Result<Vec<NormalizedJob>, u16>)>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_on(boards, store.clone(), store)
    }

    /// Harness whose worker writes through `backing`, which sits over `store`.
    fn harness_on(
        boards: Vec<(&str, Result<Vec<NormalizedJob>, u16>)>,
        store: Arc<MemoryStore>,
        backing: Arc<dyn Store>,
    ) -> Harness {
        let queue = Arc::new(MemoryTaskQueue::new());
        let queues = QueueClient::new(
            queue.clone(),
            QueueSettings::fetch(),
            QueueSettings::enrichment(),
        );
        let adapter = Arc::new(FakeAdapter {
            boards: boards.into_iter().map(|(c, r)| (c.to_string(), r)).collect(),
            ..Default::default()
        });
        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone());
        let tracker = Arc::new(ExecutionTracker::new(backing.clone(), queues.clone()));
        let worker = FetchWorker::new(backing, queues.clone(), adapters, tracker, 400);
        Harness {
            store,
            queue,
            queues,
            worker,
            adapter,
        }
    }

    /// Delegates to the in-memory store but fails the n-th commit.
    struct FailingCommit {
        inner: Arc<MemoryStore>,
        fail_on: usize,
        commits: AtomicUsize,
    }

    #[async_trait]
    impl Store for FailingCommit {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            self.inner.get(collection, id).await
        }

        async fn upsert(
            &self,
            collection: &str,
            id: &str,
            data: Document,
        ) -> Result<(), StoreError> {
            self.inner.upsert(collection, id, data).await
        }

        async fn increment(
            &self,
            collection: &str,
            id: &str,
            deltas: &[(&str, i64)],
        ) -> Result<(), StoreError> {
            self.inner.increment(collection, id, deltas).await
        }

        async fn append_bounded(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            value: Value,
            max_len: usize,
        ) -> Result<bool, StoreError> {
            self.inner.append_bounded(collection, id, field, value, max_len).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
            if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.commit(batch).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
            self.inner.query(query).await
        }

        fn max_batch_size(&self) -> usize {
            self.inner.max_batch_size()
        }
    }

    impl Harness {
        /// One running execution with a pending task per company, each enqueued.
        async fn seed(&self, provider: &str, companies: &[&str]) -> Vec<FetchTask> {
            BatchExecution::new("exec-1", "batch-1", companies.len() as i64, Trigger::Api)
                .create(&*self.store)
                .await
                .unwrap();
            let mut tasks = Vec::new();
            for company in companies {
                let source = Source {
                    provider: provider.into(),
                    company: company.to_string(),
                    params: Document::new(),
                };
                let task = FetchTask::new(&source, "exec-1", "batch-1", 2);
                task.save(&*self.store).await.unwrap();
                self.queues
                    .enqueue_fetch(&FetchPayload {
                        task_id: task.task_id.clone(),
                        execution_id: task.execution_id.clone(),
                        provider: task.provider.clone(),
                        company: task.company.clone(),
                    })
                    .await
                    .unwrap();
                tasks.push(task);
            }
            tasks
        }

        async fn claim(&self) -> Delivery {
            let settings = QueueSettings::fetch();
            self.queue
                .claim(QueueName::Fetch, 1, settings.lease())
                .await
                .unwrap()
                .pop()
                .unwrap()
        }

        async fn task(&self, id: &str) -> FetchTask {
            FetchTask::get(&*self.store, id).await.unwrap().unwrap()
        }

        async fn execution(&self) -> BatchExecution {
            BatchExecution::get(&*self.store, "exec-1").await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn empty_board_still_completes_the_task() {
        let h = harness(vec![("acme", Ok(Vec::new()))]);
        let tasks = h.seed("fake", &["acme"]).await;

        let delivery = h.claim().await;
        let outcome = h.worker.handle(&delivery).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        let task = h.task(&tasks[0].task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.jobs_fetched, Some(0));
        assert_eq!(task.jobs_written, Some(0));

        let execution = h.execution().await;
        assert_eq!(execution.completed_tasks, 1);
        assert_eq!(execution.failed_tasks, 0);
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn writes_jobs_and_queues_enrichment_for_untagged_ones() {
        let h = harness(vec![(
            "acme",
            Ok(vec![
                job("1", "Rust and Postgres", &[]),
                job("2", "Kotlin", &["Kotlin"]),
                job("3", "   ", &[]),
            ]),
        )]);
        let tasks = h.seed("fake", &["acme"]).await;

        let delivery = h.claim().await;
        h.worker.handle(&delivery).await.unwrap();

        assert_eq!(h.store.count(JOBS).await, 3);
        let stored = JobRecord::get(&*h.store, &job("2", "", &[]).job_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.skills, vec!["Kotlin".to_string()]);
        assert_eq!(stored.execution_id.as_deref(), Some("exec-1"));

        let queued = h.queue.payloads(QueueName::Enrichment).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0]["job_id"], job("1", "", &[]).job_id());
        assert_eq!(queued[0]["execution_id"], "exec-1");

        let metrics = FetchMetrics::for_execution(&*h.store, "exec-1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].task_id, tasks[0].task_id);
        assert!(metrics[0].success);
        assert_eq!(metrics[0].jobs_fetched, 3);
        assert_eq!(metrics[0].jobs_written, 3);
        assert_eq!(metrics[0].enrichment_queued, 1);

        let execution = h.execution().await;
        assert_eq!(execution.total_jobs_fetched, 3);
        assert_eq!(execution.total_jobs_written, 3);
    }

    #[tokio::test]
    async fn failures_retry_then_fail_the_task_once() {
        let h = harness(vec![("acme", Err(503))]);
        let tasks = h.seed("fake", &["acme"]).await;
        let settings = QueueSettings::fetch();

        let first = h.claim().await;
        let disposition = process_delivery(&*h.queue, &h.worker, &settings, first.clone()).await;
        assert!(matches!(disposition, Disposition::Retry { .. }));

        let task = h.task(&tasks[0].task_id).await;
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.as_deref().unwrap().contains("503"));

        let metrics = FetchMetrics::for_execution(&*h.store, "exec-1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
        assert_eq!(metrics[0].attempt, 1);
        assert!(metrics[0].error.as_deref().unwrap().contains("503"));

        // The retry is scheduled a minute out; replay the remaining attempts directly.
        for attempt in 2..=3 {
            let delivery = Delivery {
                attempt,
                ..first.clone()
            };
            process_delivery(&*h.queue, &h.worker, &settings, delivery).await;
            let task = h.task(&tasks[0].task_id).await;
            assert!(task.retry_count <= task.max_retries);
        }

        let task = h.task(&tasks[0].task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(*h.adapter.calls.lock().await, 3);

        let execution = h.execution().await;
        assert_eq!(execution.failed_tasks, 1);
        assert_eq!(execution.completed_tasks, 0);
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(h.queue.dead_letters(QueueName::Fetch).await.len(), 1);
        let metrics = FetchMetrics::for_execution(&*h.store, "exec-1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].attempt, 3);

        // A late duplicate cannot move the task out of `failed`.
        let late = Delivery {
            attempt: 3,
            ..first
        };
        let outcome = h.worker.handle(&late).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        h.worker.on_exhausted(&late, "again").await;
        assert_eq!(h.task(&tasks[0].task_id).await.status, TaskStatus::Failed);
        assert_eq!(h.execution().await.failed_tasks, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_of_completed_task_is_a_no_op() {
        let h = harness(vec![("acme", Ok(vec![job("1", "Go", &["Go"])]))]);
        h.seed("fake", &["acme"]).await;

        let delivery = h.claim().await;
        assert_eq!(h.worker.handle(&delivery).await.unwrap(), Outcome::Completed);
        let outcome = h.worker.handle(&delivery).await.unwrap();

        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert_eq!(*h.adapter.calls.lock().await, 1);
        assert_eq!(h.execution().await.completed_tasks, 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_terminal() {
        let h = harness(Vec::new());
        let tasks = h.seed("workday", &["acme"]).await;
        let settings = QueueSettings::fetch();

        let delivery = h.claim().await;
        let disposition = process_delivery(&*h.queue, &h.worker, &settings, delivery).await;

        assert!(matches!(disposition, Disposition::DeadLetter { .. }));
        let task = h.task(&tasks[0].task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("workday"));
        assert_eq!(h.execution().await.failed_tasks, 1);

        let metrics = FetchMetrics::for_execution(&*h.store, "exec-1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
        assert!(metrics[0].error.as_deref().unwrap().contains("workday"));
    }

    #[tokio::test]
    async fn timeout_is_recorded_in_metrics() {
        let h = harness(vec![("acme", Ok(Vec::new()))]);
        let tasks = h.seed("fake", &["acme"]).await;

        let delivery = h.claim().await;
        h.worker.on_retry(&delivery, "Timed out after 540s").await;

        let task = h.task(&tasks[0].task_id).await;
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);

        let metrics = FetchMetrics::for_execution(&*h.store, "exec-1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
        assert_eq!(metrics[0].attempt, 1);
        assert_eq!(metrics[0].error.as_deref(), Some("Timed out after 540s"));
    }

    #[tokio::test]
    async fn failed_completion_commit_is_retried_and_counted_once() {
        let memory = Arc::new(MemoryStore::new());
        // Commit 1 writes the jobs, commit 2 records the completion.
        let backing = Arc::new(FailingCommit {
            inner: memory.clone(),
            fail_on: 2,
            commits: AtomicUsize::new(0),
        });
        let h = harness_on(vec![("acme", Ok(vec![job("1", "Go", &["Go"])]))], memory, backing);
        let tasks = h.seed("fake", &["acme"]).await;
        let settings = QueueSettings::fetch();

        let first = h.claim().await;
        let disposition = process_delivery(&*h.queue, &h.worker, &settings, first.clone()).await;
        assert!(matches!(disposition, Disposition::Retry { .. }));
        assert_eq!(h.task(&tasks[0].task_id).await.status, TaskStatus::Retrying);
        assert_eq!(h.execution().await.completed_tasks, 0);

        let second = Delivery {
            attempt: 2,
            ..first
        };
        assert_eq!(h.worker.handle(&second).await.unwrap(), Outcome::Completed);
        assert!(matches!(h.worker.handle(&second).await.unwrap(), Outcome::Skipped(_)));

        let execution = h.execution().await;
        assert_eq!(execution.completed_tasks, 1);
        assert_eq!(execution.total_jobs_written, 1);
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn missing_task_document_is_terminal() {
        let h = harness(Vec::new());
        let delivery = Delivery {
            id: 1,
            queue: QueueName::Fetch,
            payload: serde_json::to_value(FetchPayload {
                task_id: "exec-0:fake:ghost".into(),
                execution_id: "exec-0".into(),
                provider: "fake".into(),
                company: "ghost".into(),
            })
            .unwrap(),
            attempt: 1,
            max_attempts: 3,
        };
        assert!(matches!(
            h.worker.handle(&delivery).await,
            Err(TaskError::Terminal(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_count_every_completion() {
        let companies: Vec<String> = (0..20).map(|i| format!("co-{i}")).collect();
        let refs: Vec<&str> = companies.iter().map(String::as_str).collect();
        let h = Arc::new(harness(Vec::new()));
        h.seed("fake", &refs).await;

        let mut deliveries = Vec::new();
        for _ in 0..companies.len() {
            deliveries.push(h.claim().await);
        }
        let handles: Vec<_> = deliveries
            .into_iter()
            .map(|delivery| {
                let h = h.clone();
                tokio::spawn(async move { h.worker.handle(&delivery).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Outcome::Completed);
        }

        let execution = h.execution().await;
        assert_eq!(execution.completed_tasks, 20);
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }
}
