use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::job::{EnrichmentStatus, JobRecord};
use crate::models::metrics::{EnrichmentMetrics, EnrichmentOutcome};
use crate::queue::{Delivery, EnrichmentPayload, Outcome, TaskError, TaskHandler};
use crate::skills::{MAX_INPUT_CHARS, SkillExtractor, normalize_skills, truncate_chars};
use crate::store::Store;
use crate::tracker::ExecutionTracker;

/// Tags one stored job with extracted skills.
///
/// Extraction problems are domain outcomes: the job is marked `failed` and the
/// delivery is acknowledged, so only store trouble consumes retry budget.
pub struct EnrichmentWorker {
    store: Arc<dyn Store>,
    extractor: Arc<dyn SkillExtractor>,
    tracker: Arc<ExecutionTracker>,
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<dyn SkillExtractor>,
        tracker: Arc<ExecutionTracker>,
    ) -> Self {
        Self {
            store,
            extractor,
            tracker,
        }
    }

    async fn finish(
        &self,
        payload: &EnrichmentPayload,
        outcome: EnrichmentOutcome,
        skills_count: usize,
        error: Option<String>,
        started: Instant,
    ) {
        let success = matches!(
            outcome,
            EnrichmentOutcome::Completed | EnrichmentOutcome::Skipped
        );
        let metrics = EnrichmentMetrics {
            job_id: payload.job_id.clone(),
            execution_id: payload.execution_id.clone(),
            outcome,
            success,
            skills_count: skills_count as u64,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            recorded_at: Utc::now(),
        };
        if let Err(e) = metrics.record(&*self.store).await {
            tracing::warn!(job_id = %payload.job_id, "Failed to record enrichment metrics: {e}");
        }

        if outcome == EnrichmentOutcome::Skipped {
            return;
        }
        if let Some(execution_id) = &payload.execution_id
            && let Err(e) = self.tracker.record_enrichment(execution_id, success).await
        {
            tracing::warn!(
                job_id = %payload.job_id,
                execution_id = %execution_id,
                "Failed to count enrichment: {e}"
            );
        }
    }

    async fn mark_failed(&self, job_id: &str, error: &str) -> Result<(), TaskError> {
        JobRecord::set_enrichment_status(
            &*self.store,
            job_id,
            EnrichmentStatus::Failed,
            Some(error),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for EnrichmentWorker {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, TaskError> {
        let payload: EnrichmentPayload = delivery.payload_as()?;
        let started = Instant::now();

        let Some(job) = JobRecord::get(&*self.store, &payload.job_id).await? else {
            tracing::warn!(job_id = %payload.job_id, "Job not found, skipping enrichment");
            return Ok(Outcome::Skipped("job not found".to_string()));
        };

        if job.enrichment_status == Some(EnrichmentStatus::Completed) {
            self.finish(&payload, EnrichmentOutcome::Skipped, job.skills.len(), None, started)
                .await;
            return Ok(Outcome::Skipped("already enriched".to_string()));
        }

        if job.description.trim().is_empty() {
            let error = "Empty description";
            self.mark_failed(&job.job_id, error).await?;
            self.finish(
                &payload,
                EnrichmentOutcome::EmptyDescription,
                0,
                Some(error.to_string()),
                started,
            )
            .await;
            return Ok(Outcome::Rejected(error.to_string()));
        }

        let text = format!("{}\n\n{}", job.title, job.description);
        match self.extractor.extract(truncate_chars(&text, MAX_INPUT_CHARS)).await {
            Ok(skills) => {
                let skills = normalize_skills(skills);
                JobRecord::mark_enriched(&*self.store, &job.job_id, &skills).await?;
                tracing::info!(
                    job_id = %job.job_id,
                    attempt = delivery.attempt,
                    "Extracted {} skills",
                    skills.len()
                );
                self.finish(&payload, EnrichmentOutcome::Completed, skills.len(), None, started)
                    .await;
                Ok(Outcome::Completed)
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(job_id = %job.job_id, "Skill extraction failed: {error}");
                self.mark_failed(&job.job_id, &error).await?;
                self.finish(
                    &payload,
                    EnrichmentOutcome::ExtractionFailed,
                    0,
                    Some(error.clone()),
                    started,
                )
                .await;
                Ok(Outcome::Rejected(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;
    use crate::models::JOBS;
    use crate::models::execution::{BatchExecution, Trigger};
    use crate::models::job::NormalizedJob;
    use crate::queue::{MemoryTaskQueue, QueueClient, QueueName, QueueSettings};
    use crate::skills::ExtractionError;
    use crate::store::MemoryStore;

    /// Extractor that returns a fixed answer and remembers what it was asked.
    struct FakeExtractor {
        answer: Result<Vec<String>, u16>,
        inputs: Mutex<Vec<String>>,
    }

    impl FakeExtractor {
        fn new(answer: Result<Vec<&str>, u16>) -> Self {
            Self {
                answer: answer.map(|skills| skills.into_iter().map(String::from).collect()),
                inputs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SkillExtractor for FakeExtractor {
        async fn extract(&self, text: &str) -> Result<Vec<String>, ExtractionError> {
            self.inputs.lock().await.push(text.to_string());
            match &self.answer {
                Ok(skills) => Ok(skills.clone()),
                Err(status) => Err(ExtractionError::Api {
                    status: *status,
                    body: "rate limited".into(),
                }),
            }
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        extractor: Arc<FakeExtractor>,
        worker: EnrichmentWorker,
    }

    async fn harness(answer: Result<Vec<&str>, u16>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queues = QueueClient::new(
            Arc::new(MemoryTaskQueue::new()),
            QueueSettings::fetch(),
            QueueSettings::enrichment(),
        );
        let tracker = Arc::new(ExecutionTracker::new(store.clone(), queues));
        let extractor = Arc::new(FakeExtractor::new(answer));
        BatchExecution::new("exec-1", "batch-1", 1, Trigger::Api)
            .create(&*store)
            .await
            .unwrap();
        Harness {
            worker: EnrichmentWorker::new(store.clone(), extractor.clone(), tracker),
            store,
            extractor,
        }
    }

    async fn seed_job(store: &MemoryStore, description: &str) -> String {
        let job = NormalizedJob {
            title: "Site Reliability Engineer".into(),
            company: "acme".into(),
            location: None,
            description: description.into(),
            apply_url: "https://jobs.ashbyhq.com/acme/1".into(),
            posted_at: None,
            skills: Vec::new(),
            external_id: Some("1".into()),
            provider: "ashby".into(),
        };
        let id = job.job_id();
        store
            .upsert(JOBS, &id, job.upsert_document("exec-1", Utc::now()))
            .await
            .unwrap();
        id
    }

    fn delivery(job_id: &str) -> Delivery {
        Delivery {
            id: 7,
            queue: QueueName::Enrichment,
            payload: serde_json::to_value(EnrichmentPayload {
                job_id: job_id.to_string(),
                execution_id: Some("exec-1".into()),
            })
            .unwrap(),
            attempt: 1,
            max_attempts: 2,
        }
    }

    async fn execution(store: &MemoryStore) -> BatchExecution {
        BatchExecution::get(store, "exec-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn extracted_skills_complete_the_job() {
        let h = harness(Ok(vec!["Kubernetes", " kubernetes", "Terraform"])).await;
        let job_id = seed_job(&h.store, "Run Kubernetes with Terraform.").await;

        let outcome = h.worker.handle(&delivery(&job_id)).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        let job = JobRecord::get(&*h.store, &job_id).await.unwrap().unwrap();
        assert_eq!(job.enrichment_status, Some(EnrichmentStatus::Completed));
        assert_eq!(job.skills, vec!["Kubernetes".to_string(), "Terraform".to_string()]);
        assert!(job.enriched_at.is_some());

        let inputs = h.extractor.inputs.lock().await;
        assert!(inputs[0].starts_with("Site Reliability Engineer\n\n"));

        let metrics = EnrichmentMetrics::get(&*h.store, &job_id).await.unwrap().unwrap();
        assert_eq!(metrics.outcome, EnrichmentOutcome::Completed);
        assert_eq!(metrics.skills_count, 2);
        assert_eq!(execution(&h.store).await.enrichment_completed, 1);
    }

    #[tokio::test]
    async fn empty_description_fails_without_error() {
        let h = harness(Ok(vec!["unused"])).await;
        let job_id = seed_job(&h.store, "").await;

        let outcome = h.worker.handle(&delivery(&job_id)).await;
        assert!(matches!(outcome, Ok(Outcome::Rejected(_))));

        let job = JobRecord::get(&*h.store, &job_id).await.unwrap().unwrap();
        assert_eq!(job.enrichment_status, Some(EnrichmentStatus::Failed));
        assert!(h.extractor.inputs.lock().await.is_empty());

        let metrics = EnrichmentMetrics::get(&*h.store, &job_id).await.unwrap().unwrap();
        assert_eq!(metrics.outcome, EnrichmentOutcome::EmptyDescription);
        assert!(!metrics.success);
        assert_eq!(execution(&h.store).await.enrichment_failed, 1);
    }

    #[tokio::test]
    async fn extractor_error_marks_job_failed_and_acks() {
        let h = harness(Err(429)).await;
        let job_id = seed_job(&h.store, "Python and Spark").await;

        let outcome = h.worker.handle(&delivery(&job_id)).await;
        assert!(matches!(outcome, Ok(Outcome::Rejected(ref e)) if e.contains("429")));

        let job = JobRecord::get(&*h.store, &job_id).await.unwrap().unwrap();
        assert_eq!(job.enrichment_status, Some(EnrichmentStatus::Failed));
        assert!(job.enrichment_error.unwrap().contains("429"));
        assert!(job.skills.is_empty());
    }

    #[tokio::test]
    async fn completed_job_is_not_extracted_again() {
        let h = harness(Ok(vec!["Rust"])).await;
        let job_id = seed_job(&h.store, "Rust").await;

        h.worker.handle(&delivery(&job_id)).await.unwrap();
        let outcome = h.worker.handle(&delivery(&job_id)).await.unwrap();

        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert_eq!(h.extractor.inputs.lock().await.len(), 1);
        assert_eq!(execution(&h.store).await.enrichment_completed, 1);
    }

    #[tokio::test]
    async fn missing_job_is_acknowledged() {
        let h = harness(Ok(Vec::new())).await;
        let outcome = h.worker.handle(&delivery("hash_missing")).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
    }

    #[tokio::test]
    async fn long_descriptions_are_truncated() {
        let h = harness(Ok(Vec::new())).await;
        let job_id = seed_job(&h.store, &"x".repeat(20_000)).await;

        h.worker.handle(&delivery(&job_id)).await.unwrap();

        let inputs = h.extractor.inputs.lock().await;
        assert_eq!(inputs[0].chars().count(), MAX_INPUT_CHARS);
        let job = JobRecord::get(&*h.store, &job_id).await.unwrap().unwrap();
        assert_eq!(job.enrichment_status, Some(EnrichmentStatus::Completed));
    }
}
