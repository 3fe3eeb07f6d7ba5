use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ENRICHMENT_METRICS, FETCH_METRICS};
use crate::store::{self, Direction, Query, Store, StoreError, to_document};

/// Per-task fetch metrics. The id is derived from (execution, provider,
/// company), so a retried task overwrites its earlier row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchMetrics {
    pub execution_id: String,
    pub task_id: String,
    pub provider: String,
    pub company: String,
    pub jobs_fetched: u64,
    pub jobs_written: u64,
    pub jobs_failed: u64,
    pub enrichment_queued: u64,
    pub duration_ms: u64,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
}

impl FetchMetrics {
    pub fn id(&self) -> String {
        format!("{}_{}_{}", self.execution_id, self.provider, self.company)
    }

    pub async fn record(&self, store: &dyn Store) -> Result<(), StoreError> {
        store
            .upsert(FETCH_METRICS, &self.id(), to_document(self)?)
            .await
    }

    pub async fn get(store: &dyn Store, id: &str) -> Result<Option<FetchMetrics>, StoreError> {
        store::get_as(store, FETCH_METRICS, id).await
    }

    pub async fn for_execution(
        store: &dyn Store,
        execution_id: &str,
    ) -> Result<Vec<FetchMetrics>, StoreError> {
        let query = Query::new(FETCH_METRICS)
            .eq("execution_id", execution_id)
            .order_by("recorded_at", Direction::Asc);
        store::query_as(store, &query).await
    }
}

/// Management API rendering of a [`FetchMetrics`] row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMetricsView {
    pub execution_id: String,
    pub task_id: String,
    pub provider: String,
    pub company: String,
    pub jobs_fetched: u64,
    pub jobs_written: u64,
    pub jobs_failed: u64,
    pub enrichment_queued: u64,
    pub duration_ms: u64,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
}

impl From<FetchMetrics> for FetchMetricsView {
    fn from(m: FetchMetrics) -> Self {
        Self {
            execution_id: m.execution_id,
            task_id: m.task_id,
            provider: m.provider,
            company: m.company,
            jobs_fetched: m.jobs_fetched,
            jobs_written: m.jobs_written,
            jobs_failed: m.jobs_failed,
            enrichment_queued: m.enrichment_queued,
            duration_ms: m.duration_ms,
            attempt: m.attempt,
            success: m.success,
            error: m.error,
            recorded_at: m.recorded_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    Completed,
    Skipped,
    EmptyDescription,
    ExtractionFailed,
}

/// Per-job enrichment metrics, keyed by job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentMetrics {
    pub job_id: String,
    pub execution_id: Option<String>,
    pub outcome: EnrichmentOutcome,
    pub success: bool,
    pub skills_count: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
}

impl EnrichmentMetrics {
    pub async fn record(&self, store: &dyn Store) -> Result<(), StoreError> {
        store
            .upsert(ENRICHMENT_METRICS, &self.job_id, to_document(self)?)
            .await
    }

    pub async fn get(
        store: &dyn Store,
        job_id: &str,
    ) -> Result<Option<EnrichmentMetrics>, StoreError> {
        store::get_as(store, ENRICHMENT_METRICS, job_id).await
    }
}
