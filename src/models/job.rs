use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::models::JOBS;
use crate::store::{self, Document, Query, Store, StoreError};

/// Separator used when hashing identity parts, so ("ab", "c") != ("a", "bc").
const ID_SEPARATOR: &str = "\u{1f}";

/// A provider-agnostic posting as returned by a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub description: String,
    pub apply_url: String,
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub external_id: Option<String>,
    pub provider: String,
}

impl NormalizedJob {
    /// Deterministic identity: (provider, external id) when the provider gives
    /// one, otherwise a content hash of (title, company, apply url).
    pub fn job_id(&self) -> String {
        match self.external_id.as_deref().map(str::trim) {
            Some(external_id) if !external_id.is_empty() => {
                let digest = sha256_hex(&[&self.provider, external_id]);
                format!("{}_{}", self.provider, &digest[..24])
            }
            _ => {
                let digest = sha256_hex(&[&self.title, &self.company, &self.apply_url]);
                format!("hash_{}", &digest[..32])
            }
        }
    }

    /// Jobs the adapter could not tag need a skill-extraction pass.
    pub fn needs_enrichment(&self) -> bool {
        self.skills.is_empty() && !self.description.trim().is_empty()
    }

    /// Fields written by a fetch. Skills are left out when the adapter found
    /// none so that an earlier enrichment survives the merge, and enrichment
    /// fields are never touched here.
    pub fn upsert_document(&self, execution_id: &str, seen_at: DateTime<Utc>) -> Document {
        let mut doc = Document::new();
        doc.insert("job_id".into(), json!(self.job_id()));
        doc.insert("title".into(), json!(self.title));
        doc.insert("company".into(), json!(self.company));
        doc.insert("location".into(), json!(self.location));
        doc.insert("description".into(), json!(self.description));
        doc.insert("apply_url".into(), json!(self.apply_url));
        doc.insert(
            "posted_at".into(),
            self.posted_at
                .map(|at| json!(at.timestamp_millis()))
                .unwrap_or(Value::Null),
        );
        doc.insert("external_id".into(), json!(self.external_id));
        doc.insert("provider".into(), json!(self.provider));
        doc.insert("execution_id".into(), json!(execution_id));
        doc.insert("last_seen_at".into(), json!(seen_at.timestamp_millis()));
        if !self.skills.is_empty() {
            doc.insert("skills".into(), json!(self.skills));
        }
        doc
    }
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(ID_SEPARATOR).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }
}

/// A persisted job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: String,
    pub apply_url: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub enrichment_status: Option<EnrichmentStatus>,
    #[serde(default)]
    pub enrichment_error: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub enriched_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub async fn get(store: &dyn Store, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        store::get_as(store, JOBS, job_id).await
    }

    pub async fn mark_enriched(
        store: &dyn Store,
        job_id: &str,
        skills: &[String],
    ) -> Result<(), StoreError> {
        let mut update = Document::new();
        update.insert("skills".into(), json!(skills));
        update.insert(
            "enrichment_status".into(),
            json!(EnrichmentStatus::Completed.as_str()),
        );
        update.insert("enrichment_error".into(), Value::Null);
        update.insert("enriched_at".into(), json!(Utc::now().timestamp_millis()));
        store.upsert(JOBS, job_id, update).await
    }

    pub async fn set_enrichment_status(
        store: &dyn Store,
        job_id: &str,
        status: EnrichmentStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut update = Document::new();
        update.insert("enrichment_status".into(), json!(status.as_str()));
        update.insert("enrichment_error".into(), json!(error));
        store.upsert(JOBS, job_id, update).await
    }

    pub async fn failed_enrichments(
        store: &dyn Store,
        execution_id: &str,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let query = Query::new(JOBS)
            .eq("execution_id", execution_id)
            .eq("enrichment_status", EnrichmentStatus::Failed.as_str());
        store::query_as(store, &query).await
    }
}
