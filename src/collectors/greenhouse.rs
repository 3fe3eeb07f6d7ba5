use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::collectors::{
    AdapterError, ProviderAdapter, encode_segment, get_json, html_to_text, param_str,
};
use crate::models::job::NormalizedJob;

const BASE_URL: &str = "https://boards-api.greenhouse.io/v1/boards";

pub struct Greenhouse {
    client: reqwest::Client,
}

impl Greenhouse {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderAdapter for Greenhouse {
    fn provider(&self) -> &'static str {
        "greenhouse"
    }

    async fn fetch(
        &self,
        company: &str,
        params: &Value,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let board = param_str(params, "board_token").unwrap_or(company);
        let url = format!("{BASE_URL}/{}/jobs?content=true", encode_segment(board));
        let body: Board = get_json(&self.client, self.provider(), board, &url).await?;
        Ok(normalize(company, body))
    }
}

#[derive(Debug, Deserialize)]
struct Board {
    #[serde(default)]
    jobs: Vec<Posting>,
}

#[derive(Debug, Deserialize)]
struct Posting {
    id: u64,
    title: String,
    absolute_url: String,
    #[serde(default)]
    location: Option<Location>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    first_published: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Location {
    name: Option<String>,
}

fn normalize(company: &str, board: Board) -> Vec<NormalizedJob> {
    board
        .jobs
        .into_iter()
        .map(|job| {
            let posted_at = job
                .first_published
                .as_deref()
                .or(job.updated_at.as_deref())
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                .map(|at| at.with_timezone(&Utc));

            NormalizedJob {
                title: job.title.trim().to_string(),
                company: company.to_string(),
                location: job.location.and_then(|l| l.name).filter(|n| !n.trim().is_empty()),
                description: job.content.as_deref().map(html_to_text).unwrap_or_default(),
                apply_url: job.absolute_url,
                posted_at,
                skills: Vec::new(),
                external_id: Some(job.id.to_string()),
                provider: "greenhouse".to_string(),
            }
        })
        .collect()
}
