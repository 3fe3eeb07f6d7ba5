use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::collectors::{AdapterError, ProviderAdapter, encode_segment, get_json, html_to_text};
use crate::models::job::NormalizedJob;

const BASE_URL: &str = "https://api.ashbyhq.com/posting-api/job-board";

pub struct Ashby {
    client: reqwest::Client,
}

impl Ashby {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderAdapter for Ashby {
    fn provider(&self) -> &'static str {
        "ashby"
    }

    async fn fetch(
        &self,
        company: &str,
        _params: &Value,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let url = format!("{BASE_URL}/{}", encode_segment(company));
        let board: Board = get_json(&self.client, self.provider(), company, &url).await?;
        Ok(normalize(company, board))
    }
}

#[derive(Debug, Deserialize)]
struct Board {
    #[serde(default)]
    jobs: Vec<Posting>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Posting {
    id: String,
    title: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default = "listed")]
    is_listed: bool,
    #[serde(default)]
    description_plain: Option<String>,
    #[serde(default)]
    description_html: Option<String>,
    job_url: String,
    #[serde(default)]
    apply_url: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
}

fn listed() -> bool {
    true
}

fn normalize(company: &str, board: Board) -> Vec<NormalizedJob> {
    board
        .jobs
        .into_iter()
        .filter(|posting| posting.is_listed)
        .map(|posting| {
            let description = match (posting.description_plain, posting.description_html) {
                (Some(plain), _) if !plain.trim().is_empty() => plain.trim().to_string(),
                (_, Some(html)) => html_to_text(&html),
                _ => String::new(),
            };
            NormalizedJob {
                title: posting.title.trim().to_string(),
                company: company.to_string(),
                location: posting.location.filter(|l| !l.trim().is_empty()),
                description,
                apply_url: posting.apply_url.unwrap_or(posting.job_url),
                posted_at: posting
                    .published_at
                    .as_deref()
                    .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                    .map(|at| at.with_timezone(&Utc)),
                skills: Vec::new(),
                external_id: Some(posting.id),
                provider: "ashby".to_string(),
            }
        })
        .collect()
}
