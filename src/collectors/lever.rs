use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::collectors::{
    AdapterError, ProviderAdapter, encode_segment, get_json, html_to_text, param_str,
};
use crate::models::job::NormalizedJob;

const GLOBAL_URL: &str = "https://api.lever.co/v0/postings";
const EU_URL: &str = "https://api.eu.lever.co/v0/postings";

pub struct Lever {
    client: reqwest::Client,
}

impl Lever {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderAdapter for Lever {
    fn provider(&self) -> &'static str {
        "lever"
    }

    async fn fetch(
        &self,
        company: &str,
        params: &Value,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let base = match param_str(params, "region") {
            Some(region) if region.eq_ignore_ascii_case("eu") => EU_URL,
            _ => GLOBAL_URL,
        };
        let url = format!("{base}/{}?mode=json", encode_segment(company));
        let postings: Vec<Posting> = get_json(&self.client, self.provider(), company, &url).await?;
        Ok(normalize(company, postings))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Posting {
    id: String,
    text: String,
    hosted_url: String,
    #[serde(default)]
    apply_url: Option<String>,
    #[serde(default)]
    categories: Categories,
    #[serde(default)]
    description_plain: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    lists: Vec<PostingList>,
    #[serde(default)]
    additional_plain: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    created_at: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct Categories {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostingList {
    #[serde(default)]
    text: String,
    #[serde(default)]
    content: String,
}

impl Posting {
    /// Lever splits a posting into an intro, bullet lists and a closing
    /// section; the skill extractor wants all of it.
    fn full_description(&self) -> String {
        let mut sections = Vec::new();
        match (&self.description_plain, &self.description) {
            (Some(plain), _) if !plain.trim().is_empty() => sections.push(plain.trim().to_string()),
            (_, Some(html)) => sections.push(html_to_text(html)),
            _ => {}
        }
        for list in &self.lists {
            sections.push(format!("{}: {}", list.text.trim(), html_to_text(&list.content)));
        }
        if let Some(additional) = &self.additional_plain {
            sections.push(additional.trim().to_string());
        }
        sections.retain(|s| !s.is_empty());
        sections.join("\n\n")
    }
}

fn normalize(company: &str, postings: Vec<Posting>) -> Vec<NormalizedJob> {
    postings
        .into_iter()
        .map(|posting| NormalizedJob {
            description: posting.full_description(),
            title: posting.text.trim().to_string(),
            company: company.to_string(),
            location: posting.categories.location.filter(|l| !l.trim().is_empty()),
            apply_url: posting.apply_url.unwrap_or(posting.hosted_url),
            posted_at: posting.created_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            skills: Vec::new(),
            external_id: Some(posting.id),
            provider: "lever".to_string(),
        })
        .collect()
}
