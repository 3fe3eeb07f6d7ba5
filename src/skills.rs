//! Skill extraction collaborator.
//!
//! [`LlmSkillExtractor`] talks to any OpenAI-compatible chat completions
//! endpoint in JSON mode and expects `{"skills": [...]}` back.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use serde_json::json;

/// Extracted skill lists are capped at this many entries.
pub const MAX_SKILLS: usize = 30;

/// Extractor input is truncated to this many characters.
pub const MAX_INPUT_CHARS: usize = 8000;

const SYSTEM_PROMPT: &str = "You extract skills from job postings. \
Return a JSON object {\"skills\": [string]} listing the concrete technical skills, tools, \
languages, frameworks and certifications the posting asks for. Use short canonical names. \
Return an empty list when none are mentioned.";

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait SkillExtractor: Send + Sync {
    /// Skills mentioned in `text`. An empty list is a valid answer.
    async fn extract(&self, text: &str) -> Result<Vec<String>, ExtractionError>;
}

#[derive(Clone)]
pub struct LlmSkillExtractor {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmSkillExtractor {
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct SkillList {
    #[serde(default)]
    skills: Vec<String>,
}

#[async_trait]
impl SkillExtractor for LlmSkillExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<String>, ExtractionError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": truncate_chars(text, MAX_INPUT_CHARS) },
            ],
        });

        let resp = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                body: truncate_chars(&body, 500).to_string(),
            });
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ExtractionError::Parse(format!("Invalid completion response: {e}")))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::Parse("Completion has no content".to_string()))?;

        parse_skills(&content)
    }
}

/// Parse the model's JSON answer into a normalized skill list.
pub fn parse_skills(content: &str) -> Result<Vec<String>, ExtractionError> {
    let list: SkillList = serde_json::from_str(content.trim())
        .map_err(|e| ExtractionError::Parse(format!("Expected {{\"skills\": [...]}}: {e}")))?;
    Ok(normalize_skills(list.skills))
}

/// Trim, drop blanks, de-duplicate case-insensitively (first spelling wins),
/// and cap at [`MAX_SKILLS`].
pub fn normalize_skills<I, S>(skills: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for skill in skills {
        let skill = skill.as_ref().trim();
        if skill.is_empty() || !seen.insert(skill.to_lowercase()) {
            continue;
        }
        out.push(skill.to_string());
        if out.len() == MAX_SKILLS {
            break;
        }
    }
    out
}

/// The first `max` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
