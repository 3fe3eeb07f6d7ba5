// Provider adapters. Each ATS dialect gets one strategy that fetches a
// company's board and normalizes its postings.

pub mod ashby;
pub mod greenhouse;
pub mod lever;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use scraper::{Html, Node};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::models::job::NormalizedJob;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("jobqueue/", env!("CARGO_PKG_VERSION"));

/// Characters left as-is in a path segment (RFC 3986 unreserved).
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} board '{board}' not found")]
    BoardNotFound { provider: &'static str, board: String },

    #[error("{provider} returned HTTP {status} for {url}")]
    Status {
        provider: &'static str,
        status: u16,
        url: String,
    },

    #[error("Failed to parse {provider} response: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },
}

/// Trait that every provider adapter implements.
/// An empty result means the board currently has no postings.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider tag matching `FetchTask::provider`.
    fn provider(&self) -> &'static str;

    async fn fetch(
        &self,
        company: &str,
        params: &Value,
    ) -> Result<Vec<NormalizedJob>, AdapterError>;
}

/// Provider name → adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Greenhouse, Lever and Ashby adapters sharing one client.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(greenhouse::Greenhouse::new(client.clone())));
        registry.register(Arc::new(lever::Lever::new(client.clone())));
        registry.register(Arc::new(ashby::Ashby::new(client)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider().to_string(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

pub(crate) fn encode_segment(slug: &str) -> String {
    utf8_percent_encode(slug, PATH_SEGMENT).to_string()
}

/// String param lookup, ignoring blanks.
pub(crate) fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// GET `url` and decode the JSON body, mapping 404 to an unknown-board error.
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    provider: &'static str,
    board: &str,
    url: &str,
) -> Result<T, AdapterError> {
    tracing::debug!(provider, board, "GET {url}");
    let resp = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await?;

    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(AdapterError::BoardNotFound {
            provider,
            board: board.to_string(),
        });
    }
    if !status.is_success() {
        return Err(AdapterError::Status {
            provider,
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| AdapterError::Parse {
        provider,
        message: e.to_string(),
    })
}

/// Elements that start a new line of text when rendered.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "blockquote", "br", "dd", "div", "dl", "dt", "footer", "h1", "h2",
    "h3", "h4", "h5", "h6", "header", "hr", "li", "ol", "p", "pre", "section", "table", "td",
    "th", "tr", "ul",
];

/// Turn an HTML fragment (possibly entity-escaped, as Greenhouse sends it)
/// into plain text with collapsed whitespace. Script and style bodies are dropped.
pub fn html_to_text(html: &str) -> String {
    let mut text = fragment_text(html);
    // Escaped markup only becomes markup after the first decode.
    if text.contains('<') && text.contains('>') {
        text = fragment_text(&text);
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fragment_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::with_capacity(html.len());
    for node in fragment.tree.root().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_ELEMENTS.contains(&element.name()) => text.push(' '),
            Node::Text(chunk) => {
                let hidden = node.ancestors().any(|ancestor| {
                    ancestor
                        .value()
                        .as_element()
                        .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript"))
                });
                if !hidden {
                    text.push_str(chunk);
                }
            }
            _ => {}
        }
    }
    text
}
