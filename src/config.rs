use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::queue::QueueSettings;
use crate::store::Document;

/// Connections beyond the delivery slots: claim polls, the API, migrations.
pub const POOL_HEADROOM: u32 = 10;

#[derive(Parser, Debug, Clone)]
#[command(name = "jobqueue", about = "Job board ingestion and enrichment queue")]
pub struct Config {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Run database migrations on startup
    #[arg(long, env = "RUN_MIGRATIONS", default_value = "true")]
    pub run_migrations: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// JSON file listing the boards to fetch
    #[arg(long, env = "SOURCES_FILE")]
    pub sources_file: Option<PathBuf>,

    /// Bearer token for the management API (unset = open)
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Base URL of an OpenAI-compatible API used for skill extraction
    #[arg(long, env = "LLM_API_URL", default_value = "https://api.openai.com/v1")]
    pub llm_api_url: String,

    /// API key for skill extraction; enrichment is paused without it
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Postgres pool size; defaults to both concurrencies plus headroom
    #[arg(long, env = "DB_MAX_CONNECTIONS")]
    pub db_max_connections: Option<u32>,

    /// Concurrent fetch deliveries
    #[arg(long, env = "FETCH_CONCURRENCY", default_value = "15")]
    pub fetch_concurrency: usize,

    /// Concurrent enrichment deliveries
    #[arg(long, env = "ENRICH_CONCURRENCY", default_value = "50")]
    pub enrich_concurrency: usize,

    /// Enrichment dispatches per second
    #[arg(long, env = "ENRICH_RATE", default_value = "10")]
    pub enrich_rate: f64,

    /// Documents per write batch
    #[arg(long, env = "WRITE_BATCH_SIZE", default_value = "400")]
    pub write_batch_size: usize,

    /// Idle poll interval of the dispatchers, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// A running execution older than this no longer blocks scheduling
    #[arg(long, env = "STALE_EXECUTION_HOURS", default_value = "6")]
    pub stale_execution_hours: i64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Serve the management API and run both dispatchers (default)
    Serve {
        /// Listen address
        #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: String,

        /// Serve HTTP only, without dispatchers
        #[arg(long)]
        no_workers: bool,
    },
    /// Run the dispatchers without the HTTP surface
    Work,
    /// Create one batch of fetch tasks and exit (for cron)
    CreateTasks {
        /// Create tasks even if an execution is still running
        #[arg(long)]
        force: bool,
    },
}

impl Config {
    /// Resolve the command, defaulting to Serve if none specified.
    pub fn resolved_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve {
            listen_addr: std::env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            no_workers: false,
        })
    }

    pub fn fetch_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrent_dispatches: self.fetch_concurrency,
            ..QueueSettings::fetch()
        }
    }

    pub fn enrichment_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrent_dispatches: self.enrich_concurrency,
            max_dispatches_per_second: Some(self.enrich_rate).filter(|rate| *rate > 0.0),
            ..QueueSettings::enrichment()
        }
    }

    /// Every in-flight delivery holds at most one connection at a time, so the
    /// default pool covers both dispatchers plus their claim polls and the API.
    pub fn pool_size(&self) -> u32 {
        self.db_max_connections.filter(|n| *n > 0).unwrap_or_else(|| {
            let deliveries = self.fetch_concurrency + self.enrich_concurrency;
            u32::try_from(deliveries)
                .unwrap_or(u32::MAX)
                .saturating_add(POOL_HEADROOM)
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn stale_execution_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_execution_hours.max(1))
    }

    pub fn load_sources(&self) -> anyhow::Result<Vec<Source>> {
        match &self.sources_file {
            Some(path) => load_sources(path),
            None => {
                tracing::warn!("No SOURCES_FILE configured; scheduled runs will create no tasks");
                Ok(Vec::new())
            }
        }
    }
}

/// One board to fetch: a provider tag, the company's slug on that provider,
/// and provider-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub provider: String,
    pub company: String,
    #[serde(default)]
    pub params: Document,
}

impl Source {
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.trim().is_empty() {
            return Err(format!("Source for '{}' has no provider", self.company));
        }
        if self.company.trim().is_empty() {
            return Err(format!("Source for provider '{}' has no company", self.provider));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourcesFile {
    List(Vec<Source>),
    Wrapped { sources: Vec<Source> },
}

pub fn load_sources(path: &Path) -> anyhow::Result<Vec<Source>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sources file {}", path.display()))?;
    let sources =
        parse_sources(&raw).with_context(|| format!("Invalid sources file {}", path.display()))?;
    tracing::info!("Loaded {} sources from {}", sources.len(), path.display());
    Ok(sources)
}

/// Accepts either a bare array of sources or `{"sources": [...]}`.
pub fn parse_sources(raw: &str) -> anyhow::Result<Vec<Source>> {
    let sources = match serde_json::from_str(raw)? {
        SourcesFile::List(sources) | SourcesFile::Wrapped { sources } => sources,
    };
    for source in &sources {
        source.validate().map_err(anyhow::Error::msg)?;
    }
    Ok(sources)
}
