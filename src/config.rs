use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Chat-completions endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub quick_model: String,
    /// Required: a run without it fails the whole document up front.
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Knobs for the per-claim loop and the worker pool.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_iterations: u32,
    pub concurrency: usize,
    pub claim_timeout: Duration,
    pub quick_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            concurrency: 5,
            claim_timeout: Duration::from_secs(180),
            quick_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    /// When set, progress snapshots live in a SQL table instead of the KV slot.
    pub progress_database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub llm: LlmSettings,
    pub search: SearchSettings,
    pub run: RunSettings,
    pub storage: StorageSettings,
    /// Share the PDF cache and search backoff across every document run.
    pub share_tool_state: bool,
}

impl VerifierConfig {
    pub fn from_env() -> Result<Self> {
        let model = var_or("LLM_MODEL", "gpt-4o-mini");
        let llm = LlmSettings {
            base_url: var_or("LLM_BASE_URL", "https://api.openai.com/v1"),
            quick_model: dotenv::var("LLM_QUICK_MODEL").unwrap_or_else(|_| model.clone()),
            model,
            api_key: non_empty("LLM_API_KEY"),
            request_timeout: Duration::from_secs(parse_or("LLM_REQUEST_TIMEOUT_SECS", 90)?),
        };

        let search = SearchSettings {
            api_url: var_or("SEARCH_API_URL", "https://google.serper.dev/search"),
            api_key: non_empty("SEARCH_API_KEY"),
            base_delay: Duration::from_millis(parse_or("SEARCH_BASE_DELAY_MS", 1_000)?),
            max_delay: Duration::from_millis(parse_or("SEARCH_MAX_DELAY_MS", 60_000)?),
        };

        let defaults = RunSettings::default();
        let run = RunSettings {
            max_iterations: parse_or("AGENT_MAX_ITERATIONS", defaults.max_iterations)?,
            concurrency: parse_or("VERIFY_CONCURRENCY", defaults.concurrency)?.max(1),
            claim_timeout: Duration::from_secs(parse_or(
                "CLAIM_TIMEOUT_SECS",
                defaults.claim_timeout.as_secs(),
            )?),
            quick_timeout: Duration::from_secs(parse_or(
                "QUICK_VERIFY_TIMEOUT_SECS",
                defaults.quick_timeout.as_secs(),
            )?),
        };

        let storage = StorageSettings {
            data_dir: PathBuf::from(var_or("DATA_DIR", "./data/store")),
            progress_database_url: non_empty("PROGRESS_DATABASE_URL"),
        };

        Ok(Self {
            llm,
            search,
            run,
            storage,
            share_tool_state: parse_or("SHARE_TOOL_STATE", true)?,
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    dotenv::var(name).unwrap_or_else(|_| default.to_string())
}

fn non_empty(name: &str) -> Option<String> {
    dotenv::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}
