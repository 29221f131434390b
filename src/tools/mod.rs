pub mod fetch;
pub mod pdf;
pub mod rate_limit;
pub mod search;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::SearchSettings;
use crate::footnotes::VerificationContext;

use fetch::HttpFetcher;
use pdf::PdfCache;
use rate_limit::SearchRateLimiter;
use search::SearchTarget;

pub const WEB_SEARCH: &str = "web_search";
pub const READ_URL: &str = "read_url";
pub const READ_PDF_PAGE: &str = "read_pdf_page";
pub const GET_EARLIER_FOOTNOTES: &str = "get_earlier_footnotes";

/// The only mutable state the tools share: downloaded PDF bytes and the
/// search backoff. Injected once, either process-wide or per document run.
#[derive(Debug)]
pub struct ToolState {
    pub pdf_cache: PdfCache,
    pub rate_limiter: SearchRateLimiter,
}

impl ToolState {
    pub fn new(search: &SearchSettings) -> Self {
        Self {
            pdf_cache: PdfCache::default(),
            rate_limiter: SearchRateLimiter::new(search.base_delay, search.max_delay),
        }
    }
}

/// Per-claim values a tool call may need. Owned by the agent loop and passed
/// down by reference on every call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub document: VerificationContext,
    pub search_api_key: Option<Arc<str>>,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run one tool. Always returns text for the model, never an error.
    async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> String;
}

/// The fixed four-tool dispatcher.
pub struct Toolbelt {
    fetcher: HttpFetcher,
    state: Arc<ToolState>,
    search_api_url: String,
}

impl Toolbelt {
    pub fn new(fetcher: HttpFetcher, state: Arc<ToolState>, search_api_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            state,
            search_api_url: search_api_url.into(),
        }
    }
}

#[async_trait]
impl ToolExecutor for Toolbelt {
    async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> String {
        debug!(tool = name, args = %args, position = ctx.document.position(), "dispatching tool");
        match name {
            WEB_SEARCH => match string_arg(args, "query") {
                Some(query) => {
                    let target = SearchTarget {
                        api_url: &self.search_api_url,
                        api_key: ctx.search_api_key.as_deref(),
                    };
                    search::web_search(&self.fetcher, &self.state.rate_limiter, target, &query)
                        .await
                }
                None => missing_arg(name, "query"),
            },
            READ_URL => match string_arg(args, "url") {
                Some(url) => fetch::read_url(&self.fetcher, &url).await,
                None => missing_arg(name, "url"),
            },
            READ_PDF_PAGE => {
                let Some(url) = string_arg(args, "url") else {
                    return missing_arg(name, "url");
                };
                let Some(page) = int_arg(args, "page") else {
                    return missing_arg(name, "page");
                };
                pdf::read_pdf_page(&self.fetcher, &self.state.pdf_cache, &url, page).await
            }
            GET_EARLIER_FOOTNOTES => match int_arg(args, "specific_index") {
                Some(k) => ctx.document.earlier_footnote(k),
                None => ctx.document.earlier_listing(),
            },
            other => format!(
                "Unknown tool \"{}\". Available tools: {}, {}, {}, {}.",
                other, WEB_SEARCH, READ_URL, READ_PDF_PAGE, GET_EARLIER_FOOTNOTES
            ),
        }
    }
}

fn missing_arg(tool: &str, arg: &str) -> String {
    format!("{} requires the \"{}\" argument.", tool, arg)
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Models sometimes send numbers as strings or floats.
fn int_arg(args: &Value, key: &str) -> Option<i64> {
    match args.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Function definitions in chat-completions `tools` format.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        function(
            WEB_SEARCH,
            "Search the web. Returns up to 5 results with title, URL and snippet.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
        ),
        function(
            READ_URL,
            "Fetch a web page and return its main text content.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute URL to read" }
                },
                "required": ["url"]
            }),
        ),
        function(
            READ_PDF_PAGE,
            "Read the text of one page of a PDF document.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "URL of the PDF" },
                    "page": { "type": "integer", "minimum": 1, "description": "1-based page number" }
                },
                "required": ["url", "page"]
            }),
        ),
        function(
            GET_EARLIER_FOOTNOTES,
            "Look up an earlier footnote of this document, for citations such as \"Id.\" or \
             \"supra note 3\". Omit specific_index to list all earlier footnotes.",
            json!({
                "type": "object",
                "properties": {
                    "specific_index": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "1-based footnote number in document order"
                    }
                }
            }),
        ),
    ]
}

fn function(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}
