use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use tracing::{debug, info};

use super::fetch::{truncate_with_marker, HttpFetcher};
use super::rate_limit::SearchRateLimiter;

const MAX_RESULTS: usize = 5;
const SEARCH_OUTPUT_BUDGET: usize = 4_000;

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<SearchItem>,
}

/// Where and how to reach the search API for one call.
#[derive(Debug, Clone, Copy)]
pub struct SearchTarget<'a> {
    pub api_url: &'a str,
    pub api_key: Option<&'a str>,
}

/// `web_search(query)`. Never fails: errors and throttling come back as text.
pub async fn web_search(
    fetcher: &HttpFetcher,
    limiter: &SearchRateLimiter,
    target: SearchTarget<'_>,
    query: &str,
) -> String {
    let query = query.trim();
    if query.is_empty() {
        return "web_search needs a non-empty query.".to_string();
    }
    let Some(api_key) = target.api_key else {
        return "Web search is not configured (no search API key). Use read_url or \
                read_pdf_page with URLs from the citation instead."
            .to_string();
    };

    limiter.wait().await;

    let resp = fetcher
        .client()
        .post(target.api_url)
        .header("X-API-KEY", api_key)
        .json(&serde_json::json!({ "q": query, "num": MAX_RESULTS }))
        .send()
        .await;
    let resp = match resp {
        Ok(r) => r,
        Err(e) => return format!("Search request failed: {}", e),
    };

    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        limiter.on_429(retry_after.as_deref());
        return format!(
            "Search is rate limited (HTTP 429); further searches are delayed by about {}s. \
             Consider reading a URL you already have instead of searching again.",
            limiter.backoff().as_secs().max(1)
        );
    }
    if !status.is_success() {
        return format!("Search failed with HTTP {}.", status.as_u16());
    }

    let parsed: SearchResponse = match resp.json().await {
        Ok(p) => p,
        Err(e) => return format!("Search returned an unreadable response: {}", e),
    };
    limiter.on_success();

    let results: Vec<SearchItem> = parsed
        .organic
        .into_iter()
        .filter(|item| !item.link.is_empty())
        .take(MAX_RESULTS)
        .collect();
    info!(query, results = results.len(), "web_search complete");
    debug!(backoff_ms = limiter.backoff().as_millis() as u64, "search limiter after success");

    format_results(query, &results)
}

fn format_results(query: &str, results: &[SearchItem]) -> String {
    if results.is_empty() {
        return format!("No results found for \"{}\".", query);
    }
    let mut out = format!("Search results for \"{}\":\n", query);
    for (i, item) in results.iter().enumerate() {
        let title = if item.title.is_empty() {
            "(untitled)"
        } else {
            item.title.as_str()
        };
        out.push_str(&format!(
            "\n{}. {}\n   URL: {}\n   {}\n",
            i + 1,
            title,
            item.link,
            item.snippet.trim()
        ));
    }
    truncate_with_marker(&out, SEARCH_OUTPUT_BUDGET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn limiter() -> SearchRateLimiter {
        SearchRateLimiter::new(Duration::from_millis(1_000), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_formats_at_most_five_results() {
        let server = MockServer::start().await;
        let organic: Vec<_> = (1..=8)
            .map(|i| {
                serde_json::json!({
                    "title": format!("Result {}", i),
                    "link": format!("https://example.com/{}", i),
                    "snippet": format!("Snippet {}", i),
                })
            })
            .collect();
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("X-API-KEY", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "organic": organic })),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/search", server.uri());
        let target = SearchTarget {
            api_url: &url,
            api_key: Some("secret"),
        };
        let out = web_search(&fetcher, &limiter(), target, "court ruling 1994").await;
        assert!(out.starts_with("Search results for \"court ruling 1994\""));
        assert!(out.contains("5. Result 5"));
        assert!(out.contains("URL: https://example.com/5"));
        assert!(!out.contains("Result 6"));
    }

    #[tokio::test]
    async fn test_429_feeds_retry_after_to_limiter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let rl = limiter();
        let url = format!("{}/search", server.uri());
        let target = SearchTarget {
            api_url: &url,
            api_key: Some("k"),
        };
        let out = web_search(&fetcher, &rl, target, "anything").await;
        assert!(out.contains("rate limited"));
        assert_eq!(rl.backoff(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_errors_are_strings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/search", server.uri());
        let rl = limiter();
        let failed = web_search(
            &fetcher,
            &rl,
            SearchTarget {
                api_url: &url,
                api_key: Some("k"),
            },
            "q",
        )
        .await;
        assert_eq!(failed, "Search failed with HTTP 500.");

        let unconfigured = web_search(
            &fetcher,
            &rl,
            SearchTarget {
                api_url: &url,
                api_key: None,
            },
            "q",
        )
        .await;
        assert!(unconfigured.contains("not configured"));
    }

    #[test]
    fn test_empty_results_message() {
        assert_eq!(format_results("x", &[]), "No results found for \"x\".");
    }
}
