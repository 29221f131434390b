use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{redirect, StatusCode};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

const READ_URL_CHAR_BUDGET: usize = 15_000;
/// Below this many characters the page is flagged as low-content.
const MIN_CONTENT_CHARS: usize = 200;
const MAX_BODY_BYTES: usize = 40 * 1024 * 1024;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Content regions tried in order; the first with enough text wins.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    "#content",
    "#main-content",
    ".article-body",
    ".entry-content",
    ".post-content",
    ".content",
];

/// Markup removed before any text is extracted.
const NOISE_SELECTOR: &str = "script, style, noscript, template, svg, iframe, form, nav, header, \
     footer, aside, [role=\"navigation\"], [role=\"banner\"], [role=\"contentinfo\"], \
     [aria-hidden=\"true\"], .advertisement, .ad, .ads, .sidebar, .cookie-banner, .share, .social";

/// HTTP client shared by `read_url` and `read_pdf_page`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/pdf,*/*;q=0.8",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );

        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .redirect(redirect::Policy::limited(10))
            .timeout(timeout)
            .build()
            .context("Failed to create fetch client")?;
        Ok(Self { client, timeout })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Download raw bytes, failing on non-2xx.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await.map_err(|e| self.describe(e))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("{}", status_diagnostic(status, url));
        }
        let body = resp.bytes().await.context("Failed to read response body")?;
        if body.len() > MAX_BODY_BYTES {
            bail!("response is too large ({} bytes)", body.len());
        }
        Ok(body.to_vec())
    }

    fn describe(&self, e: reqwest::Error) -> anyhow::Error {
        if e.is_timeout() {
            anyhow!("timed out after {}s", self.timeout.as_secs())
        } else if e.is_redirect() {
            anyhow!("too many redirects")
        } else if e.is_connect() {
            anyhow!("could not connect: {}", e)
        } else {
            anyhow!("request failed: {}", e)
        }
    }
}

/// `read_url(url)`. Never fails: every problem is described in the returned text.
pub async fn read_url(fetcher: &HttpFetcher, raw_url: &str) -> String {
    let url = match normalize_url(raw_url) {
        Ok(u) => u,
        Err(e) => return format!("Invalid URL \"{}\": {}", raw_url, e),
    };

    let resp = match fetcher.client().get(&url).send().await {
        Ok(resp) => resp,
        Err(e) => return format!("Could not fetch {}: {}", url, fetcher.describe(e)),
    };

    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        debug!(url = %url, status = status.as_u16(), "read_url non-success");
        return status_diagnostic(status, &url);
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    if content_type.contains("application/pdf") {
        return pdf_directive(&final_url);
    }

    let body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => return format!("Could not read the body of {}: {}", url, fetcher.describe(e)),
    };
    if body.starts_with(b"%PDF-") {
        return pdf_directive(&final_url);
    }
    let raw = String::from_utf8_lossy(&body[..body.len().min(MAX_BODY_BYTES)]);

    let looks_html = content_type.contains("html")
        || (content_type.is_empty() && raw.trim_start().starts_with('<'));
    let (title, text) = if looks_html {
        extract_readable(&raw)
    } else {
        (None, collapse_whitespace(&raw))
    };

    info!(url = %final_url, chars = text.chars().count(), "read_url extracted");
    render_page(&final_url, title.as_deref(), &text)
}

fn render_page(url: &str, title: Option<&str>, text: &str) -> String {
    let mut out = String::new();
    if let Some(title) = title {
        out.push_str(&format!("Title: {}\n", title));
    }
    out.push_str(&format!("URL: {}\n\n", url));
    out.push_str(&truncate_with_marker(text, READ_URL_CHAR_BUDGET));

    let chars = text.trim().chars().count();
    if chars < MIN_CONTENT_CHARS {
        out.push_str(&format!(
            "\n\n[Warning: only {} characters of readable text were found. The page may need \
             JavaScript, sit behind a paywall, or be an index page. Try web_search to locate \
             another copy of this source.]",
            chars
        ));
    }
    out
}

fn pdf_directive(url: &str) -> String {
    format!(
        "{} is a PDF document. Do not use read_url for it: call read_pdf_page with this URL and a \
         page number (starting at 1) to read its text.",
        url
    )
}

fn status_diagnostic(status: StatusCode, url: &str) -> String {
    match status.as_u16() {
        401 | 403 => format!(
            "Access denied (HTTP {}) for {}. The source is likely paywalled or blocks automated \
             access. Try web_search for an open copy (preprint, archive, or official summary).",
            status.as_u16(),
            url
        ),
        404 => format!(
            "Page not found (HTTP 404) at {}. The link is likely stale or the page has moved. \
             Try web_search using the source's title or author.",
            url
        ),
        code => format!(
            "The server returned HTTP {} for {}. Try again later or look for another copy via \
             web_search.",
            code, url
        ),
    }
}

/// Add a scheme when missing and reject anything that is not http(s).
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')'));
    if trimmed.is_empty() {
        bail!("empty URL");
    }
    let with_scheme = if trimmed.starts_with("//") {
        format!("https:{}", trimmed)
    } else if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = Url::parse(&with_scheme).context("not a valid URL")?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => bail!("unsupported scheme {:?}", other),
    }
}

/// Pull the title and main readable text out of an HTML page.
pub fn extract_readable(html: &str) -> (Option<String>, String) {
    let mut document = Html::parse_document(html);
    let title = extract_title(&document);

    if let Ok(noise) = Selector::parse(NOISE_SELECTOR) {
        let ids: Vec<_> = document.select(&noise).map(|e| e.id()).collect();
        for id in ids {
            if let Some(mut node) = document.tree.get_mut(id) {
                node.detach();
            }
        }
    }

    let region = CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| {
            document
                .select(&sel)
                .find(|el| visible_chars(el) >= MIN_CONTENT_CHARS)
        })
        .or_else(|| {
            Selector::parse("body")
                .ok()
                .and_then(|sel| document.select(&sel).next())
        });

    let text = match region {
        Some(el) => render_region(el),
        None => collapse_whitespace(&document.root_element().text().collect::<Vec<_>>().join(" ")),
    };
    (title, text)
}

fn extract_title(document: &Html) -> Option<String> {
    let from = |selector: &str, attr: Option<&str>| -> Option<String> {
        let sel = Selector::parse(selector).ok()?;
        let el = document.select(&sel).next()?;
        let raw = match attr {
            Some(a) => el.value().attr(a)?.to_string(),
            None => el.text().collect::<Vec<_>>().join(" "),
        };
        let t = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        (!t.is_empty()).then_some(t)
    };
    from("meta[property=\"og:title\"]", Some("content"))
        .or_else(|| from("title", None))
        .or_else(|| from("h1", None))
}

fn visible_chars(el: &ElementRef<'_>) -> usize {
    el.text().map(|t| t.trim().chars().count()).sum()
}

fn render_region(el: ElementRef<'_>) -> String {
    let fragment = el.html();
    match html2text::from_read(fragment.as_bytes(), 120) {
        Ok(text) => collapse_whitespace(&text),
        Err(_) => collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")),
    }
}

/// Collapse runs of spaces within lines and runs of blank lines.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank = false;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            if !blank && !out.is_empty() {
                out.push(String::new());
            }
            blank = true;
        } else {
            out.push(line);
            blank = false;
        }
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// Cut `text` to `budget` characters, saying so when anything was dropped.
pub fn truncate_with_marker(text: &str, budget: usize) -> String {
    let total = text.chars().count();
    if total <= budget {
        return text.to_string();
    }
    let kept: String = text.chars().take(budget).collect();
    format!(
        "{}\n\n[... truncated: showing {} of {} characters]",
        kept, budget, total
    )
}
