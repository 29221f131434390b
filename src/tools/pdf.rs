use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use super::fetch::{collapse_whitespace, normalize_url, truncate_with_marker, HttpFetcher};

pub const PDF_CACHE_CAPACITY: usize = 3;
const PDF_PAGE_CHAR_BUDGET: usize = 12_000;
/// Pages with less text than this are probably scanned images.
const SCANNED_PAGE_THRESHOLD: usize = 40;

/// Small FIFO cache of raw PDF bytes keyed by URL, so repeated page requests
/// for the same file do not re-download it.
#[derive(Debug)]
pub struct PdfCache {
    capacity: usize,
    entries: Mutex<VecDeque<(String, Arc<Vec<u8>>)>>,
}

impl Default for PdfCache {
    fn default() -> Self {
        Self::new(PDF_CACHE_CAPACITY)
    }
}

impl PdfCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<Vec<u8>>> {
        self.lock()
            .iter()
            .find(|(k, _)| k == url)
            .map(|(_, bytes)| bytes.clone())
    }

    /// Insert, evicting the oldest entry when full. Re-inserting a cached URL
    /// replaces its bytes without changing its position.
    pub fn insert(&self, url: &str, bytes: Arc<Vec<u8>>) {
        let mut entries = self.lock();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| k == url) {
            slot.1 = bytes;
            return;
        }
        if entries.len() >= self.capacity {
            if let Some((evicted, _)) = entries.pop_front() {
                debug!(url = %evicted, "pdf cache eviction");
            }
        }
        entries.push_back((url.to_string(), bytes));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(String, Arc<Vec<u8>>)>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// `read_pdf_page(url, page)`. Never fails: problems come back as text.
pub async fn read_pdf_page(fetcher: &HttpFetcher, cache: &PdfCache, url: &str, page: i64) -> String {
    if page < 1 {
        return format!(
            "Invalid page number {}. Pages are numbered from 1.",
            page
        );
    }
    let url = match normalize_url(url) {
        Ok(u) => u,
        Err(e) => return format!("Invalid URL \"{}\": {}", url, e),
    };

    let bytes = match cache.get(&url) {
        Some(bytes) => bytes,
        None => match fetcher.fetch_bytes(&url).await {
            Ok(bytes) => {
                let bytes = Arc::new(bytes);
                cache.insert(&url, bytes.clone());
                debug!(url = %url, size = bytes.len(), cached = cache.len(), "pdf downloaded");
                bytes
            }
            Err(e) => return format!("Could not download PDF from {}: {:#}", url, e),
        },
    };

    let page_no = u32::try_from(page).unwrap_or(u32::MAX);
    let extracted = tokio::task::spawn_blocking(move || extract_page_text(&bytes, page_no)).await;
    match extracted {
        Ok(Ok(PageText::OutOfRange { page_count })) => format!(
            "Page {} is out of range: this PDF has {} page{}.",
            page,
            page_count,
            if page_count == 1 { "" } else { "s" }
        ),
        Ok(Ok(PageText::Text { text, page_count })) => {
            info!(url = %url, page, page_count, chars = text.len(), "pdf page read");
            let mut out = format!("PDF page {} of {} ({})\n\n", page, page_count, url);
            let body = collapse_whitespace(&text);
            if body.trim().chars().count() < SCANNED_PAGE_THRESHOLD {
                out.push_str(&body);
                out.push_str(
                    "\n\n[Warning: almost no text was extracted from this page. It is probably a \
                     scanned image; try another page or search for an HTML version.]",
                );
                out
            } else {
                out.push_str(&truncate_with_marker(&body, PDF_PAGE_CHAR_BUDGET));
                out
            }
        }
        Ok(Err(e)) => format!("Could not parse PDF from {}: {:#}", url, e),
        Err(e) => format!("PDF extraction task failed for {}: {}", url, e),
    }
}

#[derive(Debug, PartialEq)]
enum PageText {
    Text { text: String, page_count: usize },
    OutOfRange { page_count: usize },
}

/// Parse only the requested page's text.
fn extract_page_text(bytes: &[u8], page: u32) -> Result<PageText> {
    let doc = lopdf::Document::load_mem(bytes).context("not a readable PDF")?;
    let page_count = doc.get_pages().len();
    if page as usize > page_count {
        return Ok(PageText::OutOfRange { page_count });
    }
    let text = doc
        .extract_text(&[page])
        .map_err(|e| anyhow!("text extraction failed: {}", e))?;
    Ok(PageText::Text { text, page_count })
}
