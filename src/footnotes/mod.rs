pub mod types;

use std::sync::Arc;

use types::Footnote;

/// Max footnotes listed when the agent asks for every earlier footnote.
const EARLIER_LISTING_LIMIT: usize = 40;
/// Per-entry cap on claim/citation text in the listing.
const LISTING_TEXT_CHARS: usize = 160;

/// Sort footnotes by document order. Ties keep their ingestion order.
pub fn in_document_order(mut footnotes: Vec<Footnote>) -> Vec<Footnote> {
    footnotes.sort_by_key(|f| f.document_order);
    footnotes
}

/// Document context for one claim's agent loop.
///
/// Every claim of a run shares the same ordered list; only `position` differs.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    footnotes: Arc<[Footnote]>,
    position: usize,
}

impl VerificationContext {
    pub fn new(footnotes: Arc<[Footnote]>, position: usize) -> Self {
        Self {
            footnotes,
            position,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Footnotes in the whole document.
    pub fn len(&self) -> usize {
        self.footnotes.len()
    }

    pub fn current(&self) -> Option<&Footnote> {
        self.footnotes.get(self.position)
    }

    /// Resolve a 1-based footnote number for a cross-reference.
    ///
    /// Valid iff `1 <= k <= position + 1`; anything further ahead is refused
    /// with a message the model can read.
    pub fn earlier_footnote(&self, k: i64) -> String {
        if k < 1 {
            return format!(
                "Invalid footnote number {}. Footnotes are numbered from 1 in document order.",
                k
            );
        }
        let limit = self.position + 1;
        if k as u64 > limit as u64 {
            return format!(
                "Footnote {} is not available: only footnotes 1 through {} (the current footnote and \
                 those before it) can be consulted. Cross-references cannot point forward.",
                k, limit
            );
        }
        match self.footnotes.get(k as usize - 1) {
            Some(f) => format!(
                "Footnote {} (label \"{}\")\nClaim: {}\nCitation: {}",
                k, f.display_label, f.claim_text, f.citation_text
            ),
            None => format!("Footnote {} does not exist in this document.", k),
        }
    }

    /// Compact listing of every footnote before the current one, newest last.
    pub fn earlier_listing(&self) -> String {
        if self.position == 0 {
            return "There are no earlier footnotes: this is the first footnote in the document."
                .to_string();
        }
        let end = self.position.min(self.footnotes.len());
        let start = end.saturating_sub(EARLIER_LISTING_LIMIT);
        let mut lines = Vec::with_capacity(end - start + 1);
        if start > 0 {
            lines.push(format!(
                "({} older footnotes omitted; request them by number.)",
                start
            ));
        }
        for (idx, f) in self.footnotes[start..end].iter().enumerate() {
            lines.push(format!(
                "[{}] label \"{}\" | claim: {} | citation: {}",
                start + idx + 1,
                f.display_label,
                clip(&f.claim_text, LISTING_TEXT_CHARS),
                clip(&f.citation_text, LISTING_TEXT_CHARS)
            ));
        }
        lines.join("\n")
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
pub(crate) fn sample_footnotes(n: usize) -> Vec<Footnote> {
    (1..=n)
        .map(|i| Footnote {
            id: format!("fn-{}", i),
            document_order: i as u32,
            display_label: i.to_string(),
            claim_text: format!("Claim number {}", i),
            citation_text: format!("Citation number {}", i),
        })
        .collect()
}
