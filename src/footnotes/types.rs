use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One footnote as produced by ingestion. Read-only input to verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Footnote {
    pub id: String,
    /// Monotonic position in the document, used to decide which footnotes
    /// a cross-reference may see.
    pub document_order: u32,
    /// The label printed in the document, e.g. "12" or "*".
    pub display_label: String,
    pub claim_text: String,
    pub citation_text: String,
}

/// How well a source supports a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Supports,
    PartiallySupports,
    DoesNotSupport,
    Contradicts,
    SourceUnavailable,
    NotApplicable,
}

impl Verdict {
    pub const ALL: [Verdict; 6] = [
        Verdict::Supports,
        Verdict::PartiallySupports,
        Verdict::DoesNotSupport,
        Verdict::Contradicts,
        Verdict::SourceUnavailable,
        Verdict::NotApplicable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Supports => "supports",
            Verdict::PartiallySupports => "partially_supports",
            Verdict::DoesNotSupport => "does_not_support",
            Verdict::Contradicts => "contradicts",
            Verdict::SourceUnavailable => "source_unavailable",
            Verdict::NotApplicable => "not_applicable",
        }
    }

    /// Lenient parse of a model-provided label. Unknown labels yield `None`.
    pub fn parse(label: &str) -> Option<Verdict> {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        Verdict::ALL
            .into_iter()
            .find(|v| v.as_str() == normalized)
    }

    /// Rank used when combining several accessed sources; lower is weaker.
    /// Verdicts that say nothing about support have no rank.
    pub fn support_rank(&self) -> Option<u8> {
        match self {
            Verdict::Contradicts => Some(0),
            Verdict::DoesNotSupport => Some(1),
            Verdict::PartiallySupports => Some(2),
            Verdict::Supports => Some(3),
            Verdict::SourceUnavailable | Verdict::NotApplicable => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry for one tool invocation made while investigating a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: String,
}

/// Verdict for a single source named by a citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub accessed: bool,
    pub verdict: Verdict,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub footnote_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub explanation: String,
    pub source_accessed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<ToolCallRecord>>,
}

impl Verification {
    /// Placeholder used whenever no usable verdict could be produced.
    pub fn unavailable(footnote_id: &str, explanation: impl Into<String>) -> Self {
        Self {
            footnote_id: footnote_id.to_string(),
            verdict: Verdict::SourceUnavailable,
            confidence: 0.0,
            explanation: explanation.into(),
            source_accessed: false,
            source_url: None,
            sources: None,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Vec<ToolCallRecord>) -> Self {
        self.trace = (!trace.is_empty()).then_some(trace);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Processing,
    Complete,
    Failed,
}

/// The single current progress value for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub status: RunStatus,
    pub footnote_count: usize,
    pub verifications: Vec<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stamped by the progress actor when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    pub fn processing(footnote_count: usize, verifications: Vec<Verification>) -> Self {
        Self {
            status: RunStatus::Processing,
            footnote_count,
            verifications,
            error: None,
            updated_at: None,
        }
    }

    pub fn complete(verifications: Vec<Verification>) -> Self {
        Self {
            status: RunStatus::Complete,
            footnote_count: verifications.len(),
            verifications,
            error: None,
            updated_at: None,
        }
    }

    pub fn failed(footnote_count: usize, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            footnote_count,
            verifications: Vec::new(),
            error: Some(error.into()),
            updated_at: None,
        }
    }
}

/// Final per-document output handed to the CRUD layer and the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResult {
    pub status: RunStatus,
    pub verifications: Vec<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
