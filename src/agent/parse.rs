use serde_json::{Map, Value};

use crate::footnotes::types::{SourceResult, Verdict, Verification};

const DEFAULT_CONFIDENCE: f64 = 0.5;
/// How much of an unparseable reply is kept in the explanation.
const RAW_EXCERPT_CHARS: usize = 400;

/// What the model could see when it produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    /// Full tool-using investigation: the verdict is derived from sources.
    Investigated,
    /// Quick Verify: citation text only, so the model's own verdict stands.
    CitationOnly,
}

/// Turn a model's final text into a `Verification`. Never fails; anything
/// unusable becomes `source_unavailable` with confidence 0.
pub fn parse_verification(footnote_id: &str, text: &str, evidence: Evidence) -> Verification {
    let Some(object) = extract_json_object(text) else {
        return Verification::unavailable(
            footnote_id,
            format!("Model reply contained no JSON object. Raw reply: {}", excerpt(text)),
        );
    };

    let sources: Vec<SourceResult> = object
        .get("sources")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_source).collect())
        .unwrap_or_default();

    let stated = object
        .get("overall_verdict")
        .or_else(|| object.get("verdict"))
        .and_then(Value::as_str)
        .and_then(Verdict::parse)
        .unwrap_or(Verdict::SourceUnavailable);

    let verdict = match evidence {
        Evidence::Investigated => aggregate_verdict(&sources, stated),
        Evidence::CitationOnly => stated,
    };

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE);

    let explanation = object
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("No explanation given.")
        .to_string();

    let accessed: Vec<&SourceResult> = sources.iter().filter(|s| s.accessed).collect();
    let source_accessed = !accessed.is_empty();
    let source_url = accessed.iter().find_map(|s| s.url.clone());

    Verification {
        footnote_id: footnote_id.to_string(),
        verdict,
        confidence,
        explanation,
        source_accessed,
        source_url,
        sources: (!sources.is_empty()).then_some(sources),
        trace: None,
    }
}

/// The weakest verdict among accessed sources that carry a support rank.
///
/// With no ranked source the result is `source_unavailable`. A stated
/// `not_applicable` is kept only when no source was listed, or when the
/// accessed ones were themselves judged not applicable.
pub fn aggregate_verdict(sources: &[SourceResult], stated: Verdict) -> Verdict {
    let any_accessed = sources.iter().any(|s| s.accessed);
    let weakest = sources
        .iter()
        .filter(|s| s.accessed)
        .filter_map(|s| s.verdict.support_rank().map(|rank| (rank, s.verdict)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, verdict)| verdict);

    match weakest {
        Some(verdict) => verdict,
        None if stated == Verdict::NotApplicable && (sources.is_empty() || any_accessed) => {
            Verdict::NotApplicable
        }
        None => Verdict::SourceUnavailable,
    }
}

fn parse_source(item: &Value) -> Option<SourceResult> {
    let obj = item.as_object()?;
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some(SourceResult {
        url: text("url"),
        title: text("title"),
        accessed: obj.get("accessed").and_then(Value::as_bool).unwrap_or(false),
        verdict: text("verdict")
            .as_deref()
            .and_then(Verdict::parse)
            .unwrap_or(Verdict::SourceUnavailable),
        explanation: text("explanation").unwrap_or_default(),
    })
}

/// Find the first balanced `{...}` that parses as a JSON object, skipping
/// braces inside string literals. Prose around it is ignored.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            if let Ok(Value::Object(map)) = serde_json::from_str(&text[start..start + end]) {
                return Some(map);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the balanced object starting at `s[0] == '{'`.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "(empty)".to_string();
    }
    let mut out: String = trimmed.chars().take(RAW_EXCERPT_CHARS).collect();
    if trimmed.chars().count() > RAW_EXCERPT_CHARS {
        out.push('…');
    }
    out
}
