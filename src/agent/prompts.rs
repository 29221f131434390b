use serde_json::{json, Value};

use crate::footnotes::types::{Footnote, ToolCallRecord, Verdict};

pub const SYSTEM_PROMPT: &str = r#"You are a meticulous citation checker. For one footnote at a time you decide whether the sources it cites actually support the claim it is attached to.

### Tools
- `web_search(query)`: find a source when the citation gives no usable URL, or when a link is dead.
- `read_url(url)`: read the main text of a web page. If it reports a PDF, switch to `read_pdf_page`.
- `read_pdf_page(url, page)`: read one page of a PDF. Start near the cited page (e.g. "at 12" or "p. 12") and move outward.
- `get_earlier_footnotes(specific_index)`: resolve "Id.", "ibid." and "supra note N". "Id." refers to the footnote immediately before this one. Omit the index to list every earlier footnote.

### Method
1. Identify every source the citation names. A citation may name several.
2. For each source, locate and read the passage relevant to the claim. Prefer the primary source over summaries of it.
3. Judge each source on what you actually read. Never judge a source you could not access; mark it `accessed: false` and `source_unavailable`.
4. Stop as soon as you have read enough to judge. You have a small, fixed number of turns.

### Verdicts
- `supports`: the source states the claim or directly entails it.
- `partially_supports`: some of the claim is supported, some is missing, overstated or imprecise.
- `does_not_support`: the source is relevant but does not back the claim.
- `contradicts`: the source says the opposite.
- `source_unavailable`: the source could not be found or read.
- `not_applicable`: the footnote is commentary or a cross-reference with no checkable claim.

### Final answer
Reply with ONLY a JSON object:
{"sources": [{"title": "...", "url": "...", "accessed": true, "verdict": "supports", "explanation": "..."}], "overall_verdict": "supports", "confidence": 0.8, "explanation": "..."}
Quote the decisive sentence from each source in its explanation."#;

pub const QUICK_SYSTEM_PROMPT: &str = r#"You are a citation checker working without any tools. Using only the claim, the citation text and your own knowledge of the cited work, judge whether the citation plausibly supports the claim. Be conservative: when you do not know the cited work, answer `source_unavailable`. Reply with ONLY a JSON object of the shape {"sources": [], "overall_verdict": "...", "confidence": 0.0, "explanation": "..."}."#;

/// Opening user turn for one claim.
pub fn claim_prompt(footnote: &Footnote, position: usize, total: usize) -> String {
    format!(
        "Footnote {label} (number {number} of {total} in document order).\n\n\
         Claim:\n{claim}\n\n\
         Citation:\n{citation}\n\n\
         Verify whether the cited source(s) support the claim. If the citation refers back to \
         an earlier footnote, resolve it with get_earlier_footnotes first.",
        label = footnote.display_label,
        number = position + 1,
        total = total,
        claim = footnote.claim_text,
        citation = footnote.citation_text,
    )
}

/// Last, tool-free turn after the iteration cap: everything gathered so far
/// is inlined so a fresh session can decide.
pub fn final_prompt(footnote: &Footnote, trace: &[ToolCallRecord]) -> String {
    let evidence = if trace.is_empty() {
        "(no tool output was gathered)".to_string()
    } else {
        trace
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "--- Evidence {} : {}({}) ---\n{}",
                    i + 1,
                    r.tool_name,
                    r.input,
                    r.output
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!(
        "The investigation budget is exhausted; no more tools can be used.\n\n\
         Claim:\n{}\n\nCitation:\n{}\n\n\
         Here is everything gathered during the investigation:\n\n{}\n\n\
         Based ONLY on this evidence, give your final judgement. Sources you did not read must \
         be marked accessed=false. Reply with ONLY the JSON object.",
        footnote.claim_text, footnote.citation_text, evidence
    )
}

pub fn quick_prompt(footnote: &Footnote) -> String {
    format!(
        "Claim:\n{}\n\nCitation:\n{}\n\nReply with ONLY the JSON object.",
        footnote.claim_text, footnote.citation_text
    )
}

/// Structured-output schema for the final reply.
pub fn output_schema() -> Value {
    let verdicts: Vec<&str> = Verdict::ALL.iter().map(|v| v.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "url": { "type": "string" },
                        "accessed": { "type": "boolean" },
                        "verdict": { "type": "string", "enum": verdicts },
                        "explanation": { "type": "string" }
                    },
                    "required": ["accessed", "verdict", "explanation"]
                }
            },
            "overall_verdict": { "type": "string", "enum": verdicts },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "explanation": { "type": "string" }
        },
        "required": ["sources", "overall_verdict", "confidence", "explanation"]
    })
}
