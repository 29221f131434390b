pub mod parse;
pub mod prompts;

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::VerifyError;
use crate::footnotes::types::{Footnote, ToolCallRecord, Verification};
use crate::llm::{ChatModel, SessionOptions, ToolResult, Turn};
use crate::tools::fetch::truncate_with_marker;
use crate::tools::{tool_schemas, ToolContext, ToolExecutor};

use parse::{extract_json_object, parse_verification, Evidence};

/// Cap on each tool output kept in the audit trace.
const TRACE_OUTPUT_CHARS: usize = 2_000;

/// Runs the tool-using conversation for one footnote at a time.
pub struct ClaimAgent {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolExecutor>,
    max_iterations: u32,
}

impl ClaimAgent {
    pub fn new(model: Arc<dyn ChatModel>, tools: Arc<dyn ToolExecutor>, max_iterations: u32) -> Self {
        Self {
            model,
            tools,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Investigate the footnote at `ctx.document.position()`.
    ///
    /// Never fails: model errors and unusable answers degrade to a
    /// `source_unavailable` verification carrying whatever trace exists.
    pub async fn verify(&self, ctx: &ToolContext) -> Verification {
        let Some(footnote) = ctx.document.current().cloned() else {
            return Verification::unavailable("", "No footnote at the requested position.");
        };
        let position = ctx.document.position();
        let total = ctx.document.len();

        let mut session = self.model.open_session(SessionOptions {
            system: prompts::SYSTEM_PROMPT.to_string(),
            tools: tool_schemas(),
            response_schema: Some(prompts::output_schema()),
            quick: false,
        });

        let mut turn = Turn::Prompt(prompts::claim_prompt(&footnote, position, total));
        // Full tool outputs; each tool already bounds its own.
        let mut gathered: Vec<ToolCallRecord> = Vec::new();
        let mut last_text: Option<String> = None;
        let mut last_error: Option<VerifyError> = None;

        for iteration in 1..=self.max_iterations {
            let reply = match session.send(turn).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(footnote_id = %footnote.id, iteration, error = %e, "model call failed");
                    last_error = Some(e);
                    break;
                }
            };

            if let Some(text) = &reply.text {
                debug!(
                    footnote_id = %footnote.id,
                    iteration,
                    preview = %preview(text),
                    "model text"
                );
            }

            if reply.tool_calls.is_empty() {
                match reply.text {
                    Some(text) => {
                        info!(footnote_id = %footnote.id, iteration, tools_used = gathered.len(), "claim answered");
                        return parse_verification(&footnote.id, &text, Evidence::Investigated)
                            .with_trace(audit_trace(gathered));
                    }
                    None => {
                        warn!(footnote_id = %footnote.id, iteration, "empty model reply");
                        break;
                    }
                }
            }

            last_text = reply.text;
            debug!(
                footnote_id = %footnote.id,
                iteration,
                tools = ?reply.tool_calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "executing tool calls"
            );

            // Calls from one turn are independent reads.
            let outputs = join_all(
                reply
                    .tool_calls
                    .iter()
                    .map(|call| self.tools.execute(&call.name, &call.arguments, ctx)),
            )
            .await;

            let mut results = Vec::with_capacity(outputs.len());
            for (call, output) in reply.tool_calls.into_iter().zip(outputs) {
                results.push(ToolResult {
                    call_id: call.id,
                    name: call.name.clone(),
                    output: output.clone(),
                });
                gathered.push(ToolCallRecord {
                    tool_name: call.name,
                    input: call.arguments,
                    output,
                });
            }
            turn = Turn::ToolResults(results);
        }

        // Text that arrived alongside tool calls may already hold the answer.
        if let Some(text) = last_text.filter(|t| extract_json_object(t).is_some()) {
            return parse_verification(&footnote.id, &text, Evidence::Investigated)
                .with_trace(audit_trace(gathered));
        }

        warn!(
            footnote_id = %footnote.id,
            tools_used = gathered.len(),
            model_failed = last_error.is_some(),
            "no answer within iteration cap, asking for a final judgement"
        );
        self.final_judgement(&footnote, gathered, last_error).await
    }

    /// One tool-free turn in a fresh session with all gathered evidence inlined.
    async fn final_judgement(
        &self,
        footnote: &Footnote,
        gathered: Vec<ToolCallRecord>,
        earlier_error: Option<VerifyError>,
    ) -> Verification {
        let mut session = self.model.open_session(SessionOptions {
            system: prompts::SYSTEM_PROMPT.to_string(),
            tools: Vec::new(),
            response_schema: Some(prompts::output_schema()),
            quick: false,
        });
        let prompt = prompts::final_prompt(footnote, &gathered);
        let trace = audit_trace(gathered);

        match session.send(Turn::Prompt(prompt)).await {
            Ok(reply) => match reply.text {
                Some(text) => {
                    parse_verification(&footnote.id, &text, Evidence::Investigated).with_trace(trace)
                }
                None => Verification::unavailable(
                    &footnote.id,
                    format!(
                        "No verdict after {} iterations and a final tool-free turn.",
                        self.max_iterations
                    ),
                )
                .with_trace(trace),
            },
            Err(e) => {
                let reason = match earlier_error {
                    Some(first) => format!("Model failed: {}; final turn failed: {}", first, e),
                    None => format!("Final turn failed: {}", e),
                };
                Verification::unavailable(&footnote.id, reason).with_trace(trace)
            }
        }
    }

    /// Cheap fallback: one call with only the citation text and no tools.
    pub async fn quick_verify(&self, footnote: &Footnote) -> Result<Verification, VerifyError> {
        let mut session = self.model.open_session(SessionOptions {
            system: prompts::QUICK_SYSTEM_PROMPT.to_string(),
            tools: Vec::new(),
            response_schema: Some(prompts::output_schema()),
            quick: true,
        });
        let reply = session
            .send(Turn::Prompt(prompts::quick_prompt(footnote)))
            .await?;
        let text = reply
            .text
            .ok_or_else(|| VerifyError::Model("quick verify returned no text".to_string()))?;

        let mut verification = parse_verification(&footnote.id, &text, Evidence::CitationOnly);
        verification.explanation = format!(
            "Quick check from the citation text only (full investigation timed out). {}",
            verification.explanation
        );
        Ok(verification)
    }
}

fn audit_trace(gathered: Vec<ToolCallRecord>) -> Vec<ToolCallRecord> {
    gathered
        .into_iter()
        .map(|record| ToolCallRecord {
            output: truncate_with_marker(&record.output, TRACE_OUTPUT_CHARS),
            ..record
        })
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(300).collect()
}
