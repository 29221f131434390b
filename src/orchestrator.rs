use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::agent::ClaimAgent;
use crate::config::RunSettings;
use crate::footnotes::types::{Footnote, Verification};
use crate::footnotes::{in_document_order, VerificationContext};
use crate::tools::ToolContext;

/// Receives the completed verifications, in document order, after every
/// completion. Calls are made one at a time and never overlap.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, completed: Vec<Verification>, total: usize);
}

/// Sink for callers that only want the final result.
#[cfg(test)]
pub struct NoProgress;

#[cfg(test)]
#[async_trait]
impl ProgressSink for NoProgress {
    async fn on_progress(&self, _completed: Vec<Verification>, _total: usize) {}
}

/// Runs one `ClaimAgent` per footnote on a bounded worker pool.
pub struct Orchestrator {
    agent: Arc<ClaimAgent>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(agent: Arc<ClaimAgent>, settings: RunSettings) -> Self {
        Self { agent, settings }
    }

    /// Verify every footnote. The result has exactly one verification per
    /// footnote, in document order, whatever order the runs finish in.
    pub async fn run(
        &self,
        footnotes: Vec<Footnote>,
        search_api_key: Option<Arc<str>>,
        sink: &dyn ProgressSink,
    ) -> Vec<Verification> {
        let ordered: Arc<[Footnote]> = in_document_order(footnotes).into();
        let total = ordered.len();
        if total == 0 {
            info!("no footnotes to verify");
            return Vec::new();
        }

        let workers = self.settings.concurrency.clamp(1, total);
        info!(total, workers, "starting verification run");

        let next = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Verification)>();
        let mut pool = JoinSet::new();

        for _ in 0..workers {
            let next = next.clone();
            let tx = tx.clone();
            let ordered = ordered.clone();
            let agent = self.agent.clone();
            let settings = self.settings.clone();
            let search_api_key = search_api_key.clone();

            pool.spawn(async move {
                loop {
                    let position = next.fetch_add(1, Ordering::SeqCst);
                    if position >= ordered.len() {
                        break;
                    }
                    let ctx = ToolContext {
                        document: VerificationContext::new(ordered.clone(), position),
                        search_api_key: search_api_key.clone(),
                    };
                    // A panicking run costs only its own footnote; the worker keeps pulling.
                    let verification = match AssertUnwindSafe(verify_with_fallback(&agent, &settings, &ctx))
                        .catch_unwind()
                        .await
                    {
                        Ok(verification) => verification,
                        Err(panic) => {
                            let footnote_id = &ordered[position].id;
                            error!(
                                footnote_id = %footnote_id,
                                reason = panic_message(panic.as_ref()),
                                "verification run panicked"
                            );
                            Verification::unavailable(
                                footnote_id,
                                "Verification failed unexpectedly while checking this footnote.",
                            )
                        }
                    };
                    if tx.send((position, verification)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<Verification>> = vec![None; total];
        let mut done = 0usize;
        while let Some((position, verification)) = rx.recv().await {
            if slots[position].is_none() {
                done += 1;
            }
            info!(
                done,
                total,
                footnote_id = %ordered[position].id,
                verdict = %verification.verdict,
                "footnote verified"
            );
            slots[position] = Some(verification);
            sink.on_progress(completed_in_order(&slots), total).await;
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "verification worker failed");
            }
        }

        slots
            .into_iter()
            .zip(ordered.iter())
            .map(|(slot, footnote)| {
                slot.unwrap_or_else(|| {
                    Verification::unavailable(&footnote.id, "Verification task ended without a result.")
                })
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn completed_in_order(slots: &[Option<Verification>]) -> Vec<Verification> {
    slots.iter().flatten().cloned().collect()
}

/// Primary run under its budget; on timeout, Quick Verify under its own.
async fn verify_with_fallback(
    agent: &ClaimAgent,
    settings: &RunSettings,
    ctx: &ToolContext,
) -> Verification {
    let Some(footnote) = ctx.document.current() else {
        return Verification::unavailable("", "No footnote at the requested position.");
    };

    match timeout(settings.claim_timeout, agent.verify(ctx)).await {
        Ok(verification) => verification,
        Err(_) => {
            warn!(
                footnote_id = %footnote.id,
                timeout_secs = settings.claim_timeout.as_secs(),
                "investigation timed out, running quick verify"
            );
            match timeout(settings.quick_timeout, agent.quick_verify(footnote)).await {
                Ok(Ok(verification)) => verification,
                Ok(Err(e)) => {
                    warn!(footnote_id = %footnote.id, error = %e, "quick verify failed");
                    Verification::unavailable(
                        &footnote.id,
                        format!(
                            "Investigation timed out after {}s and the quick check failed: {}",
                            settings.claim_timeout.as_secs(),
                            e
                        ),
                    )
                }
                Err(_) => {
                    warn!(footnote_id = %footnote.id, "quick verify timed out");
                    Verification::unavailable(
                        &footnote.id,
                        format!(
                            "Investigation timed out after {}s and the quick check timed out after {}s.",
                            settings.claim_timeout.as_secs(),
                            settings.quick_timeout.as_secs()
                        ),
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifyError;
    use crate::footnotes::sample_footnotes;
    use crate::footnotes::types::Verdict;
    use crate::llm::SessionOptions;
    use crate::testing::{first_prompt, text_reply, tool_reply, verdict_json, ScriptedModel, ScriptedTools};
    use crate::tools::ToolExecutor;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// One tool turn, then a verdict naming the claim it was asked about.
    fn investigating_model() -> ScriptedModel {
        ScriptedModel::new(|options: &SessionOptions, turns| {
            let claim = first_prompt(turns)
                .lines()
                .find(|l| l.starts_with("Claim number"))
                .unwrap_or("unknown")
                .to_string();
            if options.quick {
                return Ok(text_reply(format!(
                    r#"{{"sources": [], "overall_verdict": "supports", "confidence": 0.3, "explanation": "quick {}"}}"#,
                    claim
                )));
            }
            Ok(match turns.len() {
                1 => tool_reply(&[("read_url", json!({ "url": "https://src.example" }))]),
                _ => text_reply(verdict_json("supports", &format!("https://src.example/{}", claim))),
            })
        })
    }

    fn settings(concurrency: usize) -> RunSettings {
        RunSettings {
            concurrency,
            ..RunSettings::default()
        }
    }

    fn orchestrator(model: ScriptedModel, tools: Arc<dyn ToolExecutor>, concurrency: usize) -> Orchestrator {
        let agent = ClaimAgent::new(Arc::new(model), tools, 6);
        Orchestrator::new(Arc::new(agent), settings(concurrency))
    }

    /// Later footnotes finish first; tracks peak parallelism.
    #[derive(Default)]
    struct SlowEarlyTools {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for SlowEarlyTools {
        async fn execute(&self, _: &str, _: &Value, ctx: &ToolContext) -> String {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let remaining = ctx.document.len() - ctx.document.position();
            tokio::time::sleep(Duration::from_millis(100 * remaining as u64)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            "page text".to_string()
        }
    }

    #[derive(Default)]
    struct Recorder {
        counts: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn on_progress(&self, completed: Vec<Verification>, total: usize) {
            assert!(completed.len() <= total);
            self.counts.lock().unwrap().push(completed.len());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_document_order_not_completion_order() {
        let tools = Arc::new(SlowEarlyTools::default());
        let orch = orchestrator(investigating_model(), tools.clone(), 3);
        let recorder = Recorder::default();

        let results = orch.run(sample_footnotes(12), None, &recorder).await;

        assert_eq!(results.len(), 12);
        let ids: Vec<&str> = results.iter().map(|v| v.footnote_id.as_str()).collect();
        let expected: Vec<String> = (1..=12).map(|i| format!("fn-{}", i)).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(
            results[4].source_url.as_deref(),
            Some("https://src.example/Claim number 5")
        );
        assert!(tools.peak.load(Ordering::SeqCst) <= 3);

        let counts = recorder.counts.lock().unwrap().clone();
        assert_eq!(counts, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_is_sorted_before_running() {
        let mut notes = sample_footnotes(4);
        notes.reverse();
        let orch = orchestrator(investigating_model(), Arc::new(ScriptedTools::default()), 2);

        let results = orch.run(notes, None, &NoProgress).await;
        let ids: Vec<&str> = results.iter().map(|v| v.footnote_id.as_str()).collect();
        assert_eq!(ids, vec!["fn-1", "fn-2", "fn-3", "fn-4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_claim_gets_quick_verify_only_for_itself() {
        let tools = Arc::new(ScriptedTools::stalling_on(&["Claim number 2"]));
        let orch = orchestrator(investigating_model(), tools, 5);

        let results = orch.run(sample_footnotes(4), None, &NoProgress).await;
        assert_eq!(results.len(), 4);

        let stalled = &results[1];
        assert_eq!(stalled.footnote_id, "fn-2");
        assert_eq!(stalled.verdict, Verdict::Supports);
        assert!(stalled.explanation.starts_with("Quick check"));
        assert!(stalled.explanation.contains("quick Claim number 2"));
        assert!(!stalled.source_accessed);

        for (i, v) in results.iter().enumerate().filter(|(i, _)| *i != 1) {
            assert_eq!(v.footnote_id, format!("fn-{}", i + 1));
            assert!(v.source_accessed);
            assert_eq!(v.trace.as_ref().map(Vec::len), Some(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_quick_verify_becomes_placeholder() {
        let model = ScriptedModel::new(|options, turns| {
            if options.quick {
                return Err(VerifyError::Model("quick model down".to_string()));
            }
            Ok(match turns.len() {
                1 => tool_reply(&[("web_search", json!({ "query": "q" }))]),
                _ => text_reply(verdict_json("supports", "https://x")),
            })
        });
        let tools = Arc::new(ScriptedTools::stalling_on(&["Claim number 1"]));
        let orch = orchestrator(model, tools, 2);

        let results = orch.run(sample_footnotes(2), None, &NoProgress).await;
        assert_eq!(results[0].verdict, Verdict::SourceUnavailable);
        assert_eq!(results[0].confidence, 0.0);
        assert!(results[0].explanation.contains("quick model down"));
        assert_eq!(results[1].verdict, Verdict::Supports);
    }

    /// Panics while reading the source for one claim.
    struct PanicsOn(&'static str);

    #[async_trait]
    impl ToolExecutor for PanicsOn {
        async fn execute(&self, _: &str, _: &Value, ctx: &ToolContext) -> String {
            let claim = ctx.document.current().map(|f| f.claim_text.as_str()).unwrap_or("");
            if claim == self.0 {
                panic!("tool blew up on {}", claim);
            }
            "page text".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_claim_does_not_take_down_its_worker() {
        let orch = orchestrator(investigating_model(), Arc::new(PanicsOn("Claim number 2")), 1);

        let results = orch.run(sample_footnotes(5), None, &NoProgress).await;
        assert_eq!(results.len(), 5);

        let failed = &results[1];
        assert_eq!(failed.footnote_id, "fn-2");
        assert_eq!(failed.verdict, Verdict::SourceUnavailable);
        assert_eq!(failed.confidence, 0.0);

        for (i, v) in results.iter().enumerate().filter(|(i, _)| *i != 1) {
            assert_eq!(v.footnote_id, format!("fn-{}", i + 1));
            assert_eq!(v.verdict, Verdict::Supports);
            assert!(v.source_accessed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_footnotes_launch_nothing() {
        let model = Arc::new(investigating_model());
        let tools = Arc::new(ScriptedTools::default());
        let agent = ClaimAgent::new(model.clone(), tools.clone(), 6);
        let orch = Orchestrator::new(Arc::new(agent), settings(5));
        let recorder = Recorder::default();

        let results = orch.run(Vec::new(), None, &recorder).await;
        assert!(results.is_empty());
        assert!(model.sessions().is_empty());
        assert_eq!(tools.call_count(), 0);
        assert!(recorder.counts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_id_appears_exactly_once() {
        let orch = orchestrator(investigating_model(), Arc::new(SlowEarlyTools::default()), 5);
        let results = orch.run(sample_footnotes(23), None, &NoProgress).await;
        let unique: HashSet<&str> = results.iter().map(|v| v.footnote_id.as_str()).collect();
        assert_eq!(results.len(), 23);
        assert_eq!(unique.len(), 23);
    }
}
