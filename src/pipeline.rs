use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::agent::ClaimAgent;
use crate::config::{RunSettings, SearchSettings};
use crate::error::VerifyError;
use crate::footnotes::types::{DocumentResult, Footnote, ProgressSnapshot, RunStatus, Verification};
use crate::llm::ChatModel;
use crate::orchestrator::{Orchestrator, ProgressSink};
use crate::progress::ProgressHandle;
use crate::storage::{footnotes_key, put_json, results_key, BlobStore};
use crate::tools::fetch::HttpFetcher;
use crate::tools::{ToolExecutor, ToolState, Toolbelt};

/// How tool state is scoped across document runs.
pub enum ToolScope {
    /// One executor, so one PDF cache and one search backoff, for every run.
    Shared(Arc<dyn ToolExecutor>),
    /// A fresh `ToolState` for each document run.
    PerRun {
        fetcher: HttpFetcher,
        search: SearchSettings,
    },
}

impl ToolScope {
    fn for_run(&self) -> Arc<dyn ToolExecutor> {
        match self {
            ToolScope::Shared(tools) => tools.clone(),
            ToolScope::PerRun { fetcher, search } => Arc::new(Toolbelt::new(
                fetcher.clone(),
                Arc::new(ToolState::new(search)),
                search.api_url.clone(),
            )),
        }
    }
}

/// Document-level run: credential check, status transitions, persistence.
pub struct VerificationPipeline {
    model: Arc<dyn ChatModel>,
    tools: ToolScope,
    run: RunSettings,
    search_api_key: Option<Arc<str>>,
    blobs: Arc<dyn BlobStore>,
}

impl VerificationPipeline {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: ToolScope,
        run: RunSettings,
        search_api_key: Option<String>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            model,
            tools,
            run,
            search_api_key: search_api_key.map(Arc::from),
            blobs,
        }
    }

    /// Verify one document's footnotes, publishing progress through `progress`.
    ///
    /// Claim-level failures never fail the document; only a missing
    /// credential or a storage failure does.
    pub async fn run_document(
        &self,
        document_id: &str,
        footnotes: Vec<Footnote>,
        progress: &ProgressHandle,
    ) -> Result<DocumentResult, VerifyError> {
        let total = footnotes.len();
        put_json(self.blobs.as_ref(), &footnotes_key(document_id), &footnotes).await?;

        if let Err(e) = self.model.check_credentials() {
            error!(document_id, error = %e, "cannot verify document");
            let result = DocumentResult {
                status: RunStatus::Failed,
                verifications: Vec::new(),
                error: Some(e.to_string()),
            };
            progress.set(ProgressSnapshot::failed(total, e.to_string())).await?;
            put_json(self.blobs.as_ref(), &results_key(document_id), &result).await?;
            return Ok(result);
        }

        info!(document_id, footnotes = total, "verification started");
        progress.set(ProgressSnapshot::processing(total, Vec::new())).await?;

        let agent = ClaimAgent::new(self.model.clone(), self.tools.for_run(), self.run.max_iterations);
        let orchestrator = Orchestrator::new(Arc::new(agent), self.run.clone());
        let sink = SnapshotSink {
            progress: progress.clone(),
        };
        let verifications = orchestrator
            .run(footnotes, self.search_api_key.clone(), &sink)
            .await;

        progress.set(ProgressSnapshot::complete(verifications.clone())).await?;
        let result = DocumentResult {
            status: RunStatus::Complete,
            verifications,
            error: None,
        };
        put_json(self.blobs.as_ref(), &results_key(document_id), &result).await?;
        info!(document_id, footnotes = total, "verification complete");
        Ok(result)
    }

    /// Run in the background; an engine error marks the document failed.
    pub fn spawn(self: &Arc<Self>, document_id: String, footnotes: Vec<Footnote>, progress: ProgressHandle) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let total = footnotes.len();
            if let Err(e) = pipeline.run_document(&document_id, footnotes, &progress).await {
                error!(document_id = %document_id, error = %e, "verification run failed");
                if let Err(e) = progress.set(ProgressSnapshot::failed(total, e.to_string())).await {
                    warn!(document_id = %document_id, error = %e, "could not record failure");
                }
            }
        });
    }
}

/// Publishes each intermediate result as a `processing` snapshot.
struct SnapshotSink {
    progress: ProgressHandle,
}

#[async_trait]
impl ProgressSink for SnapshotSink {
    async fn on_progress(&self, completed: Vec<Verification>, total: usize) {
        if let Err(e) = self
            .progress
            .set(ProgressSnapshot::processing(total, completed))
            .await
        {
            warn!(document_id = %self.progress.document_id(), error = %e, "progress update lost");
        }
    }
}
