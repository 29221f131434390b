use std::sync::Arc;

use crate::pipeline::VerificationPipeline;
use crate::progress::ProgressHub;
use crate::storage::BlobStore;

/// Shared state behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<VerificationPipeline>,
    pub progress: Arc<ProgressHub>,
    pub blobs: Arc<dyn BlobStore>,
    pub version: String,
}

impl AppState {
    pub fn new(
        pipeline: Arc<VerificationPipeline>,
        progress: Arc<ProgressHub>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            pipeline,
            progress,
            blobs,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
