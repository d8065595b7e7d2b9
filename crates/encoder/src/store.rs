//! Seam to the chapter metadata store.
//!
//! The queue reports processing checkpoints through this trait; the real
//! implementation lives with the web/persistence layer. Store failures are
//! logged by the callers and never propagate into job state.

use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Chapter metadata operations invoked at job-processing checkpoints.
pub trait ChapterStore: Send + Sync {
    /// Chapter entered the `processing` state.
    fn mark_processing_started(&self, chapter_id: &str) -> Result<(), StoreError>;

    /// Chapter is `ready`, with the transcoder-derived audio properties.
    fn mark_processing_completed(
        &self,
        chapter_id: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), StoreError>;

    /// Chapter is in `error` state with the last captured message.
    fn mark_processing_error(&self, chapter_id: &str, message: &str) -> Result<(), StoreError>;
}

/// Store implementation that only logs, for standalone runs and tests.
#[derive(Debug, Default, Clone)]
pub struct NullChapterStore;

impl ChapterStore for NullChapterStore {
    fn mark_processing_started(&self, chapter_id: &str) -> Result<(), StoreError> {
        info!(chapter_id, "chapter processing started");
        Ok(())
    }

    fn mark_processing_completed(
        &self,
        chapter_id: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        info!(chapter_id, fields = metadata.len(), "chapter processing completed");
        Ok(())
    }

    fn mark_processing_error(&self, chapter_id: &str, message: &str) -> Result<(), StoreError> {
        info!(chapter_id, message, "chapter processing error");
        Ok(())
    }
}
