//! Extraction: turn a message window into a summary, keywords, emotion,
//! importance, candidate facts and a profile delta.
//!
//! Two interchangeable variants implement [`Extractor`]; the manager wires
//! them through [`FallbackExtractor`] so an LLM failure degrades to the
//! deterministic rules instead of blocking session closure. Both variants
//! are pure with respect to storage.

pub mod llm;
pub mod rules;

use crate::error::{Error, Result};
use crate::model::{ExtractionResult, Message};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult>;
}

/// Runs `primary` and falls back to `secondary` on any failure except
/// cancellation, which propagates unchanged.
pub struct FallbackExtractor {
    primary: Arc<dyn Extractor>,
    secondary: Arc<dyn Extractor>,
}

impl FallbackExtractor {
    pub fn new(primary: Arc<dyn Extractor>, secondary: Arc<dyn Extractor>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl Extractor for FallbackExtractor {
    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        match self.primary.extract(messages, user_id, cancel).await {
            Ok(result) => Ok(result),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!(user_id, error = %e, "primary extractor failed, falling back to rules");
                self.secondary.extract(messages, user_id, cancel).await
            }
        }
    }
}
