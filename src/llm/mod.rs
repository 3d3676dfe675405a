//! LLM access: provider trait, wire clients, registry.

pub mod mock;
pub mod openai;
pub mod provider;

pub use provider::{ChatMessage, LlmHandle, LlmParams, LlmProvider};

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::llm::mock::MockProvider;
use crate::llm::openai::{OpenAiCompatProvider, OPENAI_BASE_URL, ZHIPU_BASE_URL};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Factory: build the configured provider wrapped in the retry policy.
pub fn build_handle(config: &MemoryConfig) -> Result<LlmHandle> {
    let provider: Arc<dyn LlmProvider> = match config.llm_provider.as_str() {
        "mock" => Arc::new(MockProvider),
        "openai" => {
            let api_key = config.resolve_api_key().unwrap_or_default();
            let base_url = config
                .resolve_base_url()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string());
            info!(base_url = %base_url, model = %config.llm_model, "initializing openai provider");
            Arc::new(OpenAiCompatProvider::new(
                "openai",
                api_key,
                base_url,
                config.llm_model.clone(),
            ))
        }
        "zhipu" => {
            let api_key = config.resolve_api_key().unwrap_or_default();
            let base_url = config
                .resolve_base_url()
                .unwrap_or_else(|| ZHIPU_BASE_URL.to_string());
            info!(base_url = %base_url, model = %config.llm_model, "initializing zhipu provider");
            Arc::new(OpenAiCompatProvider::new(
                "zhipu",
                api_key,
                base_url,
                config.llm_model.clone(),
            ))
        }
        other => return Err(Error::Config(format!("unknown llm_provider '{}'", other))),
    };

    Ok(LlmHandle::new(
        provider,
        config.llm_max_retries,
        Duration::from_secs(config.llm_timeout_secs),
    ))
}
