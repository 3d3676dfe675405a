//! Configuration record and presets.
//!
//! One closed struct; presets are constructors. JSON files load with a
//! fall-back to defaults, API credentials resolve from fields first and the
//! `LLM_API_KEY` / `LLM_BASE_URL` environment variables second.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_API_KEY: &str = "LLM_API_KEY";
pub const ENV_BASE_URL: &str = "LLM_BASE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    // ── Working memory ─────────────────────────────────────
    pub working_memory_size: usize,
    /// Minimum user turns before a session is compressed into an episode.
    pub episode_compress_threshold: usize,
    pub episode_summary_max_length: usize,

    // ── Per-user caps ──────────────────────────────────────
    pub max_profile_tags: usize,
    pub max_episodes_per_user: i64,
    pub max_facts_per_user: i64,

    // ── Retention / retrieval scoring ──────────────────────
    pub memory_decay_days: f64,
    pub min_importance_threshold: f64,
    pub time_decay_weight: f64,
    pub access_count_weight: f64,
    pub max_retrieval_results: usize,

    // ── Vector retrieval ───────────────────────────────────
    pub enable_vector_search: bool,
    pub vector_dim: usize,
    pub similarity_threshold: f32,

    // ── LLM ────────────────────────────────────────────────
    /// One of "openai", "zhipu", "mock".
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_max_retries: u32,
    pub llm_timeout_secs: u64,

    // ── Cache ──────────────────────────────────────────────
    pub enable_cache: bool,
    pub cache_ttl_secs: u64,

    // ── Storage ────────────────────────────────────────────
    /// Keep raw messages in the database (debug retention).
    pub persist_messages: bool,
    pub database_url: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl MemoryConfig {
    /// Mock LLM, no cache, no vectors, tight caps. Runs fully offline.
    pub fn minimal() -> Self {
        Self {
            working_memory_size: 10,
            episode_compress_threshold: 5,
            episode_summary_max_length: 200,
            max_profile_tags: 10,
            max_episodes_per_user: 20,
            max_facts_per_user: 50,
            memory_decay_days: 30.0,
            min_importance_threshold: 0.2,
            time_decay_weight: 0.7,
            access_count_weight: 0.3,
            max_retrieval_results: 3,
            enable_vector_search: false,
            vector_dim: 384,
            similarity_threshold: 0.5,
            llm_provider: "mock".to_string(),
            llm_model: "mock".to_string(),
            llm_api_key: None,
            llm_base_url: None,
            llm_max_retries: 1,
            llm_timeout_secs: 5,
            enable_cache: false,
            cache_ttl_secs: 60,
            persist_messages: false,
            database_url: "sqlite::memory:".to_string(),
        }
    }

    /// Default middle ground: OpenAI-backed extraction, keyword retrieval.
    pub fn balanced() -> Self {
        Self {
            working_memory_size: 10,
            episode_compress_threshold: 5,
            episode_summary_max_length: 200,
            max_profile_tags: 20,
            max_episodes_per_user: 100,
            max_facts_per_user: 200,
            memory_decay_days: 30.0,
            min_importance_threshold: 0.2,
            time_decay_weight: 0.7,
            access_count_weight: 0.3,
            max_retrieval_results: 5,
            enable_vector_search: false,
            vector_dim: 384,
            similarity_threshold: 0.5,
            llm_provider: "openai".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_api_key: None,
            llm_base_url: None,
            llm_max_retries: 3,
            llm_timeout_secs: 30,
            enable_cache: true,
            cache_ttl_secs: 60,
            persist_messages: false,
            database_url: "sqlite:membox.db".to_string(),
        }
    }

    /// Everything on: vector retrieval, cache, message retention, larger caps.
    pub fn full_featured() -> Self {
        Self {
            max_profile_tags: 30,
            max_episodes_per_user: 500,
            max_facts_per_user: 1000,
            max_retrieval_results: 8,
            enable_vector_search: true,
            llm_provider: "zhipu".to_string(),
            llm_model: "glm-4-flash".to_string(),
            llm_max_retries: 5,
            persist_messages: true,
            ..Self::balanced()
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "minimal" => Ok(Self::minimal()),
            "balanced" => Ok(Self::balanced()),
            "full_featured" => Ok(Self::full_featured()),
            other => Err(Error::Config(format!("unknown preset '{}'", other))),
        }
    }

    /// Load from a JSON file, falling back to `balanced` defaults for any
    /// missing field. A missing file is a config error (unlike optional UI
    /// settings, the server should not silently run on defaults).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: MemoryConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Resolve the API key: explicit field first, then `LLM_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.llm_api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        std::env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty())
    }

    /// Resolve the base URL: explicit field first, then `LLM_BASE_URL`.
    pub fn resolve_base_url(&self) -> Option<String> {
        if let Some(ref url) = self.llm_base_url {
            if !url.is_empty() {
                return Some(url.clone());
            }
        }
        std::env::var(ENV_BASE_URL).ok().filter(|u| !u.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.working_memory_size == 0 {
            return Err(Error::Config("working_memory_size must be > 0".into()));
        }
        if self.episode_compress_threshold == 0 {
            return Err(Error::Config("episode_compress_threshold must be > 0".into()));
        }
        if self.episode_summary_max_length == 0 {
            return Err(Error::Config("episode_summary_max_length must be > 0".into()));
        }
        if self.max_episodes_per_user <= 0 || self.max_facts_per_user <= 0 {
            return Err(Error::Config("per-user caps must be > 0".into()));
        }
        if self.memory_decay_days <= 0.0 {
            return Err(Error::Config("memory_decay_days must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.min_importance_threshold) {
            return Err(Error::Config("min_importance_threshold must be within [0,1]".into()));
        }
        let weight_sum = self.time_decay_weight + self.access_count_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "time_decay_weight + access_count_weight must sum to 1.0, got {}",
                weight_sum
            )));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config("similarity_threshold must be within [0,1]".into()));
        }
        match self.llm_provider.as_str() {
            "openai" | "zhipu" | "mock" => {}
            other => {
                return Err(Error::Config(format!("unknown llm_provider '{}'", other)));
            }
        }
        Ok(())
    }

    /// Ring buffer capacity for active sessions.
    pub fn ring_capacity(&self) -> usize {
        2 * self.working_memory_size
    }
}
