//! Retrieval: rank episodes and facts against a query.
//!
//! Keyword mode is the default and the always-available fallback; vector
//! mode runs when a backend is configured and silently degrades to keyword
//! scoring if the backend fails. Returned episodes get their access
//! bookkeeping bumped as a side effect.

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::extract::rules::tokenize;
use crate::forget::{recency_factor, strength, StrengthParams};
use crate::model::{Episode, Fact};
use crate::store::MemoryStore;
use std::sync::Arc;
use tracing::warn;

const KEYWORD_WEIGHT: f64 = 0.6;
const RECENCY_WEIGHT: f64 = 0.4;

/// Pluggable embedding backend for vector retrieval.
pub trait EmbeddingBackend: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub episodes: Vec<Episode>,
    pub facts: Vec<Fact>,
}

pub struct Retriever {
    store: MemoryStore,
    params: StrengthParams,
    max_results: usize,
    enable_vector: bool,
    similarity_threshold: f32,
    backend: Option<Arc<dyn EmbeddingBackend>>,
}

impl Retriever {
    pub fn new(
        store: MemoryStore,
        config: &MemoryConfig,
        backend: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Self {
        Self {
            store,
            params: StrengthParams::from_config(config),
            max_results: config.max_retrieval_results,
            enable_vector: config.enable_vector_search,
            similarity_threshold: config.similarity_threshold,
            backend,
        }
    }

    /// Rank this user's memories against `query`. Empty query returns the
    /// strongest episodes and the most confident facts.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: Option<&str>,
        now: i64,
    ) -> Result<RetrievalResult> {
        let episodes = self.store.all_episodes(user_id).await?;
        let facts = self.store.list_facts(user_id, None).await?;

        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let mut selected = match query {
            None => self.rank_by_strength(episodes, now),
            Some(q) => match self.try_vector(&episodes, q).await {
                Some(hits) => hits,
                None => self.rank_by_keywords(episodes, q, now),
            },
        };

        let selected_facts = match query {
            None => facts.into_iter().take(self.max_results).collect(),
            Some(q) => self.rank_facts(facts, q, now),
        };

        // Access bookkeeping for everything we hand back.
        let ids: Vec<String> = selected.iter().map(|ep| ep.episode_id.clone()).collect();
        self.store.update_episode_access(&ids, now).await?;
        for ep in &mut selected {
            ep.access_count += 1;
            ep.last_accessed_at = now;
        }

        Ok(RetrievalResult { episodes: selected, facts: selected_facts })
    }

    fn rank_by_strength(&self, episodes: Vec<Episode>, now: i64) -> Vec<Episode> {
        let mut scored: Vec<(f64, Episode)> = episodes
            .into_iter()
            .map(|ep| (strength(&ep, now, &self.params), ep))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(self.max_results).map(|(_, ep)| ep).collect()
    }

    fn rank_by_keywords(&self, episodes: Vec<Episode>, query: &str, now: i64) -> Vec<Episode> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return self.rank_by_strength(episodes, now);
        }
        let mut scored: Vec<(f64, Episode)> = episodes
            .into_iter()
            .map(|ep| {
                let overlap = keyword_overlap(&ep.keywords, &query_terms);
                let recency =
                    recency_factor(ep.last_accessed_at, now, self.params.memory_decay_days);
                (KEYWORD_WEIGHT * overlap + RECENCY_WEIGHT * recency, ep)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(self.max_results).map(|(_, ep)| ep).collect()
    }

    /// Facts: prefix match on subject/object tokens, ranked by
    /// `confidence · recency`.
    fn rank_facts(&self, facts: Vec<Fact>, query: &str, now: i64) -> Vec<Fact> {
        let query_terms = tokenize(query);
        let mut scored: Vec<(f64, Fact)> = facts
            .into_iter()
            .filter(|f| {
                query_terms.iter().any(|term| {
                    f.subject.starts_with(term.as_str())
                        || f.object.starts_with(term.as_str())
                        || term.starts_with(&f.subject)
                        || term.starts_with(&f.object)
                })
            })
            .map(|f| {
                let recency = recency_factor(f.last_seen_at, now, self.params.memory_decay_days);
                (f.confidence * recency, f)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(self.max_results).map(|(_, f)| f).collect()
    }

    /// Vector scoring; `None` means "use keyword mode" (disabled, no
    /// backend, or the backend failed).
    async fn try_vector(&self, episodes: &[Episode], query: &str) -> Option<Vec<Episode>> {
        if !self.enable_vector {
            return None;
        }
        let backend = self.backend.as_ref()?;
        let query_vec = match backend.embed(query) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding backend failed, falling back to keyword mode");
                return None;
            }
        };

        let mut scored: Vec<(f32, Episode)> = Vec::new();
        for ep in episodes {
            let stored = self.store.get_episode_embedding(&ep.episode_id).await.ok().flatten();
            let vec = match stored {
                Some(v) => v,
                None => match backend.embed(&ep.summary) {
                    Ok(v) => {
                        let _ = self.store.put_episode_embedding(&ep.episode_id, &v).await;
                        v
                    }
                    Err(e) => {
                        warn!(error = %e, "embedding backend failed mid-scan, falling back");
                        return None;
                    }
                },
            };
            let sim = cosine_similarity(&query_vec, &vec);
            if sim >= self.similarity_threshold {
                scored.push((sim, ep.clone()));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Some(scored.into_iter().take(self.max_results).map(|(_, ep)| ep).collect())
    }
}

/// Share of query terms present in the episode's keyword set.
fn keyword_overlap(keywords: &[String], query_terms: &[String]) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let hits = query_terms.iter().filter(|t| keywords.contains(t)).count();
    hits as f64 / query_terms.len() as f64
}

// ── fastembed backend (optional) ───────────────────────

#[cfg(feature = "embeddings")]
pub mod fastembed_backend {
    use super::EmbeddingBackend;
    use std::sync::Mutex;

    /// Local ONNX embedding model via fastembed.
    pub struct FastembedBackend {
        model: Mutex<fastembed::TextEmbedding>,
        dim: usize,
    }

    impl FastembedBackend {
        pub fn new(dim: usize) -> anyhow::Result<Self> {
            let model = fastembed::TextEmbedding::try_new(Default::default())?;
            Ok(Self { model: Mutex::new(model), dim })
        }
    }

    impl EmbeddingBackend for FastembedBackend {
        fn dim(&self) -> usize {
            self.dim
        }

        fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("embedder lock poisoned"))?;
            let mut vectors = model.embed(vec![text.to_string()], None)?;
            vectors
                .pop()
                .ok_or_else(|| anyhow::anyhow!("empty embedding batch"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now_ts, Emotion};

    fn episode(user: &str, keywords: &[&str], access: i64, last_accessed: i64) -> Episode {
        Episode {
            episode_id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            summary: keywords.join("、"),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            emotion: Emotion::Neutral,
            importance: 0.5,
            access_count: access,
            created_at: last_accessed,
            last_accessed_at: last_accessed,
        }
    }

    async fn setup() -> (MemoryStore, Retriever) {
        let store = MemoryStore::connect("sqlite::memory:").await.unwrap();
        let retriever = Retriever::new(store.clone(), &MemoryConfig::minimal(), None);
        (store, retriever)
    }

    #[tokio::test]
    async fn matching_episode_returned_and_access_bumped() {
        let (store, retriever) = setup().await;
        let now = now_ts();
        let ep = episode("u1", &["恐龙"], 2, now - 86_400);
        store.insert_episode(&ep).await.unwrap();

        let result = retriever.retrieve("u1", Some("恐龙"), now).await.unwrap();
        assert_eq!(result.episodes.len(), 1);
        assert_eq!(result.episodes[0].access_count, 3);
        assert_eq!(result.episodes[0].last_accessed_at, now);

        // Persisted too, not just the in-memory copy.
        let stored = store.all_episodes("u1").await.unwrap();
        assert_eq!(stored[0].access_count, 3);
        assert_eq!(stored[0].last_accessed_at, now);
    }

    #[tokio::test]
    async fn keyword_match_outranks_recency() {
        let (store, retriever) = setup().await;
        let now = now_ts();
        let hit = episode("u1", &["恐龙"], 0, now - 10 * 86_400);
        let fresh_miss = episode("u1", &["画画"], 0, now);
        store.insert_episode(&hit).await.unwrap();
        store.insert_episode(&fresh_miss).await.unwrap();

        let result = retriever.retrieve("u1", Some("恐龙"), now).await.unwrap();
        assert_eq!(result.episodes[0].episode_id, hit.episode_id);
    }

    #[tokio::test]
    async fn empty_query_ranks_by_strength() {
        let (store, retriever) = setup().await;
        let now = now_ts();
        let strong = episode("u1", &["动物园"], 10, now);
        let weak = episode("u1", &["刷牙"], 0, now - 29 * 86_400);
        store.insert_episode(&strong).await.unwrap();
        store.insert_episode(&weak).await.unwrap();

        let result = retriever.retrieve("u1", None, now).await.unwrap();
        assert_eq!(result.episodes[0].episode_id, strong.episode_id);
    }

    #[tokio::test]
    async fn facts_prefix_matched_and_ranked() {
        let (store, retriever) = setup().await;
        let now = now_ts();
        for (subject, object, confidence) in
            [("小明", "恐龙", 0.9), ("小明", "青菜", 0.4), ("小红", "恐龙蛋", 0.6)]
        {
            store
                .upsert_fact(&Fact {
                    user_id: "u1".to_string(),
                    subject: subject.to_string(),
                    predicate: "喜欢".to_string(),
                    object: object.to_string(),
                    confidence,
                    created_at: now,
                    last_seen_at: now,
                })
                .await
                .unwrap();
        }

        let result = retriever.retrieve("u1", Some("恐龙"), now).await.unwrap();
        assert_eq!(result.facts.len(), 2);
        assert_eq!(result.facts[0].object, "恐龙");
        assert!(result.facts.iter().all(|f| f.object.starts_with("恐龙")));
    }

    #[tokio::test]
    async fn vector_backend_failure_falls_back_to_keywords() {
        struct BrokenBackend;
        impl EmbeddingBackend for BrokenBackend {
            fn dim(&self) -> usize {
                384
            }
            fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
                Err(anyhow::anyhow!("model not loaded"))
            }
        }

        let store = MemoryStore::connect("sqlite::memory:").await.unwrap();
        let config = MemoryConfig {
            enable_vector_search: true,
            ..MemoryConfig::minimal()
        };
        let retriever = Retriever::new(store.clone(), &config, Some(Arc::new(BrokenBackend)));
        let now = now_ts();
        let ep = episode("u1", &["恐龙"], 0, now);
        store.insert_episode(&ep).await.unwrap();

        let result = retriever.retrieve("u1", Some("恐龙"), now).await.unwrap();
        assert_eq!(result.episodes.len(), 1, "keyword fallback should still hit");
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
