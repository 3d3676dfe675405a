//! Retention: strength scoring, decay sweep, per-user cap enforcement.

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::model::Episode;
use crate::store::MemoryStore;
use tracing::{debug, info};

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Access counts saturate the access factor at this many retrievals.
const ACCESS_SATURATION: f64 = 10.0;

/// Scoring weights, taken from config at construction.
#[derive(Debug, Clone, Copy)]
pub struct StrengthParams {
    pub memory_decay_days: f64,
    pub time_decay_weight: f64,
    pub access_count_weight: f64,
}

impl StrengthParams {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            memory_decay_days: config.memory_decay_days,
            time_decay_weight: config.time_decay_weight,
            access_count_weight: config.access_count_weight,
        }
    }
}

/// Recency factor in [0,1]: 1 when touched now, 0 past the decay horizon.
pub fn recency_factor(last_accessed_at: i64, now: i64, decay_days: f64) -> f64 {
    let days_since = (now - last_accessed_at).max(0) as f64 / SECONDS_PER_DAY;
    (1.0 - days_since / decay_days).max(0.0)
}

/// Retention strength of an episode. Pure in its inputs: equal fields and
/// `now` always give equal strength.
pub fn strength(ep: &Episode, now: i64, params: &StrengthParams) -> f64 {
    let time_factor = recency_factor(ep.last_accessed_at, now, params.memory_decay_days);
    let access_factor = (ep.access_count as f64 / ACCESS_SATURATION).min(1.0);
    ep.importance
        * (params.time_decay_weight * time_factor + params.access_count_weight * access_factor)
}

pub struct Forgetter {
    store: MemoryStore,
    params: StrengthParams,
    min_importance_threshold: f64,
    max_episodes_per_user: i64,
    max_facts_per_user: i64,
}

impl Forgetter {
    pub fn new(store: MemoryStore, config: &MemoryConfig) -> Self {
        Self {
            store,
            params: StrengthParams::from_config(config),
            min_importance_threshold: config.min_importance_threshold,
            max_episodes_per_user: config.max_episodes_per_user,
            max_facts_per_user: config.max_facts_per_user,
        }
    }

    pub fn params(&self) -> &StrengthParams {
        &self.params
    }

    /// Delete every episode below the strength threshold and every fact
    /// below half of it. Returns the number of removed items.
    pub async fn run_forget(&self, user_id: &str, now: i64) -> Result<u64> {
        let episodes = self.store.all_episodes(user_id).await?;
        let doomed: Vec<String> = episodes
            .iter()
            .filter(|ep| strength(ep, now, &self.params) < self.min_importance_threshold)
            .map(|ep| ep.episode_id.clone())
            .collect();
        let mut removed = self.store.delete_episodes(&doomed).await?;
        removed += self
            .store
            .delete_facts_below(user_id, self.min_importance_threshold / 2.0)
            .await?;
        if removed > 0 {
            info!(user_id, removed, "forget sweep removed stale memories");
        }
        Ok(removed)
    }

    /// Trim per-user stores back under their caps. A fixed point after one
    /// call: re-running removes nothing further.
    pub async fn enforce_caps(&self, user_id: &str, now: i64) -> Result<u64> {
        let mut removed = 0;

        let episodes = self.store.all_episodes(user_id).await?;
        let overflow = episodes.len() as i64 - self.max_episodes_per_user;
        if overflow > 0 {
            let mut scored: Vec<(f64, &Episode)> = episodes
                .iter()
                .map(|ep| (strength(ep, now, &self.params), ep))
                .collect();
            scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let doomed: Vec<String> = scored
                .iter()
                .take(overflow as usize)
                .map(|(_, ep)| ep.episode_id.clone())
                .collect();
            debug!(user_id, count = doomed.len(), "evicting weakest episodes over cap");
            removed += self.store.delete_episodes(&doomed).await?;
        }

        let fact_overflow = self.store.count_facts(user_id).await? - self.max_facts_per_user;
        if fact_overflow > 0 {
            removed += self.store.delete_weakest_facts(user_id, fact_overflow).await?;
        }

        Ok(removed)
    }
}
