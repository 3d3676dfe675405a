//! Memory manager: session lifecycle, context assembly, the end-session
//! extraction pipeline, and maintenance entry points.
//!
//! Locking order is sessions-map → session → user slot, never the reverse;
//! extraction runs with no lock held and the user slot is reacquired only
//! for the commit and the cap checks.

use crate::config::MemoryConfig;
use crate::context::MemoryContext;
use crate::error::{Error, Result};
use crate::extract::llm::LlmExtractor;
use crate::extract::rules::RuleExtractor;
use crate::extract::{Extractor, FallbackExtractor};
use crate::forget::{strength, Forgetter};
use crate::model::{now_ts, Episode, Fact, Message, Role, SessionState, UserProfile};
use crate::retrieval::{EmbeddingBackend, Retriever};
use crate::store::MemoryStore;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct UserSlot {
    active_session: Option<String>,
}

/// Retrieval slice kept in the TTL cache; the live working memory is
/// attached fresh on every call.
#[derive(Clone)]
struct CachedSlice {
    profile: Option<UserProfile>,
    facts: Vec<Fact>,
    episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
    pub episode_count: i64,
    pub fact_count: i64,
    pub profile_tag_count: usize,
    /// Episode strengths bucketed into ten equal bins over [0,1].
    pub strength_histogram: [u32; 10],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPayload {
    pub user_id: String,
    pub profile: Option<UserProfile>,
    pub episodes: Vec<Episode>,
    pub facts: Vec<Fact>,
}

pub struct Manager {
    config: MemoryConfig,
    store: MemoryStore,
    retriever: Retriever,
    forgetter: Forgetter,
    extractor: Arc<dyn Extractor>,
    /// Network-free variant used when a session is ended implicitly from
    /// `start_session`, which must not perform network I/O.
    offline_extractor: Arc<dyn Extractor>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
    user_slots: Mutex<HashMap<String, Arc<Mutex<UserSlot>>>>,
    cache: Mutex<HashMap<(String, u64), (Instant, CachedSlice)>>,
}

impl Manager {
    pub fn new(
        store: MemoryStore,
        config: MemoryConfig,
        extractor: Arc<dyn Extractor>,
        backend: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Self {
        let retriever = Retriever::new(store.clone(), &config, backend);
        let forgetter = Forgetter::new(store.clone(), &config);
        let offline_extractor: Arc<dyn Extractor> =
            Arc::new(RuleExtractor::new(config.episode_summary_max_length));
        Self {
            config,
            store,
            retriever,
            forgetter,
            extractor,
            offline_extractor,
            sessions: Mutex::new(HashMap::new()),
            user_slots: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the full stack from config: store, LLM provider, extraction
    /// chain (LLM first, rules as fallback).
    pub async fn from_config(config: MemoryConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store = MemoryStore::connect(&config.database_url).await?;
        let handle = crate::llm::build_handle(&config)?;
        let rules: Arc<dyn Extractor> =
            Arc::new(RuleExtractor::new(config.episode_summary_max_length));
        let llm: Arc<dyn Extractor> = Arc::new(LlmExtractor::new(
            handle,
            config.episode_summary_max_length,
        ));
        let extractor: Arc<dyn Extractor> = Arc::new(FallbackExtractor::new(llm, rules));
        Ok(Arc::new(Self::new(store, config, extractor, None)))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    async fn user_slot(&self, user_id: &str) -> Arc<Mutex<UserSlot>> {
        let mut slots = self.user_slots.lock().await;
        slots.entry(user_id.to_string()).or_default().clone()
    }

    // ── Session lifecycle ──────────────────────────────────

    /// Open a session for `user_id`, implicitly ending a prior active one.
    /// Performs storage I/O only; the implicit end uses the rule-based
    /// extractor so no network call can block session startup.
    pub async fn start_session(&self, user_id: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let slot = self.user_slot(user_id).await;
        let prior = {
            let mut guard = slot.lock().await;
            guard.active_session.take()
        };
        if let Some(prior_id) = prior {
            // Best effort: a failed implicit end must not block the new session.
            if let Err(e) = self.end_session_inner(&prior_id, cancel, false).await {
                warn!(user_id, session_id = %prior_id, error = %e, "implicit end of prior session failed");
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let now = now_ts();
        let state = SessionState::new(
            session_id.clone(),
            user_id.to_string(),
            now,
            self.config.ring_capacity(),
        );

        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(session_id.clone(), Arc::new(Mutex::new(state)));
        }
        {
            let mut guard = slot.lock().await;
            guard.active_session = Some(session_id.clone());
        }
        self.store.insert_session(&session_id, user_id, now).await?;

        info!(user_id, session_id = %session_id, "session started");
        Ok(session_id)
    }

    /// Append a message to the session's working memory. Serialized per
    /// session; seq is monotonically increasing in call order.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let session = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?
        };

        let message = {
            let mut state = session.lock().await;
            if state.frozen {
                return Err(Error::UnknownSession(session_id.to_string()));
            }
            let now = now_ts();
            let seq = state.push(role, text.to_string(), now);
            Message {
                session_id: session_id.to_string(),
                seq,
                role,
                text: text.to_string(),
                timestamp: now,
            }
        };

        if self.config.persist_messages {
            self.store.persist_message(&message).await?;
        }
        Ok(())
    }

    /// Close a session. Sessions below the compression threshold close
    /// without extraction; everything else goes through extract → commit →
    /// caps → forget. The session is Ended on return regardless of errors.
    pub async fn end_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Episode>> {
        self.end_session_inner(session_id, cancel, true).await
    }

    async fn end_session_inner(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        use_llm: bool,
    ) -> Result<Option<Episode>> {
        // Freeze: drop the session from the active map so racing
        // add_message calls get UnknownSession instead of silent loss.
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?
        };
        let (user_id, messages, turns) = {
            let mut state = session.lock().await;
            state.frozen = true;
            (
                state.user_id.clone(),
                state.ring.iter().cloned().collect::<Vec<_>>(),
                state.user_turns(),
            )
        };

        let slot = self.user_slot(&user_id).await;
        {
            let mut guard = slot.lock().await;
            if guard.active_session.as_deref() == Some(session_id) {
                guard.active_session = None;
            }
        }
        self.invalidate_cache(&user_id).await;

        let now = now_ts();
        if turns < self.config.episode_compress_threshold {
            self.store.close_session(session_id, now).await?;
            info!(
                user_id = %user_id,
                session_id, turns, "session closed below threshold, no extraction"
            );
            return Ok(None);
        }

        // Extraction runs outside every lock; it can take seconds.
        let extractor = if use_llm { &self.extractor } else { &self.offline_extractor };
        let extraction = extractor.extract(&messages, &user_id, cancel).await?;

        let now = now_ts();
        let episode = Episode {
            episode_id: Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            summary: extraction
                .summary
                .chars()
                .take(self.config.episode_summary_max_length)
                .collect(),
            keywords: extraction.keywords,
            emotion: extraction.emotion,
            importance: extraction.importance.clamp(0.0, 1.0),
            access_count: 0,
            created_at: now,
            last_accessed_at: now,
        };

        // Reacquire the user slot for the commit and the cap checks.
        let _guard = slot.lock().await;
        let mut profile = self
            .store
            .get_profile(&user_id)
            .await?
            .unwrap_or_else(|| UserProfile::empty(&user_id, now));
        let delta = &extraction.profile_delta;
        if delta.name.is_some() {
            profile.name = delta.name.clone();
        }
        if delta.age.is_some() {
            profile.age = delta.age;
        }
        if delta.gender.is_some() {
            profile.gender = delta.gender.clone();
        }
        for tag in &delta.add_tags {
            profile.push_tag(tag, self.config.max_profile_tags);
        }
        profile.updated_at = now;

        self.store
            .commit_extraction(&profile, &episode, &extraction.facts, session_id, now)
            .await?;

        // A post-commit cancellation skips only the sweep; a later
        // maintenance call reclaims.
        if cancel.is_cancelled() {
            warn!(user_id = %user_id, session_id, "cancelled after commit, skipping forget sweep");
            return Ok(Some(episode));
        }
        self.forgetter.enforce_caps(&user_id, now).await?;
        self.forgetter.run_forget(&user_id, now).await?;

        info!(
            user_id = %user_id,
            session_id,
            episode_id = %episode.episode_id,
            facts = extraction.facts.len(),
            "session compressed into episode"
        );
        Ok(Some(episode))
    }

    // ── Context assembly ───────────────────────────────────

    /// Assemble the memory context for a live session. With no query, the
    /// session's recent user text is used as one.
    pub async fn get_memory_context(
        &self,
        session_id: &str,
        query: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MemoryContext> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let session = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?
        };
        let (user_id, working, recent_user_text) = {
            let state = session.lock().await;
            let recent = state
                .ring
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.text.clone())
                .collect::<Vec<_>>()
                .join(" ");
            (
                state.user_id.clone(),
                state.ring.iter().cloned().collect::<Vec<_>>(),
                recent,
            )
        };

        let query = match query {
            Some(q) if !q.trim().is_empty() => Some(q.trim().to_string()),
            _ if !recent_user_text.trim().is_empty() => Some(recent_user_text),
            _ => None,
        };

        let slice = self.retrieval_slice(&user_id, query.as_deref(), cancel).await?;
        Ok(MemoryContext {
            profile: slice.profile,
            facts: slice.facts,
            episodes: slice.episodes,
            working,
        })
    }

    async fn retrieval_slice(
        &self,
        user_id: &str,
        query: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CachedSlice> {
        let key = (user_id.to_string(), query_hash(query));
        if self.config.enable_cache {
            let cache = self.cache.lock().await;
            if let Some((at, slice)) = cache.get(&key) {
                if at.elapsed() < Duration::from_secs(self.config.cache_ttl_secs) {
                    return Ok(slice.clone());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let profile = self.store.get_profile(user_id).await?;
        let retrieved = self.retriever.retrieve(user_id, query, now_ts()).await?;
        let slice = CachedSlice {
            profile,
            facts: retrieved.facts,
            episodes: retrieved.episodes,
        };

        if self.config.enable_cache {
            let mut cache = self.cache.lock().await;
            cache.insert(key, (Instant::now(), slice.clone()));
        }
        Ok(slice)
    }

    async fn invalidate_cache(&self, user_id: &str) {
        let mut cache = self.cache.lock().await;
        cache.retain(|(uid, _), _| uid != user_id);
    }

    // ── Profile CRUD (HTTP surface) ────────────────────────

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.store.get_profile(user_id).await
    }

    /// Full profile replace; the tag cap still applies.
    pub async fn put_profile(&self, mut profile: UserProfile) -> Result<()> {
        let tags = std::mem::take(&mut profile.tags);
        for tag in &tags {
            profile.push_tag(tag, self.config.max_profile_tags);
        }
        profile.updated_at = now_ts();
        self.store.upsert_profile(&profile).await?;
        self.invalidate_cache(&profile.user_id).await;
        Ok(())
    }

    // ── Maintenance ────────────────────────────────────────

    pub async fn run_forget(&self, user_id: &str) -> Result<u64> {
        let removed = self.forgetter.run_forget(user_id, now_ts()).await?;
        self.invalidate_cache(user_id).await;
        Ok(removed)
    }

    pub async fn enforce_caps(&self, user_id: &str) -> Result<u64> {
        let removed = self.forgetter.enforce_caps(user_id, now_ts()).await?;
        self.invalidate_cache(user_id).await;
        Ok(removed)
    }

    /// Sweep every known user: caps first, then decay.
    pub async fn cleanup_all(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut removed = 0;
        for user_id in self.store.list_user_ids().await? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            removed += self.enforce_caps(&user_id).await?;
            removed += self.run_forget(&user_id).await?;
        }
        Ok(removed)
    }

    pub async fn stats(&self, user_id: &str) -> Result<UserStats> {
        let now = now_ts();
        let episodes = self.store.all_episodes(user_id).await?;
        let mut histogram = [0u32; 10];
        for ep in &episodes {
            let s = strength(ep, now, self.forgetter.params()).clamp(0.0, 1.0);
            let bucket = ((s * 10.0) as usize).min(9);
            histogram[bucket] += 1;
        }
        Ok(UserStats {
            episode_count: episodes.len() as i64,
            fact_count: self.store.count_facts(user_id).await?,
            profile_tag_count: self
                .store
                .get_profile(user_id)
                .await?
                .map(|p| p.tags.len())
                .unwrap_or(0),
            strength_histogram: histogram,
        })
    }

    // ── Export / import ────────────────────────────────────

    pub async fn export_user(&self, user_id: &str) -> Result<ExportPayload> {
        Ok(ExportPayload {
            user_id: user_id.to_string(),
            profile: self.store.get_profile(user_id).await?,
            episodes: self.store.all_episodes(user_id).await?,
            facts: self.store.all_facts(user_id).await?,
        })
    }

    /// Upsert a payload, preserving ids. Caps are enforced afterwards so an
    /// oversized import cannot exceed the per-user budgets.
    pub async fn import_user(&self, payload: &ExportPayload) -> Result<()> {
        if let Some(profile) = &payload.profile {
            self.store.upsert_profile(profile).await?;
        }
        for episode in &payload.episodes {
            self.store.insert_episode(episode).await?;
        }
        for fact in &payload.facts {
            self.store.upsert_fact(fact).await?;
        }
        self.forgetter.enforce_caps(&payload.user_id, now_ts()).await?;
        self.invalidate_cache(&payload.user_id).await;
        Ok(())
    }
}

fn query_hash(query: Option<&str>) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.unwrap_or("").hash(&mut hasher);
    hasher.finish()
}
