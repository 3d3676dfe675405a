//! SQLite persistence for profiles, sessions, messages, episodes and facts.
//!
//! Each public operation is one transaction; the multi-step extraction commit
//! goes through [`MemoryStore::commit_extraction`]. Schema is created on
//! connect and migrated forward-only via a `schema_version` row.

use crate::error::Result;
use crate::model::{Emotion, Episode, Fact, Message, UserProfile};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;

/// Ordering for episode listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOrder {
    ByImportanceDesc,
    ByRecentDesc,
}

/// Filter for [`MemoryStore::list_episodes`].
#[derive(Debug, Clone, Default)]
pub struct EpisodeFilter {
    /// Keep episodes whose keyword set intersects this list (empty = all).
    pub keywords_any: Vec<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub order: Option<EpisodeOrder>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct EpisodeRow {
    episode_id: String,
    user_id: String,
    summary: String,
    keywords: String,
    emotion: String,
    importance: f64,
    access_count: i64,
    created_at: i64,
    last_accessed_at: i64,
}

impl EpisodeRow {
    fn into_episode(self) -> Episode {
        Episode {
            episode_id: self.episode_id,
            user_id: self.user_id,
            summary: self.summary,
            keywords: serde_json::from_str(&self.keywords).unwrap_or_default(),
            emotion: Emotion::parse_or_neutral(&self.emotion),
            importance: self.importance,
            access_count: self.access_count,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FactRow {
    user_id: String,
    subject: String,
    predicate: String,
    object: String,
    confidence: f64,
    created_at: i64,
    last_seen_at: i64,
}

impl FactRow {
    fn into_fact(self) -> Fact {
        Fact {
            user_id: self.user_id,
            subject: self.subject,
            predicate: self.predicate,
            object: self.object,
            confidence: self.confidence,
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
        }
    }
}

const EPISODE_COLS: &str =
    "episode_id, user_id, summary, keywords, emotion, importance, access_count, created_at, last_accessed_at";
const FACT_COLS: &str =
    "user_id, subject, predicate, object, confidence, created_at, last_seen_at";

impl MemoryStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                name TEXT,
                age INTEGER,
                gender TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq)
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS episodes (
                episode_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                emotion TEXT NOT NULL DEFAULT 'neutral',
                importance REAL NOT NULL DEFAULT 0.5,
                access_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                embedding BLOB
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                UNIQUE (user_id, subject, predicate, object)
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_episodes_user ON episodes(user_id);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_facts_user ON facts(user_id);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);")
            .execute(&self.pool)
            .await?;

        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match version {
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
                info!(version = SCHEMA_VERSION, "schema initialized");
            }
            Some(v) if v < SCHEMA_VERSION => {
                // Forward-only: additive ALTERs land here as versions grow.
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
                info!(from = v, to = SCHEMA_VERSION, "schema migrated");
            }
            Some(v) => {
                debug!(version = v, "schema up to date");
            }
        }

        Ok(())
    }

    // ── Profiles ───────────────────────────────────────────

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        let tags = serde_json::to_string(&profile.tags).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO profiles (user_id, name, age, gender, tags, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                age = excluded.age,
                gender = excluded.gender,
                tags = excluded.tags,
                updated_at = excluded.updated_at",
        )
        .bind(&profile.user_id)
        .bind(&profile.name)
        .bind(profile.age.map(|a| a as i64))
        .bind(&profile.gender)
        .bind(tags)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT user_id, name, age, gender, tags, created_at, updated_at
             FROM profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UserProfile {
            user_id: r.get("user_id"),
            name: r.get("name"),
            age: r.get::<Option<i64>, _>("age").map(|a| a as u32),
            gender: r.get("gender"),
            tags: serde_json::from_str(&r.get::<String, _>("tags")).unwrap_or_default(),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    // ── Sessions & messages ────────────────────────────────

    pub async fn insert_session(&self, session_id: &str, user_id: &str, started_at: i64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO sessions (session_id, user_id, started_at, ended_at) VALUES (?, ?, ?, NULL)")
            .bind(session_id)
            .bind(user_id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str, ended_at: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ? WHERE session_id = ?")
            .bind(ended_at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn persist_message(&self, msg: &Message) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages (session_id, seq, role, text, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&msg.session_id)
        .bind(msg.seq)
        .bind(msg.role.as_str())
        .bind(&msg.text)
        .bind(msg.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Episodes ───────────────────────────────────────────

    pub async fn insert_episode(&self, ep: &Episode) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_episode_tx(&mut tx, ep).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_episode_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        ep: &Episode,
    ) -> Result<()> {
        let keywords = serde_json::to_string(&ep.keywords).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT OR REPLACE INTO episodes
             (episode_id, user_id, summary, keywords, emotion, importance, access_count, created_at, last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&ep.episode_id)
        .bind(&ep.user_id)
        .bind(&ep.summary)
        .bind(keywords)
        .bind(ep.emotion.as_str())
        .bind(ep.importance.clamp(0.0, 1.0))
        .bind(ep.access_count.max(0))
        .bind(ep.created_at)
        .bind(ep.last_accessed_at.max(ep.created_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Increment access counters for the given episodes, in one transaction.
    pub async fn update_episode_access(&self, episode_ids: &[String], now: i64) -> Result<()> {
        if episode_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in episode_ids {
            sqlx::query(
                "UPDATE episodes SET access_count = access_count + 1, last_accessed_at = ? WHERE episode_id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_episodes(&self, episode_ids: &[String]) -> Result<u64> {
        let mut removed = 0;
        let mut tx = self.pool.begin().await?;
        for id in episode_ids {
            let res = sqlx::query("DELETE FROM episodes WHERE episode_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += res.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn list_episodes(&self, user_id: &str, filter: &EpisodeFilter) -> Result<Vec<Episode>> {
        let order = match filter.order {
            Some(EpisodeOrder::ByImportanceDesc) => "importance DESC, created_at DESC",
            Some(EpisodeOrder::ByRecentDesc) | None => "created_at DESC",
        };
        let sql = format!(
            "SELECT {EPISODE_COLS} FROM episodes WHERE user_id = ? ORDER BY {order}"
        );
        let rows: Vec<EpisodeRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut episodes: Vec<Episode> = rows
            .into_iter()
            .map(EpisodeRow::into_episode)
            .filter(|ep| filter.since.map_or(true, |s| ep.created_at >= s))
            .filter(|ep| filter.until.map_or(true, |u| ep.created_at <= u))
            .filter(|ep| {
                filter.keywords_any.is_empty()
                    || ep.keywords.iter().any(|k| filter.keywords_any.iter().any(|q| q == k))
            })
            .collect();
        if let Some(limit) = filter.limit {
            episodes.truncate(limit);
        }
        Ok(episodes)
    }

    pub async fn count_episodes(&self, user_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM episodes WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn put_episode_embedding(&self, episode_id: &str, embedding: &[f32]) -> Result<()> {
        let blob = bincode::serialize(embedding).unwrap_or_default();
        sqlx::query("UPDATE episodes SET embedding = ? WHERE episode_id = ?")
            .bind(blob)
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_episode_embedding(&self, episode_id: &str) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query("SELECT embedding FROM episodes WHERE episode_id = ?")
            .bind(episode_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<Vec<u8>>, _>("embedding"))
            .and_then(|b| bincode::deserialize(&b).ok()))
    }

    // ── Facts ──────────────────────────────────────────────

    pub async fn upsert_fact(&self, fact: &Fact) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_fact_tx(&mut tx, fact).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_fact_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        fact: &Fact,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO facts (user_id, subject, predicate, object, confidence, created_at, last_seen_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, subject, predicate, object) DO UPDATE SET
                confidence = MAX(facts.confidence, excluded.confidence),
                last_seen_at = excluded.last_seen_at",
        )
        .bind(&fact.user_id)
        .bind(&fact.subject)
        .bind(&fact.predicate)
        .bind(&fact.object)
        .bind(fact.confidence.clamp(0.0, 1.0))
        .bind(fact.created_at)
        .bind(fact.last_seen_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn list_facts(&self, user_id: &str, subject: Option<&str>) -> Result<Vec<Fact>> {
        let rows: Vec<FactRow> = match subject {
            Some(subject) => {
                let sql = format!(
                    "SELECT {FACT_COLS} FROM facts WHERE user_id = ? AND subject = ? ORDER BY confidence DESC, last_seen_at DESC"
                );
                sqlx::query_as(&sql)
                    .bind(user_id)
                    .bind(subject)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {FACT_COLS} FROM facts WHERE user_id = ? ORDER BY confidence DESC, last_seen_at DESC"
                );
                sqlx::query_as(&sql).bind(user_id).fetch_all(&self.pool).await?
            }
        };
        Ok(rows.into_iter().map(FactRow::into_fact).collect())
    }

    pub async fn delete_facts_below(&self, user_id: &str, confidence: f64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM facts WHERE user_id = ? AND confidence < ?")
            .bind(user_id)
            .bind(confidence)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Delete the `n` weakest facts: lowest confidence first, oldest
    /// `last_seen_at` breaking ties.
    pub async fn delete_weakest_facts(&self, user_id: &str, n: i64) -> Result<u64> {
        if n <= 0 {
            return Ok(0);
        }
        let res = sqlx::query(
            "DELETE FROM facts WHERE id IN (
                SELECT id FROM facts WHERE user_id = ?
                ORDER BY confidence ASC, last_seen_at ASC LIMIT ?
            )",
        )
        .bind(user_id)
        .bind(n)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn count_facts(&self, user_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ── Extraction commit ──────────────────────────────────

    /// Commit one session's extraction output atomically: merged profile,
    /// new episode, coalesced facts, session close.
    pub async fn commit_extraction(
        &self,
        profile: &UserProfile,
        episode: &Episode,
        facts: &[Fact],
        session_id: &str,
        ended_at: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let tags = serde_json::to_string(&profile.tags).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO profiles (user_id, name, age, gender, tags, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                age = excluded.age,
                gender = excluded.gender,
                tags = excluded.tags,
                updated_at = excluded.updated_at",
        )
        .bind(&profile.user_id)
        .bind(&profile.name)
        .bind(profile.age.map(|a| a as i64))
        .bind(&profile.gender)
        .bind(tags)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::insert_episode_tx(&mut tx, episode).await?;

        for fact in facts {
            Self::upsert_fact_tx(&mut tx, fact).await?;
        }

        sqlx::query("UPDATE sessions SET ended_at = ? WHERE session_id = ?")
            .bind(ended_at)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ── Bulk / maintenance ─────────────────────────────────

    pub async fn list_user_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM profiles
             UNION SELECT user_id FROM episodes
             UNION SELECT user_id FROM facts
             ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All episodes for a user in a stable order (for export and scoring).
    pub async fn all_episodes(&self, user_id: &str) -> Result<Vec<Episode>> {
        let sql = format!(
            "SELECT {EPISODE_COLS} FROM episodes WHERE user_id = ? ORDER BY created_at ASC, episode_id ASC"
        );
        let rows: Vec<EpisodeRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EpisodeRow::into_episode).collect())
    }

    /// All facts for a user in a stable order (for export).
    pub async fn all_facts(&self, user_id: &str) -> Result<Vec<Fact>> {
        let sql = format!(
            "SELECT {FACT_COLS} FROM facts WHERE user_id = ? ORDER BY subject ASC, predicate ASC, object ASC"
        );
        let rows: Vec<FactRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FactRow::into_fact).collect())
    }
}
