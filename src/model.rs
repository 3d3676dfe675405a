//! Domain records: messages, sessions, episodes, facts, profiles.
//!
//! Timestamps are unix seconds (UTC). Episodes and sessions carry uuid string
//! ids so export/import round-trips preserve identity.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub seq: i64,
    pub role: Role,
    pub text: String,
    pub timestamp: i64,
}

/// Closed emotion tag set shared by both extractor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Neutral,
    Scared,
    Angry,
    Curious,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Neutral,
        Emotion::Scared,
        Emotion::Angry,
        Emotion::Curious,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Neutral => "neutral",
            Emotion::Scared => "scared",
            Emotion::Angry => "angry",
            Emotion::Curious => "curious",
        }
    }

    /// Parse a tag, treating anything outside the closed set as neutral.
    pub fn parse_or_neutral(s: &str) -> Emotion {
        match s.trim() {
            "happy" => Emotion::Happy,
            "sad" => Emotion::Sad,
            "scared" => Emotion::Scared,
            "angry" => Emotion::Angry,
            "curious" => Emotion::Curious,
            _ => Emotion::Neutral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub user_id: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub emotion: Emotion,
    pub importance: f64,
    pub access_count: i64,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub user_id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f64,
    pub created_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    /// Interest tags ordered by insertion recency (most recent last).
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserProfile {
    pub fn empty(user_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: None,
            age: None,
            gender: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a tag, coalescing duplicates to the most-recent position and
    /// dropping the oldest tags beyond `cap`.
    pub fn push_tag(&mut self, tag: &str, cap: usize) {
        let tag = tag.trim();
        if tag.is_empty() {
            return;
        }
        self.tags.retain(|t| t != tag);
        self.tags.push(tag.to_string());
        while self.tags.len() > cap {
            self.tags.remove(0);
        }
    }
}

/// Output of one extraction pass. Pure data; committing it is the manager's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDelta {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    #[serde(default)]
    pub add_tags: Vec<String>,
}

impl ProfileDelta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.age.is_none() && self.gender.is_none() && self.add_tags.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub summary: String,
    pub keywords: Vec<String>,
    pub emotion: Emotion,
    pub importance: f64,
    pub facts: Vec<Fact>,
    pub profile_delta: ProfileDelta,
}

/// In-RAM state of one active session. Owned by the manager; the ring buffer
/// holds the last `2 * working_memory_size` messages.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub user_id: String,
    pub started_at: i64,
    pub next_seq: i64,
    pub ring_capacity: usize,
    pub ring: VecDeque<Message>,
    /// Total user turns recorded, counted before ring eviction.
    pub user_turn_count: usize,
    /// Set when the ring is snapshotted for extraction; later appends are
    /// rejected rather than silently lost.
    pub frozen: bool,
}

impl SessionState {
    pub fn new(session_id: String, user_id: String, started_at: i64, ring_capacity: usize) -> Self {
        Self {
            session_id,
            user_id,
            started_at,
            next_seq: 0,
            ring_capacity,
            ring: VecDeque::with_capacity(ring_capacity),
            user_turn_count: 0,
            frozen: false,
        }
    }

    pub fn push(&mut self, role: Role, text: String, now: i64) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if role == Role::User {
            self.user_turn_count += 1;
        }
        self.ring.push_back(Message {
            session_id: self.session_id.clone(),
            seq,
            role,
            text,
            timestamp: now,
        });
        while self.ring.len() > self.ring_capacity {
            self.ring.pop_front();
        }
        seq
    }

    /// A turn is one user message (with or without an assistant reply).
    pub fn user_turns(&self) -> usize {
        self.user_turn_count
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
