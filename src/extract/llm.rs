//! LLM-backed extraction: one structured call per ended session.

use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::llm::LlmHandle;
use crate::model::{Emotion, ExtractionResult, Fact, Message, ProfileDelta};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Prompt for the structured extraction call. The emotion list and the JSON
/// shape are fixed; anything off-shape fails schema validation and the
/// caller falls back to the rule-based extractor.
const EXTRACTION_PROMPT: &str = concat!(
    "You are a memory extraction assistant for a children's companion toy. ",
    "Analyze the conversation below and produce a JSON object with:\n",
    "- \"summary\": one short recap of what the child talked about (same language as the child)\n",
    "- \"keywords\": 1-8 short topic words\n",
    "- \"emotion\": exactly one of happy, sad, neutral, scared, angry, curious\n",
    "- \"importance\": how memorable this conversation is, from 0.0 to 1.0\n",
    "- \"facts\": stable facts about the child as ",
    "{\"subject\", \"predicate\", \"object\", \"confidence\"} objects\n",
    "- \"profile_delta\": {\"name\"?, \"age\"?, \"gender\"?, \"add_tags\": []} ",
    "with only newly learned identity details\n\n",
    "Output ONLY the JSON object, no explanation or markdown.\n\n",
    "Conversation:\n"
);

/// Schema enforced on the provider's output.
fn extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["summary", "keywords", "emotion", "importance"],
        "properties": {
            "summary": { "type": "string" },
            "keywords": { "type": "array", "items": { "type": "string" } },
            "emotion": {
                "enum": ["happy", "sad", "neutral", "scared", "angry", "curious"]
            },
            "importance": { "type": "number" },
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["subject", "predicate", "object"],
                    "properties": {
                        "subject": { "type": "string" },
                        "predicate": { "type": "string" },
                        "object": { "type": "string" },
                        "confidence": { "type": "number" }
                    }
                }
            },
            "profile_delta": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "age": { "type": "integer", "minimum": 0 },
                    "gender": { "type": "string" },
                    "add_tags": { "type": "array", "items": { "type": "string" } }
                }
            }
        }
    })
}

#[derive(Deserialize)]
struct WireFact {
    subject: String,
    predicate: String,
    object: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.8
}

#[derive(Deserialize)]
struct WireResult {
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    emotion: String,
    importance: f64,
    #[serde(default)]
    facts: Vec<WireFact>,
    #[serde(default)]
    profile_delta: ProfileDelta,
}

pub struct LlmExtractor {
    handle: LlmHandle,
    summary_max_len: usize,
}

impl LlmExtractor {
    pub fn new(handle: LlmHandle, summary_max_len: usize) -> Self {
        Self { handle, summary_max_len }
    }

    fn transcript(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let prompt = format!("{}{}", EXTRACTION_PROMPT, Self::transcript(messages));
        let value = self
            .handle
            .extract(&prompt, &extraction_schema(), cancel)
            .await?;

        let wire: WireResult = serde_json::from_value(value)
            .map_err(|e| Error::Schema(format!("extraction shape mismatch: {}", e)))?;

        let summary: String = wire.summary.chars().take(self.summary_max_len).collect();
        let keywords: Vec<String> = wire
            .keywords
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !summary.is_empty() && keywords.is_empty() {
            return Err(Error::Schema("non-empty summary without keywords".into()));
        }

        let now = crate::model::now_ts();
        let facts = wire
            .facts
            .into_iter()
            .filter(|f| !f.predicate.trim().is_empty() && !f.object.trim().is_empty())
            .map(|f| Fact {
                user_id: user_id.to_string(),
                subject: if f.subject.trim().is_empty() {
                    "user".to_string()
                } else {
                    f.subject.trim().to_string()
                },
                predicate: f.predicate.trim().to_string(),
                object: f.object.trim().to_string(),
                confidence: f.confidence.clamp(0.0, 1.0),
                created_at: now,
                last_seen_at: now,
            })
            .collect();

        Ok(ExtractionResult {
            summary,
            keywords,
            emotion: Emotion::parse_or_neutral(&wire.emotion),
            importance: wire.importance.clamp(0.0, 1.0),
            facts,
            profile_delta: wire.profile_delta,
        })
    }
}
