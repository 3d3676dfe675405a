//! Deterministic mock provider for tests and the `minimal` preset.
//!
//! Outputs are pure functions of the input text: no network, no randomness.

use crate::llm::provider::{CallError, ChatMessage, LlmParams, LlmProvider};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct MockProvider;

impl MockProvider {
    /// First `user:` line of an extraction transcript, for seeding canned output.
    fn first_user_line(prompt: &str) -> Option<&str> {
        prompt
            .lines()
            .find_map(|line| line.trim().strip_prefix("user:"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        _params: LlmParams,
    ) -> Result<String, CallError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        Ok(format!("我听到你说:{}", last_user))
    }

    async fn extract(&self, prompt: &str, _schema: &Value) -> Result<Value, CallError> {
        let seed = Self::first_user_line(prompt).unwrap_or("");
        if seed.is_empty() {
            return Ok(json!({
                "summary": "",
                "keywords": [],
                "emotion": "neutral",
                "importance": 0.3,
                "facts": [],
                "profile_delta": {}
            }));
        }
        let summary: String = seed.chars().take(50).collect();
        let keyword: String = seed.chars().take(4).collect();
        Ok(json!({
            "summary": summary,
            "keywords": [keyword],
            "emotion": "neutral",
            "importance": 0.5,
            "facts": [],
            "profile_delta": {}
        }))
    }

    fn id(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chat_is_deterministic() {
        let mock = MockProvider;
        let msgs = vec![ChatMessage::user("今天去了公园")];
        let a = mock.chat(msgs.clone(), LlmParams::default()).await.unwrap();
        let b = mock.chat(msgs, LlmParams::default()).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("今天去了公园"));
    }

    #[tokio::test]
    async fn extract_seeds_from_first_user_line() {
        let mock = MockProvider;
        let prompt = "对话:\nuser: 我喜欢恐龙\nassistant: 恐龙很酷\n";
        let value = mock.extract(prompt, &serde_json::json!({})).await.unwrap();
        assert_eq!(value["summary"], "我喜欢恐龙");
        assert_eq!(value["emotion"], "neutral");
        assert!(value["keywords"].as_array().map_or(false, |k| !k.is_empty()));
    }
}
