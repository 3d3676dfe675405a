//! OpenAI-compatible chat completion client.
//!
//! Covers both the `openai` and `zhipu` providers; zhipu speaks the same
//! wire format under a different base URL.

use crate::llm::provider::{parse_and_validate, CallError, ChatMessage, LlmParams, LlmProvider};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const ZHIPU_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";

/// Temperature used for extraction calls; kept low for stable JSON.
const EXTRACT_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

pub struct OpenAiCompatProvider {
    client: Client,
    provider_id: String,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(provider_id: &str, api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            provider_id: provider_id.to_string(),
            api_key,
            base_url,
            model,
        }
    }

    async fn completion(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, CallError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| CallError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CallError::Http(status.as_u16(), error_text));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("failed to parse response: {}", e)))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(content)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        params: LlmParams,
    ) -> Result<String, CallError> {
        self.completion(messages, params.temperature.unwrap_or(0.7), params.max_tokens)
            .await
    }

    async fn extract(&self, prompt: &str, schema: &Value) -> Result<Value, CallError> {
        let messages = vec![ChatMessage::user(prompt.to_string())];
        let reply = self.completion(messages, EXTRACT_TEMPERATURE, None).await?;
        parse_and_validate(&reply, schema)
    }

    fn id(&self) -> &str {
        &self.provider_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::LlmHandle;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    fn provider_for(server: &MockServer) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new("openai", "test-key".into(), server.uri(), "gpt-test".into())
    }

    #[tokio::test]
    async fn chat_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("你好呀")))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let reply = provider
            .chat(vec![ChatMessage::user("hi")], LlmParams::default())
            .await
            .unwrap();
        assert_eq!(reply, "你好呀");
    }

    #[tokio::test]
    async fn server_error_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("recovered")))
            .mount(&server)
            .await;

        let handle = LlmHandle::new(
            Arc::new(provider_for(&server)),
            3,
            Duration::from_secs(5),
        );
        let reply = handle
            .chat(
                vec![ChatMessage::user("hi")],
                LlmParams::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply, "recovered");
    }

    #[tokio::test]
    async fn malformed_extract_output_is_schema_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("not json at all")))
            .expect(1)
            .mount(&server)
            .await;

        let handle = LlmHandle::new(
            Arc::new(provider_for(&server)),
            3,
            Duration::from_secs(5),
        );
        let schema = serde_json::json!({ "type": "object" });
        let err = handle
            .extract("extract", &schema, &CancellationToken::new())
            .await
            .unwrap_err();
        // Schema errors skip the retry loop entirely (expect(1) above).
        assert!(matches!(err, crate::error::Error::Schema(_)));
    }

    #[tokio::test]
    async fn extract_strips_fences_and_validates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_body("```json\n{\"summary\":\"玩积木\"}\n```")),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let schema = serde_json::json!({
            "type": "object",
            "required": ["summary"],
            "properties": { "summary": { "type": "string" } }
        });
        let value = provider.extract("extract", &schema).await.unwrap();
        assert_eq!(value["summary"], "玩积木");
    }

    #[tokio::test]
    async fn cancellation_observed_between_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let handle = LlmHandle::new(
            Arc::new(provider_for(&server)),
            5,
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handle
            .chat(vec![ChatMessage::user("hi")], LlmParams::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Cancelled));
    }
}
