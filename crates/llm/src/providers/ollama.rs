//! Ollama-compatible runtime backend.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::LlmError;
use crate::provider::{Completion, CompletionParams, LlmProvider, Message, Role};

pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
}

impl OllamaProvider {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<Completion, LlmError> {
        let url = format!("{}/api/chat", self.url);

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut options = json!({
            "temperature": params.temperature,
            "num_predict": params.max_tokens,
        });
        if !params.stop.is_empty() {
            options["stop"] = json!(params.stop);
        }

        let body = json!({
            "model": model,
            "messages": api_messages,
            "stream": false,
            "options": options,
        });

        debug!(model, url = %url, "ollama chat request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let resp: serde_json::Value = response.json().await?;
        let content = resp["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::ResponseShape("missing message.content".into()))?
            .to_string();

        Ok(Completion {
            content,
            prompt_tokens: resp["prompt_eval_count"].as_u64().unwrap_or(0),
            completion_tokens: resp["eval_count"].as_u64().unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<(), LlmError> {
        let url = format!("{}/api/tags", self.url);
        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(LlmError::Api { status, body: String::new() });
        }
        Ok(())
    }
}
