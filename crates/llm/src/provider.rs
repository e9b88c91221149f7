use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// A chat message for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub temperature: f64,
    pub stop: Vec<String>,
    pub max_tokens: u32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self { temperature: 0.1, stop: Vec::new(), max_tokens: 4096 }
    }
}

/// Raw model output plus token accounting when the runtime reports it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Trait for LLM runtime backends. One implementation per runtime protocol.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a single-shot chat completion and return the response.
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<Completion, LlmError>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), LlmError>;
}
