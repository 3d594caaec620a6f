//! Scripted model variant for tests and processless runtimes.

use async_trait::async_trait;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::{ChatMessage, GenerationOutput, GenerationParams, Llm, TokenUsage};

/// A model that answers canned responses without any backing process.
///
/// Runtimes of kind `mock` serve this variant, which keeps API-level
/// integration tests independent of a real `llama-server` binary.
#[derive(Debug, Default)]
pub struct MockLlm {
    id: String,
}

impl MockLlm {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Llm for MockLlm {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, LlmError> {
        debug!(model_id = %self.id, prompt_len = prompt.len(), "mock generate");

        let content = format!("mock completion from {} for: {prompt}", self.id);
        let usage = usage_for(prompt, &content);
        let _ = params;

        Ok(GenerationOutput {
            content,
            model_id: Some(self.id.clone()),
            usage: Some(usage),
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutput, LlmError> {
        debug!(model_id = %self.id, message_count = messages.len(), "mock chat");

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let content = format!("mock reply from {} to: {last_user}", self.id);

        let prompt_text: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let usage = usage_for(&prompt_text, &content);
        let _ = params;

        Ok(GenerationOutput {
            content,
            model_id: Some(self.id.clone()),
            usage: Some(usage),
        })
    }
}

// Word count stands in for real tokenization.
fn usage_for(prompt: &str, completion: &str) -> TokenUsage {
    let prompt_tokens = prompt.split_whitespace().count() as u32;
    let completion_tokens = completion.split_whitespace().count() as u32;
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}
