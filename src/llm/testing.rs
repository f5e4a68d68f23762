//! Test doubles for `LlmProvider`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

/// Returns the same reply to every request and records the prompts it saw.
pub struct StubLlm {
    reply: Result<String, fn() -> LlmError>,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl StubLlm {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Ok(reply.into()),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(make_error: fn() -> LlmError) -> Self {
        Self {
            reply: Err(make_error),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Concatenated message contents of every request, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);

        match &self.reply {
            Ok(content) => Ok(CompletionResponse {
                content: content.clone(),
                input_tokens: 100,
                output_tokens: 20,
                finish_reason: FinishReason::Stop,
            }),
            Err(make_error) => Err(make_error()),
        }
    }
}
