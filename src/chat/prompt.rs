//! Prompt construction and per-call options

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{BeeBeeError, Result};
use crate::llm_engine::provider::SamplingParams;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are BeeBee, a helpful assistant running locally on the \
user's machine. Answer clearly and concisely. When a conversation id is given, keep your reply \
within that conversation. If you are unsure of an answer, say so instead of guessing.";

/// Line prefix identifying the conversation inside the prompt text
pub const CONVERSATION_TAG: &str = "bboxid";

pub const USER_MARKER: &str = "User:";
pub const ASSISTANT_MARKER: &str = "Assistant:";

/// Per-call options for `prompt`, `prompt_stream` and `complete`.
///
/// Sampling overrides fall back to the configuration when unset.
#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub include_system_prompt: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Cancelling stops fragment forwarding and rejects the call
    pub cancel: Option<CancellationToken>,
    /// Upper bound on the whole call, including time spent queued
    pub deadline: Option<Duration>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            include_system_prompt: true,
            temperature: None,
            top_p: None,
            max_tokens: None,
            cancel: None,
            deadline: None,
        }
    }
}

impl PromptOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_system_prompt(mut self) -> Self {
        self.include_system_prompt = false;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Resolve sampling parameters against the configuration
    pub fn sampling(&self, config: &Config) -> Result<SamplingParams> {
        let params = SamplingParams {
            temperature: self.temperature.unwrap_or(config.temperature),
            top_p: self.top_p.unwrap_or(config.top_p),
            max_tokens: self.max_tokens.unwrap_or(config.max_tokens),
        };

        if !(0.0..=2.0).contains(&params.temperature) {
            return Err(BeeBeeError::InvalidOptions(format!(
                "temperature {} is outside 0..=2",
                params.temperature
            )));
        }
        if !(0.0..=1.0).contains(&params.top_p) {
            return Err(BeeBeeError::InvalidOptions(format!(
                "top_p {} is outside 0..=1",
                params.top_p
            )));
        }
        if params.max_tokens < 1 {
            return Err(BeeBeeError::InvalidOptions("max_tokens must be at least 1".to_string()));
        }
        Ok(params)
    }
}

/// Build the full prompt text:
///
/// ```text
/// {system prompt}\n\n        (unless suppressed or empty)
/// bboxid: {conversation}\n  (when a conversation id is given)
/// User: {text}\nAssistant:
/// ```
pub fn build_prompt(
    system_prompt: &str,
    text: &str,
    options: &PromptOptions,
    conversation_id: Option<&str>,
) -> String {
    let mut prompt = String::new();

    if options.include_system_prompt && !system_prompt.is_empty() {
        prompt.push_str(system_prompt);
        prompt.push_str("\n\n");
    }

    if let Some(id) = conversation_id.filter(|id| !id.is_empty()) {
        prompt.push_str(&format!("{}: {}\n", CONVERSATION_TAG, id));
    }

    prompt.push_str(&format!("{} {}\n{} ", USER_MARKER, text, ASSISTANT_MARKER));
    prompt
}
