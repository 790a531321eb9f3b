//! Inference engine capability traits and types
//!
//! The orchestrator never performs numerical work itself. A native inference
//! library is plugged in by implementing these four traits:
//!
//! - [`InferenceBackend`]: loads a model artifact
//! - [`LoadedModel`]: creates contexts and detokenizes
//! - [`InferenceContext`]: hands out independent generation sequences
//! - [`GenerationSequence`]: generates for one conversation

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Engine-side token identifier
pub type TokenId = u32;

/// Sampling parameters for one generate call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

/// Options for creating the shared inference context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub context_size: u32,
    pub threads: u32,
}

/// A piece of output surfaced by the engine while generating.
///
/// Engines may report text directly or raw token ids; ids are detokenized by
/// the orchestrator before anything reaches a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Tokens(Vec<TokenId>),
}

/// Receives fragments in generation order, strictly before `generate` resolves
pub type FragmentSink<'a> = &'a mut (dyn FnMut(Fragment) + Send);

/// Entry point of a native inference library
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logs (e.g. "llama.cpp")
    fn backend_name(&self) -> &'static str;

    /// Load a model artifact. Fails if it is missing, corrupt or incompatible.
    async fn load_model(&self, path: &Path, verbose: bool) -> anyhow::Result<Arc<dyn LoadedModel>>;
}

/// A model loaded into memory, shared read-only by every conversation
#[async_trait]
pub trait LoadedModel: Send + Sync {
    async fn create_context(&self, options: ContextOptions) -> anyhow::Result<Arc<dyn InferenceContext>>;

    /// Convert token ids to text
    fn detokenize(&self, tokens: &[TokenId]) -> anyhow::Result<String>;

    /// Release model resources. Must be idempotent.
    async fn dispose(&self);
}

/// The inference context shared by all conversations
#[async_trait]
pub trait InferenceContext: Send + Sync {
    /// Create a sequence for a conversation (`None` = default or anonymous).
    ///
    /// Every call returns a sequence with its own generation state.
    fn sequence(&self, conversation_id: Option<&str>) -> anyhow::Result<Box<dyn GenerationSequence>>;

    /// Release context resources. Must be idempotent.
    async fn dispose(&self);
}

/// Per-conversation generation state. Not reentrant: callers guarantee at
/// most one `generate` in flight.
#[async_trait]
pub trait GenerationSequence: Send {
    /// Generate a reply to `prompt`, reporting fragments through `on_fragment`,
    /// and resolve with the final text.
    async fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        on_fragment: FragmentSink<'_>,
    ) -> anyhow::Result<String>;

    /// Release sequence resources. Must be idempotent.
    async fn dispose(&mut self);
}
