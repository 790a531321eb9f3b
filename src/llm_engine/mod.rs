//! LLM Engine module - inference capability and engine lifecycle
//!
//! The inference library itself is external; a native binding is plugged in
//! by implementing the traits in [`provider`].
//!
//! Module structure:
//! - provider.rs: InferenceBackend, LoadedModel, InferenceContext, GenerationSequence
//! - engine.rs: EngineSlot holding the shared model + context, EngineState
//! - lifecycle.rs: LifecycleController, ControlSignal

pub mod provider;
pub mod engine;
pub mod lifecycle;

#[cfg(test)]
pub(crate) mod stubs;

pub use provider::{
    ContextOptions, Fragment, FragmentSink, GenerationSequence, InferenceBackend, InferenceContext,
    LoadedModel, SamplingParams, TokenId,
};
pub use engine::{EngineInfo, EngineState};
pub use lifecycle::{ControlSignal, LifecycleController};
