//! Chat module for multi-conversation prompting
//!
//! This module provides:
//! - Prompt templating with an optional per-conversation tag
//! - One generation sequence per conversation, created lazily
//! - Token streaming demultiplexed by conversation id
//! - Cancellable, deadline-bounded requests
//!
//! Module structure:
//! - prompt.rs: PromptOptions, build_prompt, DEFAULT_SYSTEM_PROMPT
//! - session_registry.rs: SessionRegistry, SessionInfo
//! - task_registry.rs: TaskRegistry of in-flight generations
//! - completion.rs: PromptOrchestrator (prompt, prompt_stream, complete)

pub mod prompt;
pub mod session_registry;
pub mod task_registry;
pub mod completion;

pub use prompt::{build_prompt, PromptOptions, DEFAULT_SYSTEM_PROMPT};
pub use session_registry::{SessionInfo, SessionRegistry};
pub use task_registry::{ActiveGeneration, GenerationKind};
pub use completion::{PromptOrchestrator, TokenCallback};
