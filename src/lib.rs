// BeeBee - multi-conversation prompt orchestration over a local LLM
//
// The inference library is plugged in through the traits in
// `llm_engine::provider`; everything else lives here:
// - model presence checks and download metadata
// - model load / context lifecycle
// - per-conversation sessions and token streaming
// - typed lifecycle, stream and passthrough events

pub mod config;
pub mod error;
pub mod events;
pub mod finetune;
pub mod model_manager;
pub mod llm_engine;
pub mod chat;

pub use chat::{PromptOptions, SessionInfo, TokenCallback};
pub use config::{Config, ConfigBuilder, GenerationPolicy};
pub use error::{BeeBeeError, ConfigError, ErrorEvent, ErrorKind, Result};
pub use events::{EventBus, LifecycleEvent, StreamEvent};
pub use finetune::PassthroughEvent;
pub use llm_engine::{
    ControlSignal, EngineInfo, EngineState, Fragment, InferenceBackend, InferenceContext,
    GenerationSequence, LifecycleController, LoadedModel,
};
pub use model_manager::{DownloadDescriptor, DownloadSource, ModelAvailability, ModelDescriptor};
