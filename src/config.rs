//! Orchestrator configuration
//!
//! A flat value object with documented defaults. Construct it once at startup
//! (directly, through [`ConfigBuilder`], or from partial JSON) and hand it to
//! [`crate::LifecycleController::new`]; the controller keeps its own copy.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chat::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::error::ConfigError;
use crate::model_manager::registry::{default_sources, DEFAULT_MODEL_PATH, EXPECTED_MODEL_SIZE};
use crate::model_manager::DownloadSource;

pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
pub const DEFAULT_THREADS: u32 = 4;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 256;
pub const DEFAULT_MAX_SESSIONS: usize = 32;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What happens when a second generation is requested on a conversation
/// whose sequence is already generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPolicy {
    /// Wait for the running generation to finish.
    #[default]
    Queue,
    /// Fail immediately with `BeeBeeError::ConcurrentGeneration`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the GGUF model file (a leading `~` is expanded)
    pub model_path: PathBuf,
    pub context_size: u32,
    pub threads: u32,
    /// Sampling temperature, 0.0..=2.0
    pub temperature: f32,
    /// Nucleus sampling, 0.0..=1.0
    pub top_p: f32,
    pub max_tokens: u32,
    /// Prepended to every chat prompt unless the caller opts out
    pub system_prompt: String,
    pub verbose: bool,
    /// Ordered download sources; the first entry is the primary source
    pub download_sources: Vec<DownloadSource>,
    /// Expected artifact size in bytes, reported to hosts for progress display
    pub expected_size: u64,
    /// Upper bound on live conversation sessions (LRU eviction). `None` = unbounded
    pub max_sessions: Option<usize>,
    pub generation_policy: GenerationPolicy,
    /// Buffer size of the lifecycle and passthrough broadcast channels
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: resolve_model_path(Path::new(DEFAULT_MODEL_PATH)),
            context_size: DEFAULT_CONTEXT_SIZE,
            threads: DEFAULT_THREADS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            verbose: false,
            download_sources: default_sources(),
            expected_size: EXPECTED_MODEL_SIZE,
            max_sessions: Some(DEFAULT_MAX_SESSIONS),
            generation_policy: GenerationPolicy::Queue,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Start a builder from this configuration to produce an updated copy.
    pub fn to_builder(&self) -> ConfigBuilder {
        ConfigBuilder {
            config: self.clone(),
        }
    }

    /// Parse a (possibly partial) JSON object on top of the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validated()
    }

    /// Expand the model path and check every range constraint.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.model_path = resolve_model_path(&self.model_path);
        self.validate()?;
        Ok(self)
    }

    /// Collects every violation instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.model_path.as_os_str().is_empty() {
            errors.push("Model path is required".to_string());
        }
        if self.context_size < 128 {
            errors.push("Context size must be at least 128".to_string());
        }
        if self.threads < 1 {
            errors.push("Threads must be at least 1".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            errors.push("Temperature must be between 0 and 2".to_string());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            errors.push("TopP must be between 0 and 1".to_string());
        }
        if self.max_tokens < 1 {
            errors.push("MaxTokens must be at least 1".to_string());
        }
        if self.download_sources.is_empty() {
            errors.push("At least one download source is required".to_string());
        }
        if self.max_sessions == Some(0) {
            errors.push("MaxSessions must be at least 1 when set".to_string());
        }
        if self.event_capacity < 1 {
            errors.push("EventCapacity must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Builder producing validated [`Config`] values.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    pub fn context_size(mut self, context_size: u32) -> Self {
        self.config.context_size = context_size;
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.config.threads = threads;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.config.top_p = top_p;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = system_prompt.into();
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn download_sources(mut self, sources: Vec<DownloadSource>) -> Self {
        self.config.download_sources = sources;
        self
    }

    /// Replace the URL of a named source, appending it if unknown.
    pub fn download_source(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        let url = url.into();
        match self.config.download_sources.iter_mut().find(|s| s.name == name) {
            Some(source) => source.url = url,
            None => self.config.download_sources.push(DownloadSource { name, url }),
        }
        self
    }

    pub fn expected_size(mut self, bytes: u64) -> Self {
        self.config.expected_size = bytes;
        self
    }

    pub fn max_sessions(mut self, max_sessions: Option<usize>) -> Self {
        self.config.max_sessions = max_sessions;
        self
    }

    pub fn generation_policy(mut self, policy: GenerationPolicy) -> Self {
        self.config.generation_policy = policy;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validated()
    }
}

/// Expand a leading `~` component to the user's home directory.
pub fn resolve_model_path(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => {
                log::warn!("No home directory available to expand {:?}", path);
                path.to_path_buf()
            }
        },
        Err(_) => path.to_path_buf(),
    }
}
