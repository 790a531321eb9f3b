//! Error types
//!
//! [`BeeBeeError`] is returned to direct callers; [`ErrorEvent`] is the
//! serialisable form raised on the event channels for passive observers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model_manager::ModelDescriptor;

/// Configuration problems, reported all at once.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BeeBeeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Prompt or session operation attempted before the engine is ready
    #[error("BeeBee not initialized. Call initialize() first.")]
    NotInitialized,

    #[error("Model file not found at: {path}")]
    ModelMissing { path: String },

    #[error("Failed to load model: {0:#}")]
    Load(anyhow::Error),

    #[error("Failed to create generation sequence: {0:#}")]
    SessionCreate(anyhow::Error),

    #[error("Generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("Failed to detokenize generated tokens: {0:#}")]
    Detokenize(anyhow::Error),

    #[error("A generation is already running for conversation {}", conversation_label(.conversation_id))]
    ConcurrentGeneration { conversation_id: Option<String> },

    #[error("Session for conversation {} was ended", conversation_label(.conversation_id))]
    SessionEnded { conversation_id: Option<String> },

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Generation deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid prompt options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, BeeBeeError>;

pub(crate) fn conversation_label(conversation_id: &Option<String>) -> String {
    match conversation_id {
        Some(id) => format!("'{}'", id),
        None => "<default>".to_string(),
    }
}

/// Category carried in the `type` field of an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "model:missing")]
    ModelMissing,
    /// Re-initialization triggered by a background signal failed
    #[serde(rename = "initialization")]
    Initialization,
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "generation")]
    Generation,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelMissing => "model:missing",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Load => "load",
            ErrorKind::Generation => "generation",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Structured error payload raised on the event channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelDescriptor>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            conversation_id: None,
            model: None,
        }
    }

    pub fn from_error(error: &BeeBeeError) -> Self {
        let kind = match error {
            BeeBeeError::ModelMissing { .. } => ErrorKind::ModelMissing,
            BeeBeeError::Config(_) | BeeBeeError::Load(_) => ErrorKind::Load,
            BeeBeeError::Cancelled | BeeBeeError::DeadlineExceeded => ErrorKind::Cancelled,
            _ => ErrorKind::Generation,
        };
        Self::new(kind, error.to_string())
    }

    pub fn with_conversation(mut self, conversation_id: Option<&str>) -> Self {
        self.conversation_id = conversation_id.map(str::to_string);
        self
    }

    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.model = Some(model);
        self
    }
}
