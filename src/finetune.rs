//! Fine-tune / upgrade event contract
//!
//! The fine-tuning manager lives outside this crate. Its events are forwarded
//! verbatim on the passthrough channel; only names carrying one of the reserved
//! prefixes are accepted.

use serde::{Deserialize, Serialize};

pub const FINETUNE_START: &str = "finetune:start";
pub const FINETUNE_STOPPED: &str = "finetune:stopped";
pub const CHECKPOINT_LOADED: &str = "checkpoint:loaded";
pub const UPGRADE_CHECKING: &str = "upgrade:checking";
pub const UPGRADE_DOWNLOADING: &str = "upgrade:downloading";

pub const RESERVED_PREFIXES: [&str; 3] = ["finetune:", "upgrade:", "checkpoint:"];

/// An opaque event from the fine-tuning collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughEvent {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PassthroughEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// True when the name has a reserved prefix followed by a non-empty suffix
    pub fn is_reserved(&self) -> bool {
        is_reserved_name(&self.name)
    }
}

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| name.len() > prefix.len() && name.starts_with(prefix))
}
