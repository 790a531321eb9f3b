//! Loaded engine slot
//!
//! Holds the single loaded model and inference context shared by every
//! conversation, together with the lifecycle state.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BeeBeeError, Result};
use crate::llm_engine::provider::{InferenceContext, LoadedModel};

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    /// Availability check in progress
    Checking,
    /// Model artifact absent; waiting for a download
    Missing,
    Loading,
    Ready,
    Failed,
}

/// Summary of the loaded engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub model_path: PathBuf,
    pub context_size: u32,
    pub threads: u32,
    pub backend: String,
}

/// Model + context pair. Cloning shares the same resources.
#[derive(Clone)]
pub struct LoadedEngine {
    pub model: Arc<dyn LoadedModel>,
    pub context: Arc<dyn InferenceContext>,
    pub info: EngineInfo,
}

struct SlotInner {
    state: EngineState,
    loaded: Option<LoadedEngine>,
}

/// Shared between the lifecycle controller, the session registry and the
/// orchestrator. Only the controller installs or removes the engine.
pub struct EngineSlot {
    inner: RwLock<SlotInner>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SlotInner {
                state: EngineState::Uninitialized,
                loaded: None,
            }),
        }
    }

    pub async fn state(&self) -> EngineState {
        self.inner.read().await.state
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == EngineState::Ready
    }

    pub(crate) async fn set_state(&self, state: EngineState) {
        let mut inner = self.inner.write().await;
        log::debug!("Engine state {:?} -> {:?}", inner.state, state);
        inner.state = state;
    }

    pub(crate) async fn install(&self, loaded: LoadedEngine) {
        let mut inner = self.inner.write().await;
        inner.loaded = Some(loaded);
        inner.state = EngineState::Ready;
    }

    /// Remove the loaded engine, returning to `Uninitialized`
    pub(crate) async fn take(&self) -> Option<LoadedEngine> {
        let mut inner = self.inner.write().await;
        inner.state = EngineState::Uninitialized;
        inner.loaded.take()
    }

    /// The loaded engine, or `NotInitialized` unless the state is `Ready`
    pub async fn loaded(&self) -> Result<LoadedEngine> {
        let inner = self.inner.read().await;
        match (&inner.state, &inner.loaded) {
            (EngineState::Ready, Some(loaded)) => Ok(loaded.clone()),
            _ => Err(BeeBeeError::NotInitialized),
        }
    }

    pub async fn context(&self) -> Result<Arc<dyn InferenceContext>> {
        self.loaded().await.map(|l| l.context)
    }

    pub async fn info(&self) -> Option<EngineInfo> {
        self.inner.read().await.loaded.as_ref().map(|l| l.info.clone())
    }
}

impl Default for EngineSlot {
    fn default() -> Self {
        Self::new()
    }
}
