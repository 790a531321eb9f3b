//! Typed event channels
//!
//! Three independent channels keep concerns apart: engine lifecycle,
//! generation stream, and passthrough events from the fine-tuning collaborator.
//! A token consumer never sees lifecycle events and vice versa.
//!
//! Lifecycle and passthrough events are rare and use bounded broadcast
//! channels. The stream channel carries one event per fragment, so each
//! stream subscriber gets its own unbounded queue and never loses a fragment.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::ErrorEvent;
use crate::finetune::PassthroughEvent;
use crate::model_manager::{DownloadDescriptor, ModelDescriptor};

/// Engine lifecycle signals raised by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum LifecycleEvent {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "model:missing")]
    ModelMissing(ModelDescriptor),
    #[serde(rename = "model:exists")]
    ModelExists(ModelDescriptor),
    #[serde(rename = "model:download:ready")]
    DownloadReady(DownloadDescriptor),
    #[serde(rename = "error")]
    Error(ErrorEvent),
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::ModelMissing(_) => "model:missing",
            LifecycleEvent::ModelExists(_) => "model:exists",
            LifecycleEvent::DownloadReady(_) => "model:download:ready",
            LifecycleEvent::Error(_) => "error",
        }
    }
}

/// Generation results, tagged with the originating conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Token {
        fragment: String,
        conversation_id: Option<String>,
    },
    Response {
        text: String,
        conversation_id: Option<String>,
    },
    Error(ErrorEvent),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::Response { .. } => "response",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Token { conversation_id, .. } | StreamEvent::Response { conversation_id, .. } => {
                conversation_id.as_deref()
            }
            StreamEvent::Error(error) => error.conversation_id.as_deref(),
        }
    }
}

/// Lossless fan-out: one unbounded queue per subscriber
struct Fanout<T> {
    subscribers: DashMap<u64, mpsc::UnboundedSender<T>>,
    next_id: AtomicU64,
}

impl<T: Clone> Fanout<T> {
    fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, tx);
        rx
    }

    /// Deliver to every live subscriber, dropping those whose receiver is gone
    fn send(&self, event: T) {
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// Fan-out for every event the orchestrator raises.
///
/// Emitting never fails: with no subscriber the event is dropped. A lifecycle
/// or passthrough subscriber that falls more than `capacity` events behind
/// sees `Lagged`; stream subscribers are never lagged.
pub struct EventBus {
    lifecycle: broadcast::Sender<LifecycleEvent>,
    stream: Fanout<StreamEvent>,
    passthrough: broadcast::Sender<PassthroughEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (lifecycle, _) = broadcast::channel(capacity);
        let (passthrough, _) = broadcast::channel(capacity);
        Self {
            lifecycle,
            stream: Fanout::new(),
            passthrough,
        }
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_stream(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.stream.subscribe()
    }

    pub fn stream_subscribers(&self) -> usize {
        self.stream.len()
    }

    pub fn subscribe_passthrough(&self) -> broadcast::Receiver<PassthroughEvent> {
        self.passthrough.subscribe()
    }

    pub fn emit_lifecycle(&self, event: LifecycleEvent) {
        log::debug!("Lifecycle event: {}", event.name());
        let _ = self.lifecycle.send(event);
    }

    pub fn emit_stream(&self, event: StreamEvent) {
        self.stream.send(event);
    }

    pub fn emit_passthrough(&self, event: PassthroughEvent) {
        log::debug!("Passthrough event: {}", event.name);
        let _ = self.passthrough.send(event);
    }
}
