//! Generation task registry - tracks in-flight generations for cancellation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationKind {
    /// `prompt` / `prompt_stream` on a conversation (`None` = default conversation)
    Chat(Option<String>),
    /// Raw `complete` on an anonymous sequence
    Completion,
}

/// Active generation
#[derive(Debug, Clone)]
pub struct ActiveGeneration {
    pub generation_id: Uuid,
    pub kind: GenerationKind,
    pub cancel_token: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// Registry of active generations (keyed by generation id)
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<Uuid, ActiveGeneration>>,
}

/// Removes its generation from the registry when dropped
#[must_use]
pub struct TaskTicket {
    generation_id: Uuid,
    cancel_token: CancellationToken,
    tasks: Arc<DashMap<Uuid, ActiveGeneration>>,
}

impl TaskTicket {
    pub fn generation_id(&self) -> Uuid {
        self.generation_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        self.tasks.remove(&self.generation_id);
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new generation
    pub fn register(&self, kind: GenerationKind, cancel_token: CancellationToken) -> TaskTicket {
        let generation_id = Uuid::new_v4();
        self.tasks.insert(
            generation_id,
            ActiveGeneration {
                generation_id,
                kind,
                cancel_token: cancel_token.clone(),
                started_at: Utc::now(),
            },
        );
        TaskTicket {
            generation_id,
            cancel_token,
            tasks: self.tasks.clone(),
        }
    }

    /// Cancel every generation running (or queued) on a conversation.
    /// Returns whether anything was cancelled.
    pub fn cancel_conversation(&self, conversation_id: Option<&str>) -> bool {
        let kind = GenerationKind::Chat(conversation_id.map(str::to_string));
        let tokens: Vec<CancellationToken> = self
            .tasks
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.cancel_token.clone())
            .collect();

        for token in &tokens {
            token.cancel();
        }
        !tokens.is_empty()
    }

    /// Cancel a specific generation by id
    pub fn cancel_task(&self, generation_id: &Uuid) -> Option<CancellationToken> {
        self.tasks.get(generation_id).map(|task| {
            task.cancel_token.cancel();
            task.cancel_token.clone()
        })
    }

    /// Check if there's an active generation for a conversation
    pub fn is_conversation_busy(&self, conversation_id: Option<&str>) -> bool {
        self.tasks
            .iter()
            .any(|entry| matches!(&entry.kind, GenerationKind::Chat(id) if id.as_deref() == conversation_id))
    }

    pub fn active(&self) -> Vec<ActiveGeneration> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = self.tasks.iter().map(|e| e.cancel_token.clone()).collect();
        if !tokens.is_empty() {
            log::info!("Cancelling {} active generation(s)", tokens.len());
        }
        for token in tokens {
            token.cancel();
        }
    }
}
