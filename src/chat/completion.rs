//! Prompt orchestration - template, generate, demultiplex fragments
//!
//! Every call resolves its conversation's session, holds the session's
//! sequence for the duration of one generate call, and races the call against
//! its cancellation token and deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::prompt::{build_prompt, PromptOptions};
use crate::chat::session_registry::{SequenceGuard, SessionRegistry};
use crate::chat::task_registry::{ActiveGeneration, GenerationKind, TaskRegistry};
use crate::config::Config;
use crate::error::{conversation_label, BeeBeeError, ErrorEvent, Result};
use crate::events::{EventBus, StreamEvent};
use crate::llm_engine::engine::{EngineSlot, LoadedEngine};
use crate::llm_engine::provider::{Fragment, SamplingParams};

/// Caller-supplied fragment handler: `(fragment, conversation_id)`
pub type TokenCallback = Box<dyn FnMut(&str, Option<&str>) + Send>;

/// Attempts to follow a conversation whose session was replaced or evicted
/// while the call was queued on it
const MAX_SESSION_RETRIES: usize = 3;

struct PreparedPrompt {
    engine: LoadedEngine,
    params: SamplingParams,
    prompt: String,
}

pub struct PromptOrchestrator {
    config: Arc<Config>,
    engine: Arc<EngineSlot>,
    sessions: Arc<SessionRegistry>,
    tasks: TaskRegistry,
    events: Arc<EventBus>,
}

impl PromptOrchestrator {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<EngineSlot>,
        sessions: Arc<SessionRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            engine,
            sessions,
            tasks: TaskRegistry::new(),
            events,
        }
    }

    /// Generate a full reply. Raises only `response` (or `error`).
    pub async fn prompt(
        &self,
        text: &str,
        options: PromptOptions,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        let request = self.prepare(text, &options, conversation_id).await?;
        let cancel = call_token(&options);
        let ticket = self.tasks.register(chat_kind(conversation_id), cancel.clone());
        log::info!(
            "Prompt {} on conversation {}",
            ticket.generation_id(),
            label(conversation_id)
        );

        let mut discard = |_: Fragment| {};
        let work = async {
            let mut sequence = self.acquire_sequence(conversation_id).await?;
            sequence
                .generate(&request.prompt, &request.params, &mut discard)
                .await
                .map_err(BeeBeeError::Generation)
        };
        let result = run_guarded(work, &cancel, options.deadline).await;

        self.finish(result, conversation_id, ticket.generation_id())
    }

    /// Generate a reply, forwarding every fragment to the `token` event and to
    /// `on_token` (in that order) as it is produced.
    ///
    /// Resolves with the concatenation of every forwarded fragment.
    pub async fn prompt_stream(
        &self,
        text: &str,
        options: PromptOptions,
        mut on_token: Option<TokenCallback>,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        let request = self.prepare(text, &options, conversation_id).await?;
        let cancel = call_token(&options);
        let ticket = self.tasks.register(chat_kind(conversation_id), cancel.clone());
        log::info!(
            "Streaming prompt {} on conversation {}",
            ticket.generation_id(),
            label(conversation_id)
        );

        let model = request.engine.model.clone();
        let events = self.events.clone();
        let owned_id = conversation_id.map(str::to_string);
        let mut accumulated = String::new();
        let mut detokenize_error: Option<anyhow::Error> = None;

        let mut forward = |fragment: Fragment| {
            if cancel.is_cancelled() {
                return;
            }
            let piece = match fragment {
                Fragment::Text(text) => text,
                Fragment::Tokens(ids) => match model.detokenize(&ids) {
                    Ok(text) => text,
                    Err(e) => {
                        detokenize_error = Some(e);
                        cancel.cancel();
                        return;
                    }
                },
            };
            if piece.is_empty() {
                return;
            }

            accumulated.push_str(&piece);
            events.emit_stream(StreamEvent::Token {
                fragment: piece.clone(),
                conversation_id: owned_id.clone(),
            });
            if let Some(callback) = on_token.as_mut() {
                callback(&piece, owned_id.as_deref());
            }
        };

        let work = async {
            let mut sequence = self.acquire_sequence(conversation_id).await?;
            sequence
                .generate(&request.prompt, &request.params, &mut forward)
                .await
                .map_err(BeeBeeError::Generation)
        };
        let result = run_guarded(work, &cancel, options.deadline).await;

        let result = match (result, detokenize_error) {
            (_, Some(e)) => Err(BeeBeeError::Detokenize(e)),
            (Ok(final_text), None) => {
                if final_text != accumulated {
                    log::debug!(
                        "Generation {} final text differs from streamed fragments; returning fragments",
                        ticket.generation_id()
                    );
                }
                Ok(accumulated)
            }
            (Err(e), None) => Err(e),
        };

        self.finish(result, conversation_id, ticket.generation_id())
    }

    /// Raw completion on a fresh anonymous sequence: no template, no session,
    /// no `token`/`response` events.
    pub async fn complete(&self, text: &str, options: PromptOptions) -> Result<String> {
        let engine = self.engine.loaded().await?;
        let params = options.sampling(&self.config)?;
        let cancel = call_token(&options);
        let ticket = self.tasks.register(GenerationKind::Completion, cancel.clone());

        let mut sequence = match engine.context.sequence(None) {
            Ok(sequence) => sequence,
            Err(e) => {
                let error = BeeBeeError::SessionCreate(e);
                self.report_failure(&error, None, ticket.generation_id());
                return Err(error);
            }
        };

        let mut discard = |_: Fragment| {};
        let work = async {
            sequence
                .generate(text, &params, &mut discard)
                .await
                .map_err(BeeBeeError::Generation)
        };
        let result = run_guarded(work, &cancel, options.deadline).await;
        sequence.dispose().await;

        if let Err(error) = &result {
            self.report_failure(error, None, ticket.generation_id());
        }
        result
    }

    /// Cancel whatever is running or queued on a conversation
    pub fn cancel_generation(&self, conversation_id: Option<&str>) -> bool {
        let cancelled = self.tasks.cancel_conversation(conversation_id);
        if cancelled {
            log::info!("Cancellation requested for conversation {}", label(conversation_id));
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        self.tasks.cancel_all();
    }

    pub fn active_generations(&self) -> Vec<ActiveGeneration> {
        self.tasks.active()
    }

    pub fn is_generating(&self, conversation_id: Option<&str>) -> bool {
        self.tasks.is_conversation_busy(conversation_id)
    }

    /// Preconditions checked before anything is raised on the event channels
    async fn prepare(
        &self,
        text: &str,
        options: &PromptOptions,
        conversation_id: Option<&str>,
    ) -> Result<PreparedPrompt> {
        let engine = self.engine.loaded().await?;
        let params = options.sampling(&self.config)?;
        let prompt = build_prompt(&self.config.system_prompt, text, options, conversation_id);
        Ok(PreparedPrompt {
            engine,
            params,
            prompt,
        })
    }

    async fn acquire_sequence(&self, conversation_id: Option<&str>) -> Result<SequenceGuard> {
        let mut retries = 0;
        loop {
            let session = self.sessions.resolve_session(conversation_id).await?;
            match session.acquire(self.config.generation_policy).await {
                Err(BeeBeeError::SessionEnded { .. })
                    if !session.was_ended() && retries < MAX_SESSION_RETRIES =>
                {
                    retries += 1;
                    log::debug!(
                        "Session for conversation {} was replaced while queued; retrying",
                        label(conversation_id)
                    );
                }
                result => return result,
            }
        }
    }

    fn finish(&self, result: Result<String>, conversation_id: Option<&str>, generation_id: Uuid) -> Result<String> {
        match result {
            Ok(text) => {
                log::debug!("Generation {} produced {} bytes", generation_id, text.len());
                self.events.emit_stream(StreamEvent::Response {
                    text: text.clone(),
                    conversation_id: conversation_id.map(str::to_string),
                });
                Ok(text)
            }
            Err(error) => {
                self.report_failure(&error, conversation_id, generation_id);
                Err(error)
            }
        }
    }

    fn report_failure(&self, error: &BeeBeeError, conversation_id: Option<&str>, generation_id: Uuid) {
        match error {
            BeeBeeError::Cancelled | BeeBeeError::DeadlineExceeded => {
                log::info!("Generation {} stopped: {}", generation_id, error)
            }
            _ => log::error!("Generation {} failed: {}", generation_id, error),
        }
        let event = ErrorEvent::from_error(error).with_conversation(conversation_id);
        log::debug!(
            "Raising {} error for conversation {}",
            event.kind.as_str(),
            label(conversation_id)
        );
        self.events.emit_stream(StreamEvent::Error(event));
    }
}

fn chat_kind(conversation_id: Option<&str>) -> GenerationKind {
    GenerationKind::Chat(conversation_id.map(str::to_string))
}

fn label(conversation_id: Option<&str>) -> String {
    conversation_label(&conversation_id.map(str::to_string))
}

/// Token for one call: a child of the caller's token when given
fn call_token(options: &PromptOptions) -> CancellationToken {
    options
        .cancel
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_else(CancellationToken::new)
}

/// Race `work` against cancellation and the optional deadline.
/// Losing the race drops `work`, which releases the session's sequence.
async fn run_guarded<T>(
    work: impl Future<Output = Result<T>>,
    cancel: &CancellationToken,
    deadline: Option<Duration>,
) -> Result<T> {
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BeeBeeError::Cancelled),
        _ = expired => Err(BeeBeeError::DeadlineExceeded),
        result = work => result,
    }
}
