//! Lifecycle controller - the top-level BeeBee object
//!
//! Drives `Uninitialized -> Checking -> (Missing | Loading -> (Ready | Failed))`,
//! reacts to model/download control signals, and exposes the prompt and
//! session operations to hosts.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::chat::completion::{PromptOrchestrator, TokenCallback};
use crate::chat::prompt::PromptOptions;
use crate::chat::session_registry::{SessionInfo, SessionRegistry};
use crate::chat::task_registry::ActiveGeneration;
use crate::config::Config;
use crate::error::{BeeBeeError, ErrorEvent, ErrorKind, Result};
use crate::events::{EventBus, LifecycleEvent, StreamEvent};
use crate::finetune::PassthroughEvent;
use crate::llm_engine::engine::{EngineInfo, EngineSlot, EngineState, LoadedEngine};
use crate::llm_engine::provider::{ContextOptions, InferenceBackend};
use crate::model_manager::{DownloadDescriptor, ModelAvailability, ModelDescriptor};

/// External coordination signals (typically from a host UI or downloader)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Re-check the model file and report `model:exists` / `model:missing`
    CheckModel,
    /// Prepare a download from the named source (`None` = primary)
    DownloadStart { source: Option<String> },
    /// The host finished downloading; re-initialize if the file is present
    DownloadComplete,
}

pub struct LifecycleController {
    config: Arc<Config>,
    backend: Arc<dyn InferenceBackend>,
    availability: ModelAvailability,
    engine: Arc<EngineSlot>,
    sessions: Arc<SessionRegistry>,
    orchestrator: PromptOrchestrator,
    events: Arc<EventBus>,
    /// Serializes initialize / re-initialize / dispose
    init_lock: Mutex<()>,
}

impl LifecycleController {
    /// Validate the configuration and wire the components. Nothing is loaded
    /// until [`initialize`](Self::initialize).
    pub fn new(config: Config, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        let config = Arc::new(config.validated()?);
        let engine = Arc::new(EngineSlot::new());
        let events = Arc::new(EventBus::new(config.event_capacity));
        let sessions = Arc::new(SessionRegistry::new(engine.clone(), config.max_sessions));
        let orchestrator =
            PromptOrchestrator::new(config.clone(), engine.clone(), sessions.clone(), events.clone());

        Ok(Self {
            availability: ModelAvailability::new(&config),
            config,
            backend,
            engine,
            sessions,
            orchestrator,
            events,
            init_lock: Mutex::new(()),
        })
    }

    /// Check for the model and load it.
    ///
    /// Returns `Ok(false)` when the model file is missing (after raising
    /// `model:missing` and an `error{type: "model:missing"}`), `Ok(true)` once
    /// ready. A load failure raises `error` and is returned.
    pub async fn initialize(&self) -> Result<bool> {
        let _guard = self.init_lock.lock().await;

        if self.engine.is_ready().await {
            log::debug!("BeeBee already initialized");
            return Ok(true);
        }

        self.engine.set_state(EngineState::Checking).await;
        let descriptor = self.availability.check().await;

        if !descriptor.exists {
            self.engine.set_state(EngineState::Missing).await;
            let error = BeeBeeError::ModelMissing {
                path: descriptor.path.display().to_string(),
            };
            log::warn!("{}", error);

            self.events
                .emit_lifecycle(LifecycleEvent::ModelMissing(descriptor.clone()));
            self.events.emit_lifecycle(LifecycleEvent::Error(
                ErrorEvent::new(ErrorKind::ModelMissing, error.to_string()).with_model(descriptor),
            ));
            return Ok(false);
        }

        self.engine.set_state(EngineState::Loading).await;
        match self.load().await {
            Ok(loaded) => {
                self.engine.install(loaded).await;
                self.events.emit_lifecycle(LifecycleEvent::Ready);
                Ok(true)
            }
            Err(error) => {
                self.engine.set_state(EngineState::Failed).await;
                log::error!("Failed to initialize BeeBee: {}", error);
                self.events
                    .emit_lifecycle(LifecycleEvent::Error(ErrorEvent::from_error(&error)));
                Err(error)
            }
        }
    }

    async fn load(&self) -> Result<LoadedEngine> {
        let path = self.availability.model_path();
        let start = Instant::now();
        log::info!(
            "Loading model {:?} with {} backend",
            path,
            self.backend.backend_name()
        );

        let model = self
            .backend
            .load_model(path, self.config.verbose)
            .await
            .map_err(BeeBeeError::Load)?;

        let options = ContextOptions {
            context_size: self.config.context_size,
            threads: self.config.threads,
        };
        let context = match model.create_context(options).await {
            Ok(context) => context,
            Err(e) => {
                model.dispose().await;
                return Err(BeeBeeError::Load(e.context("failed to create inference context")));
            }
        };

        log::info!("Model loaded in {:.2}s", start.elapsed().as_secs_f64());
        Ok(LoadedEngine {
            model,
            context,
            info: EngineInfo {
                model_path: path.to_path_buf(),
                context_size: options.context_size,
                threads: options.threads,
                backend: self.backend.backend_name().to_string(),
            },
        })
    }

    /// Re-check the model file without touching engine state
    pub async fn on_model_check_requested(&self) -> ModelDescriptor {
        let descriptor = self.availability.check().await;
        let event = if descriptor.exists {
            LifecycleEvent::ModelExists(descriptor.clone())
        } else {
            LifecycleEvent::ModelMissing(descriptor.clone())
        };
        self.events.emit_lifecycle(event);
        descriptor
    }

    /// Resolve download metadata, create the model directory and raise
    /// `model:download:ready`. The download itself is the host's job.
    pub async fn on_download_start(&self, source: Option<&str>) -> DownloadDescriptor {
        let descriptor = self.availability.describe_download(source);
        self.availability.ensure_storage_location().await;

        log::info!(
            "Download ready from '{}': {} -> {:?}",
            descriptor.source,
            descriptor.url,
            descriptor.destination
        );
        self.events
            .emit_lifecycle(LifecycleEvent::DownloadReady(descriptor.clone()));
        descriptor
    }

    /// Re-initialize after a download. Never fails: a re-initialization error
    /// is raised as `error{type: "initialization"}`.
    pub async fn on_download_complete(&self) -> bool {
        if !self.availability.exists().await {
            log::warn!(
                "Download reported complete but {:?} is still missing",
                self.availability.model_path()
            );
            return false;
        }

        match self.initialize().await {
            Ok(ready) => ready,
            Err(error) => {
                self.events.emit_lifecycle(LifecycleEvent::Error(ErrorEvent::new(
                    ErrorKind::Initialization,
                    error.to_string(),
                )));
                false
            }
        }
    }

    pub async fn handle_signal(&self, signal: ControlSignal) {
        log::debug!("Control signal: {:?}", signal);
        match signal {
            ControlSignal::CheckModel => {
                self.on_model_check_requested().await;
            }
            ControlSignal::DownloadStart { source } => {
                self.on_download_start(source.as_deref()).await;
            }
            ControlSignal::DownloadComplete => {
                self.on_download_complete().await;
            }
        }
    }

    /// Spawn the worker that handles control signals one at a time, in order.
    /// The worker exits once every sender is dropped.
    pub fn spawn_signal_worker(self: &Arc<Self>) -> (mpsc::UnboundedSender<ControlSignal>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                controller.handle_signal(signal).await;
            }
            log::debug!("Control signal worker stopped");
        });
        (tx, handle)
    }

    /// Forward an event from the fine-tuning collaborator verbatim.
    /// Only `finetune:*`, `upgrade:*` and `checkpoint:*` names are accepted.
    pub fn forward_passthrough(&self, event: PassthroughEvent) -> bool {
        if !event.is_reserved() {
            log::warn!("Refusing to forward non-reserved event '{}'", event.name);
            return false;
        }
        self.events.emit_passthrough(event);
        true
    }

    /// Cancel running generations, then release context, model and sessions
    /// (in that order). Idempotent.
    pub async fn dispose(&self) {
        let _guard = self.init_lock.lock().await;
        self.orchestrator.cancel_all();

        if let Some(loaded) = self.engine.take().await {
            log::info!("Releasing inference context and model");
            loaded.context.dispose().await;
            loaded.model.dispose().await;
        }
        self.sessions.clear().await;
    }

    // Prompting

    pub async fn prompt(
        &self,
        text: &str,
        options: PromptOptions,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        self.orchestrator.prompt(text, options, conversation_id).await
    }

    pub async fn prompt_stream(
        &self,
        text: &str,
        options: PromptOptions,
        on_token: Option<TokenCallback>,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        self.orchestrator
            .prompt_stream(text, options, on_token, conversation_id)
            .await
    }

    pub async fn complete(&self, text: &str, options: PromptOptions) -> Result<String> {
        self.orchestrator.complete(text, options).await
    }

    pub fn cancel_generation(&self, conversation_id: Option<&str>) -> bool {
        self.orchestrator.cancel_generation(conversation_id)
    }

    pub fn active_generations(&self) -> Vec<ActiveGeneration> {
        self.orchestrator.active_generations()
    }

    pub fn is_generating(&self, conversation_id: Option<&str>) -> bool {
        self.orchestrator.is_generating(conversation_id)
    }

    // Sessions

    pub async fn start_session(&self, conversation_id: Option<&str>) -> Result<SessionInfo> {
        self.sessions
            .start_session(conversation_id)
            .await
            .map(|session| session.info())
    }

    pub async fn end_session(&self, conversation_id: Option<&str>) -> bool {
        self.sessions.end_session(conversation_id).await
    }

    pub fn has_session(&self, conversation_id: Option<&str>) -> bool {
        self.sessions.has_session(conversation_id)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.sessions()
    }

    // State

    pub async fn state(&self) -> EngineState {
        self.engine.state().await
    }

    pub async fn is_ready(&self) -> bool {
        self.engine.is_ready().await
    }

    pub async fn engine_info(&self) -> Option<EngineInfo> {
        self.engine.info().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe_lifecycle()
    }

    pub fn subscribe_stream(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.events.subscribe_stream()
    }

    pub fn subscribe_passthrough(&self) -> broadcast::Receiver<PassthroughEvent> {
        self.events.subscribe_passthrough()
    }
}
