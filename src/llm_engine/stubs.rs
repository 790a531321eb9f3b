//! Scripted inference engine used by the unit tests
//!
//! Replays a fixed list of fragments for every generate call and counts
//! every resource acquisition and release.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use crate::config::{Config, ConfigBuilder};
use crate::llm_engine::lifecycle::LifecycleController;
use crate::llm_engine::provider::{
    ContextOptions, Fragment, FragmentSink, GenerationSequence, InferenceBackend, InferenceContext,
    LoadedModel, SamplingParams, TokenId,
};

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fragments: Vec<Fragment>,
    /// Prefix every text fragment with `[conversation]`
    pub tag_with_conversation: bool,
    /// Sleep before each fragment (otherwise yield)
    pub fragment_delay: Option<Duration>,
    pub fail_load: bool,
    pub fail_context: bool,
    /// Fail after emitting this many fragments
    pub fail_generation_after: Option<usize>,
    pub fail_detokenize: bool,
}

impl Script {
    pub fn text(parts: &[&str]) -> Self {
        Self {
            fragments: parts.iter().map(|p| Fragment::Text(p.to_string())).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }
}

#[derive(Default)]
pub struct Counters {
    pub loads: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub model_disposals: AtomicUsize,
    pub context_disposals: AtomicUsize,
    pub sequences_created: AtomicUsize,
    pub sequence_disposals: AtomicUsize,
    pub generations: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub release_log: Mutex<Vec<&'static str>>,
    pub last_params: Mutex<Option<SamplingParams>>,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn release_log(&self) -> Vec<&'static str> {
        self.release_log.lock().unwrap().clone()
    }

    fn released(&self, what: &'static str) {
        self.release_log.lock().unwrap().push(what);
    }
}

pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Mutex::new(script)),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    async fn load_model(&self, path: &Path, _verbose: bool) -> anyhow::Result<Arc<dyn LoadedModel>> {
        if self.script().fail_load {
            bail!("scripted load failure for {:?}", path);
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedModel {
            script: self.script.clone(),
            counters: self.counters.clone(),
            disposed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedModel {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    disposed: AtomicBool,
}

#[async_trait]
impl LoadedModel for ScriptedModel {
    async fn create_context(&self, _options: ContextOptions) -> anyhow::Result<Arc<dyn InferenceContext>> {
        if self.script.lock().unwrap().fail_context {
            bail!("scripted context failure");
        }
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedContext {
            script: self.script.clone(),
            counters: self.counters.clone(),
            disposed: AtomicBool::new(false),
        }))
    }

    fn detokenize(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
        if self.script.lock().unwrap().fail_detokenize {
            bail!("scripted detokenize failure");
        }
        Ok(tokens.iter().map(|t| format!("t{}", t)).collect())
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.counters.model_disposals.fetch_add(1, Ordering::SeqCst);
            self.counters.released("model");
        }
    }
}

struct ScriptedContext {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    disposed: AtomicBool,
}

#[async_trait]
impl InferenceContext for ScriptedContext {
    fn sequence(&self, conversation_id: Option<&str>) -> anyhow::Result<Box<dyn GenerationSequence>> {
        self.counters.sequences_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSequence {
            conversation_id: conversation_id.map(str::to_string),
            script: self.script.clone(),
            counters: self.counters.clone(),
            disposed: false,
        }))
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.counters.context_disposals.fetch_add(1, Ordering::SeqCst);
            self.counters.released("context");
        }
    }
}

struct ScriptedSequence {
    conversation_id: Option<String>,
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    disposed: bool,
}

#[async_trait]
impl GenerationSequence for ScriptedSequence {
    async fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        on_fragment: FragmentSink<'_>,
    ) -> anyhow::Result<String> {
        let script = self.script.lock().unwrap().clone();
        self.counters.generations.fetch_add(1, Ordering::SeqCst);
        self.counters.prompts.lock().unwrap().push(prompt.to_string());
        *self.counters.last_params.lock().unwrap() = Some(*params);

        let mut text = String::new();
        for (emitted, fragment) in script.fragments.iter().enumerate() {
            if script.fail_generation_after == Some(emitted) {
                bail!("scripted generation failure");
            }
            match script.fragment_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }

            let fragment = match fragment {
                Fragment::Text(t) if script.tag_with_conversation => {
                    let tag = self.conversation_id.as_deref().unwrap_or("default");
                    Fragment::Text(format!("[{}]{}", tag, t))
                }
                other => other.clone(),
            };
            match &fragment {
                Fragment::Text(t) => text.push_str(t),
                Fragment::Tokens(ids) => ids.iter().for_each(|id| text.push_str(&format!("t{}", id))),
            }
            on_fragment(fragment);
        }

        if script.fail_generation_after == Some(script.fragments.len()) {
            bail!("scripted generation failure");
        }
        Ok(text)
    }

    async fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.counters.sequence_disposals.fetch_add(1, Ordering::SeqCst);
            self.counters.released("sequence");
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn write_model_file(dir: &Path) -> PathBuf {
    let path = dir.join("model.gguf");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();
    path
}

/// Controller over a scripted backend with a model file present, not yet initialized
pub fn controller_with(
    script: Script,
    configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
) -> (LifecycleController, Arc<ScriptedBackend>, TempDir) {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let model_path = write_model_file(dir.path());
    let config = configure(Config::builder().model_path(model_path)).build().unwrap();
    let backend = ScriptedBackend::new(script);
    let controller = LifecycleController::new(config, backend.clone()).unwrap();
    (controller, backend, dir)
}

/// Initialized controller over a scripted backend
pub async fn ready_controller(script: Script) -> (LifecycleController, Arc<ScriptedBackend>, TempDir) {
    ready_controller_with(script, |b| b).await
}

pub async fn ready_controller_with(
    script: Script,
    configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
) -> (LifecycleController, Arc<ScriptedBackend>, TempDir) {
    let (controller, backend, dir) = controller_with(script, configure);
    assert!(controller.initialize().await.unwrap());
    (controller, backend, dir)
}

/// Everything currently buffered on a broadcast receiver
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Everything currently queued on a stream subscription
pub fn drain_stream<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
