//! Session registry - conversation id to generation sequence
//!
//! The registry is the only owner of the conversation map. Each session wraps
//! one engine sequence behind an async mutex. A per-conversation turn lock
//! outlives individual sessions, so a replaced session still generating keeps
//! its successor waiting: at most one generate call is in flight per
//! conversation id.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::GenerationPolicy;
use crate::error::{conversation_label, BeeBeeError, Result};
use crate::llm_engine::engine::EngineSlot;
use crate::llm_engine::provider::GenerationSequence;

type SharedSequence = Arc<Mutex<Box<dyn GenerationSequence>>>;

/// Conversation-wide turn, shared by every session created for one id
type Turn = Arc<Mutex<()>>;

/// Exclusive access to a session's sequence for one generate call.
///
/// Holds the conversation's turn as well; both are released on drop, the
/// sequence first.
pub struct SequenceGuard {
    sequence: OwnedMutexGuard<Box<dyn GenerationSequence>>,
    _turn: OwnedMutexGuard<()>,
}

impl Deref for SequenceGuard {
    type Target = Box<dyn GenerationSequence>;

    fn deref(&self) -> &Self::Target {
        &self.sequence
    }
}

impl DerefMut for SequenceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.sequence
    }
}

/// Snapshot of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// A generation currently holds the sequence
    pub busy: bool,
}

pub struct Session {
    conversation_id: Option<String>,
    sequence: SharedSequence,
    turn: Turn,
    disposed: AtomicBool,
    /// Ended by the caller (or cleared on dispose) rather than replaced or evicted
    ended: AtomicBool,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
    tick: AtomicU64,
}

impl Session {
    fn new(conversation_id: Option<String>, sequence: Box<dyn GenerationSequence>, turn: Turn, tick: u64) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            sequence: Arc::new(Mutex::new(sequence)),
            turn,
            disposed: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
            tick: AtomicU64::new(tick),
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.sequence.try_lock().is_err()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Ended explicitly, as opposed to replaced or evicted
    pub fn was_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Take the sequence for one generate call.
    ///
    /// `Queue` waits for a running generation on the conversation, including
    /// one still running on a replaced session; `Reject` fails fast. Either way
    /// a session disposed while waiting yields `SessionEnded`.
    pub async fn acquire(&self, policy: GenerationPolicy) -> Result<SequenceGuard> {
        let guard = match policy {
            GenerationPolicy::Queue => {
                let turn = self.turn.clone().lock_owned().await;
                SequenceGuard {
                    sequence: self.sequence.clone().lock_owned().await,
                    _turn: turn,
                }
            }
            GenerationPolicy::Reject => {
                let busy = || BeeBeeError::ConcurrentGeneration {
                    conversation_id: self.conversation_id.clone(),
                };
                let turn = self.turn.clone().try_lock_owned().map_err(|_| busy())?;
                SequenceGuard {
                    sequence: self.sequence.clone().try_lock_owned().map_err(|_| busy())?,
                    _turn: turn,
                }
            }
        };

        if self.is_disposed() {
            return Err(BeeBeeError::SessionEnded {
                conversation_id: self.conversation_id.clone(),
            });
        }
        Ok(guard)
    }

    pub fn info(&self) -> SessionInfo {
        let last_used_at = Utc
            .timestamp_millis_opt(self.last_used_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or(self.created_at);
        SessionInfo {
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            last_used_at,
            busy: self.is_busy(),
        }
    }

    fn touch(&self, tick: u64) {
        self.tick.store(tick, Ordering::SeqCst);
        self.last_used_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn last_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Release the sequence. Idempotent.
    ///
    /// An idle sequence is disposed immediately; a busy one is disposed by a
    /// background task as soon as the running generation releases it.
    async fn dispose(&self, ended: bool) {
        if ended {
            self.ended.store(true, Ordering::SeqCst);
        }
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.sequence.clone().try_lock_owned() {
            Ok(mut sequence) => sequence.dispose().await,
            Err(_) => {
                log::debug!(
                    "Session {} is generating; disposing its sequence once released",
                    conversation_label(&self.conversation_id)
                );
                let sequence = self.sequence.clone();
                tokio::spawn(async move {
                    sequence.lock().await.dispose().await;
                });
            }
        }
    }
}

pub struct SessionRegistry {
    engine: Arc<EngineSlot>,
    sessions: DashMap<Option<String>, Arc<Session>>,
    turns: DashMap<Option<String>, Turn>,
    max_sessions: Option<usize>,
    clock: AtomicU64,
}

impl SessionRegistry {
    pub fn new(engine: Arc<EngineSlot>, max_sessions: Option<usize>) -> Self {
        Self {
            engine,
            sessions: DashMap::new(),
            turns: DashMap::new(),
            max_sessions,
            clock: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn turn(&self, key: &Option<String>) -> Turn {
        self.turns.entry(key.clone()).or_default().clone()
    }

    /// Forget a conversation's turn unless a generation still holds it
    fn release_turn(&self, key: &Option<String>) {
        self.turns.remove_if(key, |_, turn| turn.try_lock().is_ok());
    }

    /// Create a fresh session for a conversation, replacing (with a warning)
    /// any existing one.
    pub async fn start_session(&self, conversation_id: Option<&str>) -> Result<Arc<Session>> {
        let context = self.engine.context().await?;
        let key = conversation_id.map(str::to_string);

        let sequence = context.sequence(conversation_id).map_err(BeeBeeError::SessionCreate)?;
        let session = Arc::new(Session::new(key.clone(), sequence, self.turn(&key), self.next_tick()));

        if let Some(previous) = self.sessions.insert(key.clone(), session.clone()) {
            log::warn!(
                "Session for conversation {} already existed; replacing it",
                conversation_label(&key)
            );
            previous.dispose(false).await;
        } else {
            log::info!("Started session for conversation {}", conversation_label(&key));
        }

        self.evict_over_capacity(&key).await;
        Ok(session)
    }

    /// Existing session for the conversation, created lazily on first use
    pub async fn resolve_session(&self, conversation_id: Option<&str>) -> Result<Arc<Session>> {
        let context = self.engine.context().await?;
        let key = conversation_id.map(str::to_string);
        let tick = self.next_tick();

        let (session, created) = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let sequence = context.sequence(conversation_id).map_err(BeeBeeError::SessionCreate)?;
                let session = Arc::new(Session::new(key.clone(), sequence, self.turn(&key), tick));
                entry.insert(session.clone());
                (session, true)
            }
        };

        if created {
            log::info!("Created session for conversation {} on first use", conversation_label(&key));
            self.evict_over_capacity(&key).await;
        } else {
            session.touch(tick);
        }
        Ok(session)
    }

    /// Dispose a conversation's session. Returns false if there was none.
    pub async fn end_session(&self, conversation_id: Option<&str>) -> bool {
        let key = conversation_id.map(str::to_string);
        match self.sessions.remove(&key) {
            Some((_, session)) => {
                session.dispose(true).await;
                self.release_turn(&key);
                log::info!("Ended session for conversation {}", conversation_label(&key));
                true
            }
            None => false,
        }
    }

    /// Dispose every session
    pub async fn clear(&self) {
        let keys: Vec<Option<String>> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.dispose(true).await;
            }
            self.release_turn(&key);
        }
    }

    pub fn has_session(&self, conversation_id: Option<&str>) -> bool {
        self.sessions.contains_key(&conversation_id.map(str::to_string))
    }

    /// Snapshots ordered from most to least recently used
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<(u64, SessionInfo)> = self
            .sessions
            .iter()
            .map(|e| (e.value().last_tick(), e.value().info()))
            .collect();
        sessions.sort_by(|a, b| b.0.cmp(&a.0));
        sessions.into_iter().map(|(_, info)| info).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict least recently used idle sessions until within `max_sessions`.
    /// `keep` (the session just created) is never evicted.
    async fn evict_over_capacity(&self, keep: &Option<String>) {
        let Some(max) = self.max_sessions else {
            return;
        };

        while self.sessions.len() > max {
            let victim = self
                .sessions
                .iter()
                .filter(|e| e.key() != keep && !e.value().is_busy())
                .min_by_key(|e| e.value().last_tick())
                .map(|e| e.key().clone());

            let Some(key) = victim else {
                log::warn!(
                    "Session limit {} exceeded ({} live) but every other session is busy",
                    max,
                    self.sessions.len()
                );
                return;
            };

            if let Some((_, session)) = self.sessions.remove(&key) {
                log::info!(
                    "Evicting least recently used session for conversation {}",
                    conversation_label(&key)
                );
                session.dispose(false).await;
                self.release_turn(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::engine::{EngineInfo, LoadedEngine};
    use crate::llm_engine::provider::{ContextOptions, InferenceBackend};
    use crate::llm_engine::stubs::{Counters, Script, ScriptedBackend};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    async fn ready_slot() -> (Arc<EngineSlot>, Arc<Counters>) {
        let backend = ScriptedBackend::new(Script::text(&["ok"]));
        let model = backend.load_model(Path::new("/m.gguf"), false).await.unwrap();
        let context = model
            .create_context(ContextOptions {
                context_size: 2048,
                threads: 4,
            })
            .await
            .unwrap();
        let slot = Arc::new(EngineSlot::new());
        slot.install(LoadedEngine {
            model,
            context,
            info: EngineInfo {
                model_path: PathBuf::from("/m.gguf"),
                context_size: 2048,
                threads: 4,
                backend: backend.backend_name().to_string(),
            },
        })
        .await;
        (slot, backend.counters())
    }

    async fn wait_for(counter: &std::sync::atomic::AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if Counters::get(counter) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(Counters::get(counter), expected);
    }

    #[tokio::test]
    async fn test_requires_ready_engine() {
        let registry = SessionRegistry::new(Arc::new(EngineSlot::new()), None);

        assert!(matches!(
            registry.start_session(Some("a")).await,
            Err(BeeBeeError::NotInitialized)
        ));
        assert!(matches!(
            registry.resolve_session(None).await,
            Err(BeeBeeError::NotInitialized)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lazy_resolve_reuses_session() {
        let (slot, counters) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);

        let first = registry.resolve_session(None).await.unwrap();
        let second = registry.resolve_session(None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(Counters::get(&counters.sequences_created), 1);
        assert!(registry.has_session(None));
        assert!(!registry.has_session(Some("other")));
    }

    #[tokio::test]
    async fn test_start_session_overwrites_and_disposes_previous() {
        let (slot, counters) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);

        let old = registry.start_session(Some("a")).await.unwrap();
        let new = registry.start_session(Some("a")).await.unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_disposed());
        assert!(!old.was_ended());
        assert_eq!(registry.len(), 1);
        assert_eq!(Counters::get(&counters.sequences_created), 2);
        assert_eq!(Counters::get(&counters.sequence_disposals), 1);
    }

    #[tokio::test]
    async fn test_overwrite_busy_session_defers_disposal() {
        let (slot, counters) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);

        let old = registry.start_session(Some("a")).await.unwrap();
        let guard = old.acquire(GenerationPolicy::Queue).await.unwrap();
        assert!(registry.sessions()[0].busy);

        registry.start_session(Some("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(Counters::get(&counters.sequence_disposals), 0);

        drop(guard);
        wait_for(&counters.sequence_disposals, 1).await;
    }

    #[tokio::test]
    async fn test_replaced_session_keeps_conversation_turn() {
        let (slot, _) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);

        let old = registry.start_session(Some("a")).await.unwrap();
        let guard = old.acquire(GenerationPolicy::Queue).await.unwrap();
        let new = registry.start_session(Some("a")).await.unwrap();

        assert!(matches!(
            new.acquire(GenerationPolicy::Reject).await,
            Err(BeeBeeError::ConcurrentGeneration { .. })
        ));
        let waiting = tokio::time::timeout(Duration::from_millis(20), new.acquire(GenerationPolicy::Queue)).await;
        assert!(waiting.is_err());

        drop(guard);
        assert!(new.acquire(GenerationPolicy::Queue).await.is_ok());
    }

    #[tokio::test]
    async fn test_end_session() {
        let (slot, counters) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);

        let session = registry.start_session(Some("a")).await.unwrap();
        assert!(registry.end_session(Some("a")).await);
        assert!(!registry.end_session(Some("a")).await);
        assert!(session.was_ended());
        assert_eq!(Counters::get(&counters.sequence_disposals), 1);

        assert!(matches!(
            session.acquire(GenerationPolicy::Queue).await,
            Err(BeeBeeError::SessionEnded { .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let (slot, _) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);
        let session = registry.resolve_session(Some("a")).await.unwrap();

        let _guard = session.acquire(GenerationPolicy::Reject).await.unwrap();
        assert!(matches!(
            session.acquire(GenerationPolicy::Reject).await,
            Err(BeeBeeError::ConcurrentGeneration { conversation_id: Some(id) }) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let (slot, counters) = ready_slot().await;
        let registry = SessionRegistry::new(slot, Some(2));

        registry.resolve_session(Some("a")).await.unwrap();
        registry.resolve_session(Some("b")).await.unwrap();
        registry.resolve_session(Some("a")).await.unwrap();
        registry.resolve_session(Some("c")).await.unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.has_session(Some("a")));
        assert!(!registry.has_session(Some("b")));
        assert!(registry.has_session(Some("c")));
        assert_eq!(Counters::get(&counters.sequence_disposals), 1);

        let order: Vec<_> = registry.sessions().into_iter().map(|s| s.conversation_id).collect();
        assert_eq!(order, vec![Some("c".to_string()), Some("a".to_string())]);
    }

    #[tokio::test]
    async fn test_busy_sessions_are_not_evicted() {
        let (slot, _) = ready_slot().await;
        let registry = SessionRegistry::new(slot, Some(1));

        let busy = registry.resolve_session(Some("a")).await.unwrap();
        let _guard = busy.acquire(GenerationPolicy::Queue).await.unwrap();
        registry.resolve_session(Some("b")).await.unwrap();

        assert_eq!(registry.len(), 2);
        assert!(!busy.is_disposed());
    }

    #[tokio::test]
    async fn test_clear_disposes_everything() {
        let (slot, counters) = ready_slot().await;
        let registry = SessionRegistry::new(slot, None);

        registry.start_session(Some("a")).await.unwrap();
        registry.start_session(Some("b")).await.unwrap();
        registry.resolve_session(None).await.unwrap();

        registry.clear().await;
        assert!(registry.is_empty());
        assert_eq!(Counters::get(&counters.sequence_disposals), 3);
    }
}
