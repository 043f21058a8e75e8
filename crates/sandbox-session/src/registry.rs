//! Session registry: one live sandbox per (conversation, runtime).

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use remote_sandbox_core::{RuntimeKind, SandboxConfig, SandboxError, SandboxProvider, SharedHandle};
use tokio::{
    sync::{Mutex as AsyncMutex, OnceCell},
    task::JoinHandle,
    time::Instant,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session key: a conversation paired with a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub conversation_id: String,
    pub runtime: RuntimeKind,
}

impl SessionKey {
    /// Create a key.
    #[must_use]
    pub fn new<S: Into<String>>(conversation_id: S, runtime: RuntimeKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            runtime,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.conversation_id, self.runtime)
    }
}

/// A live sandbox bound to one key.
///
/// Cheap to clone; all clones share the same handle.
#[derive(Clone)]
pub struct Session {
    key: SessionKey,
    handle: SharedHandle,
    created_at: Instant,
    /// One-time per-session setup (e.g. installing a runner tool).
    prepared: Arc<OnceCell<()>>,
}

impl Session {
    fn new(key: SessionKey, handle: SharedHandle) -> Self {
        Self {
            key,
            handle,
            created_at: Instant::now(),
            prepared: Arc::new(OnceCell::new()),
        }
    }

    /// Key this session is registered under.
    #[must_use]
    pub const fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Remote sandbox handle.
    #[must_use]
    pub const fn handle(&self) -> &SharedHandle {
        &self.handle
    }

    /// Stable id of the remote sandbox.
    #[must_use]
    pub fn remote_id(&self) -> &str {
        self.handle.id()
    }

    /// Run `setup` once for the lifetime of this session.
    ///
    /// Concurrent callers wait for the first run; the outcome of `setup` is
    /// not inspected, so a failed setup is not retried.
    pub async fn prepare_once<F, Fut>(&self, setup: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.prepared.get_or_init(setup).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("remote_id", &self.remote_id())
            .finish_non_exhaustive()
    }
}

struct Entry {
    session: Session,
    last_used: Instant,
}

/// Per-key slot. Its async mutex serializes creation for that key.
enum SlotState {
    /// Registered but no sandbox yet (creation in flight or about to start).
    Vacant,
    Ready(Entry),
    /// Removed from the map; holders must look the key up again.
    Retired,
}

type Slot = Arc<AsyncMutex<SlotState>>;

/// Registry timings.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub max_lifetime: Duration,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl From<&SandboxConfig> for RegistryConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_lifetime: config.max_lifetime,
            idle_ttl: config.idle_ttl,
            sweep_interval: config.sweep_interval,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

/// Session lifecycle registry.
///
/// Shared by every entry point through `Arc`; lives for the whole process.
pub struct SessionRegistry {
    provider: Arc<dyn SandboxProvider>,
    config: RegistryConfig,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl SessionRegistry {
    /// Create a registry backed by `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>, config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            provider,
            config,
            slots: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Provider sessions are created from.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Registry timings.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn slot_for(&self, key: &SessionKey) -> Slot {
        Arc::clone(
            lock(&self.slots)
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(SlotState::Vacant))),
        )
    }

    fn remove_slot(&self, key: &SessionKey, slot: &Slot) {
        let mut slots = lock(&self.slots);
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    /// Get the session for `(conversation_id, runtime)`, creating it on first use.
    ///
    /// # Errors
    /// Returns error if the provider cannot create a sandbox.
    pub async fn acquire(&self, conversation_id: &str, runtime: RuntimeKind) -> Result<Session, SandboxError> {
        self.acquire_with_hint(conversation_id, runtime, None).await
    }

    /// Like [`Self::acquire`], but on a local miss first try to adopt the
    /// sandbox `remote_id` (previously handed to the client) before creating
    /// a new one. Adoption only happens when the runtime matches.
    ///
    /// # Errors
    /// Returns error if the provider cannot create a sandbox.
    pub async fn acquire_with_hint(
        &self,
        conversation_id: &str,
        runtime: RuntimeKind,
        remote_id: Option<&str>,
    ) -> Result<Session, SandboxError> {
        let key = SessionKey::new(conversation_id, runtime);

        loop {
            let slot = self.slot_for(&key);
            let mut state = slot.lock().await;

            match &mut *state {
                SlotState::Ready(entry) => {
                    entry.last_used = Instant::now();
                    return Ok(entry.session.clone());
                }
                SlotState::Retired => continue,
                SlotState::Vacant => {}
            }

            // Other callers for this key wait on the slot lock meanwhile.
            match self.open(&key, remote_id).await {
                Ok(session) => {
                    *state = SlotState::Ready(Entry {
                        session: session.clone(),
                        last_used: Instant::now(),
                    });
                    drop(state);
                    self.ensure_sweeper();
                    return Ok(session);
                }
                Err(e) => {
                    // Unregister before releasing waiters so they retry on a fresh slot.
                    self.remove_slot(&key, &slot);
                    *state = SlotState::Retired;
                    return Err(e);
                }
            }
        }
    }

    async fn open(&self, key: &SessionKey, remote_id: Option<&str>) -> Result<Session, SandboxError> {
        if let Some(remote_id) = remote_id {
            match self.provider.get(remote_id).await {
                Ok(handle) if handle.runtime() == key.runtime => {
                    tracing::info!(%key, remote_id, "Adopted existing sandbox");
                    return Ok(Session::new(key.clone(), handle));
                }
                Ok(handle) => {
                    tracing::debug!(%key, remote_id, runtime = %handle.runtime(), "Hinted sandbox has another runtime");
                }
                Err(e) => {
                    tracing::debug!(%key, remote_id, "Hinted sandbox unavailable: {e}");
                }
            }
        }

        let handle = self.provider.create(key.runtime, self.config.max_lifetime).await?;
        tracing::info!(%key, remote_id = handle.id(), "Created sandbox session");
        Ok(Session::new(key.clone(), handle))
    }

    /// Current session for a key, without touching `last_used`.
    ///
    /// Returns `None` while a creation for the key is still in flight.
    #[must_use]
    pub fn peek(&self, key: &SessionKey) -> Option<Session> {
        let slot = lock(&self.slots).get(key).cloned()?;
        let state = slot.try_lock().ok()?;
        match &*state {
            SlotState::Ready(entry) => Some(entry.session.clone()),
            SlotState::Vacant | SlotState::Retired => None,
        }
    }

    /// Every live session of a conversation, in [`RuntimeKind::ALL`] order.
    #[must_use]
    pub fn sessions_for(&self, conversation_id: &str) -> Vec<Session> {
        RuntimeKind::ALL
            .into_iter()
            .filter_map(|runtime| self.peek(&SessionKey::new(conversation_id, runtime)))
            .collect()
    }

    /// Forget a session whose sandbox is presumed dead.
    ///
    /// No remote stop is attempted; the next `acquire` creates a fresh sandbox.
    pub async fn drop_dead(&self, key: &SessionKey) {
        let slot = lock(&self.slots).remove(key);
        let Some(slot) = slot else {
            return;
        };
        let mut state = slot.lock().await;
        if let SlotState::Ready(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
            tracing::warn!(%key, remote_id = entry.session.remote_id(), "Dropped dead sandbox session");
        }
    }

    /// Stop and remove sessions idle for longer than the TTL as of `now`.
    ///
    /// Sessions busy being created or acquired are skipped this round.
    /// Returns the number of sessions still registered.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        let idle_ttl = self.config.idle_ttl;
        let mut evicted = Vec::new();

        let remaining = {
            let mut slots = lock(&self.slots);
            slots.retain(|key, slot| {
                let Ok(mut state) = slot.try_lock() else {
                    return true;
                };
                let idle = matches!(&*state, SlotState::Ready(entry) if now.saturating_duration_since(entry.last_used) > idle_ttl);
                if !idle {
                    return true;
                }
                if let SlotState::Ready(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
                    let age = now.saturating_duration_since(entry.session.created_at);
                    tracing::info!(%key, remote_id = entry.session.remote_id(), ?age, "Evicting idle sandbox session");
                    evicted.push(entry.session);
                }
                false
            });
            slots.len()
        };

        for session in evicted {
            if let Err(e) = session.handle().stop().await {
                tracing::warn!(key = %session.key(), remote_id = session.remote_id(), "Failed to stop idle sandbox: {e}");
            }
        }

        remaining
    }

    /// Number of registered keys (including creations in flight).
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the idle sweep task is currently running.
    #[must_use]
    pub fn sweeper_running(&self) -> bool {
        lock(&self.sweeper).as_ref().is_some_and(|task| !task.is_finished())
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let registry = self.this.clone();
        let period = self.config.sweep_interval;
        tracing::debug!(?period, "Starting idle sweep");
        *sweeper = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.evict_idle(Instant::now()).await;
                if registry.stop_sweeper_if_empty() {
                    return;
                }
            }
        }));
    }

    /// Called from the sweep task; decides under the sweeper lock so a
    /// concurrent `ensure_sweeper` either sees this task alive or spawns anew.
    fn stop_sweeper_if_empty(&self) -> bool {
        let mut sweeper = lock(&self.sweeper);
        if !lock(&self.slots).is_empty() {
            return false;
        }
        tracing::debug!("No sessions left, stopping idle sweep");
        *sweeper = None;
        true
    }
}
