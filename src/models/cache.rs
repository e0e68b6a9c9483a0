use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{LoadedModel, ModelBackend, ModelError, ModelRegistry, ModelRole};

/// Limits applied by the model cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum number of models loaded at once, loads in flight included.
    pub capacity: usize,
    /// Idle time after which a model is unloaded regardless of headroom.
    pub ttl: Duration,
    /// How long `acquire` waits for a slot before giving up.
    pub acquire_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 3,
            ttl: Duration::from_secs(900),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Accumulated usage of one role since start-up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoleUsage {
    /// Successful backend loads.
    pub loads: u64,
    /// Failed backend loads.
    pub load_failures: u64,
    /// Unloads to make room for another role.
    pub evictions: u64,
    /// Unloads after the idle TTL elapsed.
    pub expirations: u64,
    /// Handles handed out, shared acquisitions included.
    pub acquisitions: u64,
    /// Milliseconds during which at least one handle for the role was held.
    pub active_ms: u64,
}

/// Snapshot of one loaded model.
#[derive(Clone, Debug, Serialize)]
pub struct LoadedModelInfo {
    /// Role the model serves.
    pub role: ModelRole,
    /// Backend model identifier.
    pub model_id: String,
    /// Handles currently held.
    pub refs: usize,
    /// Times the model was handed out since it was loaded.
    pub uses: u64,
    /// Seconds since the model was loaded.
    pub loaded_secs: u64,
    /// Seconds since the last handle was released; zero while in use.
    pub idle_secs: u64,
}

/// Cache state as reported to operators.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    /// Backend name.
    pub backend: &'static str,
    /// Configured capacity.
    pub capacity: usize,
    /// Configured idle TTL in seconds.
    pub ttl_secs: u64,
    /// Models currently loaded.
    pub loaded: Vec<LoadedModelInfo>,
    /// Per-role usage since start-up.
    pub usage: BTreeMap<ModelRole, RoleUsage>,
}

struct CacheEntry {
    model: Arc<dyn LoadedModel>,
    refs: usize,
    uses: u64,
    loaded_at: Instant,
    last_used: Instant,
    active_since: Option<Instant>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ModelRole, CacheEntry>,
    loading: HashSet<ModelRole>,
    usage: HashMap<ModelRole, RoleUsage>,
}

impl CacheState {
    fn usage_mut(&mut self, role: ModelRole) -> &mut RoleUsage {
        self.usage.entry(role).or_default()
    }

    fn occupied(&self) -> usize {
        self.entries.len() + self.loading.len()
    }

    /// Remove idle entries past the TTL and return them for unloading.
    fn take_expired(&mut self, now: Instant, ttl: Duration) -> Vec<(ModelRole, Arc<dyn LoadedModel>)> {
        let expired: Vec<ModelRole> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.refs == 0 && now.duration_since(entry.last_used) >= ttl)
            .map(|(role, _)| *role)
            .collect();

        expired
            .into_iter()
            .filter_map(|role| {
                let entry = self.entries.remove(&role)?;
                self.usage_mut(role).expirations += 1;
                Some((role, entry.model))
            })
            .collect()
    }

    /// Remove the least recently used idle entry.
    fn evict_lru(&mut self) -> Option<(ModelRole, Arc<dyn LoadedModel>)> {
        let victim = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.refs == 0)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(role, _)| *role)?;
        let entry = self.entries.remove(&victim)?;
        self.usage_mut(victim).evictions += 1;
        Some((victim, entry.model))
    }

    fn check_out(&mut self, role: ModelRole, now: Instant) -> Option<Arc<dyn LoadedModel>> {
        let entry = self.entries.get_mut(&role)?;
        if entry.refs == 0 {
            entry.active_since = Some(now);
        }
        entry.refs += 1;
        entry.uses += 1;
        entry.last_used = now;
        let model = entry.model.clone();
        self.usage_mut(role).acquisitions += 1;
        Some(model)
    }
}

struct CacheInner {
    backend: Arc<dyn ModelBackend>,
    registry: ModelRegistry,
    settings: CacheSettings,
    state: Mutex<CacheState>,
    changed: Notify,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, role: ModelRole) {
        {
            let mut state = self.lock();
            let now = Instant::now();
            let mut active = None;
            if let Some(entry) = state.entries.get_mut(&role) {
                entry.refs = entry.refs.saturating_sub(1);
                entry.last_used = now;
                if entry.refs == 0 {
                    active = entry.active_since.take().map(|since| now.duration_since(since));
                }
            }
            if let Some(active) = active {
                state.usage_mut(role).active_ms += active.as_millis() as u64;
            }
        }
        self.changed.notify_waiters();
    }
}

/// What `acquire` decided to do while holding the state lock.
enum Decision {
    Ready(Arc<dyn LoadedModel>),
    Load,
    Wait,
}

/// Bounded, shared cache of loaded models.
///
/// Cloning the cache is cheap; clones share the same state.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<CacheInner>,
}

impl ModelCache {
    /// Create a cache over `backend` serving the models in `registry`.
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        registry: ModelRegistry,
        settings: CacheSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                registry,
                settings: CacheSettings {
                    capacity: settings.capacity.max(1),
                    ..settings
                },
                state: Mutex::new(CacheState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Configured limits.
    pub fn settings(&self) -> CacheSettings {
        self.inner.settings
    }

    /// Obtain a handle to the model for `role`, loading it when needed.
    ///
    /// Concurrent callers for the same role share one loaded model. When every slot is taken,
    /// the least recently used idle model is evicted; when none is idle the call waits until a
    /// handle is released or the acquire timeout elapses.
    pub async fn acquire(&self, role: ModelRole) -> Result<ModelHandle, ModelError> {
        let spec = self.inner.registry.spec(role)?.clone();
        let settings = self.inner.settings;
        let started = Instant::now();
        let deadline = started + settings.acquire_timeout;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut to_unload = Vec::new();
            let decision = {
                let mut state = self.inner.lock();
                let now = Instant::now();
                to_unload.extend(state.take_expired(now, settings.ttl));

                if let Some(model) = state.check_out(role, now) {
                    Decision::Ready(model)
                } else if state.loading.contains(&role) {
                    Decision::Wait
                } else if state.occupied() < settings.capacity {
                    state.loading.insert(role);
                    Decision::Load
                } else if let Some(victim) = state.evict_lru() {
                    to_unload.push(victim);
                    state.loading.insert(role);
                    Decision::Load
                } else {
                    Decision::Wait
                }
            };

            self.unload_all(to_unload, "expired or evicted").await;

            match decision {
                Decision::Ready(model) => {
                    tracing::trace!(%role, model = model.model_id(), "Shared loaded model");
                    return Ok(self.handle(role, model));
                }
                Decision::Load => return self.load(role, &spec).await,
                Decision::Wait => {
                    tracing::debug!(%role, "Model cache full; waiting for a release");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::warn!(%role, waited = ?started.elapsed(), "Model cache acquire timed out");
                        return Err(ModelError::CapacityTimeout {
                            role,
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        }
    }

    async fn load(
        &self,
        role: ModelRole,
        spec: &super::ModelSpec,
    ) -> Result<ModelHandle, ModelError> {
        let guard = LoadingGuard {
            inner: &self.inner,
            role,
            armed: true,
        };
        let result = self.inner.backend.load(role, spec).await;
        guard.finish();

        let model = {
            let mut state = self.inner.lock();
            match result {
                Ok(model) => {
                    let now = Instant::now();
                    state.entries.insert(
                        role,
                        CacheEntry {
                            model: model.clone(),
                            refs: 1,
                            uses: 1,
                            loaded_at: now,
                            last_used: now,
                            active_since: Some(now),
                        },
                    );
                    let usage = state.usage_mut(role);
                    usage.loads += 1;
                    usage.acquisitions += 1;
                    Ok(model)
                }
                Err(error) => {
                    state.usage_mut(role).load_failures += 1;
                    Err(error)
                }
            }
        };
        self.inner.changed.notify_waiters();

        match model {
            Ok(model) => {
                tracing::info!(
                    %role,
                    model = model.model_id(),
                    backend = self.inner.backend.name(),
                    "Loaded model into cache"
                );
                Ok(self.handle(role, model))
            }
            Err(error) => {
                tracing::warn!(%role, model = %spec.model_id, error = %error, "Model load failed");
                Err(error)
            }
        }
    }

    fn handle(&self, role: ModelRole, model: Arc<dyn LoadedModel>) -> ModelHandle {
        ModelHandle {
            cache: Arc::downgrade(&self.inner),
            role,
            model,
        }
    }

    async fn unload_all(&self, models: Vec<(ModelRole, Arc<dyn LoadedModel>)>, reason: &str) {
        for (role, model) in models {
            tracing::info!(%role, model = model.model_id(), reason, "Unloading model");
            if let Err(error) = model.unload().await {
                tracing::warn!(%role, model = model.model_id(), error = %error, "Model unload failed");
            }
        }
    }

    /// Return a handle to the cache. Equivalent to dropping it.
    pub fn release(&self, handle: ModelHandle) {
        drop(handle);
    }

    /// Load `role` eagerly and leave it idle in the cache.
    pub async fn warm(&self, role: ModelRole) -> Result<(), ModelError> {
        let handle = self.acquire(role).await?;
        self.release(handle);
        Ok(())
    }

    /// Warm every priority role. Failures are logged and returned, never fatal.
    pub async fn warm_priority(&self) -> Vec<(ModelRole, ModelError)> {
        let mut failures = Vec::new();
        for role in self.inner.registry.priority_roles() {
            match self.warm(role).await {
                Ok(()) => tracing::info!(%role, "Warmed priority model"),
                Err(error) => {
                    tracing::warn!(%role, error = %error, "Could not warm priority model");
                    failures.push((role, error));
                }
            }
        }
        failures
    }

    /// Unload idle models past the TTL. Returns the number unloaded.
    pub async fn sweep_expired(&self) -> usize {
        let expired = {
            let mut state = self.inner.lock();
            state.take_expired(Instant::now(), self.inner.settings.ttl)
        };
        let count = expired.len();
        if count > 0 {
            self.unload_all(expired, "idle ttl").await;
            self.inner.changed.notify_waiters();
        }
        count
    }

    /// Run [`ModelCache::sweep_expired`] every `interval` until the cache is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ModelCache { inner }.sweep_expired().await;
            }
        })
    }

    /// Number of models currently loaded.
    pub fn loaded_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Usage counters for one role.
    pub fn usage(&self, role: ModelRole) -> RoleUsage {
        self.inner
            .lock()
            .usage
            .get(&role)
            .cloned()
            .unwrap_or_default()
    }

    /// Operator-facing snapshot of the cache.
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        let now = Instant::now();
        let mut loaded: Vec<LoadedModelInfo> = state
            .entries
            .iter()
            .map(|(role, entry)| LoadedModelInfo {
                role: *role,
                model_id: entry.model.model_id().to_string(),
                refs: entry.refs,
                uses: entry.uses,
                loaded_secs: now.duration_since(entry.loaded_at).as_secs(),
                idle_secs: if entry.refs == 0 {
                    now.duration_since(entry.last_used).as_secs()
                } else {
                    0
                },
            })
            .collect();
        loaded.sort_by_key(|info| info.role);

        CacheStats {
            backend: self.inner.backend.name(),
            capacity: self.inner.settings.capacity,
            ttl_secs: self.inner.settings.ttl.as_secs(),
            loaded,
            usage: state
                .usage
                .iter()
                .map(|(role, usage)| (*role, usage.clone()))
                .collect(),
        }
    }
}

/// Clears the loading marker if a load is abandoned midway (for example by a stage timeout).
struct LoadingGuard<'a> {
    inner: &'a CacheInner,
    role: ModelRole,
    armed: bool,
}

impl LoadingGuard<'_> {
    fn finish(mut self) {
        self.inner.lock().loading.remove(&self.role);
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().loading.remove(&self.role);
            self.inner.changed.notify_waiters();
        }
    }
}

/// Reference-counted access to a loaded model. Released on drop.
pub struct ModelHandle {
    cache: Weak<CacheInner>,
    role: ModelRole,
    model: Arc<dyn LoadedModel>,
}

impl ModelHandle {
    /// Role the handle was acquired for.
    pub fn role(&self) -> ModelRole {
        self.role
    }

    /// The shared model.
    pub fn model(&self) -> &dyn LoadedModel {
        self.model.as_ref()
    }

    /// Embed `texts` with the held model.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        self.model.embed(texts).await
    }

    /// Complete `prompt` with the held model.
    pub async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        self.model.complete(prompt).await
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("role", &self.role)
            .field("model_id", &self.model.model_id())
            .finish()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            inner.release(self.role);
        }
    }
}
