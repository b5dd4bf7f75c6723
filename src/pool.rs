//! Per-language-pair worker pools.
//!
//! The pool lazily creates a group of N managers per `(source, target)` pair,
//! dispatches over them round-robin, evicts idle pairs on a timer, and
//! refuses new pairs when system memory is too low for another worker.
//!
//! Locking: the pool map is guarded by a read/write lock that is only held
//! for map access. Slow work (model checks, worker spawn, readiness polls)
//! happens under a separate single-flight creation lock so concurrent
//! requests for the same new pair build it exactly once without blocking
//! lookups of existing pairs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::ModelCatalog;
use crate::config::Settings;
use crate::error::TranslateError;
use crate::ports::free_port;
use crate::worker::{WorkerArgs, WorkerManager};

const READINESS_ATTEMPTS: u32 = 30;
const READINESS_INTERVAL: Duration = Duration::from_millis(100);
const BULK_CLEANUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Probe for available system memory in MB. Injectable so tests can simulate
/// memory pressure; a probe returning 0 means "unknown" and admits.
pub type MemoryProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Available system memory in MB, or 0 when it cannot be determined.
pub fn available_memory_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory() / (1024 * 1024)
}

struct EntryState {
    next_idx: usize,
    last_used: Instant,
    idle_timer: Option<JoinHandle<()>>,
}

/// One pool entry: the manager group serving a single language pair.
pub struct EngineEntry {
    key: String,
    managers: Vec<Arc<WorkerManager>>,
    state: Mutex<EntryState>,
}

impl EngineEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn managers(&self) -> &[Arc<WorkerManager>] {
        &self.managers
    }

    pub fn last_used(&self) -> Instant {
        self.state.lock().last_used
    }

    /// Round-robin selection, preferring a running manager. When none is
    /// running (all mid-restart) the cursor manager is returned anyway:
    /// surfacing its failure beats blocking the caller.
    pub fn next_manager(&self) -> Arc<WorkerManager> {
        let mut state = self.state.lock();
        let n = self.managers.len();

        let start = state.next_idx;
        for i in 0..n {
            let idx = (start + i) % n;
            if self.managers[idx].is_running() {
                state.next_idx = idx + 1;
                return Arc::clone(&self.managers[idx]);
            }
        }

        let idx = state.next_idx % n;
        state.next_idx += 1;
        Arc::clone(&self.managers[idx])
    }
}

/// Pool of engine entries keyed `"<src>-<tgt>"`.
pub struct EnginePool {
    settings: Arc<Settings>,
    catalog: Arc<dyn ModelCatalog>,
    entries: RwLock<HashMap<String, Arc<EngineEntry>>>,
    creation: tokio::sync::Mutex<()>,
    mem_probe: MemoryProbe,
}

fn pair_key(from: &str, to: &str) -> String {
    format!("{from}-{to}")
}

impl EnginePool {
    pub fn new(settings: Arc<Settings>, catalog: Arc<dyn ModelCatalog>) -> Arc<Self> {
        Self::with_memory_probe(settings, catalog, Arc::new(available_memory_mb))
    }

    pub fn with_memory_probe(
        settings: Arc<Settings>,
        catalog: Arc<dyn ModelCatalog>,
        mem_probe: MemoryProbe,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            catalog,
            entries: RwLock::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
            mem_probe,
        })
    }

    /// Look up the entry serving a pair, if it exists.
    pub fn entry(&self, from: &str, to: &str) -> Option<Arc<EngineEntry>> {
        self.entries.read().get(&pair_key(from, to)).cloned()
    }

    pub fn contains(&self, from: &str, to: &str) -> bool {
        self.entries.read().contains_key(&pair_key(from, to))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Get a manager for the pair, creating the worker group on first use.
    /// Every hit refreshes the entry's idle-eviction timer.
    pub async fn get_or_create(
        self: &Arc<Self>,
        from: &str,
        to: &str,
    ) -> Result<Arc<WorkerManager>, TranslateError> {
        let key = pair_key(from, to);

        let existing = self.entries.read().get(&key).cloned();
        if let Some(entry) = existing {
            let manager = entry.next_manager();
            self.arm_idle_timer(&entry);
            return Ok(manager);
        }

        // Single-flight the slow path; the map lock is never held across it.
        let _creating = self.creation.lock().await;
        let existing = self.entries.read().get(&key).cloned();
        if let Some(entry) = existing {
            let manager = entry.next_manager();
            self.arm_idle_timer(&entry);
            return Ok(manager);
        }

        self.check_memory()?;

        if self.settings.offline_mode {
            debug!(from = from, to = to, "offline mode, using models already on disk");
        }
        let pair_dir = self.catalog.ensure_model(from, to)?;

        let workers = self.settings.effective_workers();
        info!(from = from, to = to, workers = workers, "creating engine pool");

        let mut managers: Vec<Arc<WorkerManager>> = Vec::with_capacity(workers);
        for i in 0..workers {
            match self.start_worker(&pair_dir).await {
                Ok(manager) => {
                    info!(
                        from = from,
                        to = to,
                        worker = i + 1,
                        port = manager.port(),
                        "worker ready"
                    );
                    managers.push(manager);
                }
                Err(e) => {
                    // Roll back everything created in this call.
                    for manager in &managers {
                        manager.cleanup().await;
                    }
                    return Err(e);
                }
            }
        }

        let entry = Arc::new(EngineEntry {
            key: key.clone(),
            managers,
            state: Mutex::new(EntryState {
                next_idx: 0,
                last_used: Instant::now(),
                idle_timer: None,
            }),
        });

        self.entries.write().insert(key, Arc::clone(&entry));
        self.arm_idle_timer(&entry);

        Ok(entry.next_manager())
    }

    /// Start one manager on a freshly allocated port and wait for the worker
    /// to report ready.
    async fn start_worker(&self, pair_dir: &Path) -> Result<Arc<WorkerManager>, TranslateError> {
        let port = free_port()
            .map_err(|e| TranslateError::WorkerFatal(format!("failed to allocate port: {e}")))?;

        let mut args = WorkerArgs::new(self.settings.worker_binary.clone());
        args.port = port;
        args.log_level = self.settings.log_level.clone();
        args.work_dir = pair_dir.to_path_buf();
        args.model_dir = Some(pair_dir.to_path_buf());

        let manager = WorkerManager::new(args);
        if let Err(e) = manager.start().await {
            manager.cleanup().await;
            return Err(e);
        }

        for attempt in 0..READINESS_ATTEMPTS {
            let token = CancellationToken::new();
            match manager.health(&token).await {
                Ok(true) => return Ok(manager),
                other => {
                    debug!(port = port, attempt = attempt + 1, result = ?other, "readiness probe");
                }
            }
            tokio::time::sleep(READINESS_INTERVAL).await;
        }

        manager.cleanup().await;
        Err(TranslateError::StartTimeout)
    }

    fn check_memory(&self) -> Result<(), TranslateError> {
        let available_mb = (self.mem_probe)();
        if available_mb == 0 {
            debug!("cannot determine available memory, allowing worker creation");
            return Ok(());
        }

        let required_mb = self.settings.worker_memory_mb + self.settings.reserved_memory_mb;
        debug!(available_mb, required_mb, "memory admission check");

        if available_mb < required_mb {
            return Err(TranslateError::InsufficientMemory {
                available_mb,
                required_mb,
            });
        }
        Ok(())
    }

    /// Refresh `last_used` and re-arm the entry's idle-eviction timer.
    fn arm_idle_timer(self: &Arc<Self>, entry: &Arc<EngineEntry>) {
        let mut state = entry.state.lock();
        state.last_used = Instant::now();

        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }

        let pool = Arc::downgrade(self);
        let entry_ref = Arc::downgrade(entry);
        let key = entry.key.clone();
        let timeout = self.settings.worker_idle_timeout;

        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(pool), Some(entry)) = (pool.upgrade(), entry_ref.upgrade()) else {
                return;
            };
            pool.evict(&key, &entry).await;
        }));
    }

    /// Idle-timer eviction. Re-checks that the entry is still the one the
    /// timer was armed for before tearing it down.
    async fn evict(&self, key: &str, entry: &Arc<EngineEntry>) {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(key) {
                Some(current) if Arc::ptr_eq(current, entry) => entries.remove(key),
                _ => None,
            }
        };

        let Some(entry) = removed else {
            return;
        };

        info!(pair = key, "engine idle timeout, stopping");
        for manager in &entry.managers {
            let manager = Arc::clone(manager);
            // Isolate each cleanup so a panic cannot take down other timers.
            if let Err(e) = tokio::spawn(async move { manager.cleanup().await }).await {
                error!(pair = key, error = %e, "panic during engine cleanup");
            }
        }
        info!(pair = key, "engine stopped due to idle timeout");
    }

    /// Tear down every entry in parallel under a 15 s deadline and leave the
    /// pool empty.
    pub async fn cleanup_all(&self) {
        let entries: Vec<(String, Arc<EngineEntry>)> =
            self.entries.write().drain().collect();

        if entries.is_empty() {
            debug!("no engines to cleanup");
            return;
        }

        info!(count = entries.len(), "cleaning up engines");

        let mut handles = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            if let Some(timer) = entry.state.lock().idle_timer.take() {
                timer.abort();
            }

            handles.push(tokio::spawn(async move {
                debug!(pair = %key, "stopping engine");
                for manager in &entry.managers {
                    manager.cleanup().await;
                }
            }));
        }

        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "panic while cleaning up engine");
                }
            }
        };

        match tokio::time::timeout(BULK_CLEANUP_TIMEOUT, join_all).await {
            Ok(()) => info!("all engines cleaned up"),
            Err(_) => warn!(
                timeout_secs = BULK_CLEANUP_TIMEOUT.as_secs(),
                "engine cleanup timeout"
            ),
        }
    }
}
