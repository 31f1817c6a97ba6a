//! Cross-thread handle registry.
//!
//! Every handle created by any thread is recorded here, per script identity,
//! through a non-owning reference. The registry never creates contexts; it
//! exists so that a script can be invalidated everywhere at once (hot reload)
//! and so that leaked or abandoned handles stay visible.

use super::cache::ENGINE_BOOTSTRAP;
use super::gateway::EngineGateway;
use super::handle::{DestroyPath, EngineHandle, HandleCell, HandleId, HandleInfo, ScriptIdentity};
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Distinguishes registries sharing the same worker threads
pub type RegistryId = u64;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning observation of one handle
struct TrackedHandle {
    cell: Weak<HandleCell>,
    live: Arc<AtomicBool>,
}

impl TrackedHandle {
    /// Live and still owned by someone
    fn is_current(&self) -> bool {
        self.live.load(Ordering::Acquire) && self.cell.strong_count() > 0
    }
}

/// Inner registry state
pub(crate) struct RegistryInner {
    id: RegistryId,
    gateway: Arc<dyn EngineGateway>,
    /// identity -> handles created for it on any thread
    handles: DashMap<ScriptIdentity, HashMap<HandleId, TrackedHandle>>,
    pub(crate) metrics: Arc<MetricsCollector>,
    shutdown: AtomicBool,
}

impl RegistryInner {
    /// Drop the entry for `id`, and the identity's set once it is empty.
    /// Never touches the native context.
    pub(crate) fn forget(&self, identity: &ScriptIdentity, id: HandleId) -> bool {
        let removed = match self.handles.get_mut(identity) {
            Some(mut set) => set.remove(&id).is_some(),
            None => false,
        };
        if removed {
            self.handles.remove_if(identity, |_, set| set.is_empty());
        }
        removed
    }
}

/// Outcome of one reclamation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Entries for handles that were already destroyed
    pub dead: usize,
    /// Entries whose owner dropped the handle; its drop destroys the context
    pub orphaned: usize,
    /// Entries still live after the sweep
    pub live: usize,
}

impl SweepReport {
    /// Entries removed by the sweep
    pub fn pruned(&self) -> usize {
        self.dead + self.orphaned
    }
}

/// Process-wide record of the handles created through one gateway.
///
/// Cheap to clone; clones share state. Inject the same registry into every
/// connector that should be invalidated together.
///
/// Dropping the last clone without [`shutdown`](Self::shutdown) leaves its
/// handles in worker threads' caches until each thread's next handle
/// creation, or its exit, destroys them.
pub struct HandleRegistry {
    inner: Arc<RegistryInner>,
}

impl HandleRegistry {
    /// Create a registry for contexts produced by `gateway`
    pub fn new(gateway: Arc<dyn EngineGateway>) -> Self {
        Self::with_metrics(gateway, Arc::new(MetricsCollector::new()))
    }

    /// Create a registry reporting into an existing metrics collector
    pub fn with_metrics(gateway: Arc<dyn EngineGateway>, metrics: Arc<MetricsCollector>) -> Self {
        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        debug!(registry = id, "Creating handle registry");

        Self {
            inner: Arc::new(RegistryInner {
                id,
                gateway,
                handles: DashMap::new(),
                metrics,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Registry ID
    pub fn id(&self) -> RegistryId {
        self.inner.id
    }

    /// The engine this registry's handles belong to
    pub fn gateway(&self) -> &Arc<dyn EngineGateway> {
        &self.inner.gateway
    }

    /// Metrics collector shared with connectors
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    /// Record a handle. Handles are created by the thread-local cache, which
    /// tracks them itself; this is public for hosts managing handles directly.
    pub fn track(&self, handle: &EngineHandle) {
        self.track_cell(handle.cell());
    }

    pub(crate) fn track_cell(&self, cell: &Arc<HandleCell>) {
        self.inner
            .handles
            .entry(cell.identity().clone())
            .or_default()
            .insert(
                cell.id(),
                TrackedHandle {
                    cell: Arc::downgrade(cell),
                    live: cell.liveness(),
                },
            );
    }

    /// Remove the entry for a handle; no-op if it is already gone
    pub fn untrack(&self, identity: &ScriptIdentity, id: HandleId) -> bool {
        self.inner.forget(identity, id)
    }

    /// Destroy a handle's context through `path` and untrack it. Returns
    /// false if another path already destroyed it.
    pub fn destroy(&self, handle: &EngineHandle, path: DestroyPath) -> bool {
        self.destroy_cell(handle.cell(), path)
    }

    pub(crate) fn destroy_cell(&self, cell: &HandleCell, path: DestroyPath) -> bool {
        let destroyed = cell.retire(path);
        self.inner.forget(cell.identity(), cell.id());
        if destroyed {
            self.inner.metrics.record_destroy(path);
        }
        destroyed
    }

    /// Destroy every live handle of `identity`, on every thread, and clear
    /// its set. Returns how many contexts this call destroyed.
    ///
    /// Runs under the engine bootstrap lock, so a context whose creation is
    /// already under way is tracked first and destroyed here too.
    ///
    /// Only handles not currently inside `invoke` may be affected: the engine
    /// requires single-thread ownership, so invalidating a handle while its
    /// owner is running it is a caller error. Owners observe the dead handle
    /// on their next lookup and create a fresh one.
    pub fn invalidate_all(&self, identity: &ScriptIdentity) -> usize {
        let _bootstrap = ENGINE_BOOTSTRAP.lock();
        self.invalidate_locked(identity)
    }

    /// Invalidate every identity
    pub fn invalidate_everything(&self) -> usize {
        let _bootstrap = ENGINE_BOOTSTRAP.lock();
        self.invalidate_everything_locked()
    }

    fn invalidate_everything_locked(&self) -> usize {
        self.identities()
            .iter()
            .map(|identity| self.invalidate_locked(identity))
            .sum()
    }

    fn invalidate_locked(&self, identity: &ScriptIdentity) -> usize {
        let tracked = match self.inner.handles.remove(identity) {
            Some((_, set)) => set,
            None => return 0,
        };

        let mut destroyed = 0;
        for (_, entry) in tracked {
            // The upgraded reference may be the last one; drop it outside
            // the map so the cell's own cleanup cannot re-enter a held shard.
            if let Some(cell) = entry.cell.upgrade() {
                if cell.retire(DestroyPath::Invalidated) {
                    self.inner.metrics.record_destroy(DestroyPath::Invalidated);
                    destroyed += 1;
                }
            }
        }

        info!(identity = %identity, destroyed = destroyed, "Invalidated script runtimes");
        destroyed
    }

    /// Drop bookkeeping for handles that are dead or no longer owned
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        self.inner.handles.retain(|_, set| {
            set.retain(|_, entry| {
                if !entry.live.load(Ordering::Acquire) {
                    report.dead += 1;
                    false
                } else if entry.cell.strong_count() == 0 {
                    report.orphaned += 1;
                    false
                } else {
                    report.live += 1;
                    true
                }
            });
            !set.is_empty()
        });

        self.inner.metrics.record_sweep(report.pruned() as u64);
        if report.pruned() > 0 {
            debug!(
                dead = report.dead,
                orphaned = report.orphaned,
                live = report.live,
                "Registry sweep pruned entries"
            );
        }
        report
    }

    /// Sweep every `interval` on the current tokio runtime until the registry
    /// is dropped. Must be called from within a runtime.
    pub fn spawn_reclaimer(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(inner) => {
                        HandleRegistry { inner }.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Destroy everything and refuse further creation
    pub fn shutdown(&self) -> usize {
        info!(registry = self.inner.id, "Shutting down handle registry");
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Waits out any creation that passed the flag check before it was set
        let _bootstrap = ENGINE_BOOTSTRAP.lock();
        self.invalidate_everything_locked()
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Identities with at least one tracked handle
    pub fn identities(&self) -> Vec<ScriptIdentity> {
        self.inner
            .handles
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of entries tracked for `identity`
    pub fn tracked_count(&self, identity: &ScriptIdentity) -> usize {
        self.inner
            .handles
            .get(identity)
            .map_or(0, |set| set.len())
    }

    /// Number of live, owned handles for `identity`
    pub fn live_count(&self, identity: &ScriptIdentity) -> usize {
        self.inner.handles.get(identity).map_or(0, |set| {
            set.values().filter(|entry| entry.is_current()).count()
        })
    }

    /// Number of live, owned handles across all identities
    pub fn total_live(&self) -> usize {
        self.inner
            .handles
            .iter()
            .map(|set| set.values().filter(|entry| entry.is_current()).count())
            .sum()
    }

    /// Snapshot of the tracked handles of `identity`
    pub fn audit(&self, identity: &ScriptIdentity) -> Vec<HandleInfo> {
        // Collect strong references first; the guard must be gone before
        // any of them can be dropped.
        let cells: Vec<Arc<HandleCell>> = {
            match self.inner.handles.get(identity) {
                Some(set) => set.values().filter_map(|entry| entry.cell.upgrade()).collect(),
                None => Vec::new(),
            }
        };
        cells.iter().map(|cell| cell.info()).collect()
    }
}

impl Clone for HandleRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("id", &self.inner.id)
            .field("identities", &self.inner.handles.len())
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}
