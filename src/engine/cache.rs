//! Per-thread handle cache.
//!
//! Engine contexts may only be driven by the thread that created them, so
//! each worker thread keeps its own map from script identity to handle. The
//! map is the handles' owner: dropping it (normally at thread exit) destroys
//! every context it still holds.

use super::handle::{DestroyPath, EngineHandle, HandleCell, HandleInfo, ScriptIdentity};
use super::registry::{HandleRegistry, RegistryId, RegistryInner};
use crate::error::{ConnectorError, Result, ScriptError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine bootstrap is not guaranteed to be reentrant; every `create` in
/// the process runs under this lock. Bulk invalidation and shutdown take it
/// too, so they never miss a context that is being built.
pub(crate) static ENGINE_BOOTSTRAP: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

thread_local! {
    static LANE: RefCell<ThreadLocalCache> = RefCell::new(ThreadLocalCache::new());
}

/// Run `f` against the calling thread's cache
pub(crate) fn with_lane<R>(f: impl FnOnce(&mut ThreadLocalCache) -> R) -> Result<R> {
    LANE.try_with(|lane| {
        lane.try_borrow_mut()
            .map(|mut cache| f(&mut cache))
            .map_err(|_| ConnectorError::InvalidState("thread-local handle cache is in use".into()))
    })
    .map_err(|_| ConnectorError::InvalidState("thread-local handle cache was torn down".into()))?
}

/// A handle lent out for one invocation.
///
/// While a lease is held the context is not destroyed by a stale
/// replacement on the same thread; the last lease of a replaced handle
/// destroys it instead.
pub(crate) struct Lease {
    pub(crate) cell: Arc<HandleCell>,
    /// Creation time, if the handle was created for this call
    pub(crate) created: Option<Duration>,
}

impl Lease {
    fn new(cell: Arc<HandleCell>, created: Option<Duration>) -> Self {
        cell.begin_lease();
        Self { cell, created }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.cell.end_lease() {
            self.cell.close(DestroyPath::Stale);
        }
    }
}

/// Handles of one registry
struct Lane {
    registry: Weak<RegistryInner>,
    handles: HashMap<ScriptIdentity, EngineHandle>,
}

impl Lane {
    fn is_orphaned(&self) -> bool {
        self.registry.strong_count() == 0
    }
}

/// Identity -> handle map owned by one thread.
///
/// Handles are keyed by registry as well, so connectors with separate
/// registries can share worker threads.
#[derive(Default)]
pub struct ThreadLocalCache {
    lanes: HashMap<RegistryId, Lane>,
}

impl ThreadLocalCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a live handle for `identity` created for `version` or later,
    /// creating one if the cached handle is missing, stale or dead.
    pub(crate) fn get_or_create(
        &mut self,
        registry: &HandleRegistry,
        identity: &ScriptIdentity,
        version: u64,
        check_compile_errors: bool,
    ) -> Result<Lease> {
        if let Some(handle) = self.get(registry, identity) {
            if handle.is_fresh_for(version) {
                return Ok(Lease::new(Arc::clone(handle.cell()), None));
            }
        }

        self.prune_orphaned();
        refuse_if_shut_down(registry)?;

        let _bootstrap = ENGINE_BOOTSTRAP.lock();
        // Shutdown may have completed while this thread waited for the lock
        refuse_if_shut_down(registry)?;

        if let Some(old) = self.take(registry, identity) {
            debug!(
                identity = %identity,
                cached = old.version(),
                requested = version,
                live = old.is_live(),
                "Replacing cached script runtime"
            );
            if old.cell().is_leased() {
                // An outer call on this thread is still running it
                old.cell().detach();
            } else {
                registry.destroy(&old, DestroyPath::Stale);
            }
        }

        let started = Instant::now();
        let native = registry.gateway().create(identity);
        if native.is_empty() {
            warn!(identity = %identity, "Failed to create script runtime");
            return Err(ScriptError::creation_failure(identity).into());
        }

        let cell = Arc::new(HandleCell::new(
            identity.clone(),
            version,
            native,
            Arc::clone(registry.gateway()),
            registry.downgrade(),
        ));

        if check_compile_errors {
            let load_error = registry
                .gateway()
                .last_error(cell.native())
                .filter(|frames| !frames.is_empty());
            if let Some(frames) = load_error {
                warn!(identity = %identity, "Script failed to load");
                registry.destroy_cell(&cell, DestroyPath::CompileCheck);
                return Err(ScriptError::compile_failure(identity, frames).into());
            }
        }

        registry.track_cell(&cell);
        registry.metrics().record_created();
        info!(
            identity = %identity,
            version = version,
            handle = %cell.id(),
            "Created script runtime"
        );

        self.lanes
            .entry(registry.id())
            .or_insert_with(|| Lane {
                registry: registry.downgrade(),
                handles: HashMap::new(),
            })
            .handles
            .insert(identity.clone(), EngineHandle::from_cell(Arc::clone(&cell)));

        Ok(Lease::new(cell, Some(started.elapsed())))
    }

    /// Destroy this thread's handle for `identity` early. Returns false if
    /// there was none or it was already dead.
    pub fn release(&mut self, registry: &HandleRegistry, identity: &ScriptIdentity) -> bool {
        match self.take(registry, identity) {
            Some(handle) => registry.destroy(&handle, DestroyPath::Released),
            None => false,
        }
    }

    /// Destroy `cell` through `path`, removing it from the map if it is
    /// still the cached handle for its identity.
    pub(crate) fn evict(
        &mut self,
        registry: &HandleRegistry,
        cell: &HandleCell,
        path: DestroyPath,
    ) -> bool {
        let is_cached = self
            .get(registry, cell.identity())
            .map_or(false, |handle| handle.id() == cell.id());
        if is_cached {
            self.take(registry, cell.identity());
        }
        registry.destroy_cell(cell, path)
    }

    /// This thread's handle for `identity`, live or not
    pub fn get(&self, registry: &HandleRegistry, identity: &ScriptIdentity) -> Option<&EngineHandle> {
        self.lanes
            .get(&registry.id())
            .and_then(|lane| lane.handles.get(identity))
    }

    /// Snapshot of this thread's handle for `identity`
    pub fn info(&self, registry: &HandleRegistry, identity: &ScriptIdentity) -> Option<HandleInfo> {
        self.get(registry, identity).map(EngineHandle::info)
    }

    /// Release every handle this thread holds for `registry`
    pub fn clear(&mut self, registry: &HandleRegistry) -> usize {
        match self.lanes.remove(&registry.id()) {
            Some(lane) => lane
                .handles
                .values()
                .filter(|handle| registry.destroy(handle, DestroyPath::Released))
                .count(),
            None => 0,
        }
    }

    /// Destroy the handles of registries that no longer exist. Returns how
    /// many contexts were destroyed.
    pub fn prune_orphaned(&mut self) -> usize {
        let orphaned: Vec<RegistryId> = self
            .lanes
            .iter()
            .filter(|(_, lane)| lane.is_orphaned())
            .map(|(id, _)| *id)
            .collect();

        let mut destroyed = 0;
        for id in orphaned {
            if let Some(lane) = self.lanes.remove(&id) {
                destroyed += lane
                    .handles
                    .values()
                    .filter(|handle| handle.close(DestroyPath::LaneExit))
                    .count();
                debug!(registry = id, "Dropped handles of a discarded registry");
            }
        }
        destroyed
    }

    /// Number of cached handles, all registries
    pub fn len(&self) -> usize {
        self.lanes.values().map(|lane| lane.handles.len()).sum()
    }

    /// Whether the cache holds no handles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&mut self, registry: &HandleRegistry, identity: &ScriptIdentity) -> Option<EngineHandle> {
        let lane = self.lanes.get_mut(&registry.id())?;
        let handle = lane.handles.remove(identity);
        if lane.handles.is_empty() {
            self.lanes.remove(&registry.id());
        }
        handle
    }
}

fn refuse_if_shut_down(registry: &HandleRegistry) -> Result<()> {
    if registry.is_shut_down() {
        return Err(ConnectorError::Shutdown(format!(
            "registry {} no longer creates runtimes",
            registry.id()
        )));
    }
    Ok(())
}

impl Drop for ThreadLocalCache {
    fn drop(&mut self) {
        for (_, lane) in self.lanes.drain() {
            for (_, handle) in lane.handles {
                handle.close(DestroyPath::LaneExit);
            }
        }
    }
}

impl std::fmt::Debug for ThreadLocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalCache")
            .field("handles", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gateway::testing::{native_id, Call, RecordingGateway};
    use crate::error::ErrorCode;
    use std::sync::Barrier;

    fn identity() -> ScriptIdentity {
        ScriptIdentity::new("a.script", "main")
    }

    fn setup() -> (Arc<RecordingGateway>, HandleRegistry, ThreadLocalCache) {
        let gateway = Arc::new(RecordingGateway::new());
        let registry = HandleRegistry::new(gateway.clone());
        (gateway, registry, ThreadLocalCache::new())
    }

    #[test]
    fn test_fast_path_reuses_handle() {
        let (gateway, registry, mut cache) = setup();
        let first = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        assert!(first.created.is_some());

        let second = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        assert!(second.created.is_none());
        assert_eq!(first.cell.id(), second.cell.id());
        assert_eq!(gateway.created(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_older_version_reuses_newer_handle() {
        let (gateway, registry, mut cache) = setup();
        cache.get_or_create(&registry, &identity(), 5, true).unwrap();
        let lease = cache.get_or_create(&registry, &identity(), 3, true).unwrap();

        assert!(lease.created.is_none());
        assert_eq!(lease.cell.version(), 5);
        assert_eq!(gateway.created(), 1);
    }

    #[test]
    fn test_stale_handle_destroyed_before_create() {
        let (gateway, registry, mut cache) = setup();
        let old = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        let old_native = native_id(old.cell.native());
        drop(old);

        let new = cache.get_or_create(&registry, &identity(), 1, true).unwrap();
        let new_native = native_id(new.cell.native());

        assert_ne!(old_native, new_native);
        assert_eq!(gateway.destroy_count(old_native), 1);
        let calls = gateway.calls();
        let destroy_at = calls.iter().position(|c| *c == Call::Destroy(old_native));
        let create_at = calls
            .iter()
            .position(|c| *c == Call::Create(identity().to_string(), new_native));
        assert!(destroy_at < create_at);
        assert_eq!(registry.tracked_count(&identity()), 1);
        assert_eq!(registry.metrics().destroyed(DestroyPath::Stale), 1);
    }

    #[test]
    fn test_dead_handle_is_recreated() {
        let (gateway, registry, mut cache) = setup();
        cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        registry.invalidate_all(&identity());

        let lease = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        assert!(lease.created.is_some());
        assert_eq!(gateway.created(), 2);
        assert_eq!(gateway.destroyed(), 1);
        assert_eq!(gateway.misuse(), 0);
    }

    #[test]
    fn test_creation_failure_registers_nothing() {
        let (gateway, registry, mut cache) = setup();
        gateway.fail_creation(true);

        let err = cache
            .get_or_create(&registry, &identity(), 0, true)
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(ErrorCode::CreationFailure));
        assert!(cache.is_empty());
        assert_eq!(registry.tracked_count(&identity()), 0);
        assert_eq!(gateway.destroyed(), 0);
    }

    #[test]
    fn test_compile_error_destroys_new_handle() {
        let (gateway, registry, mut cache) = setup();
        gateway.compile_error(Some(vec!["SyntaxError: unexpected token", "  at a.script:1"]));

        let err = cache
            .get_or_create(&registry, &identity(), 0, true)
            .err()
            .unwrap();
        let script = err.as_script_error().unwrap();
        assert_eq!(script.code, ErrorCode::CompileFailure);
        assert_eq!(script.frames.len(), 2);
        assert!(cache.is_empty());
        assert_eq!(registry.tracked_count(&identity()), 0);
        assert_eq!(gateway.live_count(), 0);
        assert_eq!(registry.metrics().destroyed(DestroyPath::CompileCheck), 1);
    }

    #[test]
    fn test_compile_check_can_be_disabled() {
        let (gateway, registry, mut cache) = setup();
        gateway.compile_error(Some(vec!["SyntaxError: unexpected token"]));

        assert!(cache.get_or_create(&registry, &identity(), 0, false).is_ok());
        assert_eq!(gateway.live_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (gateway, registry, mut cache) = setup();
        cache.get_or_create(&registry, &identity(), 0, true).unwrap();

        assert!(cache.release(&registry, &identity()));
        assert!(!cache.release(&registry, &identity()));
        assert_eq!(gateway.destroyed(), 1);
        assert_eq!(registry.tracked_count(&identity()), 0);
    }

    #[test]
    fn test_evict_ignores_replaced_handle() {
        let (gateway, registry, mut cache) = setup();
        let old = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        let old_cell = Arc::clone(&old.cell);
        drop(old);
        let new = cache.get_or_create(&registry, &identity(), 1, true).unwrap();

        // Already replaced; evicting it leaves the new handle cached
        assert!(!cache.evict(&registry, &old_cell, DestroyPath::FatalRepair));
        assert_eq!(cache.get(&registry, &identity()).unwrap().id(), new.cell.id());
        assert!(cache.evict(&registry, &new.cell, DestroyPath::FatalRepair));
        assert!(cache.is_empty());
        assert_eq!(gateway.misuse(), 0);
    }

    #[test]
    fn test_leased_handle_survives_nested_replacement() {
        let (gateway, registry, mut cache) = setup();
        let outer = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        let outer_native = native_id(outer.cell.native());

        // A re-entrant call for a newer version while the outer call runs
        let inner = cache.get_or_create(&registry, &identity(), 1, true).unwrap();
        assert!(inner.created.is_some());
        assert!(gateway.is_live(outer_native));
        assert!(outer.cell.is_live());
        drop(inner);

        drop(outer);
        assert_eq!(gateway.destroy_count(outer_native), 1);
        assert_eq!(registry.metrics().destroyed(DestroyPath::Stale), 1);
        assert_eq!(registry.tracked_count(&identity()), 1);
        assert_eq!(gateway.misuse(), 0);
    }

    #[test]
    fn test_shutdown_waits_for_creation_in_progress() {
        let (gateway, registry, cache) = setup();
        drop(cache);
        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        gateway.block_next_create(entered.clone(), resume.clone());

        let worker = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let mut cache = ThreadLocalCache::new();
                let created = cache.get_or_create(&registry, &identity(), 0, true).is_ok();
                (cache, created)
            })
        };
        entered.wait();
        let stopper = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.shutdown())
        };
        resume.wait();

        let (mut cache, created) = worker.join().unwrap();
        assert!(created);
        assert_eq!(stopper.join().unwrap(), 1);
        assert_eq!(gateway.live_count(), 0);
        assert_eq!(registry.total_live(), 0);

        let err = cache
            .get_or_create(&registry, &identity(), 0, true)
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::Shutdown(_)));
        assert_eq!(gateway.misuse(), 0);
    }

    #[test]
    fn test_invalidate_waits_for_creation_in_progress() {
        let (gateway, registry, cache) = setup();
        drop(cache);
        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        gateway.block_next_create(entered.clone(), resume.clone());

        let worker = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let mut cache = ThreadLocalCache::new();
                let id = cache
                    .get_or_create(&registry, &identity(), 0, true)
                    .map(|lease| lease.cell.id());
                (cache, id)
            })
        };
        entered.wait();
        let reloader = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.invalidate_all(&identity()))
        };
        resume.wait();

        let (mut cache, first) = worker.join().unwrap();
        assert_eq!(reloader.join().unwrap(), 1);

        let next = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        assert!(next.created.is_some());
        assert_ne!(Some(next.cell.id()), first.ok());
        assert_eq!(gateway.destroyed(), 1);
        assert_eq!(gateway.misuse(), 0);
    }

    #[test]
    fn test_discarded_registry_handles_are_pruned() {
        let (gateway, registry, mut cache) = setup();
        let other = HandleRegistry::new(gateway.clone());
        cache.get_or_create(&other, &identity(), 0, true).unwrap();
        drop(other);
        assert_eq!(gateway.live_count(), 1);

        cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(gateway.live_count(), 1);
        assert_eq!(gateway.destroyed(), 1);
        assert_eq!(cache.prune_orphaned(), 0);
    }

    #[test]
    fn test_dropping_cache_destroys_handles() {
        let (gateway, registry, mut cache) = setup();
        cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        cache
            .get_or_create(&registry, &ScriptIdentity::new("b.script", "main"), 0, true)
            .unwrap();

        drop(cache);
        assert_eq!(gateway.live_count(), 0);
        assert_eq!(registry.total_live(), 0);
        assert_eq!(registry.metrics().destroyed(DestroyPath::LaneExit), 2);
    }

    #[test]
    fn test_registries_do_not_share_handles() {
        let (gateway, registry, mut cache) = setup();
        let other = HandleRegistry::new(gateway.clone());

        let a = cache.get_or_create(&registry, &identity(), 0, true).unwrap();
        let b = cache.get_or_create(&other, &identity(), 0, true).unwrap();
        assert_ne!(a.cell.id(), b.cell.id());
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.clear(&other), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shut_down_registry_refuses_creation() {
        let (_gateway, registry, mut cache) = setup();
        registry.shutdown();

        let err = cache
            .get_or_create(&registry, &identity(), 0, true)
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::Shutdown(_)));
    }
}
