//! Engine handle management.
//!
//! Each [`EngineHandle`] owns one native execution context, bound to a
//! [`ScriptIdentity`] and tagged with the script version it was created for.

use super::gateway::{EngineGateway, NativeRef};
use super::registry::RegistryInner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique handle ID
pub type HandleId = Uuid;

/// The (source locator, entry point) pair naming one script-level callable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptIdentity {
    locator: String,
    entry_point: String,
}

impl ScriptIdentity {
    /// Create a new script identity
    pub fn new(locator: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            entry_point: entry_point.into(),
        }
    }

    /// Where the script source lives
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Name of the function to call
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

impl std::fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.locator, self.entry_point)
    }
}

/// Which transition retired a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyPath {
    /// Explicit release by the owning thread
    Released,
    /// `invoke` returned the fatal sentinel
    FatalRepair,
    /// Replaced by a handle for a newer script version
    Stale,
    /// The script failed to load right after creation
    CompileCheck,
    /// Bulk invalidation of the identity
    Invalidated,
    /// The owning thread's cache was torn down
    LaneExit,
    /// The owning reference was dropped without going through any other path
    Reclaimed,
}

impl DestroyPath {
    /// All paths, in a stable order
    pub const ALL: [DestroyPath; 7] = [
        DestroyPath::Released,
        DestroyPath::FatalRepair,
        DestroyPath::Stale,
        DestroyPath::CompileCheck,
        DestroyPath::Invalidated,
        DestroyPath::LaneExit,
        DestroyPath::Reclaimed,
    ];

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyPath::Released => "released",
            DestroyPath::FatalRepair => "fatal_repair",
            DestroyPath::Stale => "stale",
            DestroyPath::CompileCheck => "compile_check",
            DestroyPath::Invalidated => "invalidated",
            DestroyPath::LaneExit => "lane_exit",
            DestroyPath::Reclaimed => "reclaimed",
        }
    }
}

impl std::fmt::Display for DestroyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state of one handle. The owning [`EngineHandle`] holds the only
/// long-lived strong reference; the registry observes it through a `Weak`.
pub(crate) struct HandleCell {
    id: HandleId,
    identity: ScriptIdentity,
    version: u64,
    owner: ThreadId,
    created_at: DateTime<Utc>,
    native: NativeRef,
    /// Cleared exactly once; whoever clears it destroys `native`
    live: Arc<AtomicBool>,
    /// Invocations on the owning thread currently running this context
    leases: AtomicUsize,
    /// Replaced while leased; the last lease to end destroys it
    detached: AtomicBool,
    gateway: Arc<dyn EngineGateway>,
    registry: Weak<RegistryInner>,
}

impl HandleCell {
    pub(crate) fn new(
        identity: ScriptIdentity,
        version: u64,
        native: NativeRef,
        gateway: Arc<dyn EngineGateway>,
        registry: Weak<RegistryInner>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            version,
            owner: std::thread::current().id(),
            created_at: Utc::now(),
            native,
            live: Arc::new(AtomicBool::new(true)),
            leases: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
            gateway,
            registry,
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn identity(&self) -> &ScriptIdentity {
        &self.identity
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn native(&self) -> &NativeRef {
        &self.native
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn begin_lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this was the last lease of a detached cell
    pub(crate) fn end_lease(&self) -> bool {
        self.leases.fetch_sub(1, Ordering::AcqRel) == 1 && self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.leases.load(Ordering::Acquire) > 0
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }

    pub(crate) fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            identity: self.identity.clone(),
            version: self.version,
            owner: format!("{:?}", self.owner),
            created_at: self.created_at,
            live: self.is_live(),
        }
    }

    /// LIVE -> DEAD. Returns true for the single caller that won the
    /// transition and destroyed the native context.
    pub(crate) fn retire(&self, path: DestroyPath) -> bool {
        if !self.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.gateway.destroy(&self.native);
        debug!(
            handle = %self.id,
            identity = %self.identity,
            version = self.version,
            path = %path,
            "Destroyed script runtime"
        );
        true
    }

    /// Retire through `path` and remove the registry entry, if the registry
    /// still exists.
    pub(crate) fn close(&self, path: DestroyPath) -> bool {
        let destroyed = self.retire(path);
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.identity, self.id);
            if destroyed {
                registry.metrics.record_destroy(path);
            }
        }
        destroyed
    }
}

impl Drop for HandleCell {
    fn drop(&mut self) {
        if self.close(DestroyPath::Reclaimed) {
            warn!(
                handle = %self.id,
                identity = %self.identity,
                "Reclaimed script runtime dropped without release"
            );
        }
    }
}

/// Owner of one live native execution context.
///
/// Dropping the handle destroys the context if no explicit path did so
/// first, so a discarded handle never leaks.
pub struct EngineHandle {
    cell: Arc<HandleCell>,
}

impl EngineHandle {
    pub(crate) fn from_cell(cell: Arc<HandleCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<HandleCell> {
        &self.cell
    }

    pub(crate) fn close(&self, path: DestroyPath) -> bool {
        self.cell.close(path)
    }

    /// Get the handle ID
    pub fn id(&self) -> HandleId {
        self.cell.id
    }

    /// Script this handle runs
    pub fn identity(&self) -> &ScriptIdentity {
        &self.cell.identity
    }

    /// Script version the handle was created for
    pub fn version(&self) -> u64 {
        self.cell.version()
    }

    /// Whether the native context still exists
    pub fn is_live(&self) -> bool {
        self.cell.is_live()
    }

    /// Whether this handle can serve a call for `version`
    pub fn is_fresh_for(&self, version: u64) -> bool {
        self.is_live() && self.cell.version() >= version
    }

    /// Audit snapshot
    pub fn info(&self) -> HandleInfo {
        self.cell.info()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.cell.id)
            .field("identity", &self.cell.identity)
            .field("version", &self.cell.version)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Point-in-time description of a tracked handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    /// Handle ID
    pub id: HandleId,
    /// Script identity
    pub identity: ScriptIdentity,
    /// Script version
    pub version: u64,
    /// Debug rendering of the owning thread id
    pub owner: String,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Liveness at snapshot time
    pub live: bool,
}
