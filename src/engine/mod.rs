//! Script runtime management.
//!
//! This module provides the [`RuntimeConnector`] that obtains a valid engine
//! handle for the calling thread, invokes it, and repairs it after fatal
//! engine errors.

pub mod cache;
pub mod gateway;
pub mod handle;
pub mod registry;

use crate::config::ConnectorConfig;
use crate::error::{Result, ScriptError};
use crate::metrics::{InvokeTimer, MetricsCollector, RuntimeStats};
use crate::value::{ScriptOutput, ScriptValue};
use gateway::{EngineGateway, HostCallback};
use handle::{DestroyPath, HandleInfo, ScriptIdentity};
use registry::HandleRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// The main script connector
pub struct RuntimeConnector {
    /// Connector configuration
    config: ConnectorConfig,
    /// Registry shared with every connector built from it
    registry: HandleRegistry,
    /// Host side of script-to-host calls
    host: Option<Arc<dyn HostCallback>>,
}

impl RuntimeConnector {
    /// Create a connector with its own registry
    pub fn new(gateway: Arc<dyn EngineGateway>, config: ConnectorConfig) -> Result<Self> {
        Self::with_registry(HandleRegistry::new(gateway), config)
    }

    /// Create a connector over an existing registry
    pub fn with_registry(registry: HandleRegistry, config: ConnectorConfig) -> Result<Self> {
        config.validate()?;

        info!(
            registry = registry.id(),
            fatal_status = config.fatal_status,
            check_compile_errors = config.check_compile_errors,
            "Initializing script connector"
        );

        Ok(Self {
            config,
            registry,
            host: None,
        })
    }

    /// Route script-to-host calls to `host`
    pub fn with_host_callback(mut self, host: impl HostCallback + 'static) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    /// Invoke `identity` on the calling thread's handle, creating or
    /// recreating it as needed.
    #[instrument(skip_all, fields(identity = %identity, version = version))]
    pub fn invoke(
        &self,
        identity: &ScriptIdentity,
        version: u64,
        args: &[ScriptValue],
    ) -> Result<ScriptOutput> {
        let mut timer = InvokeTimer::start();
        let check = self.config.check_compile_errors;

        let lease = match cache::with_lane(|lane| {
            lane.get_or_create(&self.registry, identity, version, check)
        })? {
            Ok(lease) => lease,
            Err(e) => {
                if let Some(code) = e.code() {
                    self.metrics().record_error(code);
                }
                return Err(e);
            }
        };

        // The lane is not borrowed here, so a host callback may re-enter
        let raw = self
            .registry
            .gateway()
            .invoke(lease.cell.native(), args, self.host.as_deref());

        if let Some(creation_time) = lease.created {
            timer.record_creation(creation_time);
        }
        let metrics = timer.into_metrics();

        if raw.status >= 0 {
            self.metrics().record_invocation(&metrics, None);
            if self.config.debug {
                debug!(
                    status = raw.status,
                    handle = %lease.cell.id(),
                    duration_us = metrics.duration_us,
                    "Script invocation succeeded"
                );
            }
            return Ok(ScriptOutput {
                status: raw.status,
                value: raw.value.unwrap_or_default(),
                handle: lease.cell.id(),
                created: lease.created.is_some(),
            });
        }

        let frames = self
            .registry
            .gateway()
            .last_error(lease.cell.native())
            .unwrap_or_default();

        let error = if raw.status == self.config.fatal_status {
            warn!(
                status = raw.status,
                handle = %lease.cell.id(),
                "Fatal script error, discarding runtime"
            );
            let cell = Arc::clone(&lease.cell);
            let evicted = cache::with_lane(|lane| {
                lane.evict(&self.registry, &cell, DestroyPath::FatalRepair)
            });
            if evicted.is_err() {
                self.registry.destroy_cell(&cell, DestroyPath::FatalRepair);
            }
            ScriptError::fatal(identity, raw.status, frames)
        } else {
            if self.config.debug {
                debug!(status = raw.status, handle = %lease.cell.id(), "Script raised an error");
            }
            ScriptError::recoverable(identity, raw.status, frames)
        };

        self.metrics().record_invocation(&metrics, Some(error.code));
        Err(error.into())
    }

    /// Invoke by locator and entry point
    pub fn call(
        &self,
        locator: &str,
        entry_point: &str,
        version: u64,
        args: &[ScriptValue],
    ) -> Result<ScriptOutput> {
        self.invoke(&ScriptIdentity::new(locator, entry_point), version, args)
    }

    /// Destroy every live handle of a script on every thread (hot reload)
    pub fn invalidate(&self, locator: &str, entry_point: &str) -> usize {
        self.registry
            .invalidate_all(&ScriptIdentity::new(locator, entry_point))
    }

    /// Destroy the calling thread's handle for `identity`
    pub fn release(&self, identity: &ScriptIdentity) -> Result<bool> {
        cache::with_lane(|lane| lane.release(&self.registry, identity))
    }

    /// Destroy every handle the calling thread holds for this registry
    pub fn release_thread(&self) -> Result<usize> {
        cache::with_lane(|lane| lane.clear(&self.registry))
    }

    /// The calling thread's handle for `identity`, if it has one
    pub fn local_handle(&self, identity: &ScriptIdentity) -> Result<Option<HandleInfo>> {
        cache::with_lane(|lane| lane.info(&self.registry, identity))
    }

    /// Bind `identity` so it can be called without repeating it
    pub fn bind(self: &Arc<Self>, locator: &str, entry_point: &str) -> ScriptConnector {
        ScriptConnector::new(Arc::clone(self), ScriptIdentity::new(locator, entry_point))
    }

    /// Start the periodic registry sweep, unless disabled in the config.
    /// Must be called from within a tokio runtime.
    pub fn spawn_reclaimer(&self) -> Option<tokio::task::JoinHandle<()>> {
        match self.config.reclaim_interval_ms {
            0 => None,
            ms => Some(self.registry.spawn_reclaimer(Duration::from_millis(ms))),
        }
    }

    /// Get runtime statistics
    pub fn get_stats(&self) -> RuntimeStats {
        let metrics = self.metrics();
        RuntimeStats {
            total_invocations: metrics.total_invocations(),
            successful_invocations: metrics.successful_invocations(),
            live_handles: self.registry.total_live(),
            tracked_identities: self.registry.identities().len(),
            handles_created: metrics.handles_created(),
            handles_destroyed: metrics.total_destroyed(),
            cache_hit_rate: metrics.cache_hit_rate(),
            avg_invocation_time_us: metrics.avg_invocation_time_us(),
        }
    }

    /// Get Prometheus metrics
    pub fn get_prometheus_metrics(&self) -> String {
        self.metrics().to_prometheus()
    }

    /// Destroy every handle and refuse further creation
    pub fn shutdown(&self) -> usize {
        info!("Shutting down script connector");
        self.registry.shutdown()
    }

    /// The registry this connector tracks handles in
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Connector configuration
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn metrics(&self) -> &Arc<MetricsCollector> {
        self.registry.metrics()
    }
}

impl std::fmt::Debug for RuntimeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConnector")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("host", &self.host.is_some())
            .finish()
    }
}

/// A connector bound to one script and its current version
#[derive(Debug)]
pub struct ScriptConnector {
    connector: Arc<RuntimeConnector>,
    identity: ScriptIdentity,
    version: AtomicU64,
}

impl ScriptConnector {
    /// Bind `identity` at version 0
    pub fn new(connector: Arc<RuntimeConnector>, identity: ScriptIdentity) -> Self {
        Self {
            connector,
            identity,
            version: AtomicU64::new(0),
        }
    }

    /// Call the script with `args`
    pub fn call(&self, args: &[ScriptValue]) -> Result<ScriptOutput> {
        self.connector.invoke(&self.identity, self.version(), args)
    }

    /// Current script version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Set the script version; threads holding older handles recreate them
    /// on their next call
    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    /// The bound identity
    pub fn identity(&self) -> &ScriptIdentity {
        &self.identity
    }

    /// Destroy this script's handles on every thread
    pub fn release_all_runtimes(&self) -> usize {
        self.connector.registry().invalidate_all(&self.identity)
    }

    /// Destroy the calling thread's handle
    pub fn release(&self) -> Result<bool> {
        self.connector.release(&self.identity)
    }
}
