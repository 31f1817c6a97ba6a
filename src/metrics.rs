//! Connector metrics for monitoring and observability.
//!
//! This module provides types for collecting and reporting metrics about
//! script invocations and the lifecycle of engine handles.

use crate::engine::handle::DestroyPath;
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for a single invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetrics {
    /// Invocation duration in microseconds, including handle creation
    pub duration_us: u64,

    /// Time spent creating the handle, if one was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time_us: Option<u64>,

    /// Whether a cached handle served the call
    pub cache_hit: bool,
}

impl InvocationMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record invocation duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_us = duration.as_micros() as u64;
        self
    }

    /// Record creation time
    pub fn with_creation_time(mut self, time: Duration) -> Self {
        self.creation_time_us = Some(time.as_micros() as u64);
        self
    }

    /// Set cache hit
    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }
}

/// Runtime statistics for one connector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    /// Total invocations
    pub total_invocations: u64,

    /// Invocations that returned a success status
    pub successful_invocations: u64,

    /// Live handles across all threads
    pub live_handles: usize,

    /// Identities with at least one tracked handle
    pub tracked_identities: usize,

    /// Handles created since start
    pub handles_created: u64,

    /// Handles destroyed since start, all paths
    pub handles_destroyed: u64,

    /// Fraction of invocations served by a cached handle (0-1)
    pub cache_hit_rate: f64,

    /// Average invocation time in microseconds
    pub avg_invocation_time_us: f64,
}

/// Metrics collector shared by a registry and its connectors
pub struct MetricsCollector {
    total_invocations: AtomicU64,
    successful_invocations: AtomicU64,
    recoverable_errors: AtomicU64,
    fatal_errors: AtomicU64,
    creation_failures: AtomicU64,
    compile_failures: AtomicU64,
    total_invocation_time_us: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    handles_created: AtomicU64,
    destroyed: [AtomicU64; DestroyPath::ALL.len()],
    sweeps: AtomicU64,
    swept_entries: AtomicU64,
    error_counts: parking_lot::Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            total_invocations: AtomicU64::new(0),
            successful_invocations: AtomicU64::new(0),
            recoverable_errors: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            creation_failures: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            total_invocation_time_us: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            handles_created: AtomicU64::new(0),
            destroyed: Default::default(),
            sweeps: AtomicU64::new(0),
            swept_entries: AtomicU64::new(0),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record an invocation; `failure` is `None` on success
    pub fn record_invocation(&self, metrics: &InvocationMetrics, failure: Option<ErrorCode>) {
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
        self.total_invocation_time_us
            .fetch_add(metrics.duration_us, Ordering::Relaxed);

        if metrics.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        match failure {
            None => {
                self.successful_invocations.fetch_add(1, Ordering::Relaxed);
            }
            Some(code) => self.record_error(code),
        }
    }

    /// Record a failure by code
    pub fn record_error(&self, code: ErrorCode) {
        let counter = match code {
            ErrorCode::CreationFailure => &self.creation_failures,
            ErrorCode::CompileFailure => &self.compile_failures,
            ErrorCode::FatalRuntimeError => &self.fatal_errors,
            ErrorCode::RecoverableScriptError => &self.recoverable_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut counts = self.error_counts.lock();
        *counts.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Record a newly created handle
    pub fn record_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a destroyed handle
    pub fn record_destroy(&self, path: DestroyPath) {
        self.destroyed[path_index(path)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a registry sweep
    pub fn record_sweep(&self, pruned: u64) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.swept_entries.fetch_add(pruned, Ordering::Relaxed);
    }

    /// Get total invocations
    pub fn total_invocations(&self) -> u64 {
        self.total_invocations.load(Ordering::Relaxed)
    }

    /// Get successful invocations
    pub fn successful_invocations(&self) -> u64 {
        self.successful_invocations.load(Ordering::Relaxed)
    }

    /// Get fatal errors
    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::Relaxed)
    }

    /// Get recoverable errors
    pub fn recoverable_errors(&self) -> u64 {
        self.recoverable_errors.load(Ordering::Relaxed)
    }

    /// Get handles created
    pub fn handles_created(&self) -> u64 {
        self.handles_created.load(Ordering::Relaxed)
    }

    /// Get handles destroyed through `path`
    pub fn destroyed(&self, path: DestroyPath) -> u64 {
        self.destroyed[path_index(path)].load(Ordering::Relaxed)
    }

    /// Get handles destroyed through any path
    pub fn total_destroyed(&self) -> u64 {
        self.destroyed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Get number of sweeps run
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Get cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get average invocation time in microseconds
    pub fn avg_invocation_time_us(&self) -> f64 {
        let total = self.total_invocations.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.total_invocation_time_us.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Get error counts
    pub fn error_counts(&self) -> HashMap<String, u64> {
        self.error_counts.lock().clone()
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.total_invocations,
            &self.successful_invocations,
            &self.recoverable_errors,
            &self.fatal_errors,
            &self.creation_failures,
            &self.compile_failures,
            &self.total_invocation_time_us,
            &self.cache_hits,
            &self.cache_misses,
            &self.handles_created,
            &self.sweeps,
            &self.swept_entries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.destroyed {
            counter.store(0, Ordering::Relaxed);
        }
        self.error_counts.lock().clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP scriptable_invocations_total Script invocations\n");
        output.push_str("# TYPE scriptable_invocations_total counter\n");
        output.push_str(&format!(
            "scriptable_invocations_total{{status=\"success\"}} {}\n",
            self.successful_invocations()
        ));
        output.push_str(&format!(
            "scriptable_invocations_total{{status=\"recoverable\"}} {}\n",
            self.recoverable_errors()
        ));
        output.push_str(&format!(
            "scriptable_invocations_total{{status=\"fatal\"}} {}\n",
            self.fatal_errors()
        ));

        output.push_str("\n# HELP scriptable_invocation_time_us Average invocation time\n");
        output.push_str("# TYPE scriptable_invocation_time_us gauge\n");
        output.push_str(&format!(
            "scriptable_invocation_time_us {:.2}\n",
            self.avg_invocation_time_us()
        ));

        output.push_str("\n# HELP scriptable_cache_hit_rate Thread-local handle cache hit rate\n");
        output.push_str("# TYPE scriptable_cache_hit_rate gauge\n");
        output.push_str(&format!(
            "scriptable_cache_hit_rate {:.4}\n",
            self.cache_hit_rate()
        ));

        output.push_str("\n# HELP scriptable_handles_created_total Script runtimes created\n");
        output.push_str("# TYPE scriptable_handles_created_total counter\n");
        output.push_str(&format!(
            "scriptable_handles_created_total {}\n",
            self.handles_created()
        ));

        output.push_str("\n# HELP scriptable_handles_destroyed_total Script runtimes destroyed\n");
        output.push_str("# TYPE scriptable_handles_destroyed_total counter\n");
        for path in DestroyPath::ALL {
            output.push_str(&format!(
                "scriptable_handles_destroyed_total{{path=\"{}\"}} {}\n",
                path,
                self.destroyed(path)
            ));
        }

        output.push_str("\n# HELP scriptable_errors_total Error counts by code\n");
        output.push_str("# TYPE scriptable_errors_total counter\n");
        for (code, count) in self.error_counts() {
            output.push_str(&format!(
                "scriptable_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn path_index(path: DestroyPath) -> usize {
    DestroyPath::ALL
        .iter()
        .position(|p| *p == path)
        .unwrap_or(0)
}

/// Timer for measuring invocation duration
pub struct InvokeTimer {
    start: Instant,
    creation_duration: Option<Duration>,
}

impl InvokeTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            creation_duration: None,
        }
    }

    /// Attribute `time` of this invocation to handle creation
    pub fn record_creation(&mut self, time: Duration) {
        self.creation_duration = Some(time);
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Build metrics from timer; a call is a cache hit when it created nothing
    pub fn into_metrics(self) -> InvocationMetrics {
        let mut metrics = InvocationMetrics::new()
            .with_duration(self.elapsed())
            .with_cache_hit(self.creation_duration.is_none());

        if let Some(creation_time) = self.creation_duration {
            metrics = metrics.with_creation_time(creation_time);
        }

        metrics
    }
}
