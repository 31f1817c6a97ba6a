//! # Scriptable Connector
//!
//! This library lets a multi-threaded host call functions inside an embedded
//! scripting engine whose execution contexts are not thread-safe. Each worker
//! thread gets its own context per script, contexts are recreated when the
//! script changes or a fatal engine error poisons them, and a hot reload can
//! invalidate a script on every thread at once.
//!
//! ## Architecture
//!
//! ```text
//! Host worker threads
//!     │
//!     │ RuntimeConnector::invoke
//!     ▼
//! ThreadLocalCache (one per thread) ──tracks──▶ HandleRegistry (shared)
//!     │
//!     │ EngineGateway: create / invoke / last_error / destroy
//!     ▼
//! Embedded script engine
//! ```
//!
//! ## Features
//!
//! - **Thread affinity**: a context is only ever driven by the thread that
//!   created it
//! - **Version-aware caching**: bumping a script version recreates contexts
//!   lazily, destroying the stale one first
//! - **Fatal repair**: a context that reports the fatal status is discarded
//!   and transparently recreated on the next call
//! - **Bulk invalidation**: destroy a script's contexts on all threads
//! - **Exactly-once destroy**: every native context is destroyed once, by
//!   whichever path retires it first

#![deny(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod value;

// Re-export commonly used types
pub use config::ConnectorConfig;
pub use engine::cache::ThreadLocalCache;
pub use engine::gateway::{
    host_error, is_host_error, EngineGateway, HostCallback, NativeRef, RawInvocation,
};
pub use engine::handle::{DestroyPath, EngineHandle, HandleInfo, ScriptIdentity};
pub use engine::registry::HandleRegistry;
pub use engine::{RuntimeConnector, ScriptConnector};
pub use error::{ConnectorError, ErrorCode, ScriptError};
pub use metrics::{MetricsCollector, RuntimeStats};
pub use value::{ScriptOutput, ScriptValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }
}
