//! The boundary to the embedded scripting engine.
//!
//! Everything this crate needs from an engine is four primitives: create a
//! context bound to an entry point, destroy it, invoke it, and fetch the
//! pending exception. Any embeddable engine can be plugged in by
//! implementing [`EngineGateway`].

use super::handle::ScriptIdentity;
use crate::value::ScriptValue;

/// Opaque reference to one native execution context.
///
/// An empty reference is the engine's "creation failed" sentinel. The bytes
/// are owned by exactly one handle and are never cloned.
#[derive(PartialEq, Eq, Hash)]
pub struct NativeRef(Box<[u8]>);

impl NativeRef {
    /// Wrap the bytes the engine returned from `create`
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into_boxed_slice())
    }

    /// The "creation failed" sentinel
    pub fn empty() -> Self {
        Self(Box::default())
    }

    /// Whether this is the failure sentinel
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw bytes, for the gateway that produced them
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for NativeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeRef({} bytes)", self.0.len())
    }
}

/// What the engine reports for one `invoke`
#[derive(Debug, Clone, PartialEq)]
pub struct RawInvocation {
    /// `>= 0` success, the fatal sentinel, or another negative script error
    pub status: i32,
    /// Value produced by the entry point, if any
    pub value: Option<ScriptValue>,
}

impl RawInvocation {
    /// A bare status with no value
    pub fn status(status: i32) -> Self {
        Self {
            status,
            value: None,
        }
    }

    /// A successful call returning a value
    pub fn value(status: i32, value: impl Into<ScriptValue>) -> Self {
        Self {
            status,
            value: Some(value.into()),
        }
    }
}

/// The four primitive operations of an embedded engine.
///
/// None of these may panic on engine-level failures. The connector never
/// calls two of them concurrently on the same [`NativeRef`], and calls
/// `destroy` at most once per reference; calls on distinct references may
/// happen in parallel from different threads.
pub trait EngineGateway: Send + Sync {
    /// Load the script and bind the entry point. Returns [`NativeRef::empty`]
    /// on failure (malformed script, I/O failure, missing entry point).
    fn create(&self, identity: &ScriptIdentity) -> NativeRef;

    /// Release all engine resources held by `native`
    fn destroy(&self, native: &NativeRef);

    /// Run the entry point with `args`. `host` is how the script calls back
    /// into the host during this invocation.
    fn invoke(
        &self,
        native: &NativeRef,
        args: &[ScriptValue],
        host: Option<&dyn HostCallback>,
    ) -> RawInvocation;

    /// Take the pending exception as ordered stack frames. `None` or an empty
    /// list means no error is pending.
    fn last_error(&self, native: &NativeRef) -> Option<Vec<String>>;
}

/// First element of a host reply that signals an error to the script
pub const HOST_ERROR_MARKER: &str = "__error__";

/// Host side of script-to-host calls
pub trait HostCallback: Send + Sync {
    /// Handle a call from a script; the reply is returned to it as an array
    fn call_host(&self, args: &[ScriptValue]) -> Vec<ScriptValue>;
}

impl<F> HostCallback for F
where
    F: Fn(&[ScriptValue]) -> Vec<ScriptValue> + Send + Sync,
{
    fn call_host(&self, args: &[ScriptValue]) -> Vec<ScriptValue> {
        self(args)
    }
}

/// Build the error reply a host callback returns to a script
pub fn host_error(message: impl Into<String>) -> Vec<ScriptValue> {
    vec![
        ScriptValue::String(HOST_ERROR_MARKER.to_string()),
        ScriptValue::String(message.into()),
    ]
}

/// The error message of a host reply built with [`host_error`]
pub fn is_host_error(reply: &[ScriptValue]) -> Option<&str> {
    match reply {
        [ScriptValue::String(marker), rest @ ..] if marker == HOST_ERROR_MARKER => {
            Some(rest.first().and_then(ScriptValue::as_str).unwrap_or(""))
        }
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_ref_sentinel() {
        assert!(NativeRef::empty().is_empty());
        let native = NativeRef::new(vec![1, 2, 3]);
        assert!(!native.is_empty());
        assert_eq!(native.as_bytes(), &[1, 2, 3]);
        assert_eq!(format!("{:?}", native), "NativeRef(3 bytes)");
    }

    #[test]
    fn test_host_error_convention() {
        let reply = host_error("sample error");
        assert_eq!(is_host_error(&reply), Some("sample error"));
        assert_eq!(is_host_error(&[ScriptValue::from("dfs")]), None);
        assert_eq!(is_host_error(&[]), None);
    }

    #[test]
    fn test_closure_is_host_callback() {
        let echo = |args: &[ScriptValue]| args.to_vec();
        let host: &dyn HostCallback = &echo;
        let reply = host.call_host(&[ScriptValue::from(1)]);
        assert_eq!(reply, vec![ScriptValue::Int(1)]);
    }
}
