//! Error Module - Runtime Error Types
//!
//! Defines all error types surfaced by the runtime core.
//!
//! Policy (see also the panic policy below):
//! - Allocation failure in user paths is surfaced as `OutOfMemory`.
//! - User-visible exceptions thrown out of memoized code travel as interned
//!   exception objects in a `MemoValue`; the `Runtime` variant is their
//!   host-side rendering.
//! - Internal invariant violations (corrupted bump pointer, double unlock,
//!   lock self-deadlock) are bugs; they panic and are never caught.

use thiserror::Error;

/// Main error type for all runtime operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Runtime exception: {0}")]
    Runtime(String),

    #[error("Program exit requested with status {0}")]
    Exit(i32),

    #[error("Memo cache rejected at offset {offset}: {reason}")]
    Deserialization { offset: u64, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Process is dead: task cannot be posted")]
    DeadProcess,
}

impl RuntimeError {
    /// Check if this error is recoverable (execution can continue with
    /// degraded service, e.g. an empty memo cache).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Deserialization { .. }
                | RuntimeError::Runtime(_)
                | RuntimeError::DeadProcess
        )
    }

    /// Check if this error indicates a bug in the runtime itself.
    pub fn is_bug(&self) -> bool {
        matches!(self, RuntimeError::InvariantViolation(_))
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Abort on an unrecoverable internal error.
///
/// Collector corruption and lock-order violations leave the heap in an
/// undefined state; there is nothing to unwind to.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        panic!("rill-runtime fatal: {}", format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let err = RuntimeError::Deserialization {
            offset: 16,
            reason: "unknown tag".into(),
        };
        assert!(err.is_recoverable());
        assert!(!err.is_bug());

        let oom = RuntimeError::OutOfMemory { requested: 1 << 40 };
        assert!(!oom.is_recoverable());
    }

    #[test]
    fn test_bug_classification() {
        let err = RuntimeError::InvariantViolation("bump pointer corrupted".into());
        assert!(err.is_bug());
    }

    #[test]
    fn test_display() {
        let err = RuntimeError::OutOfMemory { requested: 64 };
        assert!(err.to_string().contains("64"));
    }
}
