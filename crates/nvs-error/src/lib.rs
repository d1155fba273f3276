#![forbid(unsafe_code)]
//! Error types for NvStore.
//!
//! # Error Tiers
//!
//! Every fallible operation in the workspace returns [`NvsError`]. What
//! happens to an error depends on where it surfaces, not on its variant:
//!
//! | Where | Outcome |
//! |-------|---------|
//! | Initialization / migration | Handed to the fatal handler; the process halts |
//! | Incremental flush | Counted, dirty bits kept, write handle discarded, retried next tick |
//! | Byte accessors | Never produced; out-of-range access is a defined no-op |
//!
//! ## Design Constraints
//!
//! - `nvs-error` MUST NOT depend on `nvs-types` or `nvs-device`.
//! - Payloads are owned so errors can cross the flush thread boundary.

use thiserror::Error;

/// Unified error type for all NvStore operations.
#[derive(Debug, Error)]
pub enum NvsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistent device (or a required file) does not exist.
    #[error("device not found: {0}")]
    DeviceMissing(String),

    /// A seek landed somewhere other than the requested offset.
    #[error("seek mismatch: requested offset {expected}, device reported {actual}")]
    SeekMismatch { expected: u64, actual: u64 },

    /// Fewer bytes were read than requested.
    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// Fewer bytes were written than requested.
    #[error("short write at offset {offset}: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// The handle was opened in a mode that does not allow the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Deployment configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A flush scheduler is already attached to this storage instance.
    #[error("a flush scheduler is already active for this storage")]
    FlushSchedulerActive,

    /// Fault injected by a test double.
    #[error("injected fault: {0}")]
    Injected(&'static str),
}

impl NvsError {
    /// Whether this error means the operation transferred fewer bytes than
    /// requested or landed at the wrong offset, as opposed to failing outright.
    #[must_use]
    pub fn is_partial_transfer(&self) -> bool {
        matches!(
            self,
            Self::SeekMismatch { .. } | Self::ShortRead { .. } | Self::ShortWrite { .. }
        )
    }
}

/// Result alias using `NvsError`.
pub type Result<T> = std::result::Result<T, NvsError>;
