//! Fatal-error reporting.
//!
//! Initialization failures leave the image in an unconfirmed state, so
//! they are never returned to accessor callers: they go to a
//! [`FatalHandler`], which must not return.

use nvs_error::NvsError;
use tracing::error;

pub trait FatalHandler: Send + Sync {
    fn halt(&self, err: &NvsError) -> !;
}

/// Log and abort the process. Production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnFatal;

impl FatalHandler for AbortOnFatal {
    fn halt(&self, err: &NvsError) -> ! {
        error!(error = %err, "storage failure is unrecoverable; aborting");
        std::process::abort()
    }
}

/// Log and panic, so tests and embedders can observe the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicOnFatal;

impl FatalHandler for PanicOnFatal {
    fn halt(&self, err: &NvsError) -> ! {
        error!(error = %err, "storage failure is unrecoverable");
        panic!("fatal storage error: {err}")
    }
}
