#![forbid(unsafe_code)]
//! NvStore public API facade.
//!
//! Re-exports the storage service from `nvs-core`. Downstream consumers
//! (the CLI, embedding applications) depend on this crate.

pub use nvs_core::*;
