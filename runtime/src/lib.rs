//! Local model acquisition and lifecycle.
//!
//! Download GGUF weights from a catalog, load them into a native inference
//! runtime, evict them when idle, and multiplex conversations over the one
//! loaded model. [`LocalRuntime`] wires the pieces together.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod notify;
mod setup;

pub use error::{Error, ModelError};
pub use localmind_native_log as native_log;
pub use setup::{LocalRuntime, LocalRuntimeConfig, NATIVE_LOG_TARGET};
