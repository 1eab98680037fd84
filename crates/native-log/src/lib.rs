//! Capture of diagnostic logs emitted by the native inference runtime.
//!
//! The native runtime exposes a single, process-wide log hook that takes a
//! plain function pointer and an opaque `user_data` pointer. This crate owns
//! the Rust side of that arrangement: a [`LogSink`] that filters and retains
//! records in a bounded ring buffer, and a [`NativeLogBridge`] that installs the
//! sink into the hook at most once.
//!
//! # Ownership
//!
//! The native side keeps only a non-owning pointer to the sink. The bridge
//! therefore hands the hook an `Arc<LogSink>`, and hooks that talk to C
//! convert it with `Arc::into_raw` and never reclaim it: the sink stays alive
//! for the remainder of the process, no matter when the bridge itself is
//! dropped. Releasing it earlier would leave the native runtime calling into
//! freed memory.
//!
//! # Example
//!
//! ```
//! use localmind_native_log::{HookError, LogSink, NativeLogBridge, NativeLogHook};
//! use std::sync::Arc;
//!
//! struct NoopHook;
//!
//! impl NativeLogHook for NoopHook {
//!     fn register(&self, _sink: Arc<LogSink>) -> Result<(), HookError> {
//!         Ok(())
//!     }
//! }
//!
//! let bridge = NativeLogBridge::new();
//! bridge.initialize(&NoopHook).unwrap();
//! bridge.subscribe(|entry| println!("[{}] {}", entry.level, entry.message));
//! bridge.record(2, "llama_model_loader: loaded meta data\n");
//! assert_eq!(bridge.len(), 1);
//! ```

mod entry;
mod sink;

#[cfg(feature = "llama")]
mod llama;

pub use entry::{
    LogEntry, LogLevel, GGML_LOG_LEVEL_CONT, GGML_LOG_LEVEL_DEBUG, GGML_LOG_LEVEL_ERROR,
    GGML_LOG_LEVEL_INFO, GGML_LOG_LEVEL_NONE, GGML_LOG_LEVEL_WARN,
};
pub use sink::{LogSink, SubscriptionId, LOG_CAPACITY};

#[cfg(feature = "llama")]
pub use llama::LlamaLogHook;

use std::sync::{Arc, OnceLock};

use log::{debug, warn};
use thiserror::Error;

/// Errors that can occur when installing the native log hook.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HookError {
    /// The process-wide hook was already claimed by another sink.
    #[error("Native log hook is already registered")]
    AlreadyRegistered,

    /// The native runtime refused or does not provide the hook.
    #[error("Native log hook unavailable: {0}")]
    Unavailable(String),
}

/// A registration point for native log records.
pub trait NativeLogHook {
    /// Route every native record into `sink` for the rest of the process.
    fn register(&self, sink: Arc<LogSink>) -> Result<(), HookError>;
}

/// Process-scoped owner of the native log sink.
///
/// Construct one at startup and share it. [`initialize`](Self::initialize)
/// runs the hook registration exactly once, even when called concurrently;
/// later calls return the outcome of the first.
pub struct NativeLogBridge {
    sink: Arc<LogSink>,
    installed: OnceLock<Result<(), HookError>>,
}

impl NativeLogBridge {
    pub fn new() -> Self {
        Self::with_sink(LogSink::new())
    }

    pub fn with_sink(sink: LogSink) -> Self {
        Self {
            sink: Arc::new(sink),
            installed: OnceLock::new(),
        }
    }

    /// Install the sink into `hook`.
    pub fn initialize<H: NativeLogHook + ?Sized>(&self, hook: &H) -> Result<(), HookError> {
        self.installed
            .get_or_init(|| {
                let result = hook.register(self.sink.clone());
                match &result {
                    Ok(()) => debug!("Native log hook installed"),
                    Err(e) => warn!("Failed to install native log hook: {}", e),
                }
                result
            })
            .clone()
    }

    /// Whether a hook registration succeeded.
    pub fn is_initialized(&self) -> bool {
        matches!(self.installed.get(), Some(Ok(())))
    }

    /// Feed a raw record through the same path the native callback uses.
    pub fn record(&self, raw_level: u32, text: &str) -> bool {
        self.sink.record(raw_level, text)
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.sink.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.sink.unsubscribe(id)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.sink.entries()
    }

    pub fn len(&self) -> usize {
        self.sink.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sink.is_empty()
    }

    pub fn clear(&self) {
        self.sink.clear()
    }

    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }
}

impl Default for NativeLogBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hook that records how often it was asked to register.
    struct CountingHook {
        registrations: AtomicUsize,
        registered: Mutex<Option<Arc<LogSink>>>,
    }

    impl CountingHook {
        fn new() -> Self {
            Self {
                registrations: AtomicUsize::new(0),
                registered: Mutex::new(None),
            }
        }
    }

    impl NativeLogHook for CountingHook {
        fn register(&self, sink: Arc<LogSink>) -> Result<(), HookError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            *self.registered.lock().unwrap() = Some(sink);
            Ok(())
        }
    }

    struct FailingHook;

    impl NativeLogHook for FailingHook {
        fn register(&self, _sink: Arc<LogSink>) -> Result<(), HookError> {
            Err(HookError::Unavailable("no backend".into()))
        }
    }

    #[test]
    fn test_initialize_runs_once_under_concurrent_callers() {
        let bridge = NativeLogBridge::new();
        let hook = CountingHook::new();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| bridge.initialize(&hook).unwrap());
            }
        });

        assert_eq!(hook.registrations.load(Ordering::SeqCst), 1);
        assert!(bridge.is_initialized());
    }

    #[test]
    fn test_native_records_reach_bridge_through_registered_sink() {
        let bridge = NativeLogBridge::new();
        let hook = CountingHook::new();
        bridge.initialize(&hook).unwrap();

        let sink = hook.registered.lock().unwrap().clone().unwrap();
        sink.record(GGML_LOG_LEVEL_ERROR, "failed to load model\n");

        let entries = bridge.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[0].message, "failed to load model");
    }

    #[test]
    fn test_failed_initialize_is_remembered() {
        let bridge = NativeLogBridge::new();
        let hook = CountingHook::new();

        assert!(bridge.initialize(&FailingHook).is_err());
        assert!(bridge.initialize(&hook).is_err());
        assert_eq!(hook.registrations.load(Ordering::SeqCst), 0);
        assert!(!bridge.is_initialized());
    }
}
