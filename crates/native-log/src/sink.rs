//! Bounded store and fan-out for native log records.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::{LogEntry, LogLevel};

/// Maximum number of records retained by a sink.
pub const LOG_CAPACITY: usize = 500;

type Subscriber = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Handle returned by [`LogSink::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receives raw records from the native callback.
///
/// Records are filtered, trimmed, appended to a ring buffer (oldest evicted
/// first) and handed to every subscriber on the calling thread. Subscribers
/// run on whatever thread the native runtime logs from and must not block.
pub struct LogSink {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Accept a record straight from the native layer.
    ///
    /// Returns `true` if the record was kept.
    pub fn record(&self, raw_level: u32, text: &str) -> bool {
        match LogLevel::from_native(raw_level) {
            Some(level) => self.push(level, text),
            None => false,
        }
    }

    /// Accept an already-classified record.
    pub fn push(&self, level: LogLevel, text: &str) -> bool {
        let message = text.trim();
        if message.is_empty() {
            return false;
        }

        let entry = LogEntry::new(level, message);
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // Snapshot so subscribers may (un)subscribe from inside the callback
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        for subscriber in subscribers {
            subscriber(&entry);
        }

        true
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Copy of the retained records, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{
        GGML_LOG_LEVEL_CONT, GGML_LOG_LEVEL_DEBUG, GGML_LOG_LEVEL_ERROR, GGML_LOG_LEVEL_INFO,
        GGML_LOG_LEVEL_NONE, GGML_LOG_LEVEL_WARN,
    };

    #[test]
    fn test_level_filtering() {
        let test_cases = vec![
            ("none is dropped", GGML_LOG_LEVEL_NONE, None),
            ("debug is dropped", GGML_LOG_LEVEL_DEBUG, None),
            ("info is kept", GGML_LOG_LEVEL_INFO, Some(LogLevel::Info)),
            ("warn is kept", GGML_LOG_LEVEL_WARN, Some(LogLevel::Warning)),
            ("error is kept", GGML_LOG_LEVEL_ERROR, Some(LogLevel::Error)),
            ("continuation is dropped", GGML_LOG_LEVEL_CONT, None),
            ("unknown is dropped", 42, None),
        ];

        for (description, raw, expected) in test_cases {
            let sink = LogSink::new();
            let kept = sink.record(raw, "llama_model_loader: loaded meta data");
            assert_eq!(kept, expected.is_some(), "{}", description);
            assert_eq!(
                sink.entries().first().map(|e| e.level),
                expected,
                "{}",
                description
            );
        }
    }

    #[test]
    fn test_messages_are_trimmed_and_empty_rejected() {
        let sink = LogSink::new();

        assert!(sink.record(GGML_LOG_LEVEL_INFO, "  load_tensors: CPU buffer size\n"));
        assert!(!sink.record(GGML_LOG_LEVEL_INFO, "\n"));
        assert!(!sink.record(GGML_LOG_LEVEL_ERROR, "   \t "));

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "load_tensors: CPU buffer size");
    }

    #[test]
    fn test_ring_evicts_oldest_at_capacity() {
        let sink = LogSink::new();

        for i in 0..=LOG_CAPACITY {
            sink.push(LogLevel::Info, &format!("line {}", i));
        }

        let entries = sink.entries();
        assert_eq!(entries.len(), LOG_CAPACITY);
        assert_eq!(entries.first().unwrap().message, "line 1");
        assert_eq!(
            entries.last().unwrap().message,
            format!("line {}", LOG_CAPACITY)
        );
    }

    #[test]
    fn test_subscribers_receive_entries_until_unsubscribed() {
        let sink = LogSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let id = sink.subscribe(move |entry| {
            seen_clone.lock().unwrap().push(entry.message.clone());
        });

        sink.push(LogLevel::Warning, "first");
        sink.record(GGML_LOG_LEVEL_DEBUG, "filtered");
        assert!(sink.unsubscribe(id));
        sink.push(LogLevel::Warning, "second");

        assert_eq!(*seen.lock().unwrap(), vec!["first".to_string()]);
        assert!(!sink.unsubscribe(id));
    }
}
