//! Non-blocking audit queue with a single writer task.
//!
//! # Overflow policy: drop-oldest
//!
//! The queue holds at most `capacity` pending entries. When a new entry
//! arrives at a full queue, the **oldest** pending entry is discarded and the
//! dropped counter incremented, so the most recent activity is always
//! retained. [`AuditLogger::log`] never awaits and never spawns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::warn;

use super::sink::AuditSink;
use super::KeyAuditEntry;

struct AuditQueue {
    pending: Mutex<VecDeque<KeyAuditEntry>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl AuditQueue {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<KeyAuditEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `entry`, evicting the oldest pending entry if full.
    ///
    /// Returns `false` if an entry had to be evicted.
    fn push(&self, entry: KeyAuditEntry) -> bool {
        let evicted = {
            let mut pending = self.lock();
            let evicted = if pending.len() >= self.capacity {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back(entry);
            evicted
        };
        self.notify.notify_one();

        match evicted {
            Some(old) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    dropped_entry = %old.id,
                    operation = %old.operation,
                    total_dropped = total,
                    "audit queue full; dropped oldest entry"
                );
                false
            }
            None => true,
        }
    }

    fn drain(&self) -> Vec<KeyAuditEntry> {
        self.lock().drain(..).collect()
    }
}

/// Cheaply clonable handle for recording audit entries.
///
/// A disabled logger (the unset-sink case) accepts and discards entries.
#[derive(Clone, Default)]
pub struct AuditLogger {
    queue: Option<Arc<AuditQueue>>,
}

impl AuditLogger {
    /// Start the writer task for `sink` and return a handle feeding it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let queue = Arc::new(AuditQueue::new(capacity));
        tokio::spawn(writer(Arc::clone(&queue), sink));
        Self { queue: Some(queue) }
    }

    /// A logger with no sink; every entry is discarded.
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    /// Queue `entry` for the writer task. Never blocks.
    pub fn log(&self, entry: KeyAuditEntry) {
        if let Some(queue) = &self.queue {
            queue.push(entry);
        }
    }

    /// Entries discarded by the drop-oldest policy since start.
    pub fn dropped(&self) -> u64 {
        self.queue
            .as_ref()
            .map_or(0, |q| q.dropped.load(Ordering::Relaxed))
    }

    /// Entries queued but not yet handed to the sink.
    pub fn pending(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.lock().len())
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("enabled", &self.queue.is_some())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn writer(queue: Arc<AuditQueue>, sink: Arc<dyn AuditSink>) {
    loop {
        let batch = queue.drain();
        if batch.is_empty() {
            queue.notify.notified().await;
            continue;
        }
        for entry in batch {
            if let Err(e) = sink.publish(&entry).await {
                warn!(
                    sink = sink.name(),
                    entry = %entry.id,
                    operation = %entry.operation,
                    error = %e,
                    "audit sink publish failed"
                );
            }
        }
    }
}
