//! Dead-Letter Queue: bounded holding area for items that failed for good
//!
//! When an item runs out of retries, hits a non-retryable error, keeps
//! meeting an open circuit or expires in the queue, it is recorded here
//! instead of vanishing. The batch report drains the queue so the caller can
//! see every terminal failure with its reason.
//!
//! # Example
//!
//! ```
//! use pacekeeper_core_resilience::dead_letter::{DeadLetterQueue, DeadLetterEntry, FailureReason};
//!
//! let mut dlq = DeadLetterQueue::new(1000); // max 1000 entries
//!
//! dlq.push(DeadLetterEntry::new(
//!     "SN-0042",
//!     FailureReason::RetriesExhausted { attempts: 4 },
//!     "server_error: 503 service unavailable",
//!     4,
//! ));
//!
//! assert_eq!(dlq.len(), 1);
//! let entries = dlq.drain();
//! assert_eq!(entries.len(), 1);
//! ```

use crate::error::ErrorKind;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Reason an item was sent to the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Maximum retry count exceeded
    RetriesExhausted { attempts: u32 },

    /// Error that can never succeed unmodified
    NonRetryable { kind: ErrorKind },

    /// Circuit stayed open for every attempt the item had
    ServiceUnavailable,

    /// Waited in the queue longer than the queue timeout
    Expired { waited: Duration },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            FailureReason::NonRetryable { kind } => write!(f, "non-retryable {} error", kind),
            FailureReason::ServiceUnavailable => write!(f, "service unavailable"),
            FailureReason::Expired { waited } => {
                write!(f, "expired after {}ms in queue", waited.as_millis())
            }
        }
    }
}

/// A single dead-letter entry
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Key of the work item
    pub item_key: String,

    /// Why this item was dead-lettered
    pub failure_reason: FailureReason,

    /// Last error message
    pub last_error: String,

    /// Attempts made against the upstream
    pub attempts: u32,

    /// When this item first failed
    pub first_failed_at: SystemTime,

    /// When this item was last attempted
    pub last_failed_at: SystemTime,
}

impl DeadLetterEntry {
    pub fn new(
        item_key: impl Into<String>,
        failure_reason: FailureReason,
        last_error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            item_key: item_key.into(),
            failure_reason,
            last_error: last_error.into(),
            attempts,
            first_failed_at: now,
            last_failed_at: now,
        }
    }

    /// Set when the item first failed
    pub fn first_failed(mut self, at: SystemTime) -> Self {
        self.first_failed_at = at;
        self
    }
}

/// In-memory dead-letter queue with bounded capacity.
///
/// Items that exceed the capacity are dropped (oldest first) to prevent
/// unbounded memory growth.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetterEntry>,
    max_capacity: usize,
    total_received: u64,
    total_dropped: u64,
}

impl DeadLetterQueue {
    /// Create a new dead-letter queue with the given maximum capacity
    pub fn new(max_capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_capacity.min(1024)),
            max_capacity: max_capacity.max(1),
            total_received: 0,
            total_dropped: 0,
        }
    }

    /// Push an entry into the dead-letter queue.
    ///
    /// If the queue is at capacity, the oldest entry is dropped.
    pub fn push(&mut self, entry: DeadLetterEntry) {
        self.total_received += 1;

        if self.entries.len() >= self.max_capacity {
            self.entries.pop_front();
            self.total_dropped += 1;
        }

        self.entries.push_back(entry);
    }

    /// Drain all entries from the queue
    pub fn drain(&mut self) -> Vec<DeadLetterEntry> {
        self.entries.drain(..).collect()
    }

    /// Number of entries currently in the queue
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            current_count: self.entries.len(),
            max_capacity: self.max_capacity,
            total_received: self.total_received,
            total_dropped: self.total_dropped,
        }
    }
}

/// Statistics for the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    /// Current number of entries
    pub current_count: usize,
    /// Maximum capacity
    pub max_capacity: usize,
    /// Total entries ever received
    pub total_received: u64,
    /// Total entries dropped due to capacity overflow
    pub total_dropped: u64,
}
