//! Read positions and consumer exclusivity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position within a partition where a consumer starts reading.
///
/// Exactly one kind of marker is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPosition {
    /// First message still retained by the partition.
    Earliest,
    /// Only messages enqueued after the consumer is created.
    Latest,
    /// A specific sequence number; `inclusive` selects whether that message itself is read.
    SequenceNumber { value: i64, inclusive: bool },
    /// A specific byte offset; `inclusive` selects whether the message at that offset is read.
    Offset { value: i64, inclusive: bool },
    /// First message enqueued at or after this instant.
    EnqueuedTime(DateTime<Utc>),
}

impl EventPosition {
    pub fn from_sequence_number(value: i64) -> Self {
        EventPosition::SequenceNumber {
            value,
            inclusive: true,
        }
    }

    pub fn from_offset(value: i64) -> Self {
        EventPosition::Offset {
            value,
            inclusive: true,
        }
    }

    pub fn from_enqueued_time(time: DateTime<Utc>) -> Self {
        EventPosition::EnqueuedTime(time)
    }
}

impl Default for EventPosition {
    fn default() -> Self {
        EventPosition::Latest
    }
}

/// Ownership a consumer asserts over its binding.
///
/// `Exclusive(level)` consumers are "epoch" consumers: a higher level preempts
/// a lower one holding the same binding. `Shared` consumers coexist with each
/// other but never with an exclusive holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Exclusivity {
    #[default]
    Shared,
    Exclusive(i64),
}

impl Exclusivity {
    pub fn owner_level(&self) -> Option<i64> {
        match self {
            Exclusivity::Shared => None,
            Exclusivity::Exclusive(level) => Some(*level),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, Exclusivity::Exclusive(_))
    }
}

impl From<Option<i64>> for Exclusivity {
    fn from(owner_level: Option<i64>) -> Self {
        match owner_level {
            Some(level) => Exclusivity::Exclusive(level),
            None => Exclusivity::Shared,
        }
    }
}
