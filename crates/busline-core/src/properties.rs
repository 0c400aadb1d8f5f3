//! Read-only metadata snapshots.
//!
//! These are fetched on demand by a transport and never cached beyond the call
//! that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information about an entity (queue or topic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProperties {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub partition_ids: Vec<String>,
}

/// Information about one partition of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProperties {
    pub entity_name: String,
    pub partition_id: String,

    /// Sequence number of the first message still retained.
    pub beginning_sequence_number: i64,

    /// Sequence number of the most recently enqueued message, 0 if nothing was ever enqueued.
    pub last_enqueued_sequence_number: i64,

    pub last_enqueued_offset: i64,
    pub last_enqueued_time: Option<DateTime<Utc>>,
    pub is_empty: bool,
}

/// Snapshot of the newest message in a partition, reported alongside receives
/// when a consumer tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEnqueuedEventProperties {
    pub sequence_number: Option<i64>,
    pub offset: Option<i64>,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub retrieved_at: DateTime<Utc>,
}
