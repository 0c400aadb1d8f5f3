//! Message Data Structure
//!
//! This module defines [`Message`], the unit of data a sender publishes to an
//! entity and a consumer reads back.
//!
//! ## Structure
//!
//! A message carries fields owned by the application:
//! - **body**: arbitrary bytes
//! - **message_id**: unique identifier, a random UUID unless set explicitly
//! - **label**: optional application-specific label
//! - **session_id**: optional session the message belongs to
//! - **partition_key**: optional placement hint for unbound senders
//! - **properties**: string application properties
//!
//! And fields owned by the service, stamped once the message is accepted:
//! - **sequence_number**: monotonically increasing within a partition, starting at 1
//! - **offset**: byte position of the message within the partition stream
//! - **enqueued_time**: when the service accepted the message
//!
//! The service-owned fields are read-only from the application's point of view;
//! they are only populated through [`Message::with_system_properties`], which
//! transports call when handing messages back to the caller.
//!
//! ## Example
//! ```ignore
//! let message = Message::new("order created")
//!     .with_label("orders")
//!     .with_session_id("customer-42");
//! assert!(message.sequence_number().is_none());
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed per-message framing overhead counted by [`Message::estimated_size`].
const MESSAGE_OVERHEAD_BYTES: usize = 24;

/// Service-assigned metadata, present only on messages read back from an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProperties {
    pub sequence_number: i64,
    pub offset: i64,
    pub enqueued_time: DateTime<Utc>,
    pub partition_id: String,
}

/// A single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    body: Bytes,
    message_id: String,
    label: Option<String>,
    session_id: Option<String>,
    partition_key: Option<String>,
    properties: HashMap<String, String>,
    system: Option<SystemProperties>,
}

impl Message {
    /// Create a message with a random message id.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            label: None,
            session_id: None,
            partition_key: None,
            properties: HashMap::new(),
            system: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Stamp service-assigned fields onto an accepted message.
    ///
    /// Intended for transports: applications never need to call this.
    pub fn with_system_properties(mut self, system: SystemProperties) -> Self {
        self.system = Some(system);
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn system_properties(&self) -> Option<&SystemProperties> {
        self.system.as_ref()
    }

    /// Sequence number assigned by the service, `None` until the message was accepted.
    pub fn sequence_number(&self) -> Option<i64> {
        self.system.as_ref().map(|s| s.sequence_number)
    }

    pub fn offset(&self) -> Option<i64> {
        self.system.as_ref().map(|s| s.offset)
    }

    pub fn enqueued_time(&self) -> Option<DateTime<Utc>> {
        self.system.as_ref().map(|s| s.enqueued_time)
    }

    /// Estimate the serialized size of this message in bytes.
    ///
    /// This is the size compared against a transport's negotiated message limit.
    pub fn estimated_size(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();

        MESSAGE_OVERHEAD_BYTES
            + self.body.len()
            + self.message_id.len()
            + self.label.as_ref().map_or(0, |l| l.len())
            + self.session_id.as_ref().map_or(0, |s| s.len())
            + self.partition_key.as_ref().map_or(0, |k| k.len())
            + properties
    }
}
