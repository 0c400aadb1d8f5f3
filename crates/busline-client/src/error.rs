//! Error types for busline client operations.
//!
//! Every transport and facade operation returns [`ClientError`]. The variants
//! follow the failure taxonomy the retry machinery relies on.
//!
//! ## Error Handling Strategy
//!
//! - **Transient** (retried by the policy): `ServiceCommunication`, `ServiceTimeout`, `ServiceBusy`
//! - **Permanent** (surfaced on first occurrence): `Authorization`, `EntityNotFound`,
//!   `PartitionNotFound`, `PositionUnavailable`, `ConsumerPreempted`, `MessageTooLarge`,
//!   `InvalidArgument`, `ConfigError`
//! - **Lifecycle**: `ClientClosed`, `OperationCanceled`
//! - **Diagnostics**: `RetriesExhausted` wraps the last transient failure once the
//!   policy gives up
//!
//! ## Examples
//!
//! ```ignore
//! use busline_client::ClientError;
//!
//! match receiver.receive(10, Duration::from_secs(1)).await {
//!     Ok(messages) => handle(messages),
//!     Err(ClientError::ConsumerPreempted { .. }) => {
//!         // another reader with a higher owner level took over the partition
//!     }
//!     Err(e) if e.is_transient() => retry_later(),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type for busline client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The service could not be reached or the connection dropped.
    ///
    /// Transient: the retry policy re-invokes the operation.
    #[error("Service communication failure: {0}")]
    ServiceCommunication(String),

    /// A single attempt exceeded its try timeout.
    ///
    /// Transient.
    #[error("Operation timed out after {0:?}")]
    ServiceTimeout(Duration),

    /// The service is throttling requests.
    ///
    /// Transient.
    #[error("Service busy: {0}")]
    ServiceBusy(String),

    /// The credential was rejected.
    #[error("Unauthorized: {0}")]
    Authorization(String),

    /// The entity does not exist (or no longer exists).
    #[error("Entity '{0}' does not exist")]
    EntityNotFound(String),

    /// The partition is not part of the entity.
    #[error("Partition '{partition_id}' does not exist for entity '{entity}'")]
    PartitionNotFound { entity: String, partition_id: String },

    /// The requested read position was purged or is otherwise invalid.
    #[error("Position unavailable on {entity}/{partition_id}: {reason}")]
    PositionUnavailable {
        entity: String,
        partition_id: String,
        reason: String,
    },

    /// Exclusive ownership of the binding was lost or denied.
    #[error("Consumer preempted on {binding}: {reason}")]
    ConsumerPreempted { binding: String, reason: String },

    /// The client, sender or consumer was closed.
    #[error("{0} has been closed")]
    ClientClosed(String),

    /// A message or batch exceeds the negotiated size limit.
    #[error("Message of {size} bytes exceeds the maximum of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// The caller cancelled the operation.
    #[error("Operation canceled")]
    OperationCanceled,

    /// The retry policy gave up on a transient failure.
    #[error("Giving up after {attempts} attempts over {elapsed:?}: {source}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Core(#[from] busline_core::Error),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether the retry policy may re-invoke the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::ServiceCommunication(_)
                | ClientError::ServiceTimeout(_)
                | ClientError::ServiceBusy(_)
        )
    }

    /// The underlying failure, looking through `RetriesExhausted`.
    pub fn root(&self) -> &ClientError {
        match self {
            ClientError::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}
