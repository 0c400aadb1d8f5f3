//! busline Core - shared data model
//!
//! This crate holds the protocol-independent types every busline transport and
//! facade agrees on:
//!
//! - [`Message`]: the unit of data sent to and received from an entity
//! - [`EventPosition`]: where a consumer starts reading
//! - [`Exclusivity`]: whether a consumer asserts ownership of its binding
//! - [`EntityProperties`] / [`PartitionProperties`]: read-only metadata snapshots
//! - [`EndpointDescriptor`] and connection-string parsing
//!
//! Nothing here performs I/O. Transports live in `busline-client`.

pub mod endpoint;
pub mod error;
pub mod message;
pub mod position;
pub mod properties;

pub use endpoint::{ConnectionStringProperties, Credential, EndpointDescriptor};
pub use error::{Error, Result};
pub use message::{Message, SystemProperties};
pub use position::{EventPosition, Exclusivity};
pub use properties::{EntityProperties, LastEnqueuedEventProperties, PartitionProperties};
