//! busline Client - transport-agnostic messaging client
//!
//! This crate provides the connection, sender and receiver facades for busline
//! entities. All protocol work sits behind the [`TransportClient`] trait; every
//! remote operation runs through a [`RetryPolicy`] and honours a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).
//!
//! ```text
//! Connection ─┬─ SenderClient   ─► TransportSender   ┐
//!             ├─ ReceiverClient ─► TransportConsumer ├─► TransportClient ─► broker
//!             └─ get_properties / peek / close ──────┘
//! ```
//!
//! The crate ships an embedded transport backed by an in-process
//! [`Broker`](transport::memory::Broker).
//!
//! # Examples
//!
//! ## Sending
//!
//! ```ignore
//! use busline_client::{ClientOptions, Connection, Message};
//!
//! let connection = Connection::connect_embedded(
//!     broker,
//!     "Endpoint=sb://demo.bus.local/;SharedAccessKeyName=Root;SharedAccessKey=secret",
//!     Some("orders"),
//!     None,
//!     ClientOptions::default(),
//! )
//! .await?;
//!
//! let sender = connection.create_sender(None)?;
//! sender
//!     .send(Message::new("order data").with_session_id("customer-42"), &cancel)
//!     .await?;
//! ```
//!
//! ## Receiving
//!
//! ```ignore
//! let receiver = connection
//!     .create_receiver()
//!     .partition_id("0")
//!     .event_position(EventPosition::Earliest)
//!     .build()?;
//!
//! let messages = receiver.receive(10, Duration::from_secs(1), &cancel).await?;
//! ```

pub mod batch;
pub mod connection;
pub mod error;
pub mod options;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod transport;

pub use batch::{CreateBatchOptions, MessageBatch};
pub use connection::Connection;
pub use error::{ClientError, Result};
pub use options::{ClientOptions, ConnectionOptions, RetryMode, RetryOptions, TransportType};
pub use receiver::{ReceiverClient, ReceiverClientBuilder};
pub use retry::{retry_with_policy, BasicRetryPolicy, RetryDecision, RetryPolicy};
pub use sender::SenderClient;
pub use transport::{
    ConsumerBinding, ConsumerOptions, TransportClient, TransportConsumer, TransportSender,
};

pub use busline_core::{
    Credential, EndpointDescriptor, EntityProperties, EventPosition, Exclusivity,
    LastEnqueuedEventProperties, Message, PartitionProperties,
};
