//! Embedded transport backed by an in-process [`Broker`].
//!
//! Useful for tests, demos and single-process deployments. The broker keeps
//! its state in memory; clients connect to it by namespace host exactly like
//! they would to a remote service.
//!
//! ```ignore
//! let broker = Broker::new("demo.bus.local");
//! broker.create_entity("orders", 2).await?;
//!
//! let descriptor = EndpointDescriptor::new("sb://demo.bus.local/", "orders")?;
//! let client = MemoryTransportClient::connect(
//!     broker.clone(),
//!     descriptor,
//!     None,
//!     ConnectionOptions::default(),
//!     &BasicRetryPolicy::default(),
//!     &CancellationToken::new(),
//! )
//! .await?;
//! ```

pub mod broker;
mod client;
mod consumer;
mod sender;

pub use broker::{Broker, Fault, DEFAULT_MAX_MESSAGE_SIZE};
pub use client::MemoryTransportClient;
pub use consumer::MemoryConsumer;
pub use sender::MemorySender;
