//! Connection facade.
//!
//! A [`Connection`] holds exactly one [`TransportClient`] for its whole life
//! and hands out [`SenderClient`]s and [`ReceiverClient`]s that share it. The
//! transport variant is chosen once, at construction.
//!
//! ## Example
//!
//! ```ignore
//! use busline_client::{ClientOptions, Connection};
//! use busline_client::transport::memory::Broker;
//!
//! let broker = Broker::new("demo.bus.local");
//! broker.create_entity("orders", 2).await?;
//!
//! let connection = Connection::connect_embedded(
//!     broker,
//!     "Endpoint=sb://demo.bus.local/;EntityPath=orders",
//!     None,
//!     None,
//!     ClientOptions::default(),
//! )
//! .await?;
//!
//! let cancel = CancellationToken::new();
//! let sender = connection.create_sender(None)?;
//! sender.send(Message::new("order created"), &cancel).await?;
//!
//! connection.close(&cancel).await?;
//! ```

use crate::error::Result;
use crate::options::ClientOptions;
use crate::receiver::ReceiverClientBuilder;
use crate::retry::{BasicRetryPolicy, RetryPolicy};
use crate::sender::SenderClient;
use crate::transport::memory::{Broker, MemoryTransportClient};
use crate::transport::TransportClient;
use busline_core::{Credential, EndpointDescriptor, EntityProperties, PartitionProperties};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A logical connection to one entity.
#[derive(Debug, Clone)]
pub struct Connection {
    transport: Arc<dyn TransportClient>,
    policy: Arc<dyn RetryPolicy>,
    options: ClientOptions,
}

impl Connection {
    /// Wrap an already connected transport.
    pub fn new(transport: Arc<dyn TransportClient>, options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let policy: Arc<dyn RetryPolicy> = Arc::new(BasicRetryPolicy::new(options.retry.clone()));
        Ok(Self {
            transport,
            policy,
            options,
        })
    }

    /// Connect to an in-process broker using a connection string.
    ///
    /// `entity_name` may be omitted when the connection string has an
    /// `EntityPath`. An explicit `credential` takes precedence over one in the
    /// connection string.
    pub async fn connect_embedded(
        broker: Broker,
        connection_string: &str,
        entity_name: Option<&str>,
        credential: Option<Credential>,
        options: ClientOptions,
    ) -> Result<Self> {
        options.validate()?;
        let (descriptor, properties) =
            EndpointDescriptor::from_connection_string(connection_string, entity_name)?;
        let credential = credential.or_else(|| properties.credential());

        let policy = BasicRetryPolicy::new(options.retry.clone());
        let transport = MemoryTransportClient::connect(
            broker,
            descriptor,
            credential,
            options.connection.clone(),
            &policy,
            &CancellationToken::new(),
        )
        .await?;

        Self::new(Arc::new(transport), options)
    }

    /// Replace the policy built from [`ClientOptions::retry`].
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn entity_name(&self) -> &str {
        self.transport.entity_name()
    }

    pub fn service_endpoint(&self) -> &str {
        self.transport.service_endpoint()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub async fn get_properties(&self, cancel: &CancellationToken) -> Result<EntityProperties> {
        self.transport.get_properties(self.policy.as_ref(), cancel).await
    }

    pub async fn get_partition_ids(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.get_properties(cancel).await?.partition_ids)
    }

    pub async fn get_partition_properties(
        &self,
        partition_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PartitionProperties> {
        self.transport
            .get_partition_properties(partition_id, self.policy.as_ref(), cancel)
            .await
    }

    /// Create a sender, bound to `partition_id` if given.
    pub fn create_sender(&self, partition_id: Option<&str>) -> Result<SenderClient> {
        let sender = self.transport.create_sender(partition_id, self.policy.clone())?;
        Ok(SenderClient::new(self.entity_name().to_string(), sender))
    }

    /// Start configuring a receiver. The consumer group defaults to `$Default`.
    pub fn create_receiver(&self) -> ReceiverClientBuilder {
        ReceiverClientBuilder::new(self.transport.clone(), self.policy.clone())
    }

    /// Close the connection and every sender and receiver created from it.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.transport.close(cancel).await
    }

    /// Close without a cancellation token, logging any failure.
    pub async fn dispose(&self) {
        self.transport.dispose().await;
        info!(entity = self.entity_name(), "Connection disposed");
    }
}
