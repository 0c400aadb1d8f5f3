use super::broker::{Broker, LinkHandle};
use super::consumer::MemoryConsumer;
use super::sender::MemorySender;
use crate::error::{ClientError, Result};
use crate::options::ConnectionOptions;
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::transport::{
    ConsumerBinding, ConsumerOptions, LifecycleState, TransportClient, TransportConsumer, TransportSender,
    CLOSE_TIMEOUT,
};
use async_trait::async_trait;
use busline_core::{Credential, EndpointDescriptor, EntityProperties, Message, PartitionProperties};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// [`TransportClient`] talking to an in-process [`Broker`].
#[derive(Debug)]
pub struct MemoryTransportClient {
    broker: Broker,
    descriptor: EndpointDescriptor,
    connection: ConnectionOptions,
    state: LifecycleState,
    children: Mutex<Children>,
}

/// Endpoints created by a client, closed when it closes.
///
/// `links` outlives dropped consumers: the broker keeps a link until it is
/// detached, and closing the client detaches every link it attached.
#[derive(Debug, Default)]
struct Children {
    senders: Vec<Weak<MemorySender>>,
    consumers: Vec<Weak<MemoryConsumer>>,
    links: Vec<(ConsumerBinding, Weak<LinkHandle>)>,
}

impl MemoryTransportClient {
    /// Open a connection: verify the namespace host and present `credential`.
    pub async fn connect(
        broker: Broker,
        descriptor: EndpointDescriptor,
        credential: Option<Credential>,
        connection: ConnectionOptions,
        policy: &dyn RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let client = Self {
            broker,
            descriptor,
            connection,
            state: LifecycleState::new(),
            children: Mutex::new(Children::default()),
        };

        let broker = &client.broker;
        let host = client.descriptor.namespace();
        let credential = credential.as_ref();
        retry_with_policy(policy, cancel, "connect", |_| broker.handshake(host, credential)).await?;

        client.state.open();
        info!(
            endpoint = client.descriptor.endpoint(),
            entity = client.descriptor.entity_name(),
            transport = ?client.connection.transport_type,
            proxy = client.connection.proxy.as_deref().unwrap_or("none"),
            "Connected transport client"
        );
        Ok(client)
    }

    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.connection
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn entity(&self) -> &str {
        self.descriptor.entity_name()
    }

    /// Registry lock; never held across an await.
    fn children(&self) -> MutexGuard<'_, Children> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TransportClient for MemoryTransportClient {
    fn service_endpoint(&self) -> &str {
        self.descriptor.endpoint()
    }

    fn entity_name(&self) -> &str {
        self.entity()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn get_properties(
        &self,
        policy: &dyn RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<EntityProperties> {
        self.state.ensure_open("transport client")?;
        let broker = &self.broker;
        let entity = self.entity();
        retry_with_policy(policy, cancel, "get_properties", |_| {
            broker.entity_properties(entity)
        })
        .await
    }

    async fn get_partition_properties(
        &self,
        partition_id: &str,
        policy: &dyn RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<PartitionProperties> {
        self.state.ensure_open("transport client")?;
        let broker = &self.broker;
        let entity = self.entity();
        retry_with_policy(policy, cancel, "get_partition_properties", |_| {
            broker.partition_properties(entity, partition_id)
        })
        .await
    }

    async fn peek(
        &self,
        consumer: &dyn TransportConsumer,
        policy: &dyn RetryPolicy,
        from_sequence_number: Option<i64>,
        message_count: usize,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        self.state.ensure_open("transport client")?;
        if consumer.is_closed() {
            return Err(ClientError::ClientClosed("consumer".to_string()));
        }
        let binding = consumer.binding();
        if binding.entity != self.entity() {
            return Err(ClientError::InvalidArgument(format!(
                "consumer is bound to '{}', not '{}'",
                binding.entity,
                self.entity()
            )));
        }
        if message_count == 0 {
            return Ok(Vec::new());
        }

        let broker = &self.broker;
        let entity = self.entity();
        let partition_id = binding.partition_id.as_str();
        let session_id = session_id.or(binding.session_id.as_deref());
        let messages = retry_with_policy(policy, cancel, "peek", |_| {
            broker.peek(entity, partition_id, session_id, from_sequence_number, message_count)
        })
        .await?;

        debug!(
            entity,
            partition_id,
            from = ?from_sequence_number,
            requested = message_count,
            returned = messages.len(),
            "Peeked messages"
        );
        Ok(messages)
    }

    fn create_sender(
        &self,
        partition_id: Option<&str>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Result<Arc<dyn TransportSender>> {
        let sender = Arc::new(MemorySender::new(
            self.broker.clone(),
            self.entity().to_string(),
            partition_id.map(str::to_string),
            policy,
        ));

        let mut children = self.children();
        self.state.ensure_open("transport client")?;
        children.senders.retain(|s| s.strong_count() > 0);
        children.senders.push(Arc::downgrade(&sender));
        drop(children);

        debug!(
            entity = self.entity(),
            partition_id = partition_id.unwrap_or("*"),
            "Created sender"
        );
        Ok(sender)
    }

    async fn create_consumer(
        &self,
        options: ConsumerOptions,
        policy: Arc<dyn RetryPolicy>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TransportConsumer>> {
        self.state.ensure_open("transport client")?;
        if options.consumer_group.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "consumer group must not be empty".to_string(),
            ));
        }
        if options.partition_id.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "partition id must not be empty".to_string(),
            ));
        }

        let mut options = options;
        if options.session_id.is_none() {
            options.session_id = self.descriptor.session_id().map(str::to_string);
        }
        let binding = options.binding(self.entity());

        let broker = &self.broker;
        let position = &options.event_position;
        let start_sequence = retry_with_policy(policy.as_ref(), cancel, "resolve_position", |_| {
            broker.resolve_position(&binding.entity, &binding.partition_id, position)
        })
        .await?;

        let exclusivity = options.exclusivity;
        let link = retry_with_policy(policy.as_ref(), cancel, "attach", |_| {
            broker.attach(&binding, exclusivity)
        })
        .await?;
        let link_id = link.id;
        let link_ref = Arc::downgrade(&link);

        let consumer = Arc::new(MemoryConsumer::new(
            self.broker.clone(),
            binding.clone(),
            policy,
            link,
            start_sequence,
            options.effective_prefetch_count() as usize,
            options.track_last_enqueued_event_properties,
        ));

        let registered = {
            let mut children = self.children();
            if self.state.is_closed() {
                false
            } else {
                children.consumers.retain(|c| c.strong_count() > 0);
                children.consumers.push(Arc::downgrade(&consumer));
                children.links.retain(|(_, l)| l.strong_count() > 0);
                children.links.push((binding.clone(), link_ref));
                true
            }
        };
        if !registered {
            self.broker.detach(&binding, link_id).await;
            return Err(ClientError::ClientClosed("transport client".to_string()));
        }

        info!(
            binding = %binding,
            ?exclusivity,
            start_sequence,
            prefetch = options.effective_prefetch_count(),
            "Created consumer"
        );
        Ok(consumer)
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.state.begin_close() {
            // another close is releasing the children; return once it is done
            debug!(entity = self.entity(), "Transport client closing elsewhere, waiting");
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::OperationCanceled),
                _ = self.state.wait_closed() => Ok(()),
            };
        }
        info!(entity = self.entity(), "Closing transport client");

        let (senders, consumers, links) = {
            let mut children = self.children();
            let senders: Vec<_> = children.senders.drain(..).filter_map(|s| s.upgrade()).collect();
            let consumers: Vec<_> = children
                .consumers
                .drain(..)
                .filter_map(|c| c.upgrade())
                .collect();
            let links: Vec<_> = children
                .links
                .drain(..)
                .filter_map(|(binding, link)| link.upgrade().map(|link| (binding, link.id)))
                .collect();
            (senders, consumers, links)
        };

        let release = async {
            for sender in &senders {
                if let Err(e) = sender.close(cancel).await {
                    warn!(entity = self.entity(), error = %e, "Failed to close sender");
                }
            }
            for consumer in &consumers {
                if let Err(e) = consumer.close(cancel).await {
                    warn!(binding = %consumer.binding(), error = %e, "Failed to close consumer");
                }
            }
            // links of consumers dropped without close
            for (binding, link_id) in &links {
                self.broker.detach(binding, *link_id).await;
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::OperationCanceled),
            released = tokio::time::timeout(CLOSE_TIMEOUT, release) => {
                released.map_err(|_| ClientError::ServiceTimeout(CLOSE_TIMEOUT))
            }
        };

        self.state.mark_closed();
        match outcome {
            Ok(()) => {
                info!(
                    entity = self.entity(),
                    senders = senders.len(),
                    consumers = consumers.len(),
                    "Closed transport client"
                );
                Ok(())
            }
            Err(ClientError::OperationCanceled) => {
                warn!(entity = self.entity(), "Close canceled; client marked closed");
                Err(ClientError::OperationCanceled)
            }
            Err(e) => {
                warn!(entity = self.entity(), error = %e, "Best-effort close did not finish");
                Ok(())
            }
        }
    }
}
