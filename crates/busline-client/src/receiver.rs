//! Receiver facade.
//!
//! A [`ReceiverClient`] reads one partition (or one session of it) for one
//! consumer group. It is configured through [`ReceiverClientBuilder`], in the
//! same builder style as the rest of the client:
//!
//! ```ignore
//! let receiver = connection
//!     .create_receiver()
//!     .consumer_group("audit")
//!     .partition_id("0")
//!     .event_position(EventPosition::Earliest)
//!     .owner_level(5)
//!     .prefetch_count(50)
//!     .track_last_enqueued_event_properties(true)
//!     .build()?;
//!
//! let messages = receiver.receive(10, Duration::from_secs(1), &cancel).await?;
//! let peeked = receiver.peek(Some(1), 10, &cancel).await?;
//! ```
//!
//! The underlying consumer link is created on the first `receive` or `peek`
//! and reused afterwards. A receiver whose link was preempted keeps failing
//! with `ConsumerPreempted`; create a new receiver to read again.

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{ConsumerOptions, TransportClient, TransportConsumer, DEFAULT_CONSUMER_GROUP};
use busline_core::{EventPosition, Exclusivity, LastEnqueuedEventProperties, Message};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Builder for [`ReceiverClient`].
#[derive(Debug)]
pub struct ReceiverClientBuilder {
    transport: Arc<dyn TransportClient>,
    policy: Arc<dyn RetryPolicy>,
    consumer_group: String,
    partition_id: Option<String>,
    event_position: EventPosition,
    exclusivity: Exclusivity,
    prefetch_count: Option<u32>,
    session_id: Option<String>,
    track_last_enqueued: bool,
}

impl ReceiverClientBuilder {
    pub(crate) fn new(transport: Arc<dyn TransportClient>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            transport,
            policy,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            partition_id: None,
            event_position: EventPosition::default(),
            exclusivity: Exclusivity::Shared,
            prefetch_count: None,
            session_id: None,
            track_last_enqueued: false,
        }
    }

    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    /// Required.
    pub fn partition_id(mut self, partition_id: impl Into<String>) -> Self {
        self.partition_id = Some(partition_id.into());
        self
    }

    pub fn event_position(mut self, position: EventPosition) -> Self {
        self.event_position = position;
        self
    }

    /// Make the receiver exclusive with this owner level.
    pub fn owner_level(mut self, owner_level: i64) -> Self {
        self.exclusivity = Exclusivity::Exclusive(owner_level);
        self
    }

    pub fn exclusivity(mut self, exclusivity: Exclusivity) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn track_last_enqueued_event_properties(mut self, track: bool) -> Self {
        self.track_last_enqueued = track;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<ReceiverClient> {
        if self.transport.is_closed() {
            return Err(ClientError::ClientClosed("connection".to_string()));
        }
        let partition_id = self.partition_id.ok_or_else(|| {
            ClientError::InvalidArgument("a receiver needs a partition id".to_string())
        })?;

        let options = ConsumerOptions {
            consumer_group: self.consumer_group,
            partition_id,
            event_position: self.event_position,
            track_last_enqueued_event_properties: self.track_last_enqueued,
            exclusivity: self.exclusivity,
            prefetch_count: self.prefetch_count,
            session_id: self.session_id,
        };

        Ok(ReceiverClient {
            transport: self.transport,
            policy: self.policy,
            options,
            consumer: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Reads messages from one binding.
#[derive(Debug)]
pub struct ReceiverClient {
    transport: Arc<dyn TransportClient>,
    policy: Arc<dyn RetryPolicy>,
    options: ConsumerOptions,
    consumer: OnceCell<Arc<dyn TransportConsumer>>,
    closed: AtomicBool,
}

impl ReceiverClient {
    pub fn consumer_options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.transport.is_closed()
            || self.consumer.get().map_or(false, |c| c.is_closed())
    }

    async fn consumer(&self, cancel: &CancellationToken) -> Result<&Arc<dyn TransportConsumer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed("receiver".to_string()));
        }
        let consumer = self
            .consumer
            .get_or_try_init(|| {
                self.transport
                    .create_consumer(self.options.clone(), self.policy.clone(), cancel)
            })
            .await?;

        // `close` may have run while the link was being created and found
        // nothing to release. Pairs with the fence in `close`.
        fence(Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            consumer.close(cancel).await?;
            return Err(ClientError::ClientClosed("receiver".to_string()));
        }
        Ok(consumer)
    }

    /// Receive up to `max_messages`, waiting at most `max_wait` for the first one.
    pub async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let consumer = self.consumer(cancel).await?;
        consumer.receive(max_messages, max_wait, cancel).await
    }

    /// Non-destructive read of up to `message_count` messages starting at
    /// `from_sequence_number` (inclusive), or at the first retained message.
    pub async fn peek(
        &self,
        from_sequence_number: Option<i64>,
        message_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        self.peek_session(from_sequence_number, message_count, None, cancel)
            .await
    }

    /// Like [`peek`](Self::peek), restricted to one session.
    pub async fn peek_session(
        &self,
        from_sequence_number: Option<i64>,
        message_count: usize,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let consumer = self.consumer(cancel).await?;
        self.transport
            .peek(
                consumer.as_ref(),
                self.policy.as_ref(),
                from_sequence_number,
                message_count,
                session_id,
                cancel,
            )
            .await
    }

    /// `None` until a receive has run with tracking enabled.
    pub async fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        match self.consumer.get() {
            Some(consumer) => consumer.last_enqueued_event_properties().await,
            None => None,
        }
    }

    /// Idempotent; releases the consumer link if one was created. A link still
    /// being created is released by the call that creates it.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        fence(Ordering::SeqCst);
        if let Some(consumer) = self.consumer.get() {
            consumer.close(cancel).await?;
        }
        debug!(
            consumer_group = %self.options.consumer_group,
            partition_id = %self.options.partition_id,
            "Closed receiver"
        );
        Ok(())
    }
}
