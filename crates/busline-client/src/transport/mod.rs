//! Transport abstraction.
//!
//! A [`TransportClient`] owns one logical connection to a messaging namespace
//! and hands out the protocol-bound endpoints ([`TransportSender`],
//! [`TransportConsumer`]) that share it. The public facades in
//! [`crate::connection`] hold a single `Arc<dyn TransportClient>` and never see
//! protocol details.
//!
//! ```text
//! Connection ──► TransportClient ──► retry_with_policy ──► protocol call
//!                    │
//!                    ├── create_sender()   ──► TransportSender
//!                    └── create_consumer() ──► TransportConsumer
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──► Open ──► Closing ──► Closed
//! ```
//!
//! There is no transition back. In `Closing` and `Closed` every entry point
//! fails with [`ClientError::ClientClosed`]. Closing a client closes every
//! sender and consumer it created.
//!
//! The only variant shipped here is the embedded broker transport in
//! [`memory`]; protocol-backed variants implement the same traits.

pub mod memory;

use crate::batch::{CreateBatchOptions, MessageBatch};
use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use busline_core::{
    EntityProperties, EventPosition, Exclusivity, LastEnqueuedEventProperties, Message,
    PartitionProperties,
};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Consumer group used when none is given.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Messages buffered ahead of `receive` calls when no prefetch count is given.
pub const DEFAULT_PREFETCH_COUNT: u32 = 300;

/// Upper bound on how long `close` waits for links to be released.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Central coordinator for one logical connection.
///
/// Every remote operation runs through the supplied [`RetryPolicy`]; the
/// cancellation token is honoured before the first attempt, during each
/// attempt and during back-off.
#[async_trait]
pub trait TransportClient: Send + Sync + fmt::Debug {
    /// Normalized `sb://<host>/` endpoint.
    fn service_endpoint(&self) -> &str;

    fn entity_name(&self) -> &str;

    /// Monotonic: once true, stays true.
    fn is_closed(&self) -> bool;

    async fn get_properties(
        &self,
        policy: &dyn RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<EntityProperties>;

    async fn get_partition_properties(
        &self,
        partition_id: &str,
        policy: &dyn RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<PartitionProperties>;

    /// Non-destructive read of up to `message_count` messages on the
    /// consumer's partition, starting at `from_sequence_number` (inclusive) or
    /// at the first retained message. `session_id` overrides the consumer's
    /// session filter. No cursor moves.
    async fn peek(
        &self,
        consumer: &dyn TransportConsumer,
        policy: &dyn RetryPolicy,
        from_sequence_number: Option<i64>,
        message_count: usize,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>>;

    /// Create a sender, optionally bound to one partition.
    ///
    /// No remote call is made; the sender connects on first use.
    fn create_sender(
        &self,
        partition_id: Option<&str>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Result<Arc<dyn TransportSender>>;

    async fn create_consumer(
        &self,
        options: ConsumerOptions,
        policy: Arc<dyn RetryPolicy>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TransportConsumer>>;

    /// Idempotent. Releases every link, then marks the client closed even if
    /// release failed or timed out. A call that overlaps a close in progress
    /// returns once that close has finished.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Close with a token that never fires, logging instead of returning failures.
    async fn dispose(&self) {
        if let Err(e) = self.close(&CancellationToken::new()).await {
            warn!(entity = self.entity_name(), error = %e, "Failed to close transport client");
        }
    }
}

/// Publishes messages to an entity, optionally pinned to one partition.
#[async_trait]
pub trait TransportSender: Send + Sync + fmt::Debug {
    fn partition_id(&self) -> Option<&str>;

    fn is_closed(&self) -> bool;

    /// Largest message (or batch) the service accepts from this sender.
    async fn max_message_size(&self, cancel: &CancellationToken) -> Result<usize>;

    /// Send messages as one unit: all of them land, in the order given, or none do.
    ///
    /// Every message of a call goes to the same partition; an unbound sender
    /// fails with `InvalidArgument` when their session ids or partition keys
    /// route to different partitions.
    async fn send(&self, messages: Vec<Message>, cancel: &CancellationToken) -> Result<()>;

    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    async fn create_batch(
        &self,
        options: CreateBatchOptions,
        cancel: &CancellationToken,
    ) -> Result<MessageBatch> {
        let limit = self.max_message_size(cancel).await?;
        let max_size = match options.max_size_in_bytes {
            Some(requested) if requested > limit => {
                return Err(ClientError::InvalidArgument(format!(
                    "batch size {} exceeds the sender limit of {} bytes",
                    requested, limit
                )))
            }
            Some(requested) => requested,
            None => limit,
        };
        Ok(MessageBatch::new(max_size))
    }

    async fn send_batch(&self, batch: MessageBatch, cancel: &CancellationToken) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.send(batch.into_messages(), cancel).await
    }
}

/// Pull-based reader bound to exactly one [`ConsumerBinding`].
#[async_trait]
pub trait TransportConsumer: Send + Sync + fmt::Debug {
    fn binding(&self) -> &ConsumerBinding;

    fn exclusivity(&self) -> Exclusivity;

    fn is_closed(&self) -> bool;

    /// Receive up to `max_messages`, waiting at most `max_wait` for the first
    /// one. Returns an empty batch when nothing arrives in time.
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>>;

    /// Snapshot refreshed by each receive when tracking is enabled.
    async fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties>;

    async fn close(&self, cancel: &CancellationToken) -> Result<()>;
}

/// The (entity, consumer group, partition, session) a consumer link attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerBinding {
    pub entity: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub session_id: Option<String>,
}

impl fmt::Display for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.entity, self.consumer_group, self.partition_id
        )?;
        if let Some(session) = &self.session_id {
            write!(f, "/{}", session)?;
        }
        Ok(())
    }
}

/// Parameters for [`TransportClient::create_consumer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub consumer_group: String,
    pub partition_id: String,
    pub event_position: EventPosition,
    pub track_last_enqueued_event_properties: bool,
    pub exclusivity: Exclusivity,
    /// `None` means [`DEFAULT_PREFETCH_COUNT`]; 0 disables read-ahead.
    pub prefetch_count: Option<u32>,
    pub session_id: Option<String>,
}

impl ConsumerOptions {
    pub fn new(consumer_group: impl Into<String>, partition_id: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            event_position: EventPosition::default(),
            track_last_enqueued_event_properties: false,
            exclusivity: Exclusivity::Shared,
            prefetch_count: None,
            session_id: None,
        }
    }

    pub fn with_event_position(mut self, position: EventPosition) -> Self {
        self.event_position = position;
        self
    }

    pub fn with_exclusivity(mut self, exclusivity: Exclusivity) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tracking(mut self, track: bool) -> Self {
        self.track_last_enqueued_event_properties = track;
        self
    }

    pub fn effective_prefetch_count(&self) -> u32 {
        self.prefetch_count.unwrap_or(DEFAULT_PREFETCH_COUNT)
    }

    pub fn binding(&self, entity: &str) -> ConsumerBinding {
        ConsumerBinding {
            entity: entity.to_string(),
            consumer_group: self.consumer_group.clone(),
            partition_id: self.partition_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Connection lifecycle of a [`TransportClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Created = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Created,
            1 => ClientState::Open,
            2 => ClientState::Closing,
            _ => ClientState::Closed,
        }
    }
}

/// Lock-free, forward-only holder of a [`ClientState`].
///
/// Reaching `Closed` also fires a signal, so callers that lose the race to
/// close can wait for the winner to finish.
#[derive(Debug)]
pub struct LifecycleState {
    state: AtomicU8,
    closed: CancellationToken,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ClientState::Created as u8),
            closed: CancellationToken::new(),
        }
    }

    pub fn get(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Created -> Open`. Returns false if the client already moved past `Created`.
    pub fn open(&self) -> bool {
        self.state
            .compare_exchange(
                ClientState::Created as u8,
                ClientState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter `Closing`. Only the caller that performs the transition gets `true`.
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ClientState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ClientState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_closed(&self) {
        self.state.store(ClientState::Closed as u8, Ordering::Release);
        self.closed.cancel();
    }

    /// Resolves once the state is `Closed`.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    /// True in `Closing` and `Closed`.
    pub fn is_closed(&self) -> bool {
        self.get() as u8 >= ClientState::Closing as u8
    }

    /// Fail with `ClientClosed(what)` unless the client is still usable.
    pub fn ensure_open(&self, what: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ClientClosed(what.to_string()));
        }
        Ok(())
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}
