use super::broker::{Broker, SenderLinkInfo};
use crate::batch::BATCH_OVERHEAD_BYTES;
use crate::error::{ClientError, Result};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::transport::TransportSender;
use async_trait::async_trait;
use busline_core::Message;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sender on the embedded transport.
///
/// The link is opened lazily on the first call that needs it; that is where a
/// missing entity or partition is reported.
///
/// ## Placement
///
/// A partition-bound sender writes everything to its partition. An unbound
/// sender places a whole `send` call by the session id, then the partition key
/// (hashed onto the partition list) of its messages, and otherwise
/// round-robins calls across partitions. Each call is one atomic append.
#[derive(Debug)]
pub struct MemorySender {
    broker: Broker,
    entity: String,
    partition_id: Option<String>,
    policy: Arc<dyn RetryPolicy>,
    link: OnceCell<SenderLinkInfo>,
    round_robin: AtomicUsize,
    closed: AtomicBool,
}

impl MemorySender {
    pub(crate) fn new(
        broker: Broker,
        entity: String,
        partition_id: Option<String>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            broker,
            entity,
            partition_id,
            policy,
            link: OnceCell::new(),
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed("sender".to_string()));
        }
        Ok(())
    }

    async fn link(&self, cancel: &CancellationToken) -> Result<&SenderLinkInfo> {
        self.link
            .get_or_try_init(|| async {
                let broker = &self.broker;
                let entity = self.entity.as_str();
                let partition_id = self.partition_id.as_deref();
                let info = retry_with_policy(self.policy.as_ref(), cancel, "open_sender_link", |_| {
                    broker.open_sender_link(entity, partition_id)
                })
                .await?;
                debug!(
                    entity,
                    partition_id = partition_id.unwrap_or("*"),
                    max_message_size = info.max_message_size,
                    "Opened sender link"
                );
                Ok::<_, ClientError>(info)
            })
            .await
    }

    /// The one partition every message of a call goes to.
    ///
    /// Keyed messages (session id, then partition key) pick the partition;
    /// unkeyed messages follow them, or the call's round-robin turn when no
    /// message is keyed. Keys that hash onto different partitions are refused
    /// so a call never lands partially.
    fn destination(&self, messages: &[Message], partition_ids: &[String]) -> Result<String> {
        if let Some(partition_id) = &self.partition_id {
            return Ok(partition_id.clone());
        }

        if partition_ids.is_empty() {
            return Err(ClientError::Internal(format!(
                "entity '{}' has no partitions",
                self.entity
            )));
        }

        let mut keyed: Option<usize> = None;
        for key in messages
            .iter()
            .filter_map(|m| m.session_id().or(m.partition_key()))
        {
            let index = hash_key(key) % partition_ids.len();
            match keyed {
                Some(chosen) if chosen != index => {
                    return Err(ClientError::InvalidArgument(format!(
                        "messages of one send route to partitions '{}' and '{}'; \
                         send them separately or use a partition-bound sender",
                        partition_ids[chosen], partition_ids[index]
                    )));
                }
                _ => keyed = Some(index),
            }
        }

        let index = keyed.unwrap_or_else(|| {
            self.round_robin.fetch_add(1, Ordering::Relaxed) % partition_ids.len()
        });
        Ok(partition_ids[index].clone())
    }
}

fn hash_key(key: &str) -> usize {
    let mut hasher = SipHasher13::new();
    hasher.write(key.as_bytes());
    hasher.finish() as usize
}

#[async_trait]
impl TransportSender for MemorySender {
    fn partition_id(&self) -> Option<&str> {
        self.partition_id.as_deref()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn max_message_size(&self, cancel: &CancellationToken) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.link(cancel).await?.max_message_size)
    }

    async fn send(&self, messages: Vec<Message>, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if messages.is_empty() {
            return Ok(());
        }

        let link = self.link(cancel).await?;
        let limit = link.max_message_size;

        let mut total = BATCH_OVERHEAD_BYTES;
        for message in &messages {
            let size = message.estimated_size();
            if size > limit {
                return Err(ClientError::MessageTooLarge { size, limit });
            }
            total += size;
        }
        if messages.len() > 1 && total > limit {
            return Err(ClientError::MessageTooLarge { size: total, limit });
        }

        let partition_id = self.destination(&messages, &link.partition_ids)?;
        let broker = &self.broker;
        let entity = self.entity.as_str();
        let count = messages.len();
        let sequence_numbers = retry_with_policy(self.policy.as_ref(), cancel, "send", |_| {
            broker.append(entity, &partition_id, messages.clone())
        })
        .await?;
        debug!(
            entity,
            partition_id = %partition_id,
            count,
            first_sequence = sequence_numbers.first().copied().unwrap_or_default(),
            "Sent messages"
        );
        Ok(())
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(entity = %self.entity, "Closed sender");
        }
        Ok(())
    }
}
