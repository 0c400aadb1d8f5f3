use super::broker::{Broker, LinkHandle};
use crate::error::{ClientError, Result};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::transport::{ConsumerBinding, TransportConsumer};
use async_trait::async_trait;
use busline_core::{Exclusivity, LastEnqueuedEventProperties, Message};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on how long a waiting receive sleeps between checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consumer on the embedded transport.
///
/// Holds a cursor (the next sequence number to fetch) and a prefetch buffer.
/// Each fetch reads up to `max(max_messages, prefetch_count)` messages; the
/// surplus is handed out by later receives without another broker call.
///
/// Preemption is checked at the start of every receive, before any buffered
/// message is returned.
#[derive(Debug)]
pub struct MemoryConsumer {
    broker: Broker,
    binding: ConsumerBinding,
    policy: Arc<dyn RetryPolicy>,
    link: Arc<LinkHandle>,
    prefetch_count: usize,
    track_last_enqueued: bool,
    cursor: Mutex<Cursor>,
    last_enqueued: RwLock<Option<LastEnqueuedEventProperties>>,
    closed: AtomicBool,
}

#[derive(Debug)]
struct Cursor {
    next_sequence: i64,
    buffer: VecDeque<Message>,
}

impl Cursor {
    fn take(&mut self, max: usize) -> Vec<Message> {
        let n = max.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }
}

impl MemoryConsumer {
    pub(crate) fn new(
        broker: Broker,
        binding: ConsumerBinding,
        policy: Arc<dyn RetryPolicy>,
        link: Arc<LinkHandle>,
        start_sequence: i64,
        prefetch_count: usize,
        track_last_enqueued: bool,
    ) -> Self {
        Self {
            broker,
            binding,
            policy,
            link,
            prefetch_count,
            track_last_enqueued,
            cursor: Mutex::new(Cursor {
                next_sequence: start_sequence,
                buffer: VecDeque::new(),
            }),
            last_enqueued: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed("consumer".to_string()));
        }
        if let Some(reason) = self.link.revoked_reason() {
            warn!(binding = %self.binding, link_id = self.link.id, "Consumer was preempted");
            return Err(ClientError::ConsumerPreempted {
                binding: self.binding.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_last_enqueued(&self, cancel: &CancellationToken) -> Result<()> {
        let broker = &self.broker;
        let binding = &self.binding;
        let snapshot = retry_with_policy(self.policy.as_ref(), cancel, "last_enqueued", |_| {
            broker.last_enqueued(&binding.entity, &binding.partition_id)
        })
        .await?;
        *self.last_enqueued.write().await = Some(snapshot);
        Ok(())
    }

    /// One fetch from the broker. Returns messages ready to hand out, possibly none.
    async fn fetch(&self, max_messages: usize, cancel: &CancellationToken) -> Result<Vec<Message>> {
        let from = self.cursor.lock().await.next_sequence;

        let broker = &self.broker;
        let binding = &self.binding;
        let count = max_messages.max(self.prefetch_count);
        let batch = retry_with_policy(self.policy.as_ref(), cancel, "receive", |_| {
            broker.read(
                &binding.entity,
                &binding.partition_id,
                binding.session_id.as_deref(),
                from,
                count,
            )
        })
        .await?;

        if self.track_last_enqueued {
            *self.last_enqueued.write().await = Some(batch.last_enqueued);
        }

        let mut cursor = self.cursor.lock().await;
        // A concurrent receive on this consumer already consumed this range.
        if cursor.next_sequence == from && cursor.buffer.is_empty() {
            cursor.next_sequence = batch.next_sequence;
            cursor.buffer.extend(batch.messages);
        }
        Ok(cursor.take(max_messages))
    }
}

#[async_trait]
impl TransportConsumer for MemoryConsumer {
    fn binding(&self) -> &ConsumerBinding {
        &self.binding
    }

    fn exclusivity(&self) -> Exclusivity {
        self.link.exclusivity
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        if max_messages == 0 {
            return Err(ClientError::InvalidArgument(
                "max_messages must be at least 1".to_string(),
            ));
        }
        // `None` waits until a message arrives or `cancel` fires.
        let deadline = Instant::now().checked_add(max_wait);

        loop {
            self.ensure_readable()?;
            if cancel.is_cancelled() {
                return Err(ClientError::OperationCanceled);
            }

            let buffered = self.cursor.lock().await.take(max_messages);
            if !buffered.is_empty() {
                if self.track_last_enqueued {
                    self.refresh_last_enqueued(cancel).await?;
                }
                return Ok(buffered);
            }

            let messages = self.fetch(max_messages, cancel).await?;
            if !messages.is_empty() {
                debug!(
                    binding = %self.binding,
                    count = messages.len(),
                    "Received messages"
                );
                return Ok(messages);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::OperationCanceled),
                _ = self.broker.appended() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        self.last_enqueued.read().await.clone()
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.link.release();
        self.broker.detach(&self.binding, self.link.id).await;
        self.cursor.lock().await.buffer.clear();
        debug!(binding = %self.binding, link_id = self.link.id, "Closed consumer");
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    /// A consumer dropped without `close` gives up its binding.
    fn drop(&mut self) {
        self.link.release();
    }
}
