//! In-process broker backing the embedded transport.
//!
//! The broker emulates one namespace: entities split into partitions, each an
//! ordered log of messages stamped with a sequence number (from 1), a
//! cumulative byte offset and an enqueue time. It also tracks consumer link
//! ownership so exclusive (owner level) consumers can preempt each other.
//!
//! ## Test hooks
//!
//! - [`Broker::inject_fault`] queues failures that the next data-plane calls
//!   return before touching any state
//! - [`Broker::set_latency`] adds a simulated round trip to every call
//! - [`Broker::request_count`] counts data-plane calls that reached the broker
//! - [`Broker::purge`] drops old messages, as retention would
//!
//! Administrative calls (creating entities, purging, ...) are not counted.

use crate::error::{ClientError, Result};
use crate::transport::ConsumerBinding;
use busline_core::{
    Credential, EntityProperties, EventPosition, Exclusivity, LastEnqueuedEventProperties,
    Message, PartitionProperties, SystemProperties,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

/// Default negotiated message size limit (256 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// A failure the broker returns instead of serving a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection dropped: `ServiceCommunication`.
    Unreachable,
    /// Throttled: `ServiceBusy`.
    Busy,
    /// The call hangs for this long before being served.
    Stall(Duration),
}

/// Handle to an in-process namespace. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    namespace: String,
    max_message_size: usize,
    latency_us: AtomicU64,
    requests: AtomicU64,
    next_link_id: AtomicU64,
    credentials: RwLock<Vec<Credential>>,
    entities: RwLock<HashMap<String, EntityState>>,
    faults: Mutex<VecDeque<Fault>>,
    owners: Mutex<HashMap<ConsumerBinding, Vec<Arc<LinkHandle>>>>,
    appended: Notify,
}

#[derive(Debug)]
struct EntityState {
    created_at: DateTime<Utc>,
    partitions: Vec<PartitionLog>,
}

impl EntityState {
    fn partition(&self, entity: &str, partition_id: &str) -> Result<&PartitionLog> {
        self.partitions
            .iter()
            .find(|p| p.id == partition_id)
            .ok_or_else(|| partition_not_found(entity, partition_id))
    }

    fn partition_mut(&mut self, entity: &str, partition_id: &str) -> Result<&mut PartitionLog> {
        self.partitions
            .iter_mut()
            .find(|p| p.id == partition_id)
            .ok_or_else(|| partition_not_found(entity, partition_id))
    }
}

#[derive(Debug)]
struct PartitionLog {
    id: String,
    messages: VecDeque<Message>,
    /// Sequence number the next accepted message gets.
    next_sequence: i64,
    next_offset: i64,
    /// First sequence number still retained (or `next_sequence` when empty).
    beginning_sequence: i64,
    /// Offset of the newest purged message.
    last_purged_offset: Option<i64>,
    last_enqueued: Option<SystemProperties>,
}

impl PartitionLog {
    fn new(id: String) -> Self {
        Self {
            id,
            messages: VecDeque::new(),
            next_sequence: 1,
            next_offset: 0,
            beginning_sequence: 1,
            last_purged_offset: None,
            last_enqueued: None,
        }
    }

    fn append(&mut self, message: Message, now: DateTime<Utc>) -> i64 {
        let sequence_number = self.next_sequence;
        let system = SystemProperties {
            sequence_number,
            offset: self.next_offset,
            enqueued_time: now,
            partition_id: self.id.clone(),
        };
        self.next_offset += message.estimated_size() as i64;
        self.next_sequence += 1;
        self.last_enqueued = Some(system.clone());
        self.messages.push_back(message.with_system_properties(system));
        sequence_number
    }

    fn was_purged(&self) -> bool {
        self.beginning_sequence > 1
    }

    /// Messages with `sequence >= from`, in order.
    fn from_sequence(&self, from: i64) -> impl Iterator<Item = &Message> {
        let skip = from.saturating_sub(self.beginning_sequence).max(0) as usize;
        self.messages.iter().skip(skip)
    }

    fn snapshot(&self) -> LastEnqueuedEventProperties {
        LastEnqueuedEventProperties {
            sequence_number: self.last_enqueued.as_ref().map(|s| s.sequence_number),
            offset: self.last_enqueued.as_ref().map(|s| s.offset),
            enqueued_time: self.last_enqueued.as_ref().map(|s| s.enqueued_time),
            retrieved_at: Utc::now(),
        }
    }

    fn properties(&self, entity: &str) -> PartitionProperties {
        PartitionProperties {
            entity_name: entity.to_string(),
            partition_id: self.id.clone(),
            beginning_sequence_number: self.beginning_sequence,
            last_enqueued_sequence_number: self.next_sequence - 1,
            last_enqueued_offset: self
                .last_enqueued
                .as_ref()
                .map(|s| s.offset)
                .unwrap_or(-1),
            last_enqueued_time: self.last_enqueued.as_ref().map(|s| s.enqueued_time),
            is_empty: self.messages.is_empty(),
        }
    }
}

/// Result of a consumer read.
#[derive(Debug, Clone)]
pub(crate) struct ReadBatch {
    pub messages: Vec<Message>,
    /// Where the next read continues, past any messages filtered out by session.
    pub next_sequence: i64,
    pub last_enqueued: LastEnqueuedEventProperties,
}

/// What a sender learns when its link opens.
#[derive(Debug, Clone)]
pub(crate) struct SenderLinkInfo {
    pub partition_ids: Vec<String>,
    pub max_message_size: usize,
}

/// Broker-side registration of one consumer link.
#[derive(Debug)]
pub(crate) struct LinkHandle {
    pub id: u64,
    pub exclusivity: Exclusivity,
    revoked: OnceLock<String>,
    released: AtomicBool,
}

impl LinkHandle {
    /// Why the link was preempted, if it was.
    pub fn revoked_reason(&self) -> Option<&str> {
        self.revoked.get().map(String::as_str)
    }

    fn revoke(&self, reason: String) {
        let _ = self.revoked.set(reason);
    }

    /// Mark the link as abandoned by its consumer. The broker prunes it on the
    /// next attach to the binding; no await needed, so `Drop` can call it.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Neither preempted nor released.
    pub fn is_active(&self) -> bool {
        self.revoked_reason().is_none() && !self.released.load(Ordering::Acquire)
    }
}

impl Broker {
    /// Create an empty namespace. Connections must target `namespace` as their host.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_max_message_size(namespace, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(namespace: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                namespace: namespace.into().to_ascii_lowercase(),
                max_message_size,
                latency_us: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                next_link_id: AtomicU64::new(1),
                credentials: RwLock::new(Vec::new()),
                entities: RwLock::new(HashMap::new()),
                faults: Mutex::new(VecDeque::new()),
                owners: Mutex::new(HashMap::new()),
                appended: Notify::new(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Create an entity with partitions `"0"..partition_count`.
    pub async fn create_entity(&self, name: &str, partition_count: usize) -> Result<()> {
        if partition_count == 0 {
            return Err(ClientError::InvalidArgument(
                "an entity needs at least one partition".to_string(),
            ));
        }
        let mut entities = self.inner.entities.write().await;
        if entities.contains_key(name) {
            return Err(ClientError::InvalidArgument(format!(
                "entity '{}' already exists",
                name
            )));
        }
        entities.insert(
            name.to_string(),
            EntityState {
                created_at: Utc::now(),
                partitions: (0..partition_count)
                    .map(|i| PartitionLog::new(i.to_string()))
                    .collect(),
            },
        );
        info!(entity = name, partitions = partition_count, "Created entity");
        Ok(())
    }

    pub async fn delete_entity(&self, name: &str) -> Result<()> {
        let removed = self.inner.entities.write().await.remove(name);
        if removed.is_none() {
            return Err(ClientError::EntityNotFound(name.to_string()));
        }
        info!(entity = name, "Deleted entity");
        Ok(())
    }

    /// Accept `credential`. Once any credential is registered, connections
    /// presenting none (or another one) are rejected.
    pub async fn allow_credential(&self, credential: Credential) {
        self.inner.credentials.write().await.push(credential);
    }

    /// Drop every message with a sequence number below `before_sequence`.
    pub async fn purge(&self, entity: &str, partition_id: &str, before_sequence: i64) -> Result<()> {
        let mut entities = self.inner.entities.write().await;
        let state = entities
            .get_mut(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        let log = state.partition_mut(entity, partition_id)?;

        let target = before_sequence.min(log.next_sequence);
        while log.beginning_sequence < target {
            if let Some(purged) = log.messages.pop_front() {
                log.last_purged_offset = purged.offset();
            }
            log.beginning_sequence += 1;
        }
        debug!(
            entity,
            partition_id,
            beginning_sequence = log.beginning_sequence,
            "Purged partition"
        );
        Ok(())
    }

    pub async fn inject_fault(&self, fault: Fault) {
        self.inner.faults.lock().await.push_back(fault);
    }

    pub async fn inject_faults(&self, fault: Fault, count: usize) {
        let mut faults = self.inner.faults.lock().await;
        faults.extend(std::iter::repeat(fault).take(count));
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Data-plane calls served (or failed) so far.
    pub fn request_count(&self) -> u64 {
        self.inner.requests.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------------

    /// Count the call, apply latency, then any queued fault. Runs before any
    /// lock is taken.
    async fn begin_request(&self, operation: &str) -> Result<()> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);

        let latency = Duration::from_micros(self.inner.latency_us.load(Ordering::Relaxed));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = self.inner.faults.lock().await.pop_front();
        match fault {
            None => Ok(()),
            Some(Fault::Unreachable) => {
                debug!(operation, "Injected fault: unreachable");
                Err(ClientError::ServiceCommunication(format!(
                    "connection to {} dropped during {}",
                    self.inner.namespace, operation
                )))
            }
            Some(Fault::Busy) => {
                debug!(operation, "Injected fault: busy");
                Err(ClientError::ServiceBusy(format!(
                    "{} is throttling {}",
                    self.inner.namespace, operation
                )))
            }
            Some(Fault::Stall(duration)) => {
                debug!(operation, stall_ms = duration.as_millis() as u64, "Injected fault: stall");
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    pub(crate) async fn handshake(&self, host: &str, credential: Option<&Credential>) -> Result<()> {
        self.begin_request("connect").await?;

        if !host.eq_ignore_ascii_case(&self.inner.namespace) {
            return Err(ClientError::ServiceCommunication(format!(
                "host '{}' is not reachable",
                host
            )));
        }

        let allowed = self.inner.credentials.read().await;
        if !allowed.is_empty() {
            let accepted = credential.map_or(false, |c| allowed.contains(c));
            if !accepted {
                warn!(namespace = %self.inner.namespace, "Rejected credential");
                return Err(ClientError::Authorization(format!(
                    "credential rejected by {}",
                    self.inner.namespace
                )));
            }
        }
        Ok(())
    }

    pub(crate) async fn entity_properties(&self, entity: &str) -> Result<EntityProperties> {
        self.begin_request("get_properties").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        Ok(EntityProperties {
            name: entity.to_string(),
            created_at: state.created_at,
            partition_ids: state.partitions.iter().map(|p| p.id.clone()).collect(),
        })
    }

    pub(crate) async fn partition_properties(
        &self,
        entity: &str,
        partition_id: &str,
    ) -> Result<PartitionProperties> {
        self.begin_request("get_partition_properties").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        Ok(state.partition(entity, partition_id)?.properties(entity))
    }

    pub(crate) async fn open_sender_link(
        &self,
        entity: &str,
        partition_id: Option<&str>,
    ) -> Result<SenderLinkInfo> {
        self.begin_request("open_sender_link").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        if let Some(partition_id) = partition_id {
            state.partition(entity, partition_id)?;
        }
        Ok(SenderLinkInfo {
            partition_ids: state.partitions.iter().map(|p| p.id.clone()).collect(),
            max_message_size: self.inner.max_message_size,
        })
    }

    /// Append `messages` to one partition atomically; returns their sequence numbers.
    pub(crate) async fn append(
        &self,
        entity: &str,
        partition_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<i64>> {
        self.begin_request("send").await?;

        let total: usize = messages.iter().map(Message::estimated_size).sum();
        if let Some(largest) = messages.iter().map(Message::estimated_size).max() {
            if largest > self.inner.max_message_size {
                return Err(ClientError::MessageTooLarge {
                    size: largest,
                    limit: self.inner.max_message_size,
                });
            }
        }

        let sequence_numbers = {
            let mut entities = self.inner.entities.write().await;
            let state = entities
                .get_mut(entity)
                .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
            let log = state.partition_mut(entity, partition_id)?;
            let now = Utc::now();
            messages
                .into_iter()
                .map(|message| log.append(message, now))
                .collect::<Vec<_>>()
        };

        debug!(
            entity,
            partition_id,
            count = sequence_numbers.len(),
            bytes = total,
            "Appended messages"
        );
        self.inner.appended.notify_waiters();
        Ok(sequence_numbers)
    }

    /// Translate a position into the first sequence number a consumer reads.
    pub(crate) async fn resolve_position(
        &self,
        entity: &str,
        partition_id: &str,
        position: &EventPosition,
    ) -> Result<i64> {
        self.begin_request("resolve_position").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        let log = state.partition(entity, partition_id)?;

        let unavailable = |reason: String| ClientError::PositionUnavailable {
            entity: entity.to_string(),
            partition_id: partition_id.to_string(),
            reason,
        };

        let resolved = match *position {
            EventPosition::Earliest => log.beginning_sequence,
            EventPosition::Latest => log.next_sequence,
            EventPosition::SequenceNumber { value, inclusive } => {
                let start = if inclusive { value } else { value.saturating_add(1) };
                if start < log.beginning_sequence && log.was_purged() {
                    return Err(unavailable(format!(
                        "sequence number {} was purged; the first retained is {}",
                        value, log.beginning_sequence
                    )));
                }
                start.max(log.beginning_sequence)
            }
            EventPosition::Offset { value, inclusive } => {
                if let Some(purged) = log.last_purged_offset {
                    let gone = if inclusive { value <= purged } else { value < purged };
                    if gone {
                        return Err(unavailable(format!(
                            "offset {} was purged; retention now starts after offset {}",
                            value, purged
                        )));
                    }
                }
                log.messages
                    .iter()
                    .filter_map(|m| m.system_properties())
                    .find(|s| {
                        if inclusive {
                            s.offset >= value
                        } else {
                            s.offset > value
                        }
                    })
                    .map(|s| s.sequence_number)
                    .unwrap_or(log.next_sequence)
            }
            EventPosition::EnqueuedTime(time) => log
                .messages
                .iter()
                .filter_map(|m| m.system_properties())
                .find(|s| s.enqueued_time >= time)
                .map(|s| s.sequence_number)
                .unwrap_or(log.next_sequence),
        };
        Ok(resolved)
    }

    /// Read up to `max` messages at or after `from`, keeping only `session_id`
    /// messages when a session is given.
    pub(crate) async fn read(
        &self,
        entity: &str,
        partition_id: &str,
        session_id: Option<&str>,
        from: i64,
        max: usize,
    ) -> Result<ReadBatch> {
        self.begin_request("receive").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        let log = state.partition(entity, partition_id)?;

        if from < log.beginning_sequence && log.was_purged() {
            return Err(ClientError::PositionUnavailable {
                entity: entity.to_string(),
                partition_id: partition_id.to_string(),
                reason: format!(
                    "sequence number {} was purged while the consumer was reading",
                    from
                ),
            });
        }

        let mut messages = Vec::new();
        let mut next_sequence = from.max(log.beginning_sequence);
        for message in log.from_sequence(from) {
            if messages.len() >= max {
                break;
            }
            next_sequence = message.sequence_number().unwrap_or(next_sequence) + 1;
            if session_id.map_or(true, |s| message.session_id() == Some(s)) {
                messages.push(message.clone());
            }
        }

        Ok(ReadBatch {
            messages,
            next_sequence,
            last_enqueued: log.snapshot(),
        })
    }

    /// Newest-message snapshot without reading.
    pub(crate) async fn last_enqueued(
        &self,
        entity: &str,
        partition_id: &str,
    ) -> Result<LastEnqueuedEventProperties> {
        self.begin_request("last_enqueued").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        Ok(state.partition(entity, partition_id)?.snapshot())
    }

    /// Non-destructive read; a start before the first retained message begins there.
    pub(crate) async fn peek(
        &self,
        entity: &str,
        partition_id: &str,
        session_id: Option<&str>,
        from: Option<i64>,
        count: usize,
    ) -> Result<Vec<Message>> {
        self.begin_request("peek").await?;
        let entities = self.inner.entities.read().await;
        let state = entities
            .get(entity)
            .ok_or_else(|| ClientError::EntityNotFound(entity.to_string()))?;
        let log = state.partition(entity, partition_id)?;

        let from = from.unwrap_or(log.beginning_sequence);
        Ok(log
            .from_sequence(from)
            .filter(|m| session_id.map_or(true, |s| m.session_id() == Some(s)))
            .take(count)
            .cloned()
            .collect())
    }

    /// Register a consumer link on `binding`, applying owner-level rules.
    ///
    /// - `Exclusive(n)` fails if a holder with level `>= n` exists, otherwise
    ///   revokes every existing link (exclusive or shared)
    /// - `Shared` fails if any exclusive link holds the binding
    pub(crate) async fn attach(
        &self,
        binding: &ConsumerBinding,
        exclusivity: Exclusivity,
    ) -> Result<Arc<LinkHandle>> {
        self.begin_request("attach").await?;

        {
            let entities = self.inner.entities.read().await;
            let state = entities
                .get(&binding.entity)
                .ok_or_else(|| ClientError::EntityNotFound(binding.entity.clone()))?;
            state.partition(&binding.entity, &binding.partition_id)?;
        }

        let mut owners = self.inner.owners.lock().await;
        let links = owners.entry(binding.clone()).or_default();
        links.retain(|link| link.is_active());

        let holder_level = links.iter().filter_map(|l| l.exclusivity.owner_level()).max();

        match exclusivity {
            Exclusivity::Exclusive(level) => {
                if let Some(held) = holder_level.filter(|held| *held >= level) {
                    return Err(ClientError::ConsumerPreempted {
                        binding: binding.to_string(),
                        reason: format!(
                            "owner level {} is held by a consumer with owner level {}",
                            level, held
                        ),
                    });
                }
                for link in links.drain(..) {
                    warn!(
                        binding = %binding,
                        link_id = link.id,
                        owner_level = level,
                        "Preempting consumer link"
                    );
                    link.revoke(format!(
                        "a consumer with owner level {} took over the binding",
                        level
                    ));
                }
            }
            Exclusivity::Shared => {
                if let Some(held) = holder_level {
                    return Err(ClientError::ConsumerPreempted {
                        binding: binding.to_string(),
                        reason: format!(
                            "the binding is held by an exclusive consumer with owner level {}",
                            held
                        ),
                    });
                }
            }
        }

        let link = Arc::new(LinkHandle {
            id: self.inner.next_link_id.fetch_add(1, Ordering::Relaxed),
            exclusivity,
            revoked: OnceLock::new(),
            released: AtomicBool::new(false),
        });
        links.push(link.clone());
        debug!(binding = %binding, link_id = link.id, ?exclusivity, "Attached consumer link");
        Ok(link)
    }

    /// Links registered on `binding`, released ones included until pruned.
    #[cfg(test)]
    pub(crate) async fn link_count(&self, binding: &ConsumerBinding) -> usize {
        self.inner
            .owners
            .lock()
            .await
            .get(binding)
            .map_or(0, Vec::len)
    }

    /// Release a link. Unknown links are ignored.
    pub(crate) async fn detach(&self, binding: &ConsumerBinding, link_id: u64) {
        let mut owners = self.inner.owners.lock().await;
        if let Some(links) = owners.get_mut(binding) {
            links.retain(|l| l.id != link_id);
            if links.is_empty() {
                owners.remove(binding);
            }
        }
    }

    /// Resolves on the next append to any partition.
    pub(crate) async fn appended(&self) {
        self.inner.appended.notified().await
    }
}

fn partition_not_found(entity: &str, partition_id: &str) -> ClientError {
    ClientError::PartitionNotFound {
        entity: entity.to_string(),
        partition_id: partition_id.to_string(),
    }
}
