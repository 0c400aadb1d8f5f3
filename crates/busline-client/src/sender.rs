//! Sender facade.

use crate::batch::{CreateBatchOptions, MessageBatch};
use crate::error::Result;
use crate::transport::TransportSender;
use busline_core::Message;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Publishes messages to the connection's entity.
///
/// ## Example
///
/// ```ignore
/// let sender = connection.create_sender(Some("0"))?;
///
/// sender.send(Message::new("hello").with_label("greeting"), &cancel).await?;
///
/// let mut batch = sender.create_batch(&cancel).await?;
/// for body in bodies {
///     if !batch.try_add(Message::new(body)) {
///         break;
///     }
/// }
/// sender.send_batch(batch, &cancel).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SenderClient {
    entity: String,
    inner: Arc<dyn TransportSender>,
}

impl SenderClient {
    pub(crate) fn new(entity: String, inner: Arc<dyn TransportSender>) -> Self {
        Self { entity, inner }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn partition_id(&self) -> Option<&str> {
        self.inner.partition_id()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub async fn send(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.inner.send(vec![message], cancel).await
    }

    /// Send several messages as one unit; they land in the order given, or not
    /// at all. On an unbound sender their keys must route to one partition.
    pub async fn send_messages(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.send(messages, cancel).await
    }

    /// An empty batch sized to the sender's limit.
    pub async fn create_batch(&self, cancel: &CancellationToken) -> Result<MessageBatch> {
        self.inner
            .create_batch(CreateBatchOptions::default(), cancel)
            .await
    }

    pub async fn create_batch_with_options(
        &self,
        options: CreateBatchOptions,
        cancel: &CancellationToken,
    ) -> Result<MessageBatch> {
        self.inner.create_batch(options, cancel).await
    }

    pub async fn send_batch(&self, batch: MessageBatch, cancel: &CancellationToken) -> Result<()> {
        self.inner.send_batch(batch, cancel).await
    }

    pub async fn max_message_size(&self, cancel: &CancellationToken) -> Result<usize> {
        self.inner.max_message_size(cancel).await
    }

    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.close(cancel).await
    }
}
