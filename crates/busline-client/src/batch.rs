//! Size-bounded message batches.
//!
//! A [`MessageBatch`] accumulates messages on the caller side until the next
//! message would push it past the sender's negotiated size limit. The whole
//! batch is then published with a single `send_batch` call.
//!
//! ```text
//! ┌──────────────────────┐
//! │  create_batch()      │  limit = sender max_message_size
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────────────┐
//! │  MessageBatch                │
//! │  - messages: Vec<Message>    │
//! │  - size_bytes: usize         │──── try_add() returns false once the
//! │  - max_size_bytes: usize     │     next message would not fit
//! └──────────┬───────────────────┘
//!            │
//!            ▼
//!        send_batch()
//! ```
//!
//! ## Thread Safety
//!
//! MessageBatch is a plain value; wrap it in a Mutex to fill it from several tasks.

use busline_core::Message;
use tracing::trace;

/// Framing overhead of an (empty) batch envelope.
pub const BATCH_OVERHEAD_BYTES: usize = 64;

/// Options for [`crate::SenderClient::create_batch`].
#[derive(Debug, Clone, Default)]
pub struct CreateBatchOptions {
    /// Limit for the batch; defaults to, and may not exceed, the sender's limit.
    pub max_size_in_bytes: Option<usize>,
}

/// A set of messages published together.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    messages: Vec<Message>,
    size_bytes: usize,
    max_size_bytes: usize,
}

impl MessageBatch {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            messages: Vec::new(),
            size_bytes: BATCH_OVERHEAD_BYTES,
            max_size_bytes,
        }
    }

    /// Add `message` if it fits.
    ///
    /// Returns `false` and leaves the batch untouched when the message would
    /// exceed the batch limit.
    pub fn try_add(&mut self, message: Message) -> bool {
        let size = message.estimated_size();
        if self.size_bytes + size > self.max_size_bytes {
            trace!(
                message_size = size,
                batch_size = self.size_bytes,
                limit = self.max_size_bytes,
                "Message does not fit in batch"
            );
            return false;
        }
        self.size_bytes += size;
        self.messages.push(message);
        true
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Current size including the envelope overhead.
    pub fn size_in_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_size_in_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_batch_is_empty() {
        let batch = MessageBatch::new(1024);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.size_in_bytes(), BATCH_OVERHEAD_BYTES);
        assert_eq!(batch.max_size_in_bytes(), 1024);
    }

    #[test]
    fn test_try_add_accumulates_size() {
        let mut batch = MessageBatch::new(1024);
        let first = Message::new("hello").with_message_id("m1");
        let second = Message::new("world").with_message_id("m2");
        let expected = BATCH_OVERHEAD_BYTES + first.estimated_size() + second.estimated_size();

        assert!(batch.try_add(first));
        assert!(batch.try_add(second));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_in_bytes(), expected);
        assert_eq!(batch.messages()[1].message_id(), "m2");
    }

    #[test]
    fn test_try_add_rejects_overflow_without_mutation() {
        let small = Message::new(vec![0u8; 10]).with_message_id("a");
        let limit = BATCH_OVERHEAD_BYTES + small.estimated_size();
        let mut batch = MessageBatch::new(limit);

        assert!(batch.try_add(small));
        let size_before = batch.size_in_bytes();

        assert!(!batch.try_add(Message::new("x").with_message_id("b")));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.size_in_bytes(), size_before);
    }

    #[test]
    fn test_oversized_single_message_never_fits() {
        let mut batch = MessageBatch::new(100);
        assert!(!batch.try_add(Message::new(vec![0u8; 500])));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_into_messages_preserves_order() {
        let mut batch = MessageBatch::new(4096);
        for i in 0..5 {
            assert!(batch.try_add(Message::new(format!("m-{}", i))));
        }
        let bodies: Vec<_> = batch
            .into_messages()
            .into_iter()
            .map(|m| m.body().clone())
            .collect();
        assert_eq!(bodies[0], "m-0");
        assert_eq!(bodies[4], "m-4");
    }
}
