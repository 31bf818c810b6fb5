//! Incoming message queue and parked receive requests.
//!
//! Owned exclusively by the core actor; nothing here is synchronized.
//! `incoming_bytes` always equals the summed payload length of the
//! successful entries currently queued.

use crate::config::BatchReceivePolicy;
use crate::error::MagnetarClientError;
use crate::message::{Message, Messages};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// FIFO of received results with byte accounting.
#[derive(Default)]
pub(crate) struct IncomingQueue {
    entries: std::collections::VecDeque<Result<Message, MagnetarClientError>>,
    bytes: usize,
}

impl IncomingQueue {
    pub fn push(&mut self, entry: Result<Message, MagnetarClientError>) {
        if let Ok(message) = &entry {
            self.bytes += message.size();
        }
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<Result<Message, MagnetarClientError>> {
        let entry = self.entries.pop_front()?;
        if let Ok(message) = &entry {
            self.bytes -= message.size();
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    /// Whether enough is queued to satisfy a batch without waiting: the
    /// message-count or byte limit of `policy` is reached.
    pub fn has_batch_ready(&self, policy: &BatchReceivePolicy) -> bool {
        self.entries.len() >= policy.max_num_messages || self.bytes >= policy.max_num_bytes
    }

    /// Drain up to the policy limits into one batch. A queued error is
    /// returned instead of a batch only when it sits at the head; otherwise
    /// the batch stops right before it.
    pub fn drain_batch(
        &mut self,
        policy: &BatchReceivePolicy,
    ) -> Result<Messages, MagnetarClientError> {
        let mut collected = Vec::new();
        let mut collected_bytes = 0usize;

        while collected.len() < policy.max_num_messages {
            let head_is_err = match self.entries.front() {
                None => break,
                Some(entry) => entry.is_err(),
            };
            if head_is_err {
                if collected.is_empty() {
                    let err = match self.pop() {
                        Some(Err(e)) => e,
                        _ => unreachable!("head checked above"),
                    };
                    return Err(err);
                }
                break;
            }
            let message = match self.pop() {
                Some(Ok(m)) => m,
                _ => unreachable!("head checked above"),
            };
            collected_bytes += message.size();
            collected.push(message);
            if collected_bytes >= policy.max_num_bytes {
                break;
            }
        }

        Ok(Messages::new(collected))
    }
}

/// A parked `receive` call.
pub(crate) struct Waiter {
    pub id: u64,
    reply: Option<oneshot::Sender<Result<Message, MagnetarClientError>>>,
    registration: Option<JoinHandle<()>>,
}

impl Waiter {
    pub fn new(
        id: u64,
        reply: oneshot::Sender<Result<Message, MagnetarClientError>>,
        registration: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            reply: Some(reply),
            registration,
        }
    }

    /// Complete the waiter, detaching its cancellation registration.
    pub fn satisfy(mut self, result: Result<Message, MagnetarClientError>) {
        if let Some(registration) = self.registration.take() {
            registration.abort();
        }
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.abort();
        }
    }
}

/// A parked `batch_receive` call with its timeout guard.
pub(crate) struct BatchWaiter {
    pub id: u64,
    reply: Option<oneshot::Sender<Result<Messages, MagnetarClientError>>>,
    /// Cancelled when the waiter completes; the scheduled timeout checks it
    /// before firing.
    guard: CancellationToken,
    registration: Option<JoinHandle<()>>,
}

impl BatchWaiter {
    pub fn new(
        id: u64,
        reply: oneshot::Sender<Result<Messages, MagnetarClientError>>,
        guard: CancellationToken,
        registration: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            reply: Some(reply),
            guard,
            registration,
        }
    }

    pub fn satisfy(mut self, result: Result<Messages, MagnetarClientError>) {
        self.guard.cancel();
        if let Some(registration) = self.registration.take() {
            registration.abort();
        }
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for BatchWaiter {
    fn drop(&mut self) {
        self.guard.cancel();
        if let Some(registration) = self.registration.take() {
            registration.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(entry: i64, payload: &str) -> Message {
        Message::builder()
            .topic("t")
            .payload(payload.to_string())
            .id(1, entry)
            .build()
    }

    fn policy(max_messages: usize, max_bytes: usize) -> BatchReceivePolicy {
        BatchReceivePolicy {
            max_num_messages: max_messages,
            max_num_bytes: max_bytes,
            timeout: std::time::Duration::from_millis(100),
        }
    }

    #[test]
    fn test_byte_accounting() {
        let mut queue = IncomingQueue::default();
        queue.push(Ok(msg(0, "abcd")));
        queue.push(Ok(msg(1, "ef")));
        queue.push(Err(MagnetarClientError::lookup("boom")));
        assert_eq!(queue.bytes(), 6);
        assert_eq!(queue.len(), 3);

        assert!(queue.pop().unwrap().is_ok());
        assert_eq!(queue.bytes(), 2);

        queue.clear();
        assert_eq!(queue.bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_batch_ready_by_count_or_bytes() {
        let mut queue = IncomingQueue::default();
        queue.push(Ok(msg(0, "aaaa")));
        assert!(!queue.has_batch_ready(&policy(2, 100)));
        assert!(queue.has_batch_ready(&policy(1, 100)));
        assert!(queue.has_batch_ready(&policy(10, 4)));
    }

    #[test]
    fn test_drain_batch_respects_count_limit() {
        let mut queue = IncomingQueue::default();
        for i in 0..5 {
            queue.push(Ok(msg(i, "x")));
        }
        let batch = queue.drain_batch(&policy(3, 1000)).unwrap();
        assert_eq!(batch.count(), 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_batch_respects_byte_limit() {
        let mut queue = IncomingQueue::default();
        for i in 0..4 {
            queue.push(Ok(msg(i, "abcd")));
        }
        let batch = queue.drain_batch(&policy(100, 8)).unwrap();
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.size_bytes(), 8);
    }

    #[test]
    fn test_drain_batch_surfaces_head_error() {
        let mut queue = IncomingQueue::default();
        queue.push(Err(MagnetarClientError::lookup("broken")));
        queue.push(Ok(msg(0, "x")));

        let result = queue.drain_batch(&policy(10, 1000));
        assert!(result.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_batch_stops_before_mid_error() {
        let mut queue = IncomingQueue::default();
        queue.push(Ok(msg(0, "x")));
        queue.push(Err(MagnetarClientError::lookup("broken")));
        queue.push(Ok(msg(1, "y")));

        let batch = queue.drain_batch(&policy(10, 1000)).unwrap();
        assert_eq!(batch.count(), 1);
        // the error is left at the head for the next receive
        assert_eq!(queue.len(), 2);
        assert!(queue.pop().unwrap().is_err());
    }
}
