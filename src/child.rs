//! The per-partition/per-topic child consumer contract.
//!
//! The multi-topic consumer never talks to the wire; it drives a set of
//! children through this interface and a factory that creates them. Concrete
//! implementations (and the test stubs) live outside this crate's core.

use crate::error::MagnetarClientError;
use crate::message::{CompleteTopicName, Message, MessageId, SeekTarget};
use crate::metrics::ConsumerStats;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Identifier of an open transaction, routed through to the child untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub most_sig_bits: u64,
    pub least_sig_bits: u64,
}

/// A single-topic (or single-partition) consumer as seen by the multi-topic
/// aggregator. Within one child, operation ordering follows call order.
#[async_trait]
pub trait ChildConsumer: Send + Sync {
    /// The fully qualified topic this child consumes
    fn topic(&self) -> &CompleteTopicName;

    /// Receive the next message from this child's queue
    async fn receive(&self) -> Result<Message, MagnetarClientError>;

    /// Acknowledge one message
    async fn acknowledge(
        &self,
        id: &MessageId,
        txn: Option<TransactionId>,
    ) -> Result<(), MagnetarClientError>;

    /// Acknowledge every message up to and including `id`
    async fn acknowledge_cumulative(
        &self,
        id: &MessageId,
        txn: Option<TransactionId>,
    ) -> Result<(), MagnetarClientError>;

    /// Request redelivery of one message
    async fn negative_acknowledge(&self, id: &MessageId) -> Result<(), MagnetarClientError>;

    /// Request redelivery of every unacknowledged message on this child
    async fn redeliver_all(&self) -> Result<(), MagnetarClientError>;

    /// Request redelivery of a specific set of messages
    async fn redeliver(&self, ids: Vec<MessageId>) -> Result<(), MagnetarClientError>;

    /// Acknowledge `message` and schedule it for redelivery through the
    /// retry letter topic after `delay`
    async fn reconsume_later(
        &self,
        message: &Message,
        delay: Duration,
    ) -> Result<(), MagnetarClientError>;

    /// As [`reconsume_later`](Self::reconsume_later), cumulatively
    async fn reconsume_later_cumulative(
        &self,
        message: &Message,
        delay: Duration,
    ) -> Result<(), MagnetarClientError>;

    /// Move this child's position
    async fn seek(&self, target: SeekTarget) -> Result<(), MagnetarClientError>;

    /// Broker-reported statistics for this child
    async fn stats(&self) -> Result<ConsumerStats, MagnetarClientError>;

    /// Whether a message is available without blocking
    async fn has_message_available(&self) -> Result<bool, MagnetarClientError>;

    /// Whether the topic has been terminated and fully consumed
    fn has_reached_end_of_topic(&self) -> bool;

    /// Epoch milliseconds of the last broker disconnect, 0 when never
    fn last_disconnected_timestamp(&self) -> u64;

    /// Remove the subscription from the broker
    async fn unsubscribe(&self) -> Result<(), MagnetarClientError>;

    /// Release this child's resources. Idempotent.
    async fn dispose(&self) -> Result<(), MagnetarClientError>;
}

/// Options for creating one child consumer
#[derive(Debug, Clone)]
pub struct ChildOptions {
    pub subscription_name: String,
    pub subscription_type: crate::config::SubscriptionType,
    pub receiver_queue_size: usize,
    pub start_message_id: Option<MessageId>,
    pub start_message_rollback_duration: Option<Duration>,
    pub create_topic_if_does_not_exist: bool,
}

/// Creates child consumers; the seam between the aggregator and the
/// underlying transport.
#[async_trait]
pub trait ChildConsumerFactory: Send + Sync {
    async fn create(
        &self,
        topic: CompleteTopicName,
        options: ChildOptions,
    ) -> Result<Arc<dyn ChildConsumer>, MagnetarClientError>;
}
