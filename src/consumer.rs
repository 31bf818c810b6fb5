//! The multi-topic consumer: a fan-in aggregator presenting one message
//! stream over many per-partition/per-topic child subscriptions.

use crate::child::{ChildConsumerFactory, TransactionId};
use crate::config::{ConsumerConfig, ConsumerMode};
use crate::core::{ConnectionState, ConsumerCore, CoreEvent, StateCell};
use crate::error::MagnetarClientError;
use crate::lookup::LookupService;
use crate::message::{CompleteTopicName, Message, MessageId, Messages, SeekTarget};
use crate::metrics::ConsumerStats;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

struct ConsumerInner {
    topic: String,
    name: String,
    config: ConsumerConfig,
    events: mpsc::UnboundedSender<CoreEvent>,
    state: Arc<StateCell>,
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        match self.state.get() {
            ConnectionState::Closed | ConnectionState::Failed => {}
            _ => {
                let (reply, _) = oneshot::channel();
                let _ = self.events.send(CoreEvent::Close { reply });
            }
        }
    }
}

/// Consumer over a dynamic set of topics and partitions.
///
/// Cheap to clone; all clones drive the same underlying consumer.
#[derive(Clone)]
pub struct MultiTopicConsumer {
    inner: Arc<ConsumerInner>,
}

impl MultiTopicConsumer {
    /// Subscribe according to `config`, building children through `factory`
    /// and resolving topic metadata through `lookup`.
    pub async fn subscribe(
        config: ConsumerConfig,
        factory: Arc<dyn ChildConsumerFactory>,
        lookup: Arc<dyn LookupService>,
    ) -> Result<Self, MagnetarClientError> {
        Self::subscribe_with_hook(config, factory, lookup, None).await
    }

    pub(crate) async fn subscribe_with_hook(
        config: ConsumerConfig,
        factory: Arc<dyn ChildConsumerFactory>,
        lookup: Arc<dyn LookupService>,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Self, MagnetarClientError> {
        config.validate()?;
        let pattern = match &config.mode {
            ConsumerMode::Pattern { pattern, .. } => Some(Regex::new(pattern).map_err(|e| {
                MagnetarClientError::invalid_config(format!("Invalid topic pattern: {}", e))
            })?),
            _ => None,
        };

        let name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", random_suffix()));
        let topic = format!("MultiTopicsConsumer-{}", random_suffix());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StateCell::new());
        let core = ConsumerCore::new(
            config.clone(),
            factory,
            lookup,
            events_tx.clone(),
            state.clone(),
            pattern,
            on_closed,
        );

        let (created_tx, created_rx) = oneshot::channel();
        tokio::spawn(core.run(events_rx, created_tx));
        created_rx
            .await
            .map_err(|_| MagnetarClientError::init_failed("consumer core stopped"))??;

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                topic,
                name,
                config,
                events: events_tx,
                state,
            }),
        })
    }

    /// Synthetic identifier of the multi-topic view
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// The consumer name, caller-chosen or auto-generated
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn ensure_ready(&self) -> Result<(), MagnetarClientError> {
        match self.inner.state.get() {
            ConnectionState::Ready => Ok(()),
            state => Err(MagnetarClientError::already_closed(format!(
                "consumer is {:?}",
                state
            ))),
        }
    }

    fn post(&self, event: CoreEvent) -> Result<(), MagnetarClientError> {
        self.inner
            .events
            .send(event)
            .map_err(|_| MagnetarClientError::already_closed("consumer"))
    }

    async fn request<T, F>(&self, build: F) -> Result<T, MagnetarClientError>
    where
        F: FnOnce(oneshot::Sender<Result<T, MagnetarClientError>>) -> CoreEvent,
    {
        let (tx, rx) = oneshot::channel();
        self.post(build(tx))?;
        rx.await
            .map_err(|_| MagnetarClientError::already_closed("consumer"))?
    }

    // ----- consumption ----------------------------------------------------

    /// Receive the next message from any child
    pub async fn receive(&self) -> Result<Message, MagnetarClientError> {
        self.receive_with(CancellationToken::new()).await
    }

    /// Receive the next message, abandoning the wait when `ct` is cancelled
    pub async fn receive_with(
        &self,
        ct: CancellationToken,
    ) -> Result<Message, MagnetarClientError> {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::Receive { ct, reply }).await
    }

    /// Receive a batch bounded by the configured [`BatchReceivePolicy`](crate::config::BatchReceivePolicy)
    pub async fn batch_receive(&self) -> Result<Messages, MagnetarClientError> {
        self.batch_receive_with(CancellationToken::new()).await
    }

    /// Batch receive, abandoning the wait when `ct` is cancelled
    pub async fn batch_receive_with(
        &self,
        ct: CancellationToken,
    ) -> Result<Messages, MagnetarClientError> {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::BatchReceive { ct, reply })
            .await
    }

    // ----- acknowledgement ------------------------------------------------

    /// Acknowledge one message
    pub async fn acknowledge(&self, id: &MessageId) -> Result<(), MagnetarClientError> {
        self.acknowledge_with_txn(id, None).await
    }

    pub async fn acknowledge_with_txn(
        &self,
        id: &MessageId,
        txn: Option<TransactionId>,
    ) -> Result<(), MagnetarClientError> {
        self.ensure_ready()?;
        let id = id.clone();
        self.request(|reply| CoreEvent::Acknowledge {
            id,
            txn,
            cumulative: false,
            reply,
        })
        .await
    }

    /// Acknowledge every message of a batch, in order
    pub async fn acknowledge_messages(
        &self,
        messages: &Messages,
    ) -> Result<(), MagnetarClientError> {
        for message in messages.iter() {
            self.acknowledge(&message.id).await?;
        }
        Ok(())
    }

    /// Acknowledge everything up to and including `id` on its partition
    pub async fn acknowledge_cumulative(&self, id: &MessageId) -> Result<(), MagnetarClientError> {
        self.acknowledge_cumulative_with_txn(id, None).await
    }

    pub async fn acknowledge_cumulative_with_txn(
        &self,
        id: &MessageId,
        txn: Option<TransactionId>,
    ) -> Result<(), MagnetarClientError> {
        self.ensure_ready()?;
        let id = id.clone();
        self.request(|reply| CoreEvent::Acknowledge {
            id,
            txn,
            cumulative: true,
            reply,
        })
        .await
    }

    /// Request redelivery of one message
    pub async fn negative_acknowledge(&self, id: &MessageId) -> Result<(), MagnetarClientError> {
        self.ensure_ready()?;
        let id = id.clone();
        self.request(|reply| CoreEvent::NegativeAcknowledge { id, reply })
            .await
    }

    /// Request redelivery of every message of a batch
    pub async fn negative_acknowledge_messages(
        &self,
        messages: &Messages,
    ) -> Result<(), MagnetarClientError> {
        for message in messages.iter() {
            self.negative_acknowledge(&message.id).await?;
        }
        Ok(())
    }

    /// Request redelivery of all unacknowledged messages
    pub async fn redeliver_unacknowledged_messages(&self) -> Result<(), MagnetarClientError> {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::RedeliverAll { reply }).await
    }

    /// Request redelivery of a specific set of unacknowledged messages.
    /// Falls back to redelivering everything unless the subscription type
    /// is Shared or KeyShared.
    pub async fn redeliver_messages(
        &self,
        ids: HashSet<MessageId>,
    ) -> Result<(), MagnetarClientError> {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::Redeliver {
            ids,
            reply: Some(reply),
        })
        .await
    }

    // ----- retry letter topic ---------------------------------------------

    /// Acknowledge `message` and schedule redelivery through the retry
    /// letter topic after `delay`. Requires `retry_enable`.
    pub async fn reconsume_later(
        &self,
        message: &Message,
        delay: Duration,
    ) -> Result<(), MagnetarClientError> {
        self.reconsume(message, delay, false).await
    }

    /// As [`reconsume_later`](Self::reconsume_later), cumulatively
    pub async fn reconsume_later_cumulative(
        &self,
        message: &Message,
        delay: Duration,
    ) -> Result<(), MagnetarClientError> {
        self.reconsume(message, delay, true).await
    }

    /// Reconsume every message of a batch, in order; returns once all of
    /// them have been acknowledged and rescheduled.
    pub async fn reconsume_later_messages(
        &self,
        messages: &Messages,
        delay: Duration,
    ) -> Result<(), MagnetarClientError> {
        for message in messages.iter() {
            self.reconsume(message, delay, false).await?;
        }
        Ok(())
    }

    async fn reconsume(
        &self,
        message: &Message,
        delay: Duration,
        cumulative: bool,
    ) -> Result<(), MagnetarClientError> {
        if !self.inner.config.retry_enable {
            return Err(MagnetarClientError::RetryDisabled);
        }
        self.ensure_ready()?;
        let message = message.clone();
        self.request(|reply| CoreEvent::ReconsumeLater {
            message,
            delay,
            cumulative,
            reply,
        })
        .await
    }

    // ----- position -------------------------------------------------------

    /// Seek every child to `id`. Only [`MessageId::earliest`] and
    /// [`MessageId::latest`] are accepted on a multi-topic consumer.
    pub async fn seek_message_id(&self, id: MessageId) -> Result<(), MagnetarClientError> {
        if !id.is_earliest() && !id.is_latest() {
            return Err(MagnetarClientError::illegal_message_id(
                "Seek on a multi-topic consumer only accepts Earliest or Latest",
            ));
        }
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::Seek {
            target: SeekTarget::MessageId(id),
            reply,
        })
        .await
    }

    /// Seek every child to the given publish time (epoch milliseconds)
    pub async fn seek_timestamp(&self, timestamp: u64) -> Result<(), MagnetarClientError> {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::Seek {
            target: SeekTarget::Timestamp(timestamp),
            reply,
        })
        .await
    }

    /// Seek each child to the message id chosen by `resolver` for its topic
    pub async fn seek_with_message_id_resolver<F>(
        &self,
        resolver: F,
    ) -> Result<(), MagnetarClientError>
    where
        F: Fn(&CompleteTopicName) -> MessageId + Send + Sync + 'static,
    {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::SeekWithResolver {
            resolver: Box::new(move |topic| SeekTarget::MessageId(resolver(topic))),
            reply,
        })
        .await
    }

    /// Seek each child to the timestamp chosen by `resolver` for its topic
    pub async fn seek_with_timestamp_resolver<F>(
        &self,
        resolver: F,
    ) -> Result<(), MagnetarClientError>
    where
        F: Fn(&CompleteTopicName) -> u64 + Send + Sync + 'static,
    {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::SeekWithResolver {
            resolver: Box::new(move |topic| SeekTarget::Timestamp(resolver(topic))),
            reply,
        })
        .await
    }

    // ----- introspection --------------------------------------------------

    /// Whether every child has reached the end of its terminated topic
    pub async fn has_reached_end_of_topic(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(CoreEvent::HasReachedEndOfTopic { reply: tx })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Epoch milliseconds of the most recent broker disconnect across
    /// children; 0 when never disconnected
    pub async fn last_disconnected_timestamp(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(CoreEvent::LastDisconnected { reply: tx })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Whether any child has a message available without blocking
    pub async fn has_message_available(&self) -> Result<bool, MagnetarClientError> {
        self.ensure_ready()?;
        self.request(|reply| CoreEvent::HasMessageAvailable { reply })
            .await
    }

    /// Broker statistics aggregated across children: counters summed,
    /// interval duration averaged
    pub async fn stats(&self) -> Result<ConsumerStats, MagnetarClientError> {
        self.ensure_ready()?;
        let per_child = self
            .request(|reply| CoreEvent::GetStats { reply })
            .await?;
        Ok(ConsumerStats::aggregate(&per_child))
    }

    /// Not supported on a multi-topic consumer
    pub async fn get_last_message_id(&self) -> Result<MessageId, MagnetarClientError> {
        Err(MagnetarClientError::not_supported(
            "GetLastMessageId is not supported on a multi-topic consumer",
        ))
    }

    // ----- lifecycle ------------------------------------------------------

    /// Remove the subscription from the broker and close
    pub async fn unsubscribe(&self) -> Result<(), MagnetarClientError> {
        self.request(|reply| CoreEvent::Unsubscribe { reply }).await
    }

    /// Close the consumer. Best-effort: always succeeds.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.post(CoreEvent::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_suffix_shape() {
        let a = random_suffix();
        let b = random_suffix();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        // two draws colliding would be a broken generator
        assert_ne!(a, b);
    }
}
