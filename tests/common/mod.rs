//! Shared stub environment for consumer integration tests: an in-memory
//! child consumer, a factory producing them, and a scriptable lookup.

#![allow(dead_code)]

use async_trait::async_trait;
use magnetar_client::{
    ChildConsumer, ChildConsumerFactory, ChildOptions, CompleteTopicName, ConsumerStats,
    LookupService, MagnetarClientError, Message, MessageId, PartitionedTopicMetadata, SeekTarget,
    TransactionId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Wait until `condition` holds, panicking after `timeout`.
pub async fn wait_until<F>(timeout: Duration, what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct ChildState {
    published: Vec<Message>,
    pending: VecDeque<Message>,
    unacked: Vec<Message>,
    acked: HashSet<MessageId>,
}

/// In-memory child consumer with broker-like ack/redeliver/seek behavior.
pub struct StubChild {
    topic: CompleteTopicName,
    state: Mutex<ChildState>,
    notify: Notify,
    end_of_topic: AtomicBool,
    disposed: AtomicBool,
    unsubscribed: AtomicBool,
    fail_unsubscribe: AtomicBool,
    delivered: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    reconsumed: AtomicU64,
    last_disconnected: AtomicU64,
}

impl StubChild {
    pub fn new(topic: CompleteTopicName) -> Arc<Self> {
        Arc::new(Self {
            topic,
            state: Mutex::new(ChildState::default()),
            notify: Notify::new(),
            end_of_topic: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            unsubscribed: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            reconsumed: AtomicU64::new(0),
            last_disconnected: AtomicU64::new(0),
        })
    }

    /// Make a message of this child's topic available for delivery.
    pub fn publish(&self, entry: i64, payload: &str) -> MessageId {
        let partition = self
            .topic
            .partition_index()
            .map(|i| i as i32)
            .unwrap_or(-1);
        let message = Message::builder()
            .topic(self.topic.clone())
            .payload(payload.to_string())
            .id(1, entry)
            .partition(partition)
            .publish_time(entry as u64)
            .producer_name("stub-producer")
            .build();
        let id = message.id.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.published.push(message.clone());
            state.pending.push_back(message);
        }
        self.notify.notify_one();
        id
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn reconsumed_count(&self) -> u64 {
        self.reconsumed.load(Ordering::SeqCst)
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    pub fn is_acked(&self, id: &MessageId) -> bool {
        self.state.lock().unwrap().acked.contains(id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn set_end_of_topic(&self) {
        self.end_of_topic.store(true, Ordering::SeqCst);
    }

    pub fn set_fail_unsubscribe(&self) {
        self.fail_unsubscribe.store(true, Ordering::SeqCst);
    }

    pub fn set_last_disconnected(&self, timestamp: u64) {
        self.last_disconnected.store(timestamp, Ordering::SeqCst);
    }

    fn same_stream_le(candidate: &MessageId, bound: &MessageId) -> bool {
        matches!(candidate.partial_cmp(bound), Some(ordering) if ordering.is_le())
    }
}

#[async_trait]
impl ChildConsumer for StubChild {
    fn topic(&self) -> &CompleteTopicName {
        &self.topic
    }

    async fn receive(&self) -> Result<Message, MagnetarClientError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(message) = state.pending.pop_front() {
                    state.unacked.push(message.clone());
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                    return Ok(message);
                }
            }
            notified.await;
        }
    }

    async fn acknowledge(
        &self,
        id: &MessageId,
        _txn: Option<TransactionId>,
    ) -> Result<(), MagnetarClientError> {
        let mut state = self.state.lock().unwrap();
        state.acked.insert(id.clone());
        state.unacked.retain(|m| m.id != *id);
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acknowledge_cumulative(
        &self,
        id: &MessageId,
        _txn: Option<TransactionId>,
    ) -> Result<(), MagnetarClientError> {
        let mut state = self.state.lock().unwrap();
        let (covered, kept): (Vec<_>, Vec<_>) = state
            .unacked
            .drain(..)
            .partition(|m| Self::same_stream_le(&m.id, id));
        for message in covered {
            state.acked.insert(message.id);
        }
        state.unacked = kept;
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn negative_acknowledge(&self, id: &MessageId) -> Result<(), MagnetarClientError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(position) = state.unacked.iter().position(|m| m.id == *id) {
                let message = state.unacked.remove(position);
                state.pending.push_back(message);
            }
        }
        self.nacks.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    async fn redeliver_all(&self) -> Result<(), MagnetarClientError> {
        {
            let mut state = self.state.lock().unwrap();
            let unacked: Vec<Message> = state.unacked.drain(..).collect();
            state.pending.extend(unacked);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn redeliver(&self, ids: Vec<MessageId>) -> Result<(), MagnetarClientError> {
        {
            let mut state = self.state.lock().unwrap();
            let requested: HashSet<MessageId> = ids.into_iter().collect();
            let (redeliver, kept): (Vec<_>, Vec<_>) = state
                .unacked
                .drain(..)
                .partition(|m| requested.contains(&m.id));
            state.unacked = kept;
            state.pending.extend(redeliver);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn reconsume_later(
        &self,
        message: &Message,
        _delay: Duration,
    ) -> Result<(), MagnetarClientError> {
        let mut state = self.state.lock().unwrap();
        state.acked.insert(message.id.clone());
        state.unacked.retain(|m| m.id != message.id);
        self.reconsumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconsume_later_cumulative(
        &self,
        message: &Message,
        _delay: Duration,
    ) -> Result<(), MagnetarClientError> {
        {
            let mut state = self.state.lock().unwrap();
            let (covered, kept): (Vec<_>, Vec<_>) = state
                .unacked
                .drain(..)
                .partition(|m| Self::same_stream_le(&m.id, &message.id));
            for message in covered {
                state.acked.insert(message.id);
            }
            state.unacked = kept;
        }
        self.reconsumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn seek(&self, target: SeekTarget) -> Result<(), MagnetarClientError> {
        {
            let mut state = self.state.lock().unwrap();
            state.unacked.clear();
            state.pending = match target {
                SeekTarget::MessageId(id) if id.is_earliest() => {
                    state.published.iter().cloned().collect()
                }
                SeekTarget::MessageId(_) => VecDeque::new(),
                SeekTarget::Timestamp(timestamp) => state
                    .published
                    .iter()
                    .filter(|m| m.publish_time >= timestamp)
                    .cloned()
                    .collect(),
            };
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn stats(&self) -> Result<ConsumerStats, MagnetarClientError> {
        Ok(ConsumerStats {
            num_msgs_received: self.delivered.load(Ordering::SeqCst),
            num_acks_sent: self.acks.load(Ordering::SeqCst),
            interval_duration: Duration::from_secs(10),
            ..Default::default()
        })
    }

    async fn has_message_available(&self) -> Result<bool, MagnetarClientError> {
        Ok(!self.state.lock().unwrap().pending.is_empty())
    }

    fn has_reached_end_of_topic(&self) -> bool {
        self.end_of_topic.load(Ordering::SeqCst)
    }

    fn last_disconnected_timestamp(&self) -> u64 {
        self.last_disconnected.load(Ordering::SeqCst)
    }

    async fn unsubscribe(&self) -> Result<(), MagnetarClientError> {
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(MagnetarClientError::connection("unsubscribe refused"));
        }
        self.unsubscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), MagnetarClientError> {
        self.disposed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

/// Factory handing out [`StubChild`]ren and recording what was created.
#[derive(Default)]
pub struct StubFactory {
    children: Mutex<HashMap<String, Arc<StubChild>>>,
    fail_topics: Mutex<HashSet<String>>,
    options_seen: Mutex<Vec<(String, ChildOptions)>>,
}

impl StubFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make creation of `topic` fail.
    pub fn fail_topic(&self, topic: &str) {
        self.fail_topics.lock().unwrap().insert(topic.to_string());
    }

    pub fn child(&self, topic: &str) -> Arc<StubChild> {
        self.try_child(topic)
            .unwrap_or_else(|| panic!("no child created for {}", topic))
    }

    pub fn try_child(&self, topic: &str) -> Option<Arc<StubChild>> {
        self.children.lock().unwrap().get(topic).cloned()
    }

    pub fn children_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    pub fn publish(&self, topic: &str, entry: i64, payload: &str) -> MessageId {
        self.child(topic).publish(entry, payload)
    }

    pub fn options_for(&self, topic: &str) -> Option<ChildOptions> {
        self.options_seen
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, options)| options.clone())
    }
}

#[async_trait]
impl ChildConsumerFactory for StubFactory {
    async fn create(
        &self,
        topic: CompleteTopicName,
        options: ChildOptions,
    ) -> Result<Arc<dyn ChildConsumer>, MagnetarClientError> {
        if self.fail_topics.lock().unwrap().contains(topic.as_str()) {
            return Err(MagnetarClientError::child(topic.as_str(), "creation refused"));
        }
        self.options_seen
            .lock()
            .unwrap()
            .push((topic.as_str().to_string(), options));
        let child = StubChild::new(topic.clone());
        self.children
            .lock()
            .unwrap()
            .insert(topic.as_str().to_string(), child.clone());
        Ok(child)
    }
}

/// Scriptable lookup service.
#[derive(Default)]
pub struct StubLookup {
    partitions: Mutex<HashMap<String, u32>>,
    namespaces: Mutex<HashMap<String, Vec<String>>>,
}

impl StubLookup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_partitions(&self, topic: &str, partitions: u32) {
        self.partitions
            .lock()
            .unwrap()
            .insert(topic.to_string(), partitions);
    }

    pub fn set_namespace_topics(&self, namespace: &str, topics: Vec<&str>) {
        self.namespaces.lock().unwrap().insert(
            namespace.to_string(),
            topics.into_iter().map(String::from).collect(),
        );
    }
}

#[async_trait]
impl LookupService for StubLookup {
    async fn get_partitioned_topic_metadata(
        &self,
        topic: &str,
    ) -> Result<PartitionedTopicMetadata, MagnetarClientError> {
        let partitions = self
            .partitions
            .lock()
            .unwrap()
            .get(topic)
            .copied()
            .unwrap_or(0);
        Ok(PartitionedTopicMetadata { partitions })
    }

    async fn get_topics_of_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<String>, MagnetarClientError> {
        Ok(self
            .namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn service_url(&self) -> &str {
        "magnetar://localhost:6650"
    }
}
