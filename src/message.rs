//! Message and topic types shared across the consumer surface

use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

pub type TopicName = String;
pub type PartitionIndex = i32;

/// Fully qualified topic identifier, including any `-partition-N` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompleteTopicName(String);

impl CompleteTopicName {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// The topic name for one partition of a partitioned topic.
    pub fn partition<S: Into<String>>(topic: S, index: u32) -> Self {
        Self(format!("{}-partition-{}", topic.into(), index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The partition index encoded in the name, if any.
    pub fn partition_index(&self) -> Option<u32> {
        let (_, suffix) = self.0.rsplit_once("-partition-")?;
        suffix.parse().ok()
    }

    /// The logical topic this name belongs to, with any partition suffix stripped.
    pub fn logical_topic(&self) -> &str {
        match self.0.rsplit_once("-partition-") {
            Some((base, suffix)) if suffix.parse::<u32>().is_ok() => base,
            _ => &self.0,
        }
    }

    /// Whether this name is `topic` itself or one of its partitions.
    pub fn belongs_to(&self, topic: &str) -> bool {
        self.0 == topic || self.logical_topic() == topic
    }
}

impl fmt::Display for CompleteTopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CompleteTopicName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CompleteTopicName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Position of a message within a (topic, partition).
///
/// Totally ordered within one (topic, partition); across partitions only
/// equality is meaningful, so this type implements `PartialOrd` and
/// comparisons between different partitions return `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub ledger_id: i64,
    pub entry_id: i64,
    pub partition: PartitionIndex,
    pub batch_index: i32,
    pub topic: CompleteTopicName,
}

impl MessageId {
    pub fn new<T: Into<CompleteTopicName>>(
        ledger_id: i64,
        entry_id: i64,
        partition: PartitionIndex,
        batch_index: i32,
        topic: T,
    ) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
            batch_index,
            topic: topic.into(),
        }
    }

    /// The position before the first available message.
    pub fn earliest() -> Self {
        Self::new(-1, -1, -1, -1, "")
    }

    /// The position after the last available message.
    pub fn latest() -> Self {
        Self::new(i64::MAX, i64::MAX, -1, -1, "")
    }

    pub fn is_earliest(&self) -> bool {
        self.ledger_id == -1 && self.entry_id == -1
    }

    pub fn is_latest(&self) -> bool {
        self.ledger_id == i64::MAX && self.entry_id == i64::MAX
    }

    fn position(&self) -> (i64, i64, i32) {
        (self.ledger_id, self.entry_id, self.batch_index)
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.topic != other.topic || self.partition != other.partition {
            return if self == other {
                Some(Ordering::Equal)
            } else {
                None
            };
        }
        Some(self.position().cmp(&other.position()))
    }
}

/// A received message. Immutable after receipt.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub topic: CompleteTopicName,
    pub payload: Bytes,
    pub publish_time: u64,
    pub event_time: u64,
    pub producer_name: String,
    pub key: Option<String>,
    pub properties: HashMap<String, String>,
    pub redelivery_count: u32,
}

impl Message {
    /// Create a message builder
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Payload length in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Rebind this message to the child topic it arrived from.
    pub(crate) fn with_topic(mut self, topic: CompleteTopicName) -> Self {
        self.id.topic = topic.clone();
        self.topic = topic;
        self
    }
}

/// Builder for [`Message`], used by child consumer implementations and tests
#[derive(Debug, Default)]
pub struct MessageBuilder {
    ledger_id: i64,
    entry_id: i64,
    partition: PartitionIndex,
    batch_index: i32,
    topic: Option<CompleteTopicName>,
    payload: Option<Bytes>,
    publish_time: u64,
    event_time: u64,
    producer_name: String,
    key: Option<String>,
    properties: HashMap<String, String>,
    redelivery_count: u32,
}

impl MessageBuilder {
    pub fn id(mut self, ledger_id: i64, entry_id: i64) -> Self {
        self.ledger_id = ledger_id;
        self.entry_id = entry_id;
        self
    }

    pub fn partition(mut self, partition: PartitionIndex) -> Self {
        self.partition = partition;
        self
    }

    pub fn batch_index(mut self, batch_index: i32) -> Self {
        self.batch_index = batch_index;
        self
    }

    pub fn topic<T: Into<CompleteTopicName>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn payload<V: Into<Bytes>>(mut self, payload: V) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn publish_time(mut self, publish_time: u64) -> Self {
        self.publish_time = publish_time;
        self
    }

    pub fn event_time(mut self, event_time: u64) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn producer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.producer_name = name.into();
        self
    }

    pub fn key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn redelivery_count(mut self, count: u32) -> Self {
        self.redelivery_count = count;
        self
    }

    pub fn build(self) -> Message {
        let topic = self.topic.expect("Topic is required");
        let payload = self.payload.expect("Payload is required");

        Message {
            id: MessageId::new(
                self.ledger_id,
                self.entry_id,
                self.partition,
                self.batch_index,
                topic.clone(),
            ),
            topic,
            payload,
            publish_time: self.publish_time,
            event_time: self.event_time,
            producer_name: self.producer_name,
            key: self.key,
            properties: self.properties,
            redelivery_count: self.redelivery_count,
        }
    }
}

/// A batch of messages returned by batch receive.
#[derive(Debug, Clone, Default)]
pub struct Messages {
    messages: Vec<Message>,
}

impl Messages {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total payload bytes across the batch
    pub fn size_bytes(&self) -> usize {
        self.messages.iter().map(Message::size).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.messages.iter().map(|m| &m.id)
    }
}

impl IntoIterator for Messages {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl std::ops::Index<usize> for Messages {
    type Output = Message;

    fn index(&self, index: usize) -> &Message {
        &self.messages[index]
    }
}

/// Target of a seek operation
#[derive(Debug, Clone)]
pub enum SeekTarget {
    /// Publish-time position in epoch milliseconds
    Timestamp(u64),
    /// An explicit position; the multi-topic consumer only accepts
    /// `MessageId::earliest()` and `MessageId::latest()`
    MessageId(MessageId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_topic_name() {
        let name = CompleteTopicName::partition("persistent://tnt/ns/orders", 3);
        assert_eq!(name.as_str(), "persistent://tnt/ns/orders-partition-3");
        assert_eq!(name.partition_index(), Some(3));
        assert_eq!(name.logical_topic(), "persistent://tnt/ns/orders");
        assert!(name.belongs_to("persistent://tnt/ns/orders"));
        assert!(!name.belongs_to("persistent://tnt/ns/order"));
    }

    #[test]
    fn test_unpartitioned_topic_name() {
        let name = CompleteTopicName::new("persistent://tnt/ns/audit");
        assert_eq!(name.partition_index(), None);
        assert_eq!(name.logical_topic(), "persistent://tnt/ns/audit");
        assert!(name.belongs_to("persistent://tnt/ns/audit"));
    }

    #[test]
    fn test_message_id_ordering_within_partition() {
        let a = MessageId::new(1, 5, 0, -1, "t-partition-0");
        let b = MessageId::new(1, 9, 0, -1, "t-partition-0");
        let c = MessageId::new(2, 0, 0, -1, "t-partition-0");

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.partial_cmp(&a), Some(Ordering::Equal));
    }

    #[test]
    fn test_message_id_incomparable_across_partitions() {
        let a = MessageId::new(1, 5, 0, -1, "t-partition-0");
        let b = MessageId::new(1, 9, 1, -1, "t-partition-1");

        assert_eq!(a.partial_cmp(&b), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_special_ids() {
        assert!(MessageId::earliest().is_earliest());
        assert!(MessageId::latest().is_latest());
        assert!(!MessageId::new(0, 0, 0, -1, "t").is_earliest());
    }

    #[test]
    fn test_messages_accounting() {
        let batch = Messages::new(vec![
            Message::builder().topic("t").payload("abcd").id(1, 0).build(),
            Message::builder().topic("t").payload("ef").id(1, 1).build(),
        ]);
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.size_bytes(), 6);
        assert_eq!(batch[1].id.entry_id, 1);
    }
}
