//! Configuration types for the Magnetar consumer

use crate::error::MagnetarClientError;
use crate::message::{MessageId, TopicName};
use std::time::Duration;

/// How the broker dispatches messages to consumers on a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

impl SubscriptionType {
    /// Whether per-message redelivery requests are meaningful for this type
    pub fn supports_individual_redelivery(&self) -> bool {
        matches!(self, Self::Shared | Self::KeyShared)
    }
}

/// The shape of the topic set a multi-topic consumer covers
#[derive(Debug, Clone)]
pub enum ConsumerMode {
    /// One partitioned topic, expanded to its current partitions
    Partitioned { topic: TopicName },
    /// An explicit list of topics, each possibly partitioned
    MultiTopic { topics: Vec<TopicName> },
    /// All topics of a namespace matching a regular expression
    Pattern { namespace: String, pattern: String },
}

/// Limits governing a single batch-receive reply. The batch is replied as
/// soon as any limit is reached; the timeout limit is only checked when the
/// batch timer fires.
#[derive(Debug, Clone)]
pub struct BatchReceivePolicy {
    /// Maximum number of messages in one batch
    pub max_num_messages: usize,
    /// Maximum total payload bytes in one batch
    pub max_num_bytes: usize,
    /// Maximum time a batch-receive call waits before replying with
    /// whatever is available
    pub timeout: Duration,
}

impl Default for BatchReceivePolicy {
    fn default() -> Self {
        Self {
            max_num_messages: 100,
            max_num_bytes: 10 * 1024 * 1024, // 10MiB
            timeout: Duration::from_millis(100),
        }
    }
}

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Subscription this consumer attaches to
    pub subscription_name: String,
    /// Consumer name; auto-generated when not set
    pub consumer_name: Option<String>,
    /// Topic coverage
    pub mode: ConsumerMode,
    /// Per-child incoming queue capacity
    pub receiver_queue_size: usize,
    /// Cap on the sum of child queue capacities for partitioned topics
    pub max_total_receiver_queue_size_across_partitions: usize,
    /// Redeliver messages not acknowledged within this window; disabled when `None`
    pub ack_timeout: Option<Duration>,
    /// Granularity of the unacknowledged-message tracker
    pub ack_timeout_tick_time: Duration,
    /// Batch receive limits
    pub batch_receive_policy: BatchReceivePolicy,
    /// Watch partitioned topics for partition growth
    pub auto_update_partitions: bool,
    /// Interval between partition-count checks
    pub auto_update_partitions_interval: Duration,
    /// Interval between pattern re-evaluations (pattern mode only)
    pub pattern_auto_discovery_period: Duration,
    /// Subscription dispatch type
    pub subscription_type: SubscriptionType,
    /// Enable the retry letter topic flow (`reconsume_later`)
    pub retry_enable: bool,
    /// Initial position for newly created children
    pub start_message_id: Option<MessageId>,
    /// Rewind applied on top of the start position
    pub start_message_rollback_duration: Option<Duration>,
}

impl ConsumerConfig {
    /// Create a config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Validate invariants the consumer relies on
    pub fn validate(&self) -> Result<(), MagnetarClientError> {
        if self.subscription_name.is_empty() {
            return Err(MagnetarClientError::invalid_config(
                "Subscription name must be specified",
            ));
        }
        if self.receiver_queue_size == 0 {
            return Err(MagnetarClientError::invalid_config(
                "Receiver queue size must be greater than zero",
            ));
        }
        if self.batch_receive_policy.max_num_messages == 0
            || self.batch_receive_policy.max_num_bytes == 0
        {
            return Err(MagnetarClientError::invalid_config(
                "Batch receive limits must be greater than zero",
            ));
        }
        match &self.mode {
            ConsumerMode::Partitioned { topic } if topic.is_empty() => Err(
                MagnetarClientError::invalid_config("Topic must be specified"),
            ),
            ConsumerMode::MultiTopic { topics } if topics.is_empty() => Err(
                MagnetarClientError::invalid_config("At least one topic must be specified"),
            ),
            ConsumerMode::Pattern { namespace, pattern }
                if namespace.is_empty() || pattern.is_empty() =>
            {
                Err(MagnetarClientError::invalid_config(
                    "Namespace and pattern must be specified",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Queue size for a newly created per-partition child, given the total
    /// number of children after creation.
    pub fn partition_receiver_queue_size(&self, total_consumers: usize) -> usize {
        let fair_share =
            self.max_total_receiver_queue_size_across_partitions / total_consumers.max(1);
        self.receiver_queue_size.min(fair_share).max(1)
    }

    /// Queue level at which a paused poller is resumed
    pub fn resume_threshold(&self) -> usize {
        self.receiver_queue_size / 2
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            subscription_name: String::new(),
            consumer_name: None,
            mode: ConsumerMode::MultiTopic { topics: Vec::new() },
            receiver_queue_size: 1000,
            max_total_receiver_queue_size_across_partitions: 50_000,
            ack_timeout: None,
            ack_timeout_tick_time: Duration::from_secs(1),
            batch_receive_policy: BatchReceivePolicy::default(),
            auto_update_partitions: true,
            auto_update_partitions_interval: Duration::from_secs(60),
            pattern_auto_discovery_period: Duration::from_secs(60),
            subscription_type: SubscriptionType::Exclusive,
            retry_enable: false,
            start_message_id: None,
            start_message_rollback_duration: None,
        }
    }
}

/// Builder for [`ConsumerConfig`]
#[derive(Debug)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.subscription_name = name.into();
        self
    }

    pub fn consumer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.consumer_name = Some(name.into());
        self
    }

    /// Consume one partitioned topic
    pub fn partitioned_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.mode = ConsumerMode::Partitioned {
            topic: topic.into(),
        };
        self
    }

    /// Consume an explicit set of topics
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.mode = ConsumerMode::MultiTopic {
            topics: topics.into_iter().map(|s| s.into()).collect(),
        };
        self
    }

    /// Consume every topic of `namespace` matching `pattern`
    pub fn topic_pattern<N: Into<String>, P: Into<String>>(
        mut self,
        namespace: N,
        pattern: P,
    ) -> Self {
        self.config.mode = ConsumerMode::Pattern {
            namespace: namespace.into(),
            pattern: pattern.into(),
        };
        self
    }

    pub fn receiver_queue_size(mut self, size: usize) -> Self {
        self.config.receiver_queue_size = size;
        self
    }

    pub fn max_total_receiver_queue_size_across_partitions(mut self, size: usize) -> Self {
        self.config.max_total_receiver_queue_size_across_partitions = size;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = Some(timeout);
        self
    }

    pub fn ack_timeout_tick_time(mut self, tick: Duration) -> Self {
        self.config.ack_timeout_tick_time = tick;
        self
    }

    pub fn batch_receive_policy(mut self, policy: BatchReceivePolicy) -> Self {
        self.config.batch_receive_policy = policy;
        self
    }

    pub fn auto_update_partitions(mut self, enabled: bool) -> Self {
        self.config.auto_update_partitions = enabled;
        self
    }

    pub fn auto_update_partitions_interval(mut self, interval: Duration) -> Self {
        self.config.auto_update_partitions_interval = interval;
        self
    }

    pub fn pattern_auto_discovery_period(mut self, period: Duration) -> Self {
        self.config.pattern_auto_discovery_period = period;
        self
    }

    pub fn subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.config.subscription_type = subscription_type;
        self
    }

    pub fn retry_enable(mut self, enabled: bool) -> Self {
        self.config.retry_enable = enabled;
        self
    }

    pub fn start_message_id(mut self, id: MessageId) -> Self {
        self.config.start_message_id = Some(id);
        self
    }

    pub fn start_message_rollback_duration(mut self, duration: Duration) -> Self {
        self.config.start_message_rollback_duration = Some(duration);
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_builder() {
        let config = ConsumerConfigBuilder::new()
            .subscription_name("orders-sub")
            .topics(vec!["persistent://tnt/ns/t1", "persistent://tnt/ns/t2"])
            .receiver_queue_size(100)
            .subscription_type(SubscriptionType::Shared)
            .retry_enable(true)
            .build();

        assert_eq!(config.subscription_name, "orders-sub");
        assert_eq!(config.receiver_queue_size, 100);
        assert!(config.retry_enable);
        assert!(config.validate().is_ok());
        match config.mode {
            ConsumerMode::MultiTopic { ref topics } => assert_eq!(topics.len(), 2),
            _ => panic!("expected multi-topic mode"),
        }
    }

    #[test]
    fn test_validation_rejects_empty_topics() {
        let config = ConsumerConfigBuilder::new()
            .subscription_name("s")
            .topics(Vec::<String>::new())
            .build();
        assert!(config.validate().is_err());

        let config = ConsumerConfigBuilder::new().topics(vec!["t"]).build();
        // missing subscription name
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_queue() {
        let config = ConsumerConfigBuilder::new()
            .subscription_name("s")
            .topics(vec!["t"])
            .receiver_queue_size(0)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partition_receiver_queue_size_fair_share() {
        let config = ConsumerConfigBuilder::new()
            .subscription_name("s")
            .partitioned_topic("t")
            .receiver_queue_size(1000)
            .max_total_receiver_queue_size_across_partitions(2000)
            .build();

        // fair share caps below the per-child size once enough children exist
        assert_eq!(config.partition_receiver_queue_size(1), 1000);
        assert_eq!(config.partition_receiver_queue_size(4), 500);
        assert_eq!(config.partition_receiver_queue_size(4000), 1);
    }

    #[test]
    fn test_resume_threshold() {
        let config = ConsumerConfigBuilder::new()
            .subscription_name("s")
            .topics(vec!["t"])
            .receiver_queue_size(10)
            .build();
        assert_eq!(config.resume_threshold(), 5);
    }

    #[test]
    fn test_subscription_type_redelivery_support() {
        assert!(SubscriptionType::Shared.supports_individual_redelivery());
        assert!(SubscriptionType::KeyShared.supports_individual_redelivery());
        assert!(!SubscriptionType::Exclusive.supports_individual_redelivery());
        assert!(!SubscriptionType::Failover.supports_individual_redelivery());
    }
}
