//! Broker lookup collaborator interface

use crate::error::MagnetarClientError;
use crate::message::TopicName;
use async_trait::async_trait;

/// Metadata the broker reports for a (possibly partitioned) topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionedTopicMetadata {
    /// Number of partitions; 0 means the topic is not partitioned
    pub partitions: u32,
}

/// Broker lookup service, consumed as an opaque contract.
#[async_trait]
pub trait LookupService: Send + Sync {
    /// Partition metadata for `topic`
    async fn get_partitioned_topic_metadata(
        &self,
        topic: &str,
    ) -> Result<PartitionedTopicMetadata, MagnetarClientError>;

    /// Current partition count for `topic` (0 when unpartitioned)
    async fn get_partitions_for_topic(&self, topic: &str) -> Result<u32, MagnetarClientError> {
        Ok(self.get_partitioned_topic_metadata(topic).await?.partitions)
    }

    /// All topics of `namespace`
    async fn get_topics_of_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<TopicName>, MagnetarClientError>;

    /// The broker service URL this lookup resolves against
    fn service_url(&self) -> &str;
}
