//! # Magnetar Client Library
//!
//! The client-side core of the Magnetar message broker: a multi-topic
//! consumer that fans many per-partition and per-topic subscriptions into a
//! single ordered message stream, and the client lifecycle that owns it.
//!
//! ## Features
//!
//! - **Multi-Topic Fan-In**: one receive surface over partitioned topics,
//!   explicit topic sets and pattern subscriptions
//! - **Async/Await**: built on tokio; every component is a cooperating task
//! - **Backpressure**: pull-based poller paced by the incoming queue
//! - **Redelivery**: negative acks, ack timeouts and explicit redelivery
//! - **Dynamic Topology**: partition growth and pattern discovery at runtime
//! - **Observability**: structured tracing and built-in client metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use magnetar_client::*;
//! use std::sync::Arc;
//!
//! async fn consume(
//!     lookup: Arc<dyn LookupService>,
//!     pool: Arc<dyn ConnectionPool>,
//!     factory: Arc<dyn ChildConsumerFactory>,
//! ) -> Result<()> {
//!     let client = MagnetarClient::new(lookup, pool, factory);
//!
//!     let config = ConsumerConfig::builder()
//!         .subscription_name("my-subscription")
//!         .topics(vec!["persistent://tenant/ns/orders"])
//!         .subscription_type(SubscriptionType::Shared)
//!         .build();
//!     let consumer = client.create_multi_topic_consumer(config).await?;
//!
//!     loop {
//!         let message = consumer.receive().await?;
//!         println!("received {} bytes from {}", message.size(), message.topic);
//!         consumer.acknowledge(&message.id).await?;
//!     }
//! }
//! ```

pub mod child;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
mod core;
pub mod error;
pub mod lookup;
pub mod message;
pub mod metrics;
mod poller;
mod queue;
mod stream;
mod taskseq;
mod tracker;

pub use child::{ChildConsumer, ChildConsumerFactory, ChildOptions, TransactionId};
pub use client::{ClientObject, ClientState, MagnetarClient};
pub use config::{BatchReceivePolicy, ConsumerConfig, ConsumerConfigBuilder, ConsumerMode, SubscriptionType};
pub use connection::ConnectionPool;
pub use consumer::MultiTopicConsumer;
pub use crate::core::ConnectionState;
pub use error::MagnetarClientError;
pub use lookup::{LookupService, PartitionedTopicMetadata};
pub use message::{
    CompleteTopicName, Message, MessageBuilder, MessageId, Messages, SeekTarget, TopicName,
};
pub use metrics::{global_metrics, ClientMetrics, ConsumerStats, MetricsSnapshot};

/// Cancellation token accepted by the receive operations
pub use tokio_util::sync::CancellationToken;

/// Client library result type
pub type Result<T> = std::result::Result<T, MagnetarClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
