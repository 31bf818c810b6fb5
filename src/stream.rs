//! Lazy per-child message source.
//!
//! A [`ChildStream`] turns one child consumer into a restartable producer of
//! `Result<Message>`: each `next()` yields a message rewritten to carry the
//! child's fully qualified topic, or the child's error. A failed `next()`
//! leaves the stream callable, so redelivery-driven retry works without
//! tearing the child down. A child that has reached the end of its topic
//! parks forever and is treated as terminally idle by the merge.

use crate::child::ChildConsumer;
use crate::error::MagnetarClientError;
use crate::message::{CompleteTopicName, Message};
use std::sync::Arc;

pub(crate) struct ChildStream {
    topic: CompleteTopicName,
    child: Arc<dyn ChildConsumer>,
}

impl ChildStream {
    pub fn new(child: Arc<dyn ChildConsumer>) -> Self {
        Self {
            topic: child.topic().clone(),
            child,
        }
    }

    pub fn topic(&self) -> &CompleteTopicName {
        &self.topic
    }

    /// Produce the next message from this child.
    pub async fn next(&self) -> Result<Message, MagnetarClientError> {
        if self.child.has_reached_end_of_topic() {
            std::future::pending::<()>().await;
        }
        match self.child.receive().await {
            Ok(message) => Ok(message.with_topic(self.topic.clone())),
            Err(MagnetarClientError::ChildOperationFailed { topic, message }) => {
                Err(MagnetarClientError::ChildOperationFailed { topic, message })
            }
            Err(e) => Err(MagnetarClientError::child(self.topic.as_str(), e.to_string())),
        }
    }
}
