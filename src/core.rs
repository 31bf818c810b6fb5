//! The consumer core: a single-consumer event loop owning every piece of
//! mutable consumer state.
//!
//! All mutations to the child table, the incoming queue, the waiter lists,
//! the partition bookkeeping and the connection state happen inside
//! [`ConsumerCore::run`], one event at a time. Background tasks (poller,
//! unacked tracker, watcher timers, cancellation registrations) interact
//! with the core exclusively by posting events into its mailbox.

use crate::child::{ChildConsumer, ChildConsumerFactory, ChildOptions, TransactionId};
use crate::config::{ConsumerConfig, ConsumerMode};
use crate::error::MagnetarClientError;
use crate::lookup::LookupService;
use crate::message::{CompleteTopicName, Message, MessageId, Messages, SeekTarget, TopicName};
use crate::metrics::{ClientMetrics, ConsumerStats};
use crate::poller::spawn_poller;
use crate::queue::{BatchWaiter, IncomingQueue, Waiter};
use crate::stream::ChildStream;
use crate::taskseq::TaskSeq;
use crate::tracker::UnackedTracker;
use futures::future::join_all;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<Result<T, MagnetarClientError>>;

/// Lifecycle state of a consumer, published for lock-free reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Uninitialized = 0,
    Ready = 1,
    Closing = 2,
    Closed = 3,
    Failed = 4,
}

/// Atomic cell publishing the consumer state. Only the core writes.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Uninitialized as u8))
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Uninitialized,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Closing,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Failed,
        }
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Per-child seek target resolver
pub type SeekResolver = Box<dyn Fn(&CompleteTopicName) -> SeekTarget + Send + Sync>;

/// Events processed by the core, one at a time in arrival order.
pub(crate) enum CoreEvent {
    MessageReceived {
        message: Result<Message, MagnetarClientError>,
        poller_reply: oneshot::Sender<()>,
    },
    Receive {
        ct: CancellationToken,
        reply: Reply<Message>,
    },
    BatchReceive {
        ct: CancellationToken,
        reply: Reply<Messages>,
    },
    SendBatchByTimeout {
        waiter_id: u64,
    },
    Acknowledge {
        id: MessageId,
        txn: Option<TransactionId>,
        cumulative: bool,
        reply: Reply<()>,
    },
    NegativeAcknowledge {
        id: MessageId,
        reply: Reply<()>,
    },
    RedeliverAll {
        reply: Reply<()>,
    },
    Redeliver {
        ids: HashSet<MessageId>,
        reply: Option<Reply<()>>,
    },
    Seek {
        target: SeekTarget,
        reply: Reply<()>,
    },
    SeekWithResolver {
        resolver: SeekResolver,
        reply: Reply<()>,
    },
    PartitionTick,
    PatternTick,
    HasReachedEndOfTopic {
        reply: oneshot::Sender<bool>,
    },
    LastDisconnected {
        reply: oneshot::Sender<u64>,
    },
    GetStats {
        reply: Reply<Vec<ConsumerStats>>,
    },
    ReconsumeLater {
        message: Message,
        delay: Duration,
        cumulative: bool,
        reply: Reply<()>,
    },
    HasMessageAvailable {
        reply: Reply<bool>,
    },
    RemoveWaiter {
        id: u64,
    },
    RemoveBatchWaiter {
        id: u64,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        reply: Reply<()>,
    },
}

pub(crate) struct ConsumerCore {
    config: ConsumerConfig,
    factory: Arc<dyn ChildConsumerFactory>,
    lookup: Arc<dyn LookupService>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    state: Arc<StateCell>,
    metrics: Arc<ClientMetrics>,
    pattern: Option<Regex>,

    children: HashMap<CompleteTopicName, Arc<dyn ChildConsumer>>,
    partitioned_topics: HashMap<TopicName, u32>,
    all_topics: HashSet<TopicName>,

    queue: IncomingQueue,
    waiters: VecDeque<Waiter>,
    batch_waiters: VecDeque<BatchWaiter>,
    waiting_poller: Option<oneshot::Sender<()>>,
    next_waiter_id: u64,

    task_seq: TaskSeq,
    tracker: UnackedTracker,
    poller: Option<JoinHandle<()>>,
    poller_token: CancellationToken,
    watcher_token: CancellationToken,
    on_closed: Option<Box<dyn FnOnce() + Send>>,
}

impl ConsumerCore {
    pub fn new(
        config: ConsumerConfig,
        factory: Arc<dyn ChildConsumerFactory>,
        lookup: Arc<dyn LookupService>,
        events_tx: mpsc::UnboundedSender<CoreEvent>,
        state: Arc<StateCell>,
        pattern: Option<Regex>,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let tracker = match config.ack_timeout {
            Some(timeout) => UnackedTracker::start(
                timeout,
                config.ack_timeout_tick_time,
                events_tx.clone(),
            ),
            None => UnackedTracker::disabled(),
        };
        Self {
            config,
            factory,
            lookup,
            events_tx,
            state,
            metrics: crate::metrics::global_metrics(),
            pattern,
            children: HashMap::new(),
            partitioned_topics: HashMap::new(),
            all_topics: HashSet::new(),
            queue: IncomingQueue::default(),
            waiters: VecDeque::new(),
            batch_waiters: VecDeque::new(),
            waiting_poller: None,
            next_waiter_id: 0,
            task_seq: TaskSeq::new(),
            tracker,
            poller: None,
            poller_token: CancellationToken::new(),
            watcher_token: CancellationToken::new(),
            on_closed,
        }
    }

    /// Drive the consumer: initialize children, then serialize events until
    /// the consumer closes.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<CoreEvent>,
        created: oneshot::Sender<Result<(), MagnetarClientError>>,
    ) {
        match self.init().await {
            Ok(()) => {
                self.state.set(ConnectionState::Ready);
                self.poller = Some(spawn_poller(
                    self.task_seq.clone(),
                    self.events_tx.clone(),
                    self.poller_token.clone(),
                ));
                self.start_watchers();
                self.metrics.record_consumer_created();
                info!(
                    subscription = %self.config.subscription_name,
                    children = self.children.len(),
                    "consumer ready"
                );
                let _ = created.send(Ok(()));
            }
            Err(e) => {
                error!(error = %e, "consumer initialization failed");
                self.dispose_children().await;
                self.state.set(ConnectionState::Failed);
                self.tracker.stop();
                let _ = created.send(Err(MagnetarClientError::init_failed(e.to_string())));
                return;
            }
        }

        while let Some(event) = events.recv().await {
            if self.handle(event).await {
                break;
            }
        }
    }

    /// Process one event; returns true when the consumer has stopped.
    async fn handle(&mut self, event: CoreEvent) -> bool {
        match event {
            CoreEvent::MessageReceived {
                message,
                poller_reply,
            } => self.on_message_received(message, poller_reply),
            CoreEvent::Receive { ct, reply } => self.on_receive(ct, reply),
            CoreEvent::BatchReceive { ct, reply } => self.on_batch_receive(ct, reply),
            CoreEvent::SendBatchByTimeout { waiter_id } => self.on_batch_timeout(waiter_id),
            CoreEvent::Acknowledge {
                id,
                txn,
                cumulative,
                reply,
            } => self.on_acknowledge(id, txn, cumulative, reply).await,
            CoreEvent::NegativeAcknowledge { id, reply } => {
                self.on_negative_acknowledge(id, reply).await
            }
            CoreEvent::RedeliverAll { reply } => self.on_redeliver_all(reply).await,
            CoreEvent::Redeliver { ids, reply } => self.on_redeliver(ids, reply).await,
            CoreEvent::Seek { target, reply } => {
                self.on_seek(|_| target.clone(), reply).await
            }
            CoreEvent::SeekWithResolver { resolver, reply } => {
                self.on_seek(|topic| resolver(topic), reply).await
            }
            CoreEvent::PartitionTick => self.on_partition_tick().await,
            CoreEvent::PatternTick => self.on_pattern_tick().await,
            CoreEvent::HasReachedEndOfTopic { reply } => {
                let all = self
                    .children
                    .values()
                    .all(|child| child.has_reached_end_of_topic());
                let _ = reply.send(all);
            }
            CoreEvent::LastDisconnected { reply } => {
                let max = self
                    .children
                    .values()
                    .map(|child| child.last_disconnected_timestamp())
                    .max()
                    .unwrap_or(0);
                let _ = reply.send(max);
            }
            CoreEvent::GetStats { reply } => self.on_get_stats(reply).await,
            CoreEvent::ReconsumeLater {
                message,
                delay,
                cumulative,
                reply,
            } => self.on_reconsume_later(message, delay, cumulative, reply).await,
            CoreEvent::HasMessageAvailable { reply } => {
                self.on_has_message_available(reply).await
            }
            CoreEvent::RemoveWaiter { id } => self.on_remove_waiter(id),
            CoreEvent::RemoveBatchWaiter { id } => self.on_remove_batch_waiter(id),
            CoreEvent::Close { reply } => {
                self.on_close().await;
                let _ = reply.send(());
                return true;
            }
            CoreEvent::Unsubscribe { reply } => {
                let stopped = self.on_unsubscribe(reply).await;
                return stopped;
            }
        }
        false
    }

    // ----- initialization -------------------------------------------------

    async fn init(&mut self) -> Result<(), MagnetarClientError> {
        match self.config.mode.clone() {
            ConsumerMode::Partitioned { topic } => {
                let partitions = self.lookup.get_partitions_for_topic(&topic).await?;
                if partitions == 0 {
                    return Err(MagnetarClientError::invalid_config(format!(
                        "Topic '{}' is not partitioned",
                        topic
                    )));
                }
                self.create_partition_children(&topic, 0, partitions, true)
                    .await?;
                self.partitioned_topics.insert(topic.clone(), partitions);
                self.all_topics.insert(topic);
            }
            ConsumerMode::MultiTopic { topics } => {
                for topic in topics {
                    self.init_topic(topic, true).await?;
                }
            }
            ConsumerMode::Pattern { namespace, .. } => {
                let pattern = self.pattern.clone().expect("pattern compiled before spawn");
                let topics = self.lookup.get_topics_of_namespace(&namespace).await?;
                for topic in topics.into_iter().filter(|t| pattern.is_match(t)) {
                    self.init_topic(topic, false).await?;
                }
            }
        }
        Ok(())
    }

    /// Create the children for one logical topic, expanding partitions.
    /// Cleans up its own partial creations on failure.
    async fn init_topic(
        &mut self,
        topic: TopicName,
        create_if_missing: bool,
    ) -> Result<(), MagnetarClientError> {
        let metadata = self.lookup.get_partitioned_topic_metadata(&topic).await?;
        if metadata.partitions > 0 {
            self.create_partition_children(&topic, 0, metadata.partitions, create_if_missing)
                .await?;
        } else {
            let name = CompleteTopicName::new(topic.clone());
            self.create_child(name, self.config.receiver_queue_size, create_if_missing)
                .await?;
        }
        self.partitioned_topics
            .insert(topic.clone(), metadata.partitions);
        self.all_topics.insert(topic);
        Ok(())
    }

    /// Create children for partition indices `[from, to)` of `topic`,
    /// disposing the ones that were created if a later one fails.
    async fn create_partition_children(
        &mut self,
        topic: &str,
        from: u32,
        to: u32,
        create_if_missing: bool,
    ) -> Result<(), MagnetarClientError> {
        let total = self.children.len() + (to - from) as usize;
        let queue_size = self.config.partition_receiver_queue_size(total);
        let mut created = Vec::new();
        for index in from..to {
            let name = CompleteTopicName::partition(topic, index);
            match self
                .create_child(name.clone(), queue_size, create_if_missing)
                .await
            {
                Ok(()) => created.push(name),
                Err(e) => {
                    for name in created {
                        self.drop_child(&name).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn create_child(
        &mut self,
        topic: CompleteTopicName,
        receiver_queue_size: usize,
        create_if_missing: bool,
    ) -> Result<(), MagnetarClientError> {
        let options = ChildOptions {
            subscription_name: self.config.subscription_name.clone(),
            subscription_type: self.config.subscription_type,
            receiver_queue_size,
            start_message_id: self.config.start_message_id.clone(),
            start_message_rollback_duration: self.config.start_message_rollback_duration,
            create_topic_if_does_not_exist: create_if_missing,
        };
        let child = self.factory.create(topic.clone(), options).await?;
        debug!(topic = %topic, "child consumer created");
        self.task_seq.add(ChildStream::new(child.clone()));
        self.children.insert(topic, child);
        Ok(())
    }

    /// Remove one child from the table and the merge, then dispose it.
    async fn drop_child(&mut self, topic: &CompleteTopicName) {
        self.task_seq.remove(topic);
        if let Some(child) = self.children.remove(topic) {
            if let Err(e) = child.dispose().await {
                warn!(topic = %topic, error = %e, "child dispose failed");
            }
        }
    }

    async fn dispose_children(&mut self) {
        let children: Vec<_> = self.children.drain().collect();
        for (topic, _) in &children {
            self.task_seq.remove(topic);
        }
        let results = join_all(children.iter().map(|(_, child)| child.dispose())).await;
        for ((topic, _), result) in children.iter().zip(results) {
            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "child dispose failed");
            }
        }
    }

    fn start_watchers(&self) {
        let partitioned = self.partitioned_topics.values().any(|&n| n > 0);
        if self.config.auto_update_partitions && partitioned {
            spawn_ticker(
                self.config.auto_update_partitions_interval,
                self.watcher_token.clone(),
                self.events_tx.clone(),
                || CoreEvent::PartitionTick,
            );
        }
        if matches!(self.config.mode, ConsumerMode::Pattern { .. }) {
            spawn_ticker(
                self.config.pattern_auto_discovery_period,
                self.watcher_token.clone(),
                self.events_tx.clone(),
                || CoreEvent::PatternTick,
            );
        }
    }

    // ----- message flow ---------------------------------------------------

    fn on_message_received(
        &mut self,
        message: Result<Message, MagnetarClientError>,
        poller_reply: oneshot::Sender<()>,
    ) {
        match &message {
            Ok(m) => self.metrics.record_receive(m.size() as u64),
            Err(_) => self.metrics.record_receive_error(),
        }

        if let Some(waiter) = self.waiters.pop_front() {
            if self.queue.is_empty() {
                self.deliver(waiter, message);
            } else {
                // keep FIFO: the parked caller gets the oldest entry
                self.queue.push(message);
                let head = self.queue.pop().expect("queue is non-empty");
                self.deliver(waiter, head);
            }
        } else {
            self.queue.push(message);
            self.try_satisfy_batch_waiters();
        }

        if self.queue.len() >= self.config.receiver_queue_size {
            // backpressure: hold the reply until dequeues bring the queue
            // back down to the resume threshold
            self.waiting_poller = Some(poller_reply);
        } else {
            let _ = poller_reply.send(());
        }
    }

    fn deliver(&mut self, waiter: Waiter, entry: Result<Message, MagnetarClientError>) {
        if let Ok(message) = &entry {
            self.tracker.add(message.id.clone());
        }
        waiter.satisfy(entry);
    }

    fn on_receive(&mut self, ct: CancellationToken, reply: Reply<Message>) {
        if ct.is_cancelled() {
            let _ = reply.send(Err(MagnetarClientError::OperationCancelled));
            return;
        }
        if let Some(entry) = self.queue.pop() {
            if let Ok(message) = &entry {
                self.tracker.add(message.id.clone());
            }
            let _ = reply.send(entry);
            self.maybe_resume_poller();
            return;
        }

        let id = self.next_waiter_id();
        let registration = {
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                ct.cancelled().await;
                let _ = events.send(CoreEvent::RemoveWaiter { id });
            })
        };
        self.waiters.push_back(Waiter::new(id, reply, Some(registration)));
    }

    fn on_batch_receive(&mut self, ct: CancellationToken, reply: Reply<Messages>) {
        if ct.is_cancelled() {
            let _ = reply.send(Err(MagnetarClientError::OperationCancelled));
            return;
        }
        let policy = self.config.batch_receive_policy.clone();
        if self.batch_waiters.is_empty() && self.queue.has_batch_ready(&policy) {
            let result = self.queue.drain_batch(&policy);
            if let Ok(batch) = &result {
                for id in batch.message_ids() {
                    self.tracker.add(id.clone());
                }
            }
            let _ = reply.send(result);
            self.maybe_resume_poller();
            return;
        }

        let id = self.next_waiter_id();
        let guard = CancellationToken::new();
        {
            let events = self.events_tx.clone();
            let guard = guard.clone();
            let timeout = policy.timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = guard.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        let _ = events.send(CoreEvent::SendBatchByTimeout { waiter_id: id });
                    }
                }
            });
        }
        let registration = {
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                ct.cancelled().await;
                let _ = events.send(CoreEvent::RemoveBatchWaiter { id });
            })
        };
        self.batch_waiters
            .push_back(BatchWaiter::new(id, reply, guard, Some(registration)));
    }

    /// Satisfy queued batch waiters while enough messages are available.
    fn try_satisfy_batch_waiters(&mut self) {
        let policy = self.config.batch_receive_policy.clone();
        while !self.batch_waiters.is_empty() && self.queue.has_batch_ready(&policy) {
            let waiter = self.batch_waiters.pop_front().expect("checked non-empty");
            let result = self.queue.drain_batch(&policy);
            if let Ok(batch) = &result {
                for id in batch.message_ids() {
                    self.tracker.add(id.clone());
                }
            }
            waiter.satisfy(result);
            self.maybe_resume_poller();
        }
    }

    fn on_batch_timeout(&mut self, waiter_id: u64) {
        let Some(position) = self
            .batch_waiters
            .iter()
            .position(|w| w.id == waiter_id)
        else {
            return;
        };
        let waiter = self
            .batch_waiters
            .remove(position)
            .expect("position is valid");
        let result = self.queue.drain_batch(&self.config.batch_receive_policy);
        if let Ok(batch) = &result {
            for id in batch.message_ids() {
                self.tracker.add(id.clone());
            }
        }
        waiter.satisfy(result);
        self.maybe_resume_poller();
    }

    fn on_remove_waiter(&mut self, id: u64) {
        if let Some(position) = self.waiters.iter().position(|w| w.id == id) {
            let waiter = self.waiters.remove(position).expect("position is valid");
            waiter.satisfy(Err(MagnetarClientError::OperationCancelled));
        }
    }

    fn on_remove_batch_waiter(&mut self, id: u64) {
        if let Some(position) = self.batch_waiters.iter().position(|w| w.id == id) {
            let waiter = self
                .batch_waiters
                .remove(position)
                .expect("position is valid");
            waiter.satisfy(Err(MagnetarClientError::OperationCancelled));
        }
    }

    /// Release a withheld poller reply once the queue is back at or below
    /// the resume threshold.
    fn maybe_resume_poller(&mut self) {
        if self.queue.len() <= self.config.resume_threshold() {
            if let Some(reply) = self.waiting_poller.take() {
                let _ = reply.send(());
            }
        }
    }

    fn next_waiter_id(&mut self) -> u64 {
        self.next_waiter_id += 1;
        self.next_waiter_id
    }

    // ----- acknowledgement and redelivery ---------------------------------

    fn child_for(
        &self,
        topic: &CompleteTopicName,
    ) -> Result<Arc<dyn ChildConsumer>, MagnetarClientError> {
        self.children.get(topic).cloned().ok_or_else(|| {
            MagnetarClientError::child(topic.as_str(), "no child consumer for topic")
        })
    }

    async fn on_acknowledge(
        &mut self,
        id: MessageId,
        txn: Option<TransactionId>,
        cumulative: bool,
        reply: Reply<()>,
    ) {
        let result = match self.child_for(&id.topic) {
            Ok(child) => {
                if cumulative {
                    child.acknowledge_cumulative(&id, txn).await
                } else {
                    child.acknowledge(&id, txn).await
                }
            }
            Err(e) => Err(e),
        };
        if result.is_ok() {
            if cumulative {
                self.tracker.remove_until(&id);
            } else {
                self.tracker.remove(&id);
            }
            self.metrics.record_ack();
        }
        let _ = reply.send(result);
    }

    async fn on_negative_acknowledge(&mut self, id: MessageId, reply: Reply<()>) {
        let result = match self.child_for(&id.topic) {
            Ok(child) => child.negative_acknowledge(&id).await,
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.tracker.remove(&id);
            self.metrics.record_nack();
        }
        let _ = reply.send(result);
    }

    async fn on_redeliver_all(&mut self, reply: Reply<()>) {
        if self.state.get() != ConnectionState::Ready {
            let _ = reply.send(Err(MagnetarClientError::already_closed("consumer")));
            return;
        }
        let result = self.redeliver_all_children().await;
        let _ = reply.send(result);
    }

    async fn redeliver_all_children(&mut self) -> Result<(), MagnetarClientError> {
        let discarded = self.queue.len() as u64 + self.tracker.len() as u64;

        // drop anything pulled before the redelivery point
        self.task_seq.cancel_in_flight();
        self.queue.clear();
        self.tracker.clear();
        self.maybe_resume_poller();

        let results = join_all(
            self.children
                .values()
                .map(|child| child.redeliver_all()),
        )
        .await;
        self.task_seq.restart_completed();
        self.metrics.record_redelivery(discarded);

        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    async fn on_redeliver(
        &mut self,
        ids: HashSet<MessageId>,
        reply: Option<Reply<()>>,
    ) {
        if self.state.get() != ConnectionState::Ready {
            if let Some(reply) = reply {
                let _ = reply.send(Err(MagnetarClientError::already_closed("consumer")));
            }
            return;
        }
        if !self
            .config
            .subscription_type
            .supports_individual_redelivery()
        {
            let result = self.redeliver_all_children().await;
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(error = %e, "redelivery failed");
                    }
                }
            }
            return;
        }

        let count = ids.len() as u64;
        let mut grouped: HashMap<CompleteTopicName, Vec<MessageId>> = HashMap::new();
        for id in ids {
            self.tracker.remove(&id);
            grouped.entry(id.topic.clone()).or_default().push(id);
        }

        let mut result = Ok(());
        for (topic, ids) in grouped {
            match self.children.get(&topic) {
                Some(child) => {
                    if let Err(e) = child.redeliver(ids).await {
                        warn!(topic = %topic, error = %e, "redelivery failed");
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                None => debug!(topic = %topic, "redelivery for unknown child dropped"),
            }
        }
        self.metrics.record_redelivery(count);

        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(error = %e, "redelivery failed");
                }
            }
        }
    }

    async fn on_seek<F>(&mut self, target_for: F, reply: Reply<()>)
    where
        F: Fn(&CompleteTopicName) -> SeekTarget,
    {
        self.task_seq.cancel_in_flight();
        self.queue.clear();
        self.tracker.clear();
        self.maybe_resume_poller();

        let seeks: Vec<_> = self
            .children
            .iter()
            .map(|(topic, child)| {
                let target = target_for(topic);
                async move { child.seek(target).await }
            })
            .collect();
        let results = join_all(seeks).await;
        self.task_seq.restart_completed();

        let result = results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ());
        let _ = reply.send(result);
    }

    async fn on_reconsume_later(
        &mut self,
        message: Message,
        delay: Duration,
        cumulative: bool,
        reply: Reply<()>,
    ) {
        let result = match self.child_for(&message.topic) {
            Ok(child) => {
                if cumulative {
                    child.reconsume_later_cumulative(&message, delay).await
                } else {
                    child.reconsume_later(&message, delay).await
                }
            }
            Err(e) => Err(e),
        };
        if result.is_ok() {
            if cumulative {
                self.tracker.remove_until(&message.id);
            } else {
                self.tracker.remove(&message.id);
            }
        }
        let _ = reply.send(result);
    }

    async fn on_get_stats(&mut self, reply: Reply<Vec<ConsumerStats>>) {
        let results = join_all(self.children.values().map(|child| child.stats())).await;
        let result = results.into_iter().collect::<Result<Vec<_>, _>>();
        let _ = reply.send(result);
    }

    async fn on_has_message_available(&mut self, reply: Reply<bool>) {
        if !self.queue.is_empty() {
            let _ = reply.send(Ok(true));
            return;
        }
        let results = join_all(
            self.children
                .values()
                .map(|child| child.has_message_available()),
        )
        .await;
        let mut available = false;
        let mut first_err = None;
        for result in results {
            match result {
                Ok(true) => available = true,
                Ok(false) => {}
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(_) => {}
            }
        }
        let result = match (available, first_err) {
            (true, _) => Ok(true),
            (false, Some(e)) => Err(e),
            (false, None) => Ok(false),
        };
        let _ = reply.send(result);
    }

    // ----- watchers -------------------------------------------------------

    async fn on_partition_tick(&mut self) {
        if self.state.get() != ConnectionState::Ready {
            return;
        }
        let tracked: Vec<(TopicName, u32)> = self
            .partitioned_topics
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(topic, &count)| (topic.clone(), count))
            .collect();

        for (topic, old_count) in tracked {
            let new_count = match self.lookup.get_partitions_for_topic(&topic).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "partition lookup failed");
                    continue;
                }
            };
            if new_count < old_count {
                warn!(
                    topic = %topic,
                    old = old_count,
                    new = new_count,
                    "refusing to shrink partition count"
                );
                continue;
            }
            if new_count == old_count {
                continue;
            }
            match self
                .create_partition_children(&topic, old_count, new_count, true)
                .await
            {
                Ok(()) => {
                    info!(topic = %topic, old = old_count, new = new_count, "partitions grown");
                    self.partitioned_topics.insert(topic, new_count);
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "partition growth failed, keeping old set");
                }
            }
        }
    }

    async fn on_pattern_tick(&mut self) {
        if self.state.get() != ConnectionState::Ready {
            return;
        }
        let (namespace, pattern) = match (&self.config.mode, &self.pattern) {
            (ConsumerMode::Pattern { namespace, .. }, Some(pattern)) => {
                (namespace.clone(), pattern.clone())
            }
            _ => return,
        };

        let topics = match self.lookup.get_topics_of_namespace(&namespace).await {
            Ok(topics) => topics,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "topic discovery failed");
                return;
            }
        };
        let new_all: HashSet<TopicName> = topics
            .into_iter()
            .filter(|topic| pattern.is_match(topic))
            .collect();

        let added: Vec<TopicName> = new_all.difference(&self.all_topics).cloned().collect();
        let removed: Vec<TopicName> = self.all_topics.difference(&new_all).cloned().collect();

        for topic in added {
            match self.init_topic(topic.clone(), false).await {
                Ok(()) => info!(topic = %topic, "pattern discovered topic"),
                Err(e) => warn!(topic = %topic, error = %e, "discovered topic init failed"),
            }
        }

        for topic in removed {
            let matching: Vec<CompleteTopicName> = self
                .children
                .keys()
                .filter(|name| name.belongs_to(&topic))
                .cloned()
                .collect();
            for name in matching {
                self.drop_child(&name).await;
            }
            self.all_topics.remove(&topic);
            self.partitioned_topics.remove(&topic);
            info!(topic = %topic, "pattern removed topic");
        }
    }

    // ----- shutdown -------------------------------------------------------

    async fn on_close(&mut self) {
        match self.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => return,
            _ => {}
        }
        self.state.set(ConnectionState::Closing);
        self.dispose_children().await;
        self.state.set(ConnectionState::Closed);
        self.stop_consumer();
        self.metrics.record_consumer_closed();
        info!(subscription = %self.config.subscription_name, "consumer closed");
    }

    /// Returns true when the actor should stop.
    async fn on_unsubscribe(&mut self, reply: Reply<()>) -> bool {
        match self.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => {
                let _ = reply.send(Ok(()));
                return true;
            }
            _ => {}
        }
        self.state.set(ConnectionState::Closing);

        let results = join_all(self.children.values().map(|child| child.unsubscribe())).await;
        let failure = results.into_iter().find_map(Result::err);

        self.dispose_children().await;
        match failure {
            Some(e) => {
                self.state.set(ConnectionState::Failed);
                self.stop_consumer();
                error!(error = %e, "unsubscribe failed");
                let _ = reply.send(Err(e));
            }
            None => {
                self.state.set(ConnectionState::Closed);
                self.stop_consumer();
                self.metrics.record_consumer_closed();
                info!(subscription = %self.config.subscription_name, "consumer unsubscribed");
                let _ = reply.send(Ok(()));
            }
        }
        true
    }

    /// Cancel the poller, close the periodic timers, stop the tracker and
    /// fail every outstanding waiter.
    fn stop_consumer(&mut self) {
        self.poller_token.cancel();
        self.watcher_token.cancel();
        self.tracker.stop();
        self.poller.take();
        self.waiting_poller.take();

        for waiter in self.waiters.drain(..) {
            waiter.satisfy(Err(MagnetarClientError::already_closed("consumer")));
        }
        for waiter in self.batch_waiters.drain(..) {
            waiter.satisfy(Err(MagnetarClientError::already_closed("consumer")));
        }
        self.queue.clear();

        if let Some(hook) = self.on_closed.take() {
            hook();
        }
    }
}

/// Spawn a periodic task posting one event per interval until cancelled.
fn spawn_ticker<F>(
    period: Duration,
    token: CancellationToken,
    events: mpsc::UnboundedSender<CoreEvent>,
    make_event: F,
) where
    F: Fn() -> CoreEvent + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if events.send(make_event()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
