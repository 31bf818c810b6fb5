//! Client lifecycle: tracks live producers and consumers and drives an
//! orderly quiesce-then-stop shutdown.

use crate::child::ChildConsumerFactory;
use crate::config::ConsumerConfig;
use crate::connection::ConnectionPool;
use crate::consumer::MultiTopicConsumer;
use crate::error::MagnetarClientError;
use crate::lookup::LookupService;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Lifecycle state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

struct ClientStateCell(AtomicU8);

impl ClientStateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ClientState::Active as u8))
    }

    fn get(&self) -> ClientState {
        match self.0.load(Ordering::Acquire) {
            0 => ClientState::Active,
            1 => ClientState::Closing,
            _ => ClientState::Closed,
        }
    }

    fn set(&self, state: ClientState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A producer or consumer the client tracks for shutdown
#[async_trait]
pub trait ClientObject: Send + Sync {
    async fn close(&self) -> Result<(), MagnetarClientError>;
}

#[async_trait]
impl ClientObject for MultiTopicConsumer {
    async fn close(&self) -> Result<(), MagnetarClientError> {
        self.dispose().await;
        Ok(())
    }
}

enum ClientEvent {
    AddProducer {
        id: u64,
        handle: Arc<dyn ClientObject>,
        reply: oneshot::Sender<Result<(), MagnetarClientError>>,
    },
    RemoveProducer {
        id: u64,
    },
    AddConsumer {
        id: u64,
        handle: Arc<dyn ClientObject>,
        reply: oneshot::Sender<Result<(), MagnetarClientError>>,
    },
    RemoveConsumer {
        id: u64,
    },
    Close {
        reply: oneshot::Sender<Result<(), MagnetarClientError>>,
    },
    Stop,
}

struct ClientActor {
    producers: HashMap<u64, Arc<dyn ClientObject>>,
    consumers: HashMap<u64, Arc<dyn ClientObject>>,
    state: Arc<ClientStateCell>,
    pool: Arc<dyn ConnectionPool>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::AddProducer { id, handle, reply } => {
                    let _ = reply.send(self.add(id, handle, true));
                }
                ClientEvent::AddConsumer { id, handle, reply } => {
                    let _ = reply.send(self.add(id, handle, false));
                }
                ClientEvent::RemoveProducer { id } => {
                    self.producers.remove(&id);
                    self.maybe_stop();
                }
                ClientEvent::RemoveConsumer { id } => {
                    self.consumers.remove(&id);
                    self.maybe_stop();
                }
                ClientEvent::Close { reply } => {
                    let _ = reply.send(self.close_all().await);
                    self.maybe_stop();
                }
                ClientEvent::Stop => {
                    self.pool.close_all().await;
                    self.state.set(ClientState::Closed);
                    info!("client stopped");
                    break;
                }
            }
        }
    }

    fn add(
        &mut self,
        id: u64,
        handle: Arc<dyn ClientObject>,
        producer: bool,
    ) -> Result<(), MagnetarClientError> {
        if self.state.get() != ClientState::Active {
            return Err(MagnetarClientError::already_closed("client"));
        }
        if producer {
            self.producers.insert(id, handle);
        } else {
            self.consumers.insert(id, handle);
        }
        Ok(())
    }

    async fn close_all(&mut self) -> Result<(), MagnetarClientError> {
        match self.state.get() {
            ClientState::Closing | ClientState::Closed => return Ok(()),
            ClientState::Active => {}
        }
        self.state.set(ClientState::Closing);

        let children: Vec<Arc<dyn ClientObject>> = self
            .producers
            .values()
            .chain(self.consumers.values())
            .cloned()
            .collect();
        let results = join_all(children.iter().map(|child| child.close())).await;

        if let Some(e) = results.into_iter().find_map(Result::err) {
            warn!(error = %e, "client close failed, staying active");
            self.state.set(ClientState::Active);
            return Err(e);
        }

        self.producers.clear();
        self.consumers.clear();
        Ok(())
    }

    fn maybe_stop(&self) {
        if self.state.get() == ClientState::Closing
            && self.producers.is_empty()
            && self.consumers.is_empty()
        {
            let _ = self.events_tx.send(ClientEvent::Stop);
        }
    }
}

struct ClientInner {
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Arc<ClientStateCell>,
    lookup: Arc<dyn LookupService>,
    factory: Arc<dyn ChildConsumerFactory>,
    next_id: AtomicU64,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.state.get() == ClientState::Active {
            let (reply, _) = oneshot::channel();
            let _ = self.events.send(ClientEvent::Close { reply });
        }
    }
}

/// Entry point for creating consumers against one broker service.
#[derive(Clone)]
pub struct MagnetarClient {
    inner: Arc<ClientInner>,
}

impl MagnetarClient {
    pub fn new(
        lookup: Arc<dyn LookupService>,
        pool: Arc<dyn ConnectionPool>,
        factory: Arc<dyn ChildConsumerFactory>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ClientStateCell::new());
        let actor = ClientActor {
            producers: HashMap::new(),
            consumers: HashMap::new(),
            state: state.clone(),
            pool,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(actor.run(events_rx));

        Self {
            inner: Arc::new(ClientInner {
                events: events_tx,
                state,
                lookup,
                factory,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        self.inner.state.get()
    }

    /// The broker service URL this client resolves against
    pub fn service_url(&self) -> &str {
        self.inner.lookup.service_url()
    }

    fn ensure_active(&self) -> Result<(), MagnetarClientError> {
        match self.inner.state.get() {
            ClientState::Active => Ok(()),
            _ => Err(MagnetarClientError::already_closed("client")),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(
        &self,
        id: u64,
        handle: Arc<dyn ClientObject>,
        producer: bool,
    ) -> Result<(), MagnetarClientError> {
        let (tx, rx) = oneshot::channel();
        let event = if producer {
            ClientEvent::AddProducer {
                id,
                handle,
                reply: tx,
            }
        } else {
            ClientEvent::AddConsumer {
                id,
                handle,
                reply: tx,
            }
        };
        self.inner
            .events
            .send(event)
            .map_err(|_| MagnetarClientError::already_closed("client"))?;
        rx.await
            .map_err(|_| MagnetarClientError::already_closed("client"))?
    }

    /// Create a multi-topic consumer owned by this client.
    pub async fn create_multi_topic_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<MultiTopicConsumer, MagnetarClientError> {
        self.ensure_active()?;
        let id = self.next_id();
        let hook: Box<dyn FnOnce() + Send> = {
            let events = self.inner.events.clone();
            Box::new(move || {
                let _ = events.send(ClientEvent::RemoveConsumer { id });
            })
        };
        let consumer = MultiTopicConsumer::subscribe_with_hook(
            config,
            self.inner.factory.clone(),
            self.inner.lookup.clone(),
            Some(hook),
        )
        .await?;

        if let Err(e) = self.register(id, Arc::new(consumer.clone()), false).await {
            consumer.dispose().await;
            return Err(e);
        }
        Ok(consumer)
    }

    /// Track an externally created producer handle for shutdown.
    pub async fn register_producer(
        &self,
        handle: Arc<dyn ClientObject>,
    ) -> Result<u64, MagnetarClientError> {
        self.ensure_active()?;
        let id = self.next_id();
        self.register(id, handle, true).await?;
        Ok(id)
    }

    /// Forget a producer previously registered.
    pub fn deregister_producer(&self, id: u64) {
        let _ = self.inner.events.send(ClientEvent::RemoveProducer { id });
    }

    /// Close every tracked producer and consumer, then the connection pool.
    /// On any child failure the client stays active and the first error is
    /// reported.
    pub async fn close(&self) -> Result<(), MagnetarClientError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .events
            .send(ClientEvent::Close { reply: tx })
            .map_err(|_| MagnetarClientError::already_closed("client"))?;
        rx.await
            .map_err(|_| MagnetarClientError::already_closed("client"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct StubObject {
        closed: AtomicBool,
        fail: bool,
    }

    impl StubObject {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                fail,
            })
        }
    }

    #[async_trait]
    impl ClientObject for StubObject {
        async fn close(&self) -> Result<(), MagnetarClientError> {
            if self.fail {
                return Err(MagnetarClientError::connection("close refused"));
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubPool {
        closed: AtomicBool,
    }

    #[async_trait]
    impl ConnectionPool for StubPool {
        async fn close_all(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct StubLookup;

    #[async_trait]
    impl crate::lookup::LookupService for StubLookup {
        async fn get_partitioned_topic_metadata(
            &self,
            _topic: &str,
        ) -> Result<crate::lookup::PartitionedTopicMetadata, MagnetarClientError> {
            Ok(crate::lookup::PartitionedTopicMetadata { partitions: 0 })
        }

        async fn get_topics_of_namespace(
            &self,
            _namespace: &str,
        ) -> Result<Vec<String>, MagnetarClientError> {
            Ok(Vec::new())
        }

        fn service_url(&self) -> &str {
            "magnetar://localhost:6650"
        }
    }

    struct NoFactory;

    #[async_trait]
    impl ChildConsumerFactory for NoFactory {
        async fn create(
            &self,
            topic: crate::message::CompleteTopicName,
            _options: crate::child::ChildOptions,
        ) -> Result<Arc<dyn crate::child::ChildConsumer>, MagnetarClientError> {
            Err(MagnetarClientError::child(topic.as_str(), "no transport"))
        }
    }

    fn client(pool: Arc<StubPool>) -> MagnetarClient {
        MagnetarClient::new(Arc::new(StubLookup), pool, Arc::new(NoFactory))
    }

    async fn wait_for_state(client: &MagnetarClient, state: ClientState) {
        for _ in 0..100 {
            if client.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_close_quiesces_then_stops() {
        let pool = Arc::new(StubPool {
            closed: AtomicBool::new(false),
        });
        let client = client(pool.clone());

        let producer = StubObject::new(false);
        client.register_producer(producer.clone()).await.unwrap();

        client.close().await.unwrap();
        wait_for_state(&client, ClientState::Closed).await;

        assert!(producer.closed.load(Ordering::SeqCst));
        assert!(pool.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_failure_reverts_to_active() {
        let pool = Arc::new(StubPool {
            closed: AtomicBool::new(false),
        });
        let client = client(pool.clone());

        client
            .register_producer(StubObject::new(true))
            .await
            .unwrap();

        let result = client.close().await;
        assert!(result.is_err());
        assert_eq!(client.state(), ClientState::Active);
        assert!(!pool.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let pool = Arc::new(StubPool {
            closed: AtomicBool::new(false),
        });
        let client = client(pool.clone());

        client.close().await.unwrap();
        wait_for_state(&client, ClientState::Closed).await;

        let result = client.register_producer(StubObject::new(false)).await;
        assert!(matches!(
            result,
            Err(MagnetarClientError::AlreadyClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_consumer_creation_fails_through_factory() {
        let pool = Arc::new(StubPool {
            closed: AtomicBool::new(false),
        });
        let client = client(pool);

        let config = ConsumerConfig::builder()
            .subscription_name("sub")
            .topics(vec!["persistent://tnt/ns/t"])
            .build();
        let result = client.create_multi_topic_consumer(config).await;
        assert!(matches!(result, Err(MagnetarClientError::InitFailed { .. })));
    }
}
