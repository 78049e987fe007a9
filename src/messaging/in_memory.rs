//! In-process broker for tests and single-process use.
//!
//! Implements the same boundary as the AMQP backend:
//! - queues deliver each message to one receiver
//! - topics copy each message into every subscription
//! - delivered messages stay in flight until completed or abandoned; an
//!   abandoned message goes to the back of the entity, marked as redelivered
//! - releasing a receive-channel puts its in-flight messages back at the
//!   front of the entity, marked as redelivered
//!
//! In strict mode every destination must be declared first, so sends and
//! receives against unknown names fail the way a managed broker would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use super::broker::{BrokerClient, Connector, ReceiverChannel, SenderChannel};
use super::error::{BusError, Result};
use super::types::{ConnectionId, DestinationKind, OutgoingMessage, ReceiveSource, ReceivedMessage};

/// A message the broker accepted from a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedMessage {
    pub kind: DestinationKind,
    pub destination: String,
    pub body: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Default)]
struct Entity {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, StoredMessage>,
    completed: Vec<StoredMessage>,
    next_tag: u64,
    notify: Arc<Notify>,
    deleted: bool,
}

#[derive(Default)]
struct BrokerState {
    strict: bool,
    // keyed by entity path
    entities: HashMap<String, Entity>,
    // topic name -> subscription names
    topics: HashMap<String, BTreeSet<String>>,
    accepted: Vec<AcceptedMessage>,
    open_senders: usize,
    open_receivers: usize,
    receivers_opened: usize,
}

impl BrokerState {
    fn live_entity(&self, path: &str) -> bool {
        self.entities.get(path).is_some_and(|e| !e.deleted)
    }

    fn ensure_entity(&mut self, path: &str) {
        let replace = self.entities.get(path).map_or(true, |e| e.deleted);
        if replace {
            if let Some(old) = self.entities.insert(path.to_string(), Entity::default()) {
                old.notify.notify_waiters();
            }
        }
    }

    fn ensure_topic(&mut self, topic: &str) {
        self.topics.entry(topic.to_string()).or_default();
    }

    fn ensure_subscription(&mut self, topic: &str, subscription: &str) -> String {
        self.ensure_topic(topic);
        if let Some(subscriptions) = self.topics.get_mut(topic) {
            subscriptions.insert(subscription.to_string());
        }
        let path = subscription_path(topic, subscription);
        self.ensure_entity(&path);
        path
    }

    fn push(&mut self, path: &str, message: &OutgoingMessage) {
        if let Some(entity) = self.entities.get_mut(path) {
            entity.ready.push_back(StoredMessage {
                message_id: message.id.clone(),
                body: message.body.clone(),
                enqueued_at: Utc::now(),
                delivery_count: 0,
            });
            entity.notify.notify_one();
        }
    }

    fn check_destination(&mut self, kind: DestinationKind, name: &str) -> Result<()> {
        let known = match kind {
            DestinationKind::Queue => self.live_entity(name),
            DestinationKind::Topic => self.topics.contains_key(name),
        };
        if known {
            return Ok(());
        }
        if self.strict {
            return Err(BusError::send(name, format!("{} '{}' not found", kind, name)));
        }
        match kind {
            DestinationKind::Queue => self.ensure_entity(name),
            DestinationKind::Topic => self.ensure_topic(name),
        }
        Ok(())
    }

    fn enqueue(&mut self, kind: DestinationKind, name: &str, message: &OutgoingMessage) -> Result<()> {
        self.check_destination(kind, name)?;
        match kind {
            DestinationKind::Queue => self.push(name, message),
            DestinationKind::Topic => {
                let subscriptions: Vec<String> = self
                    .topics
                    .get(name)
                    .map(|subs| subs.iter().cloned().collect())
                    .unwrap_or_default();
                for subscription in subscriptions {
                    self.push(&subscription_path(name, &subscription), message);
                }
            }
        }
        self.accepted.push(AcceptedMessage {
            kind,
            destination: name.to_string(),
            body: message.body.clone(),
        });
        Ok(())
    }

    fn resolve_source(&mut self, source: &ReceiveSource) -> Result<String> {
        let path = source.entity_path();
        if self.live_entity(&path) {
            return Ok(path);
        }
        if self.strict {
            return Err(BusError::receive(path, "entity not found"));
        }
        Ok(match source {
            ReceiveSource::Queue(name) => {
                self.ensure_entity(name);
                path
            }
            ReceiveSource::Subscription {
                topic,
                subscription,
            } => self.ensure_subscription(topic, subscription),
        })
    }
}

fn subscription_path(topic: &str, subscription: &str) -> String {
    ReceiveSource::Subscription {
        topic: topic.to_string(),
        subscription: subscription.to_string(),
    }
    .entity_path()
}

/// Shared handle to one in-process broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only knows explicitly declared destinations.
    pub fn strict() -> Self {
        let broker = Self::default();
        broker.lock().strict = true;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn declare_queue(&self, name: &str) {
        self.lock().ensure_entity(name);
    }

    pub fn declare_topic(&self, name: &str) {
        self.lock().ensure_topic(name);
    }

    pub fn declare_subscription(&self, topic: &str, subscription: &str) {
        self.lock().ensure_subscription(topic, subscription);
    }

    /// Remove an entity. Receivers reading from it fail on their next wait.
    pub fn delete(&self, source: &ReceiveSource) {
        let mut state = self.lock();
        if let ReceiveSource::Subscription {
            topic,
            subscription,
        } = source
        {
            if let Some(subscriptions) = state.topics.get_mut(topic) {
                subscriptions.remove(subscription);
            }
        }
        if let Some(entity) = state.entities.get_mut(&source.entity_path()) {
            entity.deleted = true;
            entity.ready.clear();
            entity.in_flight.clear();
            entity.notify.notify_waiters();
        }
    }

    pub fn client(&self) -> InMemoryClient {
        InMemoryClient {
            broker: self.clone(),
        }
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
            connects: AtomicUsize::new(0),
        }
    }

    /// Every message accepted so far, in acceptance order.
    pub fn accepted(&self) -> Vec<AcceptedMessage> {
        self.lock().accepted.clone()
    }

    /// Bodies of completed messages for an entity, in completion order.
    pub fn completed(&self, source: &ReceiveSource) -> Vec<String> {
        self.lock()
            .entities
            .get(&source.entity_path())
            .map(|e| e.completed.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered but not yet completed.
    pub fn in_flight(&self, source: &ReceiveSource) -> usize {
        self.lock()
            .entities
            .get(&source.entity_path())
            .map_or(0, |e| e.in_flight.len())
    }

    /// Waiting for delivery.
    pub fn pending(&self, source: &ReceiveSource) -> usize {
        self.lock()
            .entities
            .get(&source.entity_path())
            .map_or(0, |e| e.ready.len())
    }

    /// Send and receive channels currently open.
    pub fn open_channels(&self) -> usize {
        let state = self.lock();
        state.open_senders + state.open_receivers
    }

    /// Receive channels opened since the broker was created.
    pub fn receivers_opened(&self) -> usize {
        self.lock().receivers_opened
    }
}

#[derive(Clone)]
pub struct InMemoryClient {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerClient for InMemoryClient {
    async fn open_sender(
        &self,
        kind: DestinationKind,
        name: &str,
    ) -> Result<Box<dyn SenderChannel>> {
        {
            let mut state = self.broker.lock();
            state.check_destination(kind, name)?;
            state.open_senders += 1;
        }
        Ok(Box::new(InMemorySender {
            broker: self.broker.clone(),
            kind,
            name: name.to_string(),
            open: true,
        }))
    }

    async fn open_receiver(&self, source: &ReceiveSource) -> Result<Box<dyn ReceiverChannel>> {
        let path = {
            let mut state = self.broker.lock();
            let path = state.resolve_source(source)?;
            state.open_receivers += 1;
            state.receivers_opened += 1;
            path
        };
        debug!(entity = %path, "Opened in-memory receiver");
        Ok(Box::new(InMemoryReceiver {
            broker: self.broker.clone(),
            path,
            held: HashSet::new(),
            open: true,
        }))
    }
}

pub struct InMemoryConnector {
    broker: InMemoryBroker,
    connects: AtomicUsize,
}

impl InMemoryConnector {
    /// How many clients this connector has built.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, id: &ConnectionId) -> Result<Arc<dyn BrokerClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(connection = %id, "Connected to in-memory broker");
        Ok(Arc::new(self.broker.client()))
    }
}

struct InMemorySender {
    broker: InMemoryBroker,
    kind: DestinationKind,
    name: String,
    open: bool,
}

impl InMemorySender {
    fn release(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            self.broker.lock().open_senders -= 1;
        }
    }
}

#[async_trait]
impl SenderChannel for InMemorySender {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<()> {
        if !self.open {
            return Err(BusError::send(&self.name, "sender channel is closed"));
        }
        self.broker.lock().enqueue(self.kind, &self.name, message)
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemorySender {
    fn drop(&mut self) {
        self.release();
    }
}

struct InMemoryReceiver {
    broker: InMemoryBroker,
    path: String,
    held: HashSet<u64>,
    open: bool,
}

impl InMemoryReceiver {
    fn notifier(&self) -> Result<Arc<Notify>> {
        let state = self.broker.lock();
        match state.entities.get(&self.path) {
            Some(entity) if !entity.deleted => Ok(Arc::clone(&entity.notify)),
            _ => Err(BusError::receive(&self.path, "entity was deleted")),
        }
    }

    fn try_take(&mut self) -> Result<Option<ReceivedMessage>> {
        let mut state = self.broker.lock();
        let entity = match state.entities.get_mut(&self.path) {
            Some(entity) if !entity.deleted => entity,
            _ => return Err(BusError::receive(&self.path, "entity was deleted")),
        };
        let Some(mut stored) = entity.ready.pop_front() else {
            return Ok(None);
        };

        entity.next_tag += 1;
        let tag = entity.next_tag;
        stored.delivery_count += 1;
        let received = ReceivedMessage {
            message_id: stored.message_id.clone(),
            body: stored.body.clone(),
            delivery_tag: tag,
            redelivered: stored.delivery_count > 1,
            enqueued_at: Some(stored.enqueued_at),
        };
        entity.in_flight.insert(tag, stored);
        self.held.insert(tag);
        Ok(Some(received))
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.open, false) {
            return;
        }
        let mut state = self.broker.lock();
        state.open_receivers -= 1;

        let mut tags: Vec<u64> = self.held.drain().collect();
        tags.sort_unstable();
        if let Some(entity) = state.entities.get_mut(&self.path) {
            for tag in tags.into_iter().rev() {
                if let Some(message) = entity.in_flight.remove(&tag) {
                    entity.ready.push_front(message);
                    entity.notify.notify_one();
                }
            }
        }
    }
}

#[async_trait]
impl ReceiverChannel for InMemoryReceiver {
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>> {
        loop {
            let notify = self.notifier()?;
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before looking, so a push or delete in between still wakes us.
            notified.as_mut().enable();

            if let Some(message) = self.try_take()? {
                return Ok(Some(message));
            }
            notified.await;
        }
    }

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()> {
        let mut state = self.broker.lock();
        let entity = state
            .entities
            .get_mut(&self.path)
            .ok_or_else(|| BusError::receive(&self.path, "entity was deleted"))?;
        let stored = entity.in_flight.remove(&message.delivery_tag).ok_or_else(|| {
            BusError::receive(
                &self.path,
                format!("unknown delivery tag {}", message.delivery_tag),
            )
        })?;
        entity.completed.push(stored);
        self.held.remove(&message.delivery_tag);
        Ok(())
    }

    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<()> {
        let mut state = self.broker.lock();
        let entity = state
            .entities
            .get_mut(&self.path)
            .filter(|entity| !entity.deleted)
            .ok_or_else(|| BusError::receive(&self.path, "entity was deleted"))?;
        let stored = entity.in_flight.remove(&message.delivery_tag).ok_or_else(|| {
            BusError::receive(
                &self.path,
                format!("unknown delivery tag {}", message.delivery_tag),
            )
        })?;
        // Behind whatever is already waiting, so one bad message cannot starve the rest.
        entity.ready.push_back(stored);
        entity.notify.notify_one();
        self.held.remove(&message.delivery_tag);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryReceiver {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(name: &str) -> ReceiveSource {
        ReceiveSource::Queue(name.to_string())
    }

    #[tokio::test]
    async fn queue_delivers_in_order_and_completes() {
        let broker = InMemoryBroker::new();
        let client = broker.client();

        let mut sender = client.open_sender(DestinationKind::Queue, "q1").await.unwrap();
        sender.send(&OutgoingMessage::new("one")).await.unwrap();
        sender.send(&OutgoingMessage::new("two")).await.unwrap();
        sender.close().await.unwrap();

        let mut receiver = client.open_receiver(&queue("q1")).await.unwrap();
        let first = receiver.receive().await.unwrap().unwrap();
        let second = receiver.receive().await.unwrap().unwrap();
        assert_eq!(first.body, "one");
        assert_eq!(second.body, "two");
        assert_eq!(broker.in_flight(&queue("q1")), 2);

        receiver.complete(&first).await.unwrap();
        assert_eq!(broker.completed(&queue("q1")), vec!["one"]);
        assert_eq!(broker.in_flight(&queue("q1")), 1);
    }

    #[tokio::test]
    async fn released_receiver_returns_unacked_messages() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        let mut sender = client.open_sender(DestinationKind::Queue, "q1").await.unwrap();
        sender.send(&OutgoingMessage::new("retry-me")).await.unwrap();

        let mut receiver = client.open_receiver(&queue("q1")).await.unwrap();
        let delivered = receiver.receive().await.unwrap().unwrap();
        assert!(!delivered.redelivered);
        receiver.close().await.unwrap();
        assert_eq!(broker.pending(&queue("q1")), 1);

        let mut again = client.open_receiver(&queue("q1")).await.unwrap();
        let redelivered = again.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.body, "retry-me");
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn abandoned_message_queues_behind_waiting_ones() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        let mut sender = client.open_sender(DestinationKind::Queue, "q1").await.unwrap();
        sender.send(&OutgoingMessage::new("first")).await.unwrap();
        sender.send(&OutgoingMessage::new("second")).await.unwrap();

        let mut receiver = client.open_receiver(&queue("q1")).await.unwrap();
        let first = receiver.receive().await.unwrap().unwrap();
        receiver.abandon(&first).await.unwrap();
        assert_eq!(broker.in_flight(&queue("q1")), 0);
        assert_eq!(broker.pending(&queue("q1")), 2);

        let next = receiver.receive().await.unwrap().unwrap();
        assert_eq!(next.body, "second");
        let again = receiver.receive().await.unwrap().unwrap();
        assert_eq!(again.body, "first");
        assert!(again.redelivered);

        // Already handed back; the tag is no longer ours.
        assert!(matches!(
            receiver.abandon(&first).await,
            Err(BusError::Receive { .. })
        ));
    }

    #[tokio::test]
    async fn topic_copies_to_every_subscription() {
        let broker = InMemoryBroker::new();
        broker.declare_subscription("t1", "s1");
        broker.declare_subscription("t1", "s2");

        let client = broker.client();
        let mut sender = client.open_sender(DestinationKind::Topic, "t1").await.unwrap();
        sender.send(&OutgoingMessage::new("fan-out")).await.unwrap();

        for sub in ["s1", "s2"] {
            let source = ReceiveSource::Subscription {
                topic: "t1".to_string(),
                subscription: sub.to_string(),
            };
            assert_eq!(broker.pending(&source), 1);
        }
        assert_eq!(broker.accepted().len(), 1);
    }

    #[tokio::test]
    async fn strict_broker_rejects_unknown_destinations() {
        let broker = InMemoryBroker::strict();
        let client = broker.client();

        let err = client.open_sender(DestinationKind::Queue, "missing").await.err().unwrap();
        assert!(matches!(err, BusError::Send { .. }));

        let err = client.open_receiver(&queue("missing")).await.err().unwrap();
        assert!(matches!(err, BusError::Receive { .. }));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn deleting_an_entity_fails_waiting_receivers() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        let mut receiver = client.open_receiver(&queue("q1")).await.unwrap();

        let waiting = tokio::spawn(async move { receiver.receive().await });
        tokio::task::yield_now().await;
        broker.delete(&queue("q1"));

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(BusError::Receive { .. })));
    }

    #[tokio::test]
    async fn dropped_channels_are_released() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        {
            let _sender = client.open_sender(DestinationKind::Queue, "q1").await.unwrap();
            let _receiver = client.open_receiver(&queue("q1")).await.unwrap();
            assert_eq!(broker.open_channels(), 2);
        }
        assert_eq!(broker.open_channels(), 0);
    }
}
