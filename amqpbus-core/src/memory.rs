//! In-process broker with AMQP topic-exchange semantics.
//!
//! Routing follows the broker's rules (`*` is exactly one word, `#` is zero
//! or more), unacknowledged deliveries go back to their queue when the
//! session that received them dies, and exclusive or auto-delete queues
//! disappear with their owner. Faults can be injected with
//! [`MemoryBroker::refuse_connections`] and [`MemoryBroker::sever_connections`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    Acknowledger, Broker, BrokerConnection, Delivery, DeliveryStream, ExchangeOptions,
    MessagingError, QueueOptions, Result,
};

/// Match a routing key against a binding pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// A message as it went through an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    data: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    connection: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    key: String,
}

struct Unacked {
    connection: u64,
    queue: String,
    message: Message,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    live: HashMap<u64, Arc<AtomicBool>>,
    refuse: usize,
    next_id: u64,
    connection_attempts: usize,
    bindings_declared: usize,
    published: Vec<Published>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

type Shared = Mutex<State>;

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hand queued messages to consumers, round-robin.
fn pump(shared: &Arc<Shared>, state: &mut State, queue_name: &str) {
    loop {
        let tag = state.next_id();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        if queue.consumers.is_empty() {
            return;
        }
        let Some(message) = queue.messages.pop_front() else {
            return;
        };

        let idx = queue.next % queue.consumers.len();
        let consumer = &queue.consumers[idx];
        let connection = consumer.connection;
        let delivery = Delivery::new(
            message.routing_key.clone(),
            message.redelivered,
            message.data.clone(),
            Arc::new(MemoryAcker {
                shared: Arc::clone(shared),
                tag,
            }),
        );

        if consumer.tx.send(Ok(delivery)).is_err() {
            // receiver dropped without cancelling
            queue.consumers.remove(idx);
            queue.messages.push_front(message);
            continue;
        }
        queue.next = idx + 1;

        state.unacked.insert(
            tag,
            Unacked {
                connection,
                queue: queue_name.to_string(),
                message,
            },
        );
    }
}

fn delete_queue(state: &mut State, queue_name: &str) {
    state.queues.remove(queue_name);
    state.bindings.retain(|b| b.queue != queue_name);
}

/// Tear down everything a session owned. With `severed`, its consumers see
/// a transport error before their streams end.
fn drop_connection(shared: &Arc<Shared>, state: &mut State, connection: u64, severed: bool) {
    if let Some(alive) = state.live.remove(&connection) {
        alive.store(false, Ordering::SeqCst);
    }

    let mut doomed = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        let before = queue.consumers.len();
        queue.consumers.retain(|c| {
            if c.connection != connection {
                return true;
            }
            if severed {
                let _ = c
                    .tx
                    .send(Err(MessagingError::Subscribe("connection lost".into())));
            }
            false
        });
        let lost_consumers = before != queue.consumers.len();
        if queue.owner == Some(connection)
            || (queue.options.auto_delete && lost_consumers && queue.consumers.is_empty())
        {
            doomed.push(name.clone());
        }
    }
    for name in &doomed {
        delete_queue(state, name);
    }

    let tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| u.connection == connection)
        .map(|(tag, _)| *tag)
        .collect();
    let mut touched = Vec::new();
    for tag in tags {
        if let Some(mut unacked) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                unacked.message.redelivered = true;
                queue.messages.push_front(unacked.message);
                touched.push(unacked.queue);
            }
        }
    }
    touched.sort();
    touched.dedup();
    for name in touched {
        pump(shared, state, &name);
    }
}

/// In-memory [`Broker`]. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        lock(&self.shared).refuse = n;
    }

    /// Kill every live session as if the socket dropped.
    pub fn sever_connections(&self) {
        let mut state = lock(&self.shared);
        let ids: Vec<u64> = state.live.keys().copied().collect();
        for id in ids {
            drop_connection(&self.shared, &mut state, id, true);
        }
        debug!("memory broker severed all connections");
    }

    pub fn connection_attempts(&self) -> usize {
        lock(&self.shared).connection_attempts
    }

    pub fn live_connections(&self) -> usize {
        lock(&self.shared).live.len()
    }

    /// Number of bind operations performed so far, duplicates included.
    pub fn bindings_declared(&self) -> usize {
        lock(&self.shared).bindings_declared
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        lock(&self.shared)
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.shared).queues.contains_key(queue)
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock(&self.shared)
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Delete a queue from the broker side. Its consumers are cancelled and
    /// their streams end while the connections stay up.
    pub fn delete_queue(&self, queue: &str) {
        delete_queue(&mut lock(&self.shared), queue);
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.shared).unacked.len()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.shared).published.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = lock(&self.shared);
        state.connection_attempts += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(MessagingError::Connection("connection refused".into()));
        }

        let id = state.next_id();
        let alive = Arc::new(AtomicBool::new(true));
        state.live.insert(id, Arc::clone(&alive));

        Ok(Arc::new(MemoryConnection {
            id,
            alive,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    id: u64,
    alive: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    fn guard(&self) -> Result<MutexGuard<'_, State>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection("connection closed".into()));
        }
        Ok(lock(&self.shared))
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()> {
        let mut state = self.guard()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != options => Err(MessagingError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), options);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.guard()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.id) {
                return Err(MessagingError::Topology(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                )));
            }
            if existing.options != options {
                return Err(MessagingError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    name
                )));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            Queue {
                options,
                owner: options.exclusive.then_some(self.id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        let mut state = self.guard()?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Topology(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        state.bindings_declared += 1;
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.key == binding_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                key: binding_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.guard()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(MessagingError::Subscribe(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            };
            if q.owner.is_some_and(|owner| owner != self.id) {
                return Err(MessagingError::Subscribe(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    queue
                )));
            }
            if q.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(MessagingError::Subscribe(format!(
                    "NOT_ALLOWED - consumer tag '{}' in use",
                    consumer_tag
                )));
            }
            q.consumers.push(Consumer {
                tag: consumer_tag.to_string(),
                connection: self.id,
                tx,
            });
        }
        pump(&self.shared, &mut state, queue);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.guard()?;
        let mut doomed = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.connection == self.id));
            if queue.options.auto_delete
                && before != queue.consumers.len()
                && queue.consumers.is_empty()
            {
                doomed.push(name.clone());
            }
        }
        for name in &doomed {
            delete_queue(&mut state, name);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MessagingError::Publish("connection closed".into()));
        }
        let mut state = lock(&self.shared);
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Publish(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        state.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.messages.push_back(Message {
                    routing_key: routing_key.to_string(),
                    data: body.to_vec(),
                    redelivered: false,
                });
            }
            pump(&self.shared, &mut state, &name);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = lock(&self.shared);
        drop_connection(&self.shared, &mut state, self.id, false);
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<()> {
        let mut state = lock(&self.shared);
        let Some(mut unacked) = state.unacked.remove(&self.tag) else {
            return Err(MessagingError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            )));
        };
        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                unacked.message.redelivered = true;
                queue.messages.push_front(unacked.message);
            }
            let name = unacked.queue;
            pump(&self.shared, &mut state, &name);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }

    async fn reject(&self) -> Result<()> {
        self.settle(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{EXCHANGE_OPTIONS, REQUEST_QUEUE_OPTIONS, RESPONSE_QUEUE_OPTIONS};

    #[test]
    fn topic_matching() {
        assert!(topic_matches("test.request.*", "test.request.7"));
        assert!(!topic_matches("test.request.*", "test.request"));
        assert!(!topic_matches("test.request.*", "test.request.7.8"));
        assert!(topic_matches("test.#", "test"));
        assert!(topic_matches("test.#", "test.response.7"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.response.#", "test.response.7.x"));
        assert!(!topic_matches("test.response.7", "test.response.8"));
    }

    async fn setup(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
        let conn = broker.connect().await.unwrap();
        conn.declare_exchange("ex", EXCHANGE_OPTIONS).await.unwrap();
        conn.declare_queue("q", REQUEST_QUEUE_OPTIONS).await.unwrap();
        conn.bind_queue("q", "ex", "t.request.*").await.unwrap();
        conn
    }

    #[tokio::test]
    async fn queued_messages_reach_a_late_consumer() {
        let broker = MemoryBroker::new();
        let conn = setup(&broker).await;
        conn.publish("ex", "t.request.1", b"one").await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(1));

        let mut stream = conn.consume("q", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.data, b"one".to_vec());
        assert_eq!(delivery.routing_key, "t.request.1");
        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_after_connection_loss() {
        let broker = MemoryBroker::new();
        let conn = setup(&broker).await;
        let mut stream = conn.consume("q", "c1").await.unwrap();
        conn.publish("ex", "t.request.1", b"one").await.unwrap();
        let _unacked = stream.next().await.unwrap().unwrap();

        broker.sever_connections();
        assert!(matches!(stream.next().await, Some(Err(_))));
        assert!(stream.next().await.is_none());
        assert!(!conn.is_connected());
        assert_eq!(broker.queue_depth("q"), Some(1));

        let conn = broker.connect().await.unwrap();
        let mut stream = conn.consume("q", "c1").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn nack_with_requeue_puts_message_back() {
        let broker = MemoryBroker::new();
        let conn = setup(&broker).await;
        conn.publish("ex", "t.request.1", b"one").await.unwrap();
        let mut stream = conn.consume("q", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.nack(true).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.reject().await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn exclusive_queue_dies_with_its_consumer() {
        let broker = MemoryBroker::new();
        let conn = setup(&broker).await;
        let name = conn.declare_queue("", RESPONSE_QUEUE_OPTIONS).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let other = broker.connect().await.unwrap();
        assert!(other.consume(&name, "x").await.is_err());

        let _stream = conn.consume(&name, "resp").await.unwrap();
        conn.cancel("resp").await.unwrap();
        assert!(!broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn refused_connections_count_as_attempts() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connection_attempts(), 3);
        assert_eq!(broker.live_connections(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_consumers() {
        let broker = MemoryBroker::new();
        let conn = setup(&broker).await;
        let mut stream = conn.consume("q", "c1").await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(conn.publish("ex", "t.request.1", b"x").await.is_err());
    }
}
