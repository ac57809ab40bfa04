//! The worker: one consume loop over one request queue.
//!
//! States are `Stopped -> Running <-> Reconnecting -> Stopped`. Transport
//! failures while running lead to a reconnect and a fresh topology
//! declaration, never to `Stopped`. Only [`Worker::stop`] or the broker
//! cancelling the consumer on a healthy connection end the loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::supervisor::Session;
use crate::{
    codec, topology, Broker, BrokerConnection, ConnectionSupervisor, Delivery, DeliveryStream,
    Dispatch, MessagingError, Responder, Result, WorkerConfig, WorkerIdentity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Running = 1,
    Reconnecting = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Running,
            2 => WorkerState::Reconnecting,
            _ => WorkerState::Stopped,
        }
    }
}

/// A request/response worker bound to `<service>_req`.
///
/// Cloning yields another handle to the same worker, so a signal handler can
/// hold one and call [`Worker::stop`].
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<WorkerIdentity>,
    config: WorkerConfig,
    dispatch: Arc<dyn Dispatch>,
    supervisor: Arc<ConnectionSupervisor>,
    responder: Responder,
    state: AtomicU8,
    cancel: CancellationToken,
    in_flight: Arc<Semaphore>,
}

enum SessionEnd {
    Stopped,
    Exhausted,
    Broken(MessagingError),
    // failed on a live connection before handing out a single delivery
    Unusable(MessagingError),
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        let identity = Arc::new(config.identity()?);
        if config.max_in_flight == 0 {
            return Err(MessagingError::Config(
                "max_in_flight must be at least 1".into(),
            ));
        }

        let cancel = CancellationToken::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            identity.service_name(),
            broker,
            cancel.clone(),
        ));
        let responder = Responder::new(
            Arc::clone(&identity),
            Arc::clone(&supervisor),
            config.publish_retry_interval(),
        );
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));

        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                config,
                dispatch,
                supervisor,
                responder,
                state: AtomicU8::new(WorkerState::Stopped as u8),
                cancel,
                in_flight,
            }),
        })
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.inner.identity
    }

    pub fn responder(&self) -> Responder {
        self.inner.responder.clone()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Spawn the consume loop. Returns `None` if it is already running or the
    /// worker has been stopped with [`Worker::stop`].
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.cancel.is_cancelled() {
            warn!(
                service = %self.inner.identity.service_name(),
                "Worker was stopped; build a new one to consume again"
            );
            return None;
        }
        if self
            .inner
            .state
            .compare_exchange(
                WorkerState::Stopped as u8,
                WorkerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(service = %self.inner.identity.service_name(), "Worker already running");
            return None;
        }

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(inner.run()))
    }

    /// Request shutdown: mark the worker stopped, wake the loop out of any
    /// wait, and close the connection. Idempotent. Does not wait for the
    /// loop task to finish; await its `JoinHandle` for that.
    pub async fn stop(&self) {
        debug!(service = %self.inner.identity.service_name(), "Stop requested");
        self.inner
            .state
            .store(WorkerState::Stopped as u8, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.inner.supervisor.close().await;
    }
}

impl Inner {
    fn transition(&self, from: WorkerState, to: WorkerState) {
        // a concurrent stop() wins over internal transitions
        let _ = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    async fn run(self: Arc<Self>) {
        let service = self.identity.service_name();
        let interval = self.config.connect_retry_interval();
        info!(
            service = %service,
            queue = %self.identity.request_queue_name(),
            "Entering consumer loop"
        );

        let mut session = match self.supervisor.wait_for_connection(interval).await {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(service = %service, error = %e, "Gave up waiting for broker");
                None
            }
        };

        while let Some(current) = session.take() {
            match self.consume_session(&current).await {
                SessionEnd::Stopped => break,
                SessionEnd::Exhausted => {
                    info!(service = %service, "Consumer cancelled, breaking out of consumer loop");
                    break;
                }
                SessionEnd::Broken(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    error!(service = %service, error = %e, "Broker session lost, reconnecting");
                    self.transition(WorkerState::Running, WorkerState::Reconnecting);
                    match self.supervisor.reconnect(current.generation, interval).await {
                        Ok(next) => session = Some(next),
                        Err(e) => debug!(service = %service, error = %e, "Reconnect abandoned"),
                    }
                }
                SessionEnd::Unusable(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    error!(
                        service = %service,
                        error = %e,
                        retry_in_ms = %interval.as_millis(),
                        "Could not consume on fresh connection, waiting before reconnect"
                    );
                    self.transition(WorkerState::Running, WorkerState::Reconnecting);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match self.supervisor.reconnect(current.generation, interval).await {
                        Ok(next) => session = Some(next),
                        Err(e) => debug!(service = %service, error = %e, "Reconnect abandoned"),
                    }
                }
            }
        }

        self.supervisor.close().await;
        self.state
            .store(WorkerState::Stopped as u8, Ordering::SeqCst);
        info!(service = %service, "Consumer loop exited");
    }

    async fn open_consumer(&self, connection: &dyn BrokerConnection) -> Result<DeliveryStream> {
        topology::declare_worker_topology(connection, &self.identity).await?;
        let tag = format!("consumer-{}", self.identity.service_name());
        connection
            .consume(self.identity.request_queue_name(), &tag)
            .await
    }

    async fn consume_session(self: &Arc<Self>, session: &Session) -> SessionEnd {
        let connection = session.connection.as_ref();
        let mut deliveries = match self.open_consumer(connection).await {
            Ok(deliveries) => deliveries,
            Err(e) => return SessionEnd::Unusable(e),
        };
        self.transition(WorkerState::Reconnecting, WorkerState::Running);

        info!(
            service = %self.identity.service_name(),
            exchange = %self.identity.exchange_name(),
            queue = %self.identity.request_queue_name(),
            binding_key = %self.identity.binding_key(),
            generation = session.generation,
            "Consuming requests"
        );

        let mut delivered = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    delivered = true;
                    self.handle(delivery).await
                }
                Some(Err(e)) if !delivered && connection.is_connected() => {
                    return SessionEnd::Unusable(e)
                }
                Some(Err(e)) => return SessionEnd::Broken(e),
                None if self.cancel.is_cancelled() => return SessionEnd::Stopped,
                None if connection.is_connected() => return SessionEnd::Exhausted,
                None => {
                    return SessionEnd::Broken(MessagingError::Subscribe(
                        "delivery stream ended with the connection".into(),
                    ))
                }
            }
        }
    }

    async fn handle(self: &Arc<Self>, delivery: Delivery) {
        if self.config.max_in_flight <= 1 {
            self.process(delivery).await;
            return;
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.process(delivery).await;
            drop(permit);
        });
    }

    async fn process(&self, delivery: Delivery) {
        let service = self.identity.service_name();
        let routing_key = delivery.routing_key.clone();
        let redelivered = delivery.redelivered;

        let (qid, payload) = match codec::decode(&delivery.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(
                    service = %service,
                    routing_key = %routing_key,
                    error = %e,
                    "Dropping undecodable request"
                );
                if let Err(e) = delivery.reject().await {
                    warn!(routing_key = %routing_key, error = %e, "Failed to reject undecodable request");
                }
                return;
            }
        };

        debug!(
            service = %service,
            routing_key = %routing_key,
            qid = ?qid,
            redelivered,
            "Dispatching request"
        );

        let dispatched = self.dispatch.dispatch(
            delivery,
            payload,
            qid.clone(),
            self.responder.clone(),
        );
        match AssertUnwindSafe(dispatched).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                service = %service,
                routing_key = %routing_key,
                qid = ?qid,
                redelivered,
                error = %e,
                "Dispatch failed"
            ),
            Err(panic) => error!(
                service = %service,
                routing_key = %routing_key,
                qid = ?qid,
                redelivered,
                panic = %panic_message(panic.as_ref()),
                "BUG: dispatch panicked"
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::dispatch_fn;
    use crate::memory::MemoryBroker;
    use crate::topology::RESPONSE_QUEUE_OPTIONS;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::{mpsc, Barrier};

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::new("TestConsumer", "Test", "test");
        config.connect_retry_ms = 5;
        config.publish_retry_ms = 5;
        config
    }

    type Seen = mpsc::UnboundedReceiver<(Value, Option<String>)>;

    /// Acks everything, records what it saw, and answers `{"msg": "ok", "echo": payload}`
    /// when a qid is present.
    fn echo_dispatch() -> (Arc<dyn Dispatch>, Seen) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatch = dispatch_fn(move |delivery: Delivery, payload: Value, qid: Option<String>, responder: Responder| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((payload.clone(), qid.clone()));
                delivery.ack().await?;
                if let Some(qid) = qid {
                    responder
                        .respond(&json!({"msg": "ok", "echo": payload}), &qid)
                        .await?;
                }
                Ok(())
            }
        });
        (dispatch, rx)
    }

    fn worker(broker: &MemoryBroker, config: WorkerConfig, dispatch: Arc<dyn Dispatch>) -> Worker {
        Worker::new(config, Arc::new(broker.clone()), dispatch).unwrap()
    }

    /// A caller's connection with the worker's topology declared, so requests
    /// are queued even before the worker consumes.
    async fn client(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
        let conn = broker.connect().await.unwrap();
        topology::declare_topology(conn.as_ref(), "Test", "TestConsumer_req", "test.request.*")
            .await
            .unwrap();
        conn
    }

    async fn listen(conn: &Arc<dyn BrokerConnection>, key: &str) -> DeliveryStream {
        let queue = conn
            .declare_queue("", RESPONSE_QUEUE_OPTIONS)
            .await
            .unwrap();
        conn.bind_queue(&queue, "Test", key).await.unwrap();
        conn.consume(&queue, &format!("listen-{}", key)).await.unwrap()
    }

    async fn next_body(stream: &mut DeliveryStream) -> Value {
        let delivery = tokio::time::timeout(WAIT, stream.next())
            .await
            .expect("timed out waiting for response")
            .expect("stream ended")
            .expect("transport error");
        serde_json::from_slice(&delivery.data).unwrap()
    }

    async fn next_seen(seen: &mut Seen) -> (Value, Option<String>) {
        tokio::time::timeout(WAIT, seen.recv())
            .await
            .expect("timed out waiting for dispatch")
            .expect("dispatch channel closed")
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[test]
    fn new_validates_config() {
        let broker = MemoryBroker::new();
        let (dispatch, _seen) = echo_dispatch();

        let mut bad = config();
        bad.max_in_flight = 0;
        assert!(Worker::new(bad, Arc::new(broker.clone()), Arc::clone(&dispatch)).is_err());

        let bad = WorkerConfig::new("", "Test", "test");
        assert!(Worker::new(bad, Arc::new(broker), dispatch).is_err());
    }

    #[tokio::test]
    async fn exposes_identity_and_starts_stopped() {
        let broker = MemoryBroker::new();
        let (dispatch, _seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);

        assert_eq!(worker.identity().binding_key(), "test.request.*");
        assert_eq!(worker.identity().response_routing_key_template(), "test.response.%s");
        assert_eq!(worker.responder().routing_key("5"), "test.response.5");
        assert!(worker.is_stopped());
    }

    #[tokio::test]
    async fn answers_request_on_qid_routing_key() {
        let broker = MemoryBroker::new();
        let (dispatch, mut seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let client = client(&broker).await;
        let mut responses = listen(&client, "test.response.7").await;

        let handle = worker.start().unwrap();
        assert!(!worker.is_stopped());

        client
            .publish("Test", "test.request.7", br#"{"qid":"7","q":{"msg":"hi"}}"#)
            .await
            .unwrap();

        assert_eq!(
            next_seen(&mut seen).await,
            (json!({"msg": "hi"}), Some("7".to_string()))
        );
        assert_eq!(
            next_body(&mut responses).await,
            json!({"msg": "ok", "echo": {"msg": "hi"}})
        );

        worker.stop().await;
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_produces_no_response() {
        let broker = MemoryBroker::new();
        let (dispatch, mut seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let client = client(&broker).await;
        let mut responses = listen(&client, "test.response.*").await;
        worker.start().unwrap();

        client
            .publish("Test", "test.request.abc", br#"{"q":{"msg":"hi"}}"#)
            .await
            .unwrap();

        assert_eq!(next_seen(&mut seen).await, (json!({"msg": "hi"}), None));
        let nothing = tokio::time::timeout(Duration::from_millis(200), responses.next()).await;
        assert!(nothing.is_err(), "unexpected response");
        assert!(broker
            .published()
            .iter()
            .all(|p| !p.routing_key.starts_with("test.response.")));

        worker.stop().await;
    }

    #[tokio::test]
    async fn malformed_request_is_skipped() {
        let broker = MemoryBroker::new();
        let (dispatch, mut seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let client = client(&broker).await;
        worker.start().unwrap();

        client
            .publish("Test", "test.request.1", b"not json")
            .await
            .unwrap();
        client
            .publish("Test", "test.request.2", br#"{"qid": null, "q": 2}"#)
            .await
            .unwrap();

        assert_eq!(next_seen(&mut seen).await, (json!(2), None));
        assert!(seen.try_recv().is_err());
        assert_eq!(worker.state(), WorkerState::Running);
        eventually("queue drained", || broker.unacked_count() == 0).await;
        assert_eq!(broker.queue_depth("TestConsumer_req"), Some(0));

        worker.stop().await;
    }

    #[tokio::test]
    async fn dispatch_errors_and_panics_do_not_stop_the_loop() {
        let broker = MemoryBroker::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let dispatch = dispatch_fn(move |delivery: Delivery, payload: Value, _qid: Option<String>, _responder: Responder| {
            let tx = tx.clone();
            async move {
                match payload.as_str() {
                    Some("fail") => Err(MessagingError::Handler("refused".into())),
                    Some("panic") => panic!("dispatch blew up"),
                    _ => {
                        delivery.ack().await?;
                        let _ = tx.send(payload);
                        Ok(())
                    }
                }
            }
        });
        let worker = worker(&broker, config(), dispatch);
        let client = client(&broker).await;
        worker.start().unwrap();

        for body in [r#"{"q":"fail"}"#, r#"{"q":"panic"}"#, r#"{"q":"fine"}"#] {
            client
                .publish("Test", "test.request.x", body.as_bytes())
                .await
                .unwrap();
        }

        let got = tokio::time::timeout(WAIT, seen.recv()).await.unwrap();
        assert_eq!(got, Some(json!("fine")));
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() {
        let broker = MemoryBroker::new();
        let (dispatch, _seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);

        worker.stop().await;
        worker.stop().await;
        assert!(worker.is_stopped());
        assert!(worker.start().is_none());
    }

    #[tokio::test]
    async fn stop_unblocks_the_delivery_wait() {
        let broker = MemoryBroker::new();
        let (dispatch, _seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let handle = worker.start().unwrap();
        assert!(worker.start().is_none());

        eventually("consumer attached", || broker.live_connections() == 1).await;
        worker.stop().await;
        worker.stop().await;
        assert!(worker.is_stopped());

        tokio::time::timeout(WAIT, handle)
            .await
            .expect("loop did not exit")
            .unwrap();
        assert!(worker.is_stopped());
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn stop_interrupts_the_startup_wait() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(usize::MAX);
        let (dispatch, _seen) = echo_dispatch();
        let mut config = config();
        config.connect_retry_ms = 60_000;
        let worker = worker(&broker, config, dispatch);
        let handle = worker.start().unwrap();

        eventually("first attempt", || broker.connection_attempts() == 1).await;
        worker.stop().await;
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(worker.is_stopped());
    }

    #[tokio::test]
    async fn reconnects_and_keeps_answering() {
        let broker = MemoryBroker::new();
        let (dispatch, mut seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let first = client(&broker).await;
        let mut responses = listen(&first, "test.response.1").await;
        let handle = worker.start().unwrap();

        first
            .publish("Test", "test.request.1", br#"{"qid":"1","q":"first"}"#)
            .await
            .unwrap();
        next_seen(&mut seen).await;
        next_body(&mut responses).await;

        let declared = broker.bindings_declared();
        broker.refuse_connections(2);
        broker.sever_connections();

        eventually("topology re-declared", || broker.bindings_declared() > declared).await;
        assert!(!worker.is_stopped());
        assert!(!handle.is_finished());

        let second = client(&broker).await;
        let mut responses = listen(&second, "test.response.2").await;
        second
            .publish("Test", "test.request.2", br#"{"qid":"2","q":"second"}"#)
            .await
            .unwrap();

        assert_eq!(next_seen(&mut seen).await, (json!("second"), Some("2".into())));
        assert_eq!(
            next_body(&mut responses).await,
            json!({"msg": "ok", "echo": "second"})
        );
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop().await;
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn topology_failure_waits_before_reconnecting() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_exchange(
            "Test",
            crate::ExchangeOptions {
                durable: false,
                auto_delete: true,
            },
        )
        .await
        .unwrap();

        let (dispatch, _seen) = echo_dispatch();
        let mut config = config();
        config.connect_retry_ms = 60_000;
        let worker = worker(&broker, config, dispatch);
        let handle = worker.start().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.connection_attempts(), 2);
        assert_eq!(worker.state(), WorkerState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.connection_attempts(), 3);
        assert_eq!(broker.live_connections(), 2);

        worker.stop().await;
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(worker.is_stopped());
    }

    #[tokio::test]
    async fn unacked_request_is_redelivered_after_reconnect() {
        let broker = MemoryBroker::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let dispatch = dispatch_fn(move |delivery: Delivery, payload: Value, _qid: Option<String>, _responder: Responder| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((payload, delivery.redelivered));
                // ack only what comes back a second time
                if delivery.redelivered {
                    delivery.ack().await?;
                }
                Ok(())
            }
        });
        let worker = worker(&broker, config(), dispatch);
        let client = client(&broker).await;
        worker.start().unwrap();

        client
            .publish("Test", "test.request.1", br#"{"q":"once"}"#)
            .await
            .unwrap();
        let first = tokio::time::timeout(WAIT, seen.recv()).await.unwrap();
        assert_eq!(first, Some((json!("once"), false)));

        broker.sever_connections();
        let second = tokio::time::timeout(WAIT, seen.recv()).await.unwrap();
        assert_eq!(second, Some((json!("once"), true)));

        worker.stop().await;
    }

    #[tokio::test]
    async fn broker_cancelling_the_consumer_ends_the_loop() {
        let broker = MemoryBroker::new();
        let (dispatch, _seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let handle = worker.start().unwrap();

        eventually("queue declared", || broker.queue_exists("TestConsumer_req")).await;
        eventually("consumer attached", || broker.consumer_count("TestConsumer_req") == 1).await;
        broker.delete_queue("TestConsumer_req");

        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(worker.is_stopped());
        assert_eq!(broker.live_connections(), 0);

        // not stopped explicitly, so it may be started again
        let handle = worker.start().unwrap();
        eventually("consumer re-attached", || broker.consumer_count("TestConsumer_req") == 1).await;
        worker.stop().await;
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waits_out_a_broker_outage_at_startup() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let mut responses = listen(&client, "test.response.9").await;
        broker.refuse_connections(3);

        let (dispatch, _seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        worker.start().unwrap();

        client
            .publish("Test", "test.request.9", br#"{"qid":"9","q":null}"#)
            .await
            .unwrap();
        assert_eq!(
            next_body(&mut responses).await,
            json!({"msg": "ok", "echo": null})
        );
        assert!(broker.connection_attempts() >= 5);

        worker.stop().await;
    }

    #[tokio::test]
    async fn sequential_dispatch_preserves_delivery_order() {
        let broker = MemoryBroker::new();
        let (dispatch, mut seen) = echo_dispatch();
        let worker = worker(&broker, config(), dispatch);
        let client = client(&broker).await;

        for i in 0..20 {
            let body = serde_json::to_vec(&json!({"q": i})).unwrap();
            client.publish("Test", "test.request.n", &body).await.unwrap();
        }
        worker.start().unwrap();

        for i in 0..20 {
            assert_eq!(next_seen(&mut seen).await.0, json!(i));
        }
        worker.stop().await;
    }

    #[tokio::test]
    async fn max_in_flight_allows_concurrent_dispatch() {
        let broker = MemoryBroker::new();
        let barrier = Arc::new(Barrier::new(4));
        let (tx, mut seen) = mpsc::unbounded_channel();
        let dispatch = dispatch_fn(move |delivery: Delivery, payload: Value, _qid: Option<String>, _responder: Responder| {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            async move {
                // deadlocks unless four dispatches run at once
                barrier.wait().await;
                delivery.ack().await?;
                let _ = tx.send(payload);
                Ok(())
            }
        });
        let mut config = config();
        config.max_in_flight = 4;
        let worker = worker(&broker, config, dispatch);
        let client = client(&broker).await;
        worker.start().unwrap();

        for i in 0..4 {
            let body = serde_json::to_vec(&json!({"q": i})).unwrap();
            client.publish("Test", "test.request.p", &body).await.unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..4 {
            let value = tokio::time::timeout(WAIT, seen.recv()).await.unwrap().unwrap();
            got.push(value.as_i64().unwrap());
        }
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);

        worker.stop().await;
    }
}
