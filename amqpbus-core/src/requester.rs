//! Calling side of the protocol.
//!
//! Each request gets a throwaway exclusive queue bound to
//! `<topic>.response.<qid>`, declared before the request is published so the
//! answer cannot be missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::supervisor::Session;
use crate::topology::{self, RESPONSE_QUEUE_OPTIONS};
use crate::{codec, Broker, ConnectionSupervisor, MessagingError, Result, WorkerConfig, WorkerIdentity};

pub struct Requester {
    identity: WorkerIdentity,
    supervisor: ConnectionSupervisor,
    retry_interval: Duration,
    cancel: CancellationToken,
    // generation of the session the topology was last declared on
    declared: AtomicU64,
}

impl Requester {
    /// A requester for the service described by `config`.
    pub fn new(config: &WorkerConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let identity = config.identity()?;
        let cancel = CancellationToken::new();
        let supervisor = ConnectionSupervisor::new(
            format!("{}-requester", identity.service_name()),
            broker,
            cancel.clone(),
        );
        Ok(Self {
            identity,
            supervisor,
            retry_interval: config.publish_retry_interval(),
            cancel,
            declared: AtomicU64::new(0),
        })
    }

    pub fn new_qid() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Send `payload` and wait for the worker's answer.
    ///
    /// `timeout` bounds the wait for the response of one attempt; `None`
    /// waits indefinitely. Transport failures are retried on a fresh
    /// connection with the same qid.
    pub async fn request(&self, payload: &Value, timeout: Option<Duration>) -> Result<Value> {
        let qid = Self::new_qid();
        let body = codec::encode_request(payload, Some(&qid))?;

        let mut session = self.supervisor.session(self.retry_interval).await?;
        loop {
            match self.round_trip(&session, &qid, &body, timeout).await {
                Err(e) if e.is_transport() => {
                    warn!(
                        service = %self.identity.service_name(),
                        qid = %qid,
                        error = %e,
                        "Request failed, retrying"
                    );
                    session = self.retry_session(session).await?;
                }
                other => return other,
            }
        }
    }

    /// Publish `payload` without asking for a response.
    pub async fn send(&self, payload: &Value) -> Result<()> {
        let body = codec::encode_request(payload, None)?;
        let routing_key = self.identity.request_routing_key(&Self::new_qid());

        let mut session = self.supervisor.session(self.retry_interval).await?;
        loop {
            let sent = match self.ensure_topology(&session).await {
                Ok(()) => {
                    session
                        .connection
                        .publish(self.identity.exchange_name(), &routing_key, &body)
                        .await
                }
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => {
                    debug!(routing_key = %routing_key, "Request sent");
                    return Ok(());
                }
                Err(e) if e.is_transport() => {
                    warn!(
                        service = %self.identity.service_name(),
                        error = %e,
                        "Send failed, retrying"
                    );
                    session = self.retry_session(session).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Abort pending waits and close the connection. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.supervisor.close().await;
    }

    /// Wait one retry interval, then hand back `session` if it is still up
    /// or a fresh one otherwise.
    async fn retry_session(&self, session: Session) -> Result<Session> {
        self.supervisor.pause(self.retry_interval).await?;
        if session.connection.is_connected() {
            // force a fresh declaration on the next attempt
            self.declared.store(0, Ordering::SeqCst);
            return Ok(session);
        }
        self.supervisor
            .reconnect(session.generation, self.retry_interval)
            .await
    }

    async fn ensure_topology(&self, session: &Session) -> Result<()> {
        if self.declared.load(Ordering::SeqCst) == session.generation {
            return Ok(());
        }
        topology::declare_worker_topology(session.connection.as_ref(), &self.identity).await?;
        self.declared.store(session.generation, Ordering::SeqCst);
        Ok(())
    }

    async fn round_trip(
        &self,
        session: &Session,
        qid: &str,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_topology(session).await?;

        let connection = session.connection.as_ref();
        let exchange = self.identity.exchange_name();
        let response_key = self.identity.response_routing_key(qid);
        let queue = connection
            .declare_queue("", RESPONSE_QUEUE_OPTIONS)
            .await?;
        connection.bind_queue(&queue, exchange, &response_key).await?;

        let tag = format!("response-{}", qid);
        let mut responses = connection.consume(&queue, &tag).await?;

        let routing_key = self.identity.request_routing_key(qid);
        connection.publish(exchange, &routing_key, body).await?;
        debug!(routing_key = %routing_key, queue = %queue, qid = %qid, "Request published");

        let wait = async {
            match responses.next().await {
                Some(Ok(delivery)) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(qid = %qid, error = %e, "Failed to ack response");
                    }
                    codec::decode_response(&delivery.data)
                }
                Some(Err(e)) => Err(e),
                None => Err(MessagingError::Subscribe(format!(
                    "response consumer for {} was cancelled",
                    qid
                ))),
            }
        };
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, wait).await {
                    Ok(result) => result,
                    Err(_) => Err(MessagingError::Timeout(format!(
                        "no response to {} within {:?}",
                        qid, limit
                    ))),
                },
                None => wait.await,
            }
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(MessagingError::Stopped),
            result = bounded => result,
        };

        if connection.is_connected() {
            if let Err(e) = connection.cancel(&tag).await {
                debug!(qid = %qid, error = %e, "Failed to cancel response consumer");
            }
        }
        result
    }
}
