use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::topology::EXCHANGE_OPTIONS;
use crate::{codec, ConnectionSupervisor, Result, WorkerIdentity};

/// Publishes correlated responses for a worker.
///
/// The body is the bare payload; the correlation id travels only in the
/// routing key `<topic>.response.<qid>`. A failed publish is retried every
/// retry interval for as long as it takes, on a fresh connection once the old
/// one is gone, so a response may be sent twice when the broker took the
/// first copy but the confirmation was lost.
#[derive(Clone)]
pub struct Responder {
    identity: Arc<WorkerIdentity>,
    supervisor: Arc<ConnectionSupervisor>,
    retry_interval: Duration,
}

impl Responder {
    pub(crate) fn new(
        identity: Arc<WorkerIdentity>,
        supervisor: Arc<ConnectionSupervisor>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            identity,
            supervisor,
            retry_interval,
        }
    }

    pub fn routing_key(&self, qid: &str) -> String {
        self.identity.response_routing_key(qid)
    }

    /// Publish `payload` as the response to `qid`.
    ///
    /// Returns only once the broker accepted it, or with
    /// [`MessagingError::Stopped`](crate::MessagingError::Stopped) when the
    /// worker is shut down while waiting for a connection.
    pub async fn respond(&self, payload: &Value, qid: &str) -> Result<()> {
        let exchange = self.identity.exchange_name();
        let routing_key = self.routing_key(qid);
        let body = codec::encode(payload)?;

        let mut session = self.supervisor.session(self.retry_interval).await?;
        let mut attempt: u32 = 1;
        loop {
            match session
                .connection
                .publish(exchange, &routing_key, &body)
                .await
            {
                Ok(()) => {
                    debug!(
                        service = %self.identity.service_name(),
                        exchange = %exchange,
                        routing_key = %routing_key,
                        qid = %qid,
                        attempt,
                        "Response published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        service = %self.identity.service_name(),
                        routing_key = %routing_key,
                        qid = %qid,
                        attempt,
                        error = %e,
                        retry_in_ms = %self.retry_interval.as_millis(),
                        "Response publish failed, retrying"
                    );
                    self.supervisor.pause(self.retry_interval).await?;
                    if !session.connection.is_connected() {
                        session = self
                            .supervisor
                            .reconnect(session.generation, self.retry_interval)
                            .await?;
                    }
                    if let Err(e) = session
                        .connection
                        .declare_exchange(exchange, EXCHANGE_OPTIONS)
                        .await
                    {
                        warn!(exchange = %exchange, error = %e, "Exchange declaration failed before retry");
                    }
                    attempt += 1;
                }
            }
        }
    }
}
