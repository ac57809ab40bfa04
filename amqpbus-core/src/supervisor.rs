use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Broker, BrokerConnection, MessagingError, Result};

/// A connection together with the number of the attempt that produced it.
#[derive(Clone)]
pub struct Session {
    pub generation: u64,
    pub connection: Arc<dyn BrokerConnection>,
}

/// Owns the single broker connection of a worker (or requester).
///
/// Waiting for a connection never gives up: broker downtime is expected to be
/// transient. Only cancellation of the token ends a wait early.
pub struct ConnectionSupervisor {
    name: String,
    broker: Arc<dyn Broker>,
    cancel: CancellationToken,
    state: RwLock<Option<Session>>,
    // serializes connection attempts; holds the last generation handed out
    gate: Mutex<u64>,
}

impl ConnectionSupervisor {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>, cancel: CancellationToken) -> Self {
        Self {
            name: name.into(),
            broker,
            cancel,
            state: RwLock::new(None),
            gate: Mutex::new(0),
        }
    }

    /// Connect, retrying every `retry_interval` until the broker answers,
    /// and install the result as the current session.
    ///
    /// The previous session is replaced, not closed: whoever asks for a new
    /// connection presumes the old one dead.
    pub async fn wait_for_connection(&self, retry_interval: Duration) -> Result<Session> {
        let mut generation = self.gate.lock().await;
        self.connect_locked(&mut generation, retry_interval).await
    }

    /// Replace the session numbered `stale`, unless somebody already did and
    /// their session is healthy.
    pub async fn reconnect(&self, stale: u64, retry_interval: Duration) -> Result<Session> {
        let mut generation = self.gate.lock().await;
        if let Some(session) = self.current().await {
            if session.generation > stale && session.connection.is_connected() {
                debug!(
                    service = %self.name,
                    generation = session.generation,
                    "Reusing session opened by another task"
                );
                return Ok(session);
            }
        }
        self.connect_locked(&mut generation, retry_interval).await
    }

    /// The current session if it is healthy, otherwise a fresh one.
    pub async fn session(&self, retry_interval: Duration) -> Result<Session> {
        match self.current().await {
            Some(session) if session.connection.is_connected() => Ok(session),
            Some(session) => self.reconnect(session.generation, retry_interval).await,
            None => self.reconnect(0, retry_interval).await,
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.connection.is_connected())
    }

    /// Close the current session. Safe to call any number of times; close
    /// failures are logged and swallowed.
    pub async fn close(&self) {
        let session = self.state.write().await.take();
        if let Some(session) = session {
            if let Err(e) = session.connection.close().await {
                debug!(service = %self.name, error = %e, "Ignoring error while closing connection");
            } else {
                debug!(service = %self.name, generation = session.generation, "Connection closed");
            }
        }
    }

    /// Sleep for `interval`, or fail with [`MessagingError::Stopped`] as
    /// soon as the supervisor is cancelled.
    pub async fn pause(&self, interval: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MessagingError::Stopped),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }

    async fn connect_locked(&self, generation: &mut u64, retry_interval: Duration) -> Result<Session> {
        let endpoint = self.broker.endpoint();
        loop {
            if self.cancel.is_cancelled() {
                return Err(MessagingError::Stopped);
            }

            match self.broker.connect().await {
                Ok(connection) => {
                    if self.cancel.is_cancelled() {
                        let _ = connection.close().await;
                        return Err(MessagingError::Stopped);
                    }

                    *generation += 1;
                    let session = Session {
                        generation: *generation,
                        connection,
                    };
                    let previous = self.state.write().await.replace(session.clone());
                    // a replaced session that still looks alive would leak its socket
                    if let Some(previous) = previous {
                        if previous.connection.is_connected() {
                            let _ = previous.connection.close().await;
                        }
                    }

                    info!(
                        service = %self.name,
                        endpoint = %endpoint,
                        generation = session.generation,
                        "Connected to broker"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        service = %self.name,
                        endpoint = %endpoint,
                        error = %e,
                        retry_in_ms = %retry_interval.as_millis(),
                        "Waiting for broker connection"
                    );
                    self.pause(retry_interval).await?;
                }
            }
        }
    }
}
