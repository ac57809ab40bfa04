//! Example worker: answers every request carrying a `qid` with the current
//! time and logs the ones without.
//!
//! Usage: `example-worker [config.yaml]`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info};

use amqpbus_core::{Delivery, Dispatch, MessagingError, Responder, Worker};
use amqpbus_rabbitmq::{init_tracing, RabbitBroker, Settings};

const DEFAULT_SERVICE: &str = "ExampleBroker";
const DEFAULT_EXCHANGE: &str = "TestExchange";
const DEFAULT_TOPIC: &str = "example";

struct ClockDispatch;

#[async_trait]
impl Dispatch for ClockDispatch {
    async fn dispatch(
        &self,
        delivery: Delivery,
        payload: Value,
        qid: Option<String>,
        responder: Responder,
    ) -> Result<(), MessagingError> {
        match qid {
            Some(qid) => {
                info!(%qid, request = %payload, "received request");
                let response = json!({ "msg": chrono::Local::now().to_rfc2822() });
                delivery.ack().await?;
                responder.respond(&response, &qid).await
            }
            None => {
                info!(request = %payload, "received request without qid");
                delivery.ack().await
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let mut settings = Settings::read(path.as_deref())?;
    if settings.worker.service_name.is_empty() {
        settings.worker.service_name = DEFAULT_SERVICE.to_string();
    }
    if settings.worker.exchange_name.is_empty() {
        settings.worker.exchange_name = DEFAULT_EXCHANGE.to_string();
    }
    if settings.worker.topic.is_empty() {
        settings.worker.topic = DEFAULT_TOPIC.to_string();
    }
    settings.validate()?;

    let broker = Arc::new(RabbitBroker::new(settings.amqp.clone()));
    let worker = Worker::new(settings.worker.clone(), broker, Arc::new(ClockDispatch))?;

    let handle = match worker.start() {
        Some(handle) => handle,
        None => return Err("worker failed to start".into()),
    };

    tokio::spawn(stop_on_signal(worker.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    while !worker.is_stopped() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if let Err(e) = handle.await {
        error!("worker task failed: {e}");
    }
    info!("example worker exited");
    Ok(())
}

async fn stop_on_signal(worker: Worker) {
    wait_for_signal().await;
    info!("signal received, stopping worker");
    worker.stop().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGQUIT handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
