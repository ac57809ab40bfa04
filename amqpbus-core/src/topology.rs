use tracing::debug;

use crate::{BrokerConnection, ExchangeOptions, QueueOptions, Result, WorkerIdentity};

/// Topic exchange shared by requests and responses.
pub const EXCHANGE_OPTIONS: ExchangeOptions = ExchangeOptions {
    durable: true,
    auto_delete: false,
};

/// Request queue: durable and shared, so processes of one service compete for it.
pub const REQUEST_QUEUE_OPTIONS: QueueOptions = QueueOptions {
    durable: true,
    exclusive: false,
    auto_delete: false,
};

/// Per-request response queue of a caller.
pub const RESPONSE_QUEUE_OPTIONS: QueueOptions = QueueOptions {
    durable: false,
    exclusive: true,
    auto_delete: true,
};

/// Declare exchange, request queue and wildcard binding.
///
/// Runs on every fresh connection: a new session starts with no declarations
/// of its own, and the broker treats identical re-declarations as no-ops.
pub async fn declare_topology(
    connection: &dyn BrokerConnection,
    exchange_name: &str,
    queue_name: &str,
    binding_key: &str,
) -> Result<()> {
    connection
        .declare_exchange(exchange_name, EXCHANGE_OPTIONS)
        .await?;
    connection
        .declare_queue(queue_name, REQUEST_QUEUE_OPTIONS)
        .await?;
    connection
        .bind_queue(queue_name, exchange_name, binding_key)
        .await?;

    debug!(
        exchange = %exchange_name,
        queue = %queue_name,
        binding_key = %binding_key,
        "Queue bound to exchange"
    );
    Ok(())
}

pub async fn declare_worker_topology(
    connection: &dyn BrokerConnection,
    identity: &WorkerIdentity,
) -> Result<()> {
    declare_topology(
        connection,
        identity.exchange_name(),
        identity.request_queue_name(),
        identity.binding_key(),
    )
    .await
}
