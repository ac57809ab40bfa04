//! RabbitMQ transport for amqpbus workers, built on lapin.

mod options;
mod rabbit_broker;
mod settings;

pub use options::ConnectionSettings;
pub use rabbit_broker::RabbitBroker;
pub use settings::{Settings, CONFIG_ENV_PREFIX, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE, LOG_ENV_VAR};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber, filtered by `AMQPBUS_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
