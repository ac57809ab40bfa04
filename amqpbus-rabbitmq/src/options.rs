use serde::Deserialize;

/// Where and how to reach RabbitMQ.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Unacknowledged deliveries the broker may push to one consumer.
    pub prefetch: u16,
    /// If true, publishes wait for the broker's ACK/NACK.
    pub confirms: bool,
    /// Shown in the management UI.
    pub connection_name: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            prefetch: 1,
            confirms: true,
            connection_name: None,
        }
    }
}

impl ConnectionSettings {
    /// AMQP URI, credentials and vhost percent-encoded.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }

    /// Same as [`uri`](Self::uri) without credentials, for logs.
    pub fn endpoint(&self) -> String {
        format!(
            "amqp://{}:{}/{}",
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}
