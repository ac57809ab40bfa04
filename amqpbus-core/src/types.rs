use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{MessagingError, Result};

/// Binding pattern for a worker's request queue: any single correlation word.
pub fn binding_key(topic: &str) -> String {
    format!("{}.request.*", topic)
}

/// Response routing key template; `%s` stands for the correlation id.
pub fn response_routing_key_template(topic: &str) -> String {
    format!("{}.response.%s", topic)
}

/// Name of the durable request queue shared by every process of a service.
pub fn request_queue_name(service_name: &str) -> String {
    format!("{}_req", service_name)
}

/// Who a worker is on the bus. Derived keys are computed once here and never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    service_name: String,
    exchange_name: String,
    topic: String,
    binding_key: String,
    response_routing_key_template: String,
    request_queue_name: String,
}

impl WorkerIdentity {
    pub fn new(
        service_name: impl Into<String>,
        exchange_name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Self> {
        let service_name = service_name.into();
        let exchange_name = exchange_name.into();
        let topic = topic.into();

        if service_name.trim().is_empty() {
            return Err(MessagingError::Config("service_name must not be empty".into()));
        }
        if exchange_name.trim().is_empty() {
            return Err(MessagingError::Config("exchange_name must not be empty".into()));
        }
        if topic.trim().is_empty() {
            return Err(MessagingError::Config("topic must not be empty".into()));
        }
        if topic.contains(['*', '#']) {
            return Err(MessagingError::Config(format!(
                "topic '{}' must not contain wildcards",
                topic
            )));
        }

        Ok(Self {
            binding_key: binding_key(&topic),
            response_routing_key_template: response_routing_key_template(&topic),
            request_queue_name: request_queue_name(&service_name),
            service_name,
            exchange_name,
            topic,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn binding_key(&self) -> &str {
        &self.binding_key
    }

    pub fn response_routing_key_template(&self) -> &str {
        &self.response_routing_key_template
    }

    pub fn request_queue_name(&self) -> &str {
        &self.request_queue_name
    }

    /// Routing key of the response to `qid`.
    pub fn response_routing_key(&self, qid: &str) -> String {
        self.response_routing_key_template.replacen("%s", qid, 1)
    }

    /// Routing key a caller publishes a request under.
    pub fn request_routing_key(&self, token: &str) -> String {
        format!("{}.request.{}", self.topic, token)
    }
}

/// Worker settings as they appear in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub service_name: String,
    pub exchange_name: String,
    pub topic: String,
    /// Pause between connection attempts at startup and after a dropped session.
    pub connect_retry_ms: u64,
    /// Pause before retrying a failed response publish.
    pub publish_retry_ms: u64,
    /// Deliveries dispatched concurrently. 1 keeps strict delivery order.
    pub max_in_flight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            exchange_name: String::new(),
            topic: String::new(),
            connect_retry_ms: 60_000,
            publish_retry_ms: 5_000,
            max_in_flight: 1,
        }
    }
}

impl WorkerConfig {
    pub fn new(
        service_name: impl Into<String>,
        exchange_name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            exchange_name: exchange_name.into(),
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn identity(&self) -> Result<WorkerIdentity> {
        WorkerIdentity::new(&self.service_name, &self.exchange_name, &self.topic)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn publish_retry_interval(&self) -> Duration {
        Duration::from_millis(self.publish_retry_ms)
    }
}

/// Request envelope: application payload plus optional correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub q: Value,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "qid_from_json"
    )]
    pub qid: Option<String>,
}

impl Envelope {
    pub fn new(q: Value, qid: Option<String>) -> Self {
        Self { q, qid }
    }
}

// Older callers send numeric ids; an empty id means no response is wanted.
fn qid_from_json<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "qid must be a string or number, got {}",
            other
        ))),
    }
}
