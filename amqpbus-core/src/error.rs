use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("acknowledgement error: {0}")]
    Ack(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("stopped")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    /// Failures of the broker session itself. These are answered by waiting
    /// for a fresh connection, never by giving up.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::Topology(_)
                | MessagingError::Subscribe(_)
                | MessagingError::Publish(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
