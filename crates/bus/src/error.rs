use thiserror::Error;

/// Errors that can occur in the bus messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("not connected to broker")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("shutdown in progress")]
    ShuttingDown,
}
