use thiserror::Error;

/// Common error type for RabbitSight components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metric error: {0}")]
    Metric(#[from] crate::metric::MetricError),
}

/// Result type alias using RabbitSight's Error.
pub type Result<T> = std::result::Result<T, Error>;
