use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowgateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("coordination store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type FlowgateResult<T> = Result<T, FlowgateError>;
