use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;
