use thiserror::Error;

/// Result type for analyzer operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Errors that can occur during semantic analysis
#[derive(Error, Debug, Clone)]
pub enum AnalyzerError {
    /// File extension maps to no supported language
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Grammar failed to load; the failure is cached, not retried
    #[error("grammar unavailable for language {0}")]
    GrammarUnavailable(String),

    /// Tree-sitter could not produce a tree
    #[error("parse error in {0}")]
    ParseError(String),

    /// The worker pool has been disposed
    #[error("worker pool disposed")]
    PoolDisposed,

    /// The worker executing this task died before reporting back
    #[error("worker lost while running task")]
    WorkerLost,
}
