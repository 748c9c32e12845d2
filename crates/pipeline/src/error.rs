use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] toolmesh_store::StoreError),

    #[error(transparent)]
    Analyzer(#[from] toolmesh_analyzer::AnalyzerError),

    #[error(transparent)]
    Graph(#[from] toolmesh_graph::GraphError),

    #[error("cached result is malformed: {0}")]
    MalformedCacheEntry(#[from] serde_json::Error),

    #[error("analysis task was aborted: {0}")]
    TaskAborted(String),

    #[error("job {0} vanished from the store mid-run")]
    JobVanished(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
