//! Project knowledge graph: built from semantic analysis results,
//! serialized into snapshots, and scored for trustworthiness.

pub mod builder;
pub mod error;
pub mod types;

pub use builder::{confidence_score, GraphBuilder};
pub use error::{GraphError, Result};
pub use types::{
    ArchitecturalSummary, GraphEdge, GraphNode, GraphSnapshot, KnowledgeGraph, SnapshotEdge,
};
