use petgraph::graph::{Graph, NodeIndex};
use serde::{Deserialize, Serialize};
use toolmesh_analyzer::SymbolKind;

use crate::error::Result;

/// A vertex in the project knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphNode {
    File {
        path: String,
        language: String,
    },
    Symbol {
        name: String,
        kind: SymbolKind,
        file: String,
        start_line: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEdge {
    /// File -> Symbol it defines.
    Contains,
    /// File -> File named by an import.
    Imports { specifier: String },
}

/// In-memory project graph. Directed, file and symbol vertices.
pub type KnowledgeGraph = Graph<GraphNode, GraphEdge>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub source: usize,
    pub target: usize,
    pub edge: GraphEdge,
}

/// Serializable form of a [`KnowledgeGraph`], stored as a single blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub project_path: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<SnapshotEdge>,
}

impl GraphSnapshot {
    pub fn from_graph(project_path: &str, graph: &KnowledgeGraph) -> Self {
        let nodes = graph.node_indices().map(|ix| graph[ix].clone()).collect();
        let edges = graph
            .edge_indices()
            .filter_map(|ix| {
                let (source, target) = graph.edge_endpoints(ix)?;
                Some(SnapshotEdge {
                    source: source.index(),
                    target: target.index(),
                    edge: graph[ix].clone(),
                })
            })
            .collect();
        Self {
            project_path: project_path.to_string(),
            nodes,
            edges,
        }
    }

    pub fn to_graph(&self) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        let indices: Vec<NodeIndex> = self
            .nodes
            .iter()
            .map(|node| graph.add_node(node.clone()))
            .collect();
        for edge in &self.edges {
            if let (Some(&source), Some(&target)) =
                (indices.get(edge.source), indices.get(edge.target))
            {
                graph.add_edge(source, target, edge.edge.clone());
            }
        }
        graph
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn file_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, GraphNode::File { .. }))
            .count()
    }

    pub fn symbol_count(&self) -> usize {
        self.nodes.len() - self.file_count()
    }
}

/// Project-level heuristics derived from the analyzed files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchitecturalSummary {
    pub detected_pattern: Option<String>,
    pub detected_stack: Option<String>,
}
