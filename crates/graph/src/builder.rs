use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use toolmesh_analyzer::FileAnalysis;

use crate::types::{
    ArchitecturalSummary, GraphEdge, GraphNode, GraphSnapshot, KnowledgeGraph,
};

/// Extensions tried when an import specifier has none.
const RESOLUTION_EXTENSIONS: &[&str] = &["rs", "py", "js", "ts", "jsx", "tsx"];

/// Entry files tried when a specifier names a directory.
const INDEX_FILES: &[&str] = &["index.js", "index.ts", "mod.rs", "__init__.py"];

/// Builds the project knowledge graph from per-file analysis results.
///
/// Two passes: the first registers every file and its symbols, the
/// second resolves import specifiers against the registered file set so
/// import edges can point at files analyzed later in the batch.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn build(project_path: &str, analyses: &[FileAnalysis]) -> GraphSnapshot {
        let mut graph = KnowledgeGraph::new();
        let mut files: HashMap<String, NodeIndex> = HashMap::new();

        for analysis in analyses {
            let path = normalize_path(&analysis.file_path);
            let file_ix = graph.add_node(GraphNode::File {
                path: path.clone(),
                language: analysis.language.clone(),
            });
            files.insert(path.clone(), file_ix);

            for symbol in &analysis.symbols {
                let symbol_ix = graph.add_node(GraphNode::Symbol {
                    name: symbol.name.clone(),
                    kind: symbol.kind,
                    file: path.clone(),
                    start_line: symbol.start_line,
                });
                graph.add_edge(file_ix, symbol_ix, GraphEdge::Contains);
            }
        }

        for analysis in analyses {
            let path = normalize_path(&analysis.file_path);
            let Some(&file_ix) = files.get(&path) else {
                continue;
            };
            for specifier in &analysis.dependencies {
                match resolve_import(&path, specifier, &files) {
                    Some(target_ix) if target_ix != file_ix => {
                        graph.add_edge(
                            file_ix,
                            target_ix,
                            GraphEdge::Imports {
                                specifier: specifier.clone(),
                            },
                        );
                    }
                    Some(_) => {}
                    None => {
                        log::debug!("unresolved import {specifier} in {path}");
                    }
                }
            }
        }

        GraphSnapshot::from_graph(project_path, &graph)
    }

    /// Language and layout heuristics for the graph snapshot metadata.
    pub fn summarize(analyses: &[FileAnalysis]) -> ArchitecturalSummary {
        let mut language_counts: HashMap<&str, usize> = HashMap::new();
        for analysis in analyses {
            *language_counts.entry(analysis.language.as_str()).or_default() += 1;
        }
        let detected_stack = language_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(language, _)| language.to_string());

        let has_dir = |name: &str| {
            analyses.iter().any(|a| {
                normalize_path(&a.file_path)
                    .split('/')
                    .any(|segment| segment == name)
            })
        };
        let detected_pattern = if has_dir("controllers") && has_dir("models") {
            Some("mvc".to_string())
        } else if has_dir("handlers") || has_dir("services") || has_dir("api") {
            Some("layered".to_string())
        } else {
            None
        };

        ArchitecturalSummary {
            detected_pattern,
            detected_stack,
        }
    }
}

/// Score in [0, 1] for how trustworthy a built graph is. Every critical
/// failure (a file that could not even be read) costs a flat 0.2 on top
/// of the completion ratio. An empty batch is trivially complete.
pub fn confidence_score(files_total: u32, files_succeeded: u32, critical_failures: u32) -> f64 {
    if files_total == 0 {
        return 1.0;
    }
    let ratio = f64::from(files_succeeded) / f64::from(files_total);
    (ratio - 0.2 * f64::from(critical_failures)).clamp(0.0, 1.0)
}

/// Resolve an import specifier to a known file path. Tries the literal
/// path, then common extensions, then directory entry files. Relative
/// specifiers resolve against the importing file's directory; bare
/// specifiers are tried against the importing file's directory first
/// and the project root second.
fn resolve_import(
    importer: &str,
    specifier: &str,
    files: &HashMap<String, NodeIndex>,
) -> Option<NodeIndex> {
    let parent = importer.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let bases = if specifier.starts_with("./") || specifier.starts_with("../") {
        vec![normalize_path(&format!("{parent}/{specifier}"))]
    } else {
        vec![
            normalize_path(&format!("{parent}/{specifier}")),
            normalize_path(specifier),
        ]
    };

    for base in &bases {
        if let Some(&ix) = files.get(base) {
            return Some(ix);
        }
        for ext in RESOLUTION_EXTENSIONS {
            if let Some(&ix) = files.get(&format!("{base}.{ext}")) {
                return Some(ix);
            }
        }
        for index in INDEX_FILES {
            if let Some(&ix) = files.get(&format!("{base}/{index}")) {
                return Some(ix);
            }
        }
    }
    None
}

/// Lexical normalization: forward slashes, no `.` segments, `..`
/// collapsed against preceding segments.
fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in forward.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use toolmesh_analyzer::{SymbolInfo, SymbolKind};

    fn analysis(path: &str, language: &str, deps: &[&str]) -> FileAnalysis {
        FileAnalysis {
            file_path: path.to_string(),
            language: language.to_string(),
            symbols: vec![SymbolInfo {
                name: "item".to_string(),
                kind: SymbolKind::Function,
                start_line: 1,
                end_line: 3,
            }],
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn files_contain_their_symbols() {
        let snapshot = GraphBuilder::build(
            "/proj",
            &[analysis("src/lib.rs", "rust", &[])],
        );
        assert_eq!(snapshot.file_count(), 1);
        assert_eq!(snapshot.symbol_count(), 1);
        assert_eq!(snapshot.edges.len(), 1);
        assert!(matches!(snapshot.edges[0].edge, GraphEdge::Contains));
    }

    #[test]
    fn relative_import_resolves_with_extension() {
        let snapshot = GraphBuilder::build(
            "/proj",
            &[
                analysis("src/app.js", "javascript", &["./util"]),
                analysis("src/util.js", "javascript", &[]),
            ],
        );
        let imports: Vec<_> = snapshot
            .edges
            .iter()
            .filter(|e| matches!(e.edge, GraphEdge::Imports { .. }))
            .collect();
        assert_eq!(imports.len(), 1);
        assert_eq!(
            snapshot.nodes[imports[0].target],
            GraphNode::File {
                path: "src/util.js".to_string(),
                language: "javascript".to_string(),
            }
        );
    }

    #[test]
    fn directory_import_resolves_to_index_file() {
        let snapshot = GraphBuilder::build(
            "/proj",
            &[
                analysis("src/app.ts", "typescript", &["./widgets"]),
                analysis("src/widgets/index.ts", "typescript", &[]),
            ],
        );
        assert_eq!(
            snapshot
                .edges
                .iter()
                .filter(|e| matches!(e.edge, GraphEdge::Imports { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn unresolved_imports_are_dropped() {
        let snapshot = GraphBuilder::build(
            "/proj",
            &[analysis("src/app.py", "python", &["third_party/requests"])],
        );
        assert!(snapshot
            .edges
            .iter()
            .all(|e| matches!(e.edge, GraphEdge::Contains)));
    }

    #[test]
    fn parent_relative_import_resolves() {
        let snapshot = GraphBuilder::build(
            "/proj",
            &[
                analysis("src/deep/inner.rs", "rust", &["../shared"]),
                analysis("src/shared.rs", "rust", &[]),
            ],
        );
        assert_eq!(
            snapshot
                .edges
                .iter()
                .filter(|e| matches!(e.edge, GraphEdge::Imports { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = GraphBuilder::build(
            "/proj",
            &[
                analysis("src/a.rs", "rust", &["./b"]),
                analysis("src/b.rs", "rust", &[]),
            ],
        );
        let json = snapshot.to_json().unwrap();
        let restored = GraphSnapshot::from_json(&json).unwrap();
        assert_eq!(restored.nodes, snapshot.nodes);
        assert_eq!(restored.to_graph().edge_count(), snapshot.edges.len());
    }

    #[test]
    fn confidence_rewards_completion_and_punishes_critical_failures() {
        assert_eq!(confidence_score(5, 5, 0), 1.0);
        assert!((confidence_score(10, 8, 1) - 0.6).abs() < 1e-9);
        assert_eq!(confidence_score(0, 0, 0), 1.0);
        assert_eq!(confidence_score(2, 0, 4), 0.0);
    }

    #[test]
    fn summary_detects_dominant_language_and_layout() {
        let summary = GraphBuilder::summarize(&[
            analysis("src/api/routes.py", "python", &[]),
            analysis("src/services/auth.py", "python", &[]),
            analysis("web/app.js", "javascript", &[]),
        ]);
        assert_eq!(summary.detected_stack.as_deref(), Some("python"));
        assert_eq!(summary.detected_pattern.as_deref(), Some("layered"));
    }
}
