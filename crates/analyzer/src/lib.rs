//! Per-file semantic analysis: language detection, load-once grammar
//! registry, tree-sitter symbol/dependency extraction, and the worker
//! pool the CPU-bound parsing runs on.

pub mod error;
pub mod grammars;
pub mod language;
pub mod semantic;
pub mod workers;

pub use error::{AnalyzerError, Result};
pub use grammars::GrammarRegistry;
pub use language::Language;
pub use semantic::{FileAnalysis, SemanticAnalyzer, SymbolInfo, SymbolKind};
pub use workers::WorkerPool;
