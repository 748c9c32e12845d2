use crate::error::{AnalyzerError, Result};
use crate::grammars::GrammarRegistry;
use crate::language::Language;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tree_sitter::{Node, Parser};

/// Kind of symbol extracted from a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Interface,
    Module,
    Constant,
}

/// One extracted symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: usize,
    pub end_line: usize,
}

/// Per-file analysis summary: the unit cached by signature and fed to
/// the graph builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub file_path: String,
    pub language: String,
    pub symbols: Vec<SymbolInfo>,
    /// Import/module specifiers as written in the source. Resolution to
    /// files happens later, in the graph builder.
    pub dependencies: Vec<String>,
}

/// Parses one file's text into a symbol/dependency summary.
///
/// Parsing is synchronous and CPU-bound; run it inside a worker pool
/// task, not on the orchestration runtime.
pub struct SemanticAnalyzer {
    grammars: Arc<GrammarRegistry>,
}

impl SemanticAnalyzer {
    pub fn new(grammars: Arc<GrammarRegistry>) -> Self {
        Self { grammars }
    }

    pub fn analyze(&self, file_path: &str, content: &str) -> Result<FileAnalysis> {
        let language = Language::from_path(file_path);
        if !language.is_supported() {
            return Err(AnalyzerError::UnsupportedFileType(file_path.to_string()));
        }

        let grammar = self.grammars.get(language)?;
        let mut parser = Parser::new();
        parser
            .set_language(&grammar)
            .map_err(|_| AnalyzerError::GrammarUnavailable(language.as_str().to_string()))?;

        let tree = parser
            .parse(content, None)
            .ok_or_else(|| AnalyzerError::ParseError(file_path.to_string()))?;

        let mut symbols = Vec::new();
        let mut dependencies = Vec::new();
        let root = tree.root_node();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            extract_top_level(language, child, content, &mut symbols, &mut dependencies);
        }

        log::debug!(
            "analyzed {file_path}: {} symbols, {} dependencies",
            symbols.len(),
            dependencies.len()
        );

        Ok(FileAnalysis {
            file_path: file_path.to_string(),
            language: language.as_str().to_string(),
            symbols,
            dependencies,
        })
    }
}

fn extract_top_level(
    language: Language,
    node: Node,
    content: &str,
    symbols: &mut Vec<SymbolInfo>,
    dependencies: &mut Vec<String>,
) {
    match language {
        Language::Rust => extract_rust(node, content, symbols, dependencies),
        Language::Python => extract_python(node, content, symbols, dependencies),
        Language::JavaScript | Language::TypeScript => {
            extract_js(node, content, symbols, dependencies)
        }
        Language::Unknown => {}
    }
}

fn extract_rust(node: Node, content: &str, symbols: &mut Vec<SymbolInfo>, deps: &mut Vec<String>) {
    match node.kind() {
        "function_item" => push_named(node, content, SymbolKind::Function, symbols),
        "struct_item" => push_named(node, content, SymbolKind::Struct, symbols),
        "enum_item" => push_named(node, content, SymbolKind::Enum, symbols),
        "trait_item" => push_named(node, content, SymbolKind::Interface, symbols),
        "const_item" | "static_item" => push_named(node, content, SymbolKind::Constant, symbols),
        "mod_item" => {
            push_named(node, content, SymbolKind::Module, symbols);
            // `mod foo;` without a body refers to a sibling file.
            let has_body = child_of_kind(node, "declaration_list").is_some();
            if !has_body {
                if let Some(name) = field_text(node, "name", content) {
                    deps.push(name);
                }
            }
        }
        "impl_item" => {
            if let Some(body) = child_of_kind(node, "declaration_list") {
                let mut cursor = body.walk();
                for item in body.children(&mut cursor) {
                    if item.kind() == "function_item" {
                        push_named(item, content, SymbolKind::Method, symbols);
                    }
                }
            }
        }
        "use_declaration" => {
            if let Some(argument) = field_text(node, "argument", content) {
                deps.push(argument);
            }
        }
        _ => {}
    }
}

fn extract_python(
    node: Node,
    content: &str,
    symbols: &mut Vec<SymbolInfo>,
    deps: &mut Vec<String>,
) {
    match node.kind() {
        "function_definition" => push_named(node, content, SymbolKind::Function, symbols),
        "decorated_definition" => {
            let mut cursor = node.walk();
            for inner in node.children(&mut cursor) {
                extract_python(inner, content, symbols, deps);
            }
        }
        "class_definition" => {
            push_named(node, content, SymbolKind::Class, symbols);
            if let Some(body) = node.child_by_field_name("body") {
                let mut cursor = body.walk();
                for item in body.children(&mut cursor) {
                    match item.kind() {
                        "function_definition" => {
                            push_named(item, content, SymbolKind::Method, symbols)
                        }
                        "decorated_definition" => {
                            let mut inner_cursor = item.walk();
                            for inner in item.children(&mut inner_cursor) {
                                if inner.kind() == "function_definition" {
                                    push_named(inner, content, SymbolKind::Method, symbols);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        "import_statement" => {
            let mut cursor = node.walk();
            for item in node.named_children(&mut cursor) {
                match item.kind() {
                    "dotted_name" => deps.push(module_to_path(node_text(item, content))),
                    "aliased_import" => {
                        if let Some(name) = field_text(item, "name", content) {
                            deps.push(module_to_path(&name));
                        }
                    }
                    _ => {}
                }
            }
        }
        "import_from_statement" => {
            if let Some(module) = field_text(node, "module_name", content) {
                let path = module_to_path(module.trim_start_matches('.'));
                if !path.is_empty() {
                    deps.push(path);
                }
            }
        }
        _ => {}
    }
}

fn extract_js(node: Node, content: &str, symbols: &mut Vec<SymbolInfo>, deps: &mut Vec<String>) {
    match node.kind() {
        "function_declaration" | "generator_function_declaration" => {
            push_named(node, content, SymbolKind::Function, symbols)
        }
        "class_declaration" => {
            push_named(node, content, SymbolKind::Class, symbols);
            if let Some(body) = node.child_by_field_name("body") {
                let mut cursor = body.walk();
                for item in body.children(&mut cursor) {
                    if item.kind() == "method_definition" {
                        push_named(item, content, SymbolKind::Method, symbols);
                    }
                }
            }
        }
        "interface_declaration" => push_named(node, content, SymbolKind::Interface, symbols),
        "enum_declaration" => push_named(node, content, SymbolKind::Enum, symbols),
        "import_statement" => {
            if let Some(source) = field_text(node, "source", content) {
                deps.push(strip_quotes(&source));
            }
        }
        "export_statement" => {
            // `export function foo() {}` and friends
            if let Some(declaration) = node.child_by_field_name("declaration") {
                extract_js(declaration, content, symbols, deps);
            }
        }
        _ => {}
    }
}

fn push_named(node: Node, content: &str, kind: SymbolKind, symbols: &mut Vec<SymbolInfo>) {
    let Some(name) = field_text(node, "name", content) else {
        return;
    };
    symbols.push(SymbolInfo {
        name,
        kind,
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
    });
}

fn node_text<'a>(node: Node, content: &'a str) -> &'a str {
    &content[node.start_byte()..node.end_byte()]
}

fn field_text(node: Node, field: &str, content: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|child| node_text(child, content).to_string())
}

fn child_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find(|c| c.kind() == kind);
    found
}

fn module_to_path(module: &str) -> String {
    module.replace('.', "/")
}

fn strip_quotes(s: &str) -> String {
    s.trim_matches(|c| c == '"' || c == '\'').to_string()
}
