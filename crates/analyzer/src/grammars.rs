use crate::error::{AnalyzerError, Result};
use crate::language::Language;
use std::collections::HashMap;
use std::sync::Mutex;

enum LoadState {
    Loaded(tree_sitter::Language),
    /// A failed load is remembered and not retried automatically.
    Failed(String),
}

/// Explicitly-owned registry of loaded tree-sitter grammars.
///
/// Each grammar loads exactly once; the lock is held across the load so
/// concurrent first requests for the same language cannot double-load.
/// Inject an instance into the analyzer rather than reaching for global
/// state.
#[derive(Default)]
pub struct GrammarRegistry {
    grammars: Mutex<HashMap<Language, LoadState>>,
}

impl GrammarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The loaded grammar for a language, loading it on first request.
    pub fn get(&self, language: Language) -> Result<tree_sitter::Language> {
        let mut grammars = self
            .grammars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let state = grammars
            .entry(language)
            .or_insert_with(|| match load_grammar(language) {
                Ok(grammar) => {
                    log::debug!("loaded grammar for {}", language.as_str());
                    LoadState::Loaded(grammar)
                }
                Err(err) => {
                    log::warn!("grammar load for {} failed: {err}", language.as_str());
                    LoadState::Failed(err.to_string())
                }
            });

        match state {
            LoadState::Loaded(grammar) => Ok(grammar.clone()),
            LoadState::Failed(_) => Err(AnalyzerError::GrammarUnavailable(
                language.as_str().to_string(),
            )),
        }
    }

    /// How many grammars are resident (loaded or failed).
    pub fn loaded_count(&self) -> usize {
        self.grammars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn load_grammar(language: Language) -> Result<tree_sitter::Language> {
    match language {
        Language::Rust => Ok(tree_sitter_rust::LANGUAGE.into()),
        Language::Python => Ok(tree_sitter_python::LANGUAGE.into()),
        Language::JavaScript => Ok(tree_sitter_javascript::LANGUAGE.into()),
        Language::TypeScript => Ok(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        Language::Unknown => Err(AnalyzerError::GrammarUnavailable(
            language.as_str().to_string(),
        )),
    }
}
