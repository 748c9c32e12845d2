//! Concurrent analysis pipeline: fans project files out over the worker
//! pool, consults the two-tier result cache, drives the job state
//! machine, and promotes the resulting knowledge graph snapshot.

pub mod error;

pub use error::{PipelineError, Result};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use toolmesh_analyzer::{FileAnalysis, Language, SemanticAnalyzer, WorkerPool};
use toolmesh_graph::{confidence_score, ArchitecturalSummary, GraphBuilder, GraphSnapshot};
use toolmesh_store::{AnalysisJob, JobStatus, Store};

/// Inputs that affect analysis output, hashed into every cache
/// signature so a config change invalidates prior results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub schema_version: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { schema_version: 1 }
    }
}

/// Why a single file produced no analysis.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub file_path: String,
    pub message: String,
    /// Read failures are critical; parse failures are not.
    pub critical: bool,
}

/// Everything one pipeline run produced.
#[derive(Debug)]
pub struct AnalysisReport {
    pub job: AnalysisJob,
    pub snapshot: Option<GraphSnapshot>,
    pub summary: ArchitecturalSummary,
    pub cache_hits: u32,
    pub failures: Vec<FileFailure>,
}

enum FileOutcome {
    Analyzed { analysis: FileAnalysis, from_cache: bool },
    Failed(FileFailure),
}

pub struct Pipeline {
    store: Arc<Store>,
    pool: Arc<WorkerPool>,
    analyzer: Arc<SemanticAnalyzer>,
    config: AnalysisConfig,
}

impl Pipeline {
    pub fn new(store: Arc<Store>, pool: Arc<WorkerPool>, analyzer: Arc<SemanticAnalyzer>) -> Self {
        Self {
            store,
            pool,
            analyzer,
            config: AnalysisConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    /// Analyze the given files and promote the resulting graph snapshot
    /// for the project. Unsupported file types are filtered up front and
    /// never count against the job.
    pub async fn run_analysis(
        &self,
        project_path: &Path,
        targets: Vec<PathBuf>,
    ) -> Result<AnalysisReport> {
        let targets: Vec<PathBuf> = targets
            .into_iter()
            .filter(|path| {
                let supported = Language::from_path(path).is_supported();
                if !supported {
                    log::debug!("skipping unsupported file {}", path.display());
                }
                supported
            })
            .collect();
        let files_total = targets.len() as u32;
        let project = project_path.to_string_lossy().to_string();

        let job = {
            let project = project.clone();
            self.with_store(move |store| store.create_job(&project, files_total))
                .await?
        };
        let job_id = job.job_id.clone();
        self.with_store(move |store| store.update_job_status(&job_id, JobStatus::Running))
            .await?;
        log::info!("job {}: analyzing {} files", job.job_id, files_total);

        let config_json = serde_json::to_string(&self.config)?;
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let store = Arc::clone(&self.store);
            let pool = Arc::clone(&self.pool);
            let analyzer = Arc::clone(&self.analyzer);
            let config_json = config_json.clone();
            handles.push(tokio::spawn(async move {
                analyze_one(store, pool, analyzer, target, config_json).await
            }));
        }

        let mut analyses = Vec::new();
        let mut failures = Vec::new();
        let mut cache_hits = 0u32;
        for handle in handles {
            match handle
                .await
                .map_err(|err| PipelineError::TaskAborted(err.to_string()))?
            {
                FileOutcome::Analyzed { analysis, from_cache } => {
                    if from_cache {
                        cache_hits += 1;
                    }
                    analyses.push(analysis);
                }
                FileOutcome::Failed(failure) => {
                    log::warn!("job {}: {}: {}", job.job_id, failure.file_path, failure.message);
                    failures.push(failure);
                }
            }
        }

        {
            let job_id = job.job_id.clone();
            let succeeded = analyses.len() as u32;
            let failed = failures.len() as u32;
            self.with_store(move |store| store.update_job_progress(&job_id, succeeded, failed))
                .await?;
        }

        // Nothing analyzable survived: the job dies without a graph.
        if analyses.is_empty() && files_total > 0 {
            let job_id = job.job_id.clone();
            self.with_store(move |store| store.fail_job(&job_id)).await?;
            let job = self.refetch_job(&job.job_id).await?;
            return Ok(AnalysisReport {
                job,
                snapshot: None,
                summary: ArchitecturalSummary::default(),
                cache_hits,
                failures,
            });
        }

        let intermediate = if failures.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::PartiallyCompleted
        };
        {
            let job_id = job.job_id.clone();
            self.with_store(move |store| store.update_job_status(&job_id, intermediate))
                .await?;
        }

        let snapshot = GraphBuilder::build(&project, &analyses);
        let summary = GraphBuilder::summarize(&analyses);
        let critical = failures.iter().filter(|f| f.critical).count() as u32;
        let confidence = confidence_score(files_total, analyses.len() as u32, critical);

        let graph_id = fresh_id("graph");
        let metadata = toolmesh_store::GraphMetadata {
            confidence,
            detected_pattern: summary.detected_pattern.clone(),
            detected_stack: summary.detected_stack.clone(),
        };
        {
            let graph_id = graph_id.clone();
            let job_id = job.job_id.clone();
            let project = project.clone();
            let graph_json = snapshot.to_json()?;
            let metadata = metadata.clone();
            self.with_store(move |store| {
                store.save_graph(&graph_id, &job_id, &project, &graph_json, &metadata)?;
                store.promote_graph(&graph_id, &project)?;
                store.complete_job(&job_id, confidence)
            })
            .await?;
        }

        let job = self.refetch_job(&job.job_id).await?;
        log::info!(
            "job {}: promoted graph {} (confidence {:.2}, {} cache hits)",
            job.job_id,
            graph_id,
            confidence,
            cache_hits
        );
        Ok(AnalysisReport {
            job,
            snapshot: Some(snapshot),
            summary,
            cache_hits,
            failures,
        })
    }

    async fn refetch_job(&self, job_id: &str) -> Result<AnalysisJob> {
        let id = job_id.to_string();
        self.with_store(move |store| store.get_job(&id))
            .await?
            .ok_or_else(|| PipelineError::JobVanished(job_id.to_string()))
    }

    /// SQLite access is synchronous, so every store call hops to the
    /// blocking thread pool instead of stalling the async runtime.
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Store) -> toolmesh_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| PipelineError::TaskAborted(err.to_string()))?
            .map_err(PipelineError::from)
    }
}

async fn analyze_one(
    store: Arc<Store>,
    pool: Arc<WorkerPool>,
    analyzer: Arc<SemanticAnalyzer>,
    target: PathBuf,
    config_json: String,
) -> FileOutcome {
    let path = target.to_string_lossy().to_string();

    let content = match tokio::fs::read_to_string(&target).await {
        Ok(content) => content,
        Err(err) => {
            return FileOutcome::Failed(FileFailure {
                file_path: path,
                message: format!("read failed: {err}"),
                critical: true,
            });
        }
    };

    let signature = analysis_signature(&path, &content, &config_json);
    let lookup = {
        let store = Arc::clone(&store);
        let signature = signature.clone();
        tokio::task::spawn_blocking(move || store.get_cached(&signature)).await
    };
    match lookup {
        Ok(Ok(Some(value))) => match serde_json::from_value::<FileAnalysis>(value) {
            Ok(analysis) => {
                return FileOutcome::Analyzed { analysis, from_cache: true };
            }
            Err(err) => {
                // Poisoned cache entry, fall through and recompute.
                log::warn!("discarding malformed cache entry for {path}: {err}");
            }
        },
        Ok(Ok(None)) => {}
        Ok(Err(err)) => {
            log::warn!("cache lookup failed for {path}: {err}");
        }
        Err(err) => {
            log::warn!("cache lookup aborted for {path}: {err}");
        }
    }

    let content_hash = sha256_hex(content.as_bytes());
    let task_path = path.clone();
    let task_content = content.clone();
    let analyzed = pool
        .run_task(move || analyzer.analyze(&task_path, &task_content))
        .await;

    match analyzed {
        Ok(Ok(analysis)) => {
            match serde_json::to_value(&analysis) {
                Ok(result) => {
                    let config = serde_json::from_str(&config_json)
                        .unwrap_or(serde_json::Value::Null);
                    let write_path = path.clone();
                    let write = tokio::task::spawn_blocking(move || {
                        store.set_cached(&signature, &write_path, &content_hash, &config, &result)
                    })
                    .await;
                    match write {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => log::warn!("cache write failed for {path}: {err}"),
                        Err(err) => log::warn!("cache write aborted for {path}: {err}"),
                    }
                }
                Err(err) => {
                    log::warn!("cache serialization failed for {path}: {err}");
                }
            }
            FileOutcome::Analyzed { analysis, from_cache: false }
        }
        Ok(Err(err)) => FileOutcome::Failed(FileFailure {
            file_path: path,
            message: err.to_string(),
            critical: false,
        }),
        Err(err) => FileOutcome::Failed(FileFailure {
            file_path: path,
            message: err.to_string(),
            critical: false,
        }),
    }
}

/// Cache signature: file path, content, and config are all inputs, so a
/// change to any of them produces a fresh entry.
fn analysis_signature(path: &str, content: &str, config_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(content.as_bytes());
    hasher.update(b"\n");
    hasher.update(config_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn fresh_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("{prefix}-{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_ne;

    #[test]
    fn signature_changes_with_every_input() {
        let base = analysis_signature("src/a.rs", "fn a() {}", "{\"schema_version\":1}");
        assert_ne!(
            base,
            analysis_signature("src/b.rs", "fn a() {}", "{\"schema_version\":1}")
        );
        assert_ne!(
            base,
            analysis_signature("src/a.rs", "fn b() {}", "{\"schema_version\":1}")
        );
        assert_ne!(
            base,
            analysis_signature("src/a.rs", "fn a() {}", "{\"schema_version\":2}")
        );
    }
}
