//! Durable job/result cache store: an in-memory LRU tier over an
//! embedded SQLite tier, plus the analysis-job state machine and the
//! promoted-graph snapshot invariant.

pub mod error;
pub mod migrations;
pub mod types;

pub use error::{Result, StoreError};
pub use types::{
    AnalysisCacheEntry, AnalysisJob, GraphMetadata, GraphSnapshotRow, JobStatus,
};

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use toolmesh_protocol::{KnowledgeRecord, KnowledgeSink};

pub const DEFAULT_TIER1_CAPACITY: usize = 200;

/// Two-tier store: tier 1 is a bounded in-memory LRU keyed by analysis
/// signature, tier 2 is SQLite. Tier-2 hits are promoted into tier 1.
pub struct Store {
    conn: Mutex<Connection>,
    tier1: Mutex<LruCache<String, Value>>,
}

impl Store {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and one-shot runs.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tier1: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_TIER1_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    // ------------------------------------------------------------------
    // Analysis result cache
    // ------------------------------------------------------------------

    /// Cached analysis result for a signature: tier 1 first, then
    /// tier 2 with promotion.
    pub fn get_cached(&self, signature: &str) -> Result<Option<Value>> {
        if let Some(value) = self.lock_tier1().get(signature) {
            log::debug!("tier-1 cache hit for {signature}");
            return Ok(Some(value.clone()));
        }

        let row: Option<String> = self
            .lock_conn()
            .query_row(
                "SELECT analysis_result FROM analysis_cache WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )
            .optional()?;

        match row {
            Some(json) => {
                let value: Value = serde_json::from_str(&json)?;
                self.lock_tier1()
                    .put(signature.to_string(), value.clone());
                log::debug!("tier-2 cache hit for {signature}, promoted to tier 1");
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write an analysis result into both tiers.
    pub fn set_cached(
        &self,
        signature: &str,
        file_path: &str,
        content_hash: &str,
        config: &Value,
        result: &Value,
    ) -> Result<()> {
        self.lock_conn().execute(
            "INSERT INTO analysis_cache
                (signature, file_path, file_content_hash, analysis_config,
                 analysis_result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(signature) DO UPDATE SET
                analysis_result = excluded.analysis_result,
                created_at = excluded.created_at",
            params![
                signature,
                file_path,
                content_hash,
                config.to_string(),
                result.to_string(),
                unix_now(),
            ],
        )?;
        self.lock_tier1().put(signature.to_string(), result.clone());
        Ok(())
    }

    pub fn get_cache_entry(&self, signature: &str) -> Result<Option<AnalysisCacheEntry>> {
        let entry = self
            .lock_conn()
            .query_row(
                "SELECT signature, file_path, file_content_hash, analysis_config,
                        analysis_result, created_at
                 FROM analysis_cache WHERE signature = ?1",
                params![signature],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        entry
            .map(|(signature, file_path, hash, config, result, created_at)| {
                Ok(AnalysisCacheEntry {
                    signature,
                    file_path,
                    file_content_hash: hash,
                    analysis_config: serde_json::from_str(&config)?,
                    analysis_result: serde_json::from_str(&result)?,
                    created_at,
                })
            })
            .transpose()
    }

    // ------------------------------------------------------------------
    // Job lifecycle
    // ------------------------------------------------------------------

    pub fn create_job(&self, project_path: &str, files_total: u32) -> Result<AnalysisJob> {
        let job = AnalysisJob {
            job_id: fresh_id("job"),
            project_path: project_path.to_string(),
            status: JobStatus::Pending,
            confidence_score: 0.0,
            files_total,
            files_completed: 0,
            files_failed: 0,
            created_at: unix_now(),
            completed_at: None,
        };
        self.lock_conn().execute(
            "INSERT INTO analysis_jobs
                (job_id, project_path, status, confidence_score, files_total,
                 files_completed, files_failed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.job_id,
                job.project_path,
                job.status.as_str(),
                job.confidence_score,
                job.files_total,
                job.files_completed,
                job.files_failed,
                job.created_at,
            ],
        )?;
        log::info!("created analysis job {} for {}", job.job_id, project_path);
        Ok(job)
    }

    /// Advance a job's status. Backward transitions are rejected.
    pub fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let conn = self.lock_conn();
        let current = Self::job_status_in(&conn, job_id)?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: current.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        conn.execute(
            "UPDATE analysis_jobs SET status = ?2 WHERE job_id = ?1",
            params![job_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn update_job_progress(
        &self,
        job_id: &str,
        files_completed: u32,
        files_failed: u32,
    ) -> Result<()> {
        let changed = self.lock_conn().execute(
            "UPDATE analysis_jobs SET files_completed = ?2, files_failed = ?3
             WHERE job_id = ?1",
            params![job_id, files_completed, files_failed],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Terminal success: stamps completion time, records the confidence
    /// score, and moves the job to `promoted`.
    pub fn complete_job(&self, job_id: &str, confidence_score: f64) -> Result<()> {
        let conn = self.lock_conn();
        let current = Self::job_status_in(&conn, job_id)?;
        if !current.can_transition_to(JobStatus::Promoted) {
            return Err(StoreError::InvalidTransition {
                from: current.as_str().to_string(),
                to: JobStatus::Promoted.as_str().to_string(),
            });
        }
        conn.execute(
            "UPDATE analysis_jobs
             SET status = ?2, confidence_score = ?3, completed_at = ?4
             WHERE job_id = ?1",
            params![
                job_id,
                JobStatus::Promoted.as_str(),
                confidence_score,
                unix_now(),
            ],
        )?;
        Ok(())
    }

    /// Terminal failure.
    pub fn fail_job(&self, job_id: &str) -> Result<()> {
        let conn = self.lock_conn();
        let current = Self::job_status_in(&conn, job_id)?;
        if !current.can_transition_to(JobStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                from: current.as_str().to_string(),
                to: JobStatus::Failed.as_str().to_string(),
            });
        }
        conn.execute(
            "UPDATE analysis_jobs SET status = ?2, completed_at = ?3 WHERE job_id = ?1",
            params![job_id, JobStatus::Failed.as_str(), unix_now()],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<AnalysisJob>> {
        let job = self
            .lock_conn()
            .query_row(
                "SELECT job_id, project_path, status, confidence_score, files_total,
                        files_completed, files_failed, created_at, completed_at
                 FROM analysis_jobs WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                    ))
                },
            )
            .optional()?;

        job.map(
            |(
                job_id,
                project_path,
                status,
                confidence_score,
                files_total,
                files_completed,
                files_failed,
                created_at,
                completed_at,
            )| {
                Ok(AnalysisJob {
                    job_id,
                    project_path,
                    status: JobStatus::parse(&status)?,
                    confidence_score,
                    files_total,
                    files_completed,
                    files_failed,
                    created_at,
                    completed_at,
                })
            },
        )
        .transpose()
    }

    fn job_status_in(conn: &Connection, job_id: &str) -> Result<JobStatus> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM analysis_jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => JobStatus::parse(&s),
            None => Err(StoreError::JobNotFound(job_id.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Graph snapshots
    // ------------------------------------------------------------------

    /// Insert a non-promoted snapshot.
    pub fn save_graph(
        &self,
        graph_id: &str,
        job_id: &str,
        project_path: &str,
        graph_json: &str,
        metadata: &GraphMetadata,
    ) -> Result<()> {
        self.lock_conn().execute(
            "INSERT INTO knowledge_graphs
                (graph_id, job_id, project_path, is_promoted, graph_json,
                 confidence, detected_pattern, detected_stack, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8)",
            params![
                graph_id,
                job_id,
                project_path,
                graph_json,
                metadata.confidence,
                metadata.detected_pattern,
                metadata.detected_stack,
                unix_now(),
            ],
        )?;
        Ok(())
    }

    /// Demote every other snapshot for the project and promote this one,
    /// in a single transaction, preserving the at-most-one-promoted
    /// invariant under concurrent pipeline runs.
    pub fn promote_graph(&self, graph_id: &str, project_path: &str) -> Result<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE knowledge_graphs SET is_promoted = 0 WHERE project_path = ?1",
            params![project_path],
        )?;
        let changed = tx.execute(
            "UPDATE knowledge_graphs SET is_promoted = 1 WHERE graph_id = ?1",
            params![graph_id],
        )?;
        if changed == 0 {
            return Err(StoreError::GraphNotFound(graph_id.to_string()));
        }
        tx.commit()?;
        log::info!("promoted graph {graph_id} for {project_path}");
        Ok(())
    }

    pub fn get_promoted_graph(&self, project_path: &str) -> Result<Option<GraphSnapshotRow>> {
        self.query_graphs(
            "SELECT graph_id, job_id, project_path, is_promoted, graph_json,
                    confidence, detected_pattern, detected_stack, created_at
             FROM knowledge_graphs
             WHERE project_path = ?1 AND is_promoted = 1",
            project_path,
        )
        .map(|mut rows| rows.pop())
    }

    pub fn list_graphs(&self, project_path: &str) -> Result<Vec<GraphSnapshotRow>> {
        self.query_graphs(
            "SELECT graph_id, job_id, project_path, is_promoted, graph_json,
                    confidence, detected_pattern, detected_stack, created_at
             FROM knowledge_graphs
             WHERE project_path = ?1
             ORDER BY created_at, graph_id",
            project_path,
        )
    }

    fn query_graphs(&self, sql: &str, project_path: &str) -> Result<Vec<GraphSnapshotRow>> {
        let conn = self.lock_conn();
        let mut statement = conn.prepare(sql)?;
        let rows = statement.query_map(params![project_path], |row| {
            Ok(GraphSnapshotRow {
                graph_id: row.get(0)?,
                job_id: row.get(1)?,
                project_path: row.get(2)?,
                is_promoted: row.get::<_, i64>(3)? != 0,
                graph_json: row.get(4)?,
                metadata: GraphMetadata {
                    confidence: row.get(5)?,
                    detected_pattern: row.get(6)?,
                    detected_stack: row.get(7)?,
                },
                created_at: row.get(8)?,
            })
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    // ------------------------------------------------------------------
    // Knowledge triples (mesh enrichment sink)
    // ------------------------------------------------------------------

    /// Persist one `(MCPServer)-[:PROVIDES]->(Response)-[:ENRICHES]->`
    /// record from the fan-out orchestrator.
    pub fn record_knowledge(&self, record: &KnowledgeRecord) -> Result<()> {
        self.lock_conn().execute(
            "INSERT OR REPLACE INTO knowledge_triples
                (response_id, server_id, capability, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.response_id,
                record.server_id,
                record.capability,
                record.kind,
                record.payload.to_string(),
                unix_now(),
            ],
        )?;
        Ok(())
    }

    pub fn knowledge_count(&self, server_id: &str) -> Result<u64> {
        let count: i64 = self.lock_conn().query_row(
            "SELECT COUNT(*) FROM knowledge_triples WHERE server_id = ?1",
            params![server_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tier1(&self) -> MutexGuard<'_, LruCache<String, Value>> {
        self.tier1
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Knowledge sink writing fan-out enrichment records into the store.
pub struct SqliteKnowledgeSink {
    store: Arc<Store>,
}

impl SqliteKnowledgeSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl KnowledgeSink for SqliteKnowledgeSink {
    async fn record_response(&self, record: KnowledgeRecord) -> std::result::Result<(), String> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.record_knowledge(&record))
            .await
            .map_err(|err| err.to_string())?
            .map_err(|err| err.to_string())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

fn fresh_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("{prefix}-{nanos:x}")
}
