use crate::error::StoreError;
use serde::{Deserialize, Serialize};

/// Lifecycle of one analysis pipeline run. Advances forward only;
/// `Failed` and `Promoted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    PartiallyCompleted,
    Completed,
    Failed,
    Promoted,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Promoted => "promoted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "partially_completed" => Ok(JobStatus::PartiallyCompleted),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "promoted" => Ok(JobStatus::Promoted),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Promoted)
    }

    /// Position along the forward-only progression. `Failed` may be
    /// entered from any non-terminal state.
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::PartiallyCompleted => 2,
            JobStatus::Completed => 3,
            JobStatus::Failed => 4,
            JobStatus::Promoted => 5,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::Failed {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// One pipeline run's persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub job_id: String,
    pub project_path: String,
    pub status: JobStatus,
    pub confidence_score: f64,
    pub files_total: u32,
    pub files_completed: u32,
    pub files_failed: u32,
    /// Unix seconds.
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Durable per-file analysis cache row.
#[derive(Debug, Clone)]
pub struct AnalysisCacheEntry {
    pub signature: String,
    pub file_path: String,
    pub file_content_hash: String,
    pub analysis_config: serde_json::Value,
    pub analysis_result: serde_json::Value,
    pub created_at: i64,
}

/// Metadata stored next to a graph snapshot blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub confidence: f64,
    pub detected_pattern: Option<String>,
    pub detected_stack: Option<String>,
}

/// One persisted knowledge-graph snapshot.
#[derive(Debug, Clone)]
pub struct GraphSnapshotRow {
    pub graph_id: String,
    pub job_id: String,
    pub project_path: String,
    pub is_promoted: bool,
    pub graph_json: String,
    pub metadata: GraphMetadata,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::PartiallyCompleted,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Promoted,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_forward_only_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Promoted));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Promoted.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        // Same-status updates are a no-op, not a violation.
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
    }
}
