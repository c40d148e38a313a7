//! Work item records and their lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    New,
    Processing,
    Completed,
    Failed,
    Duplicate,
    Skipped,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::New => "new",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Duplicate => "duplicate",
            WorkStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<WorkStatus> {
        match s {
            "new" => Some(WorkStatus::New),
            "processing" => Some(WorkStatus::Processing),
            "completed" => Some(WorkStatus::Completed),
            "failed" => Some(WorkStatus::Failed),
            "duplicate" => Some(WorkStatus::Duplicate),
            "skipped" => Some(WorkStatus::Skipped),
            _ => None,
        }
    }

    /// Terminal states are never re-offered by `batch_check`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Duplicate | WorkStatus::Skipped
        )
    }

    /// Whether `self -> to` is a legal lifecycle transition.
    ///
    /// `failed -> duplicate` is reserved for the reconciliation job;
    /// `failed -> processing` is the explicit retry path. Completed
    /// records are immutable.
    pub fn can_transition_to(&self, to: WorkStatus) -> bool {
        match (self, to) {
            (WorkStatus::New, WorkStatus::Processing) => true,
            // Failures can surface before a claim, during discovery.
            (WorkStatus::New, WorkStatus::Failed) => true,
            (WorkStatus::Processing, WorkStatus::Completed) => true,
            (WorkStatus::Processing, WorkStatus::Failed) => true,
            (WorkStatus::Processing, WorkStatus::Skipped) => true,
            // Abandoned-claim reclaim keeps the record in processing.
            (WorkStatus::Processing, WorkStatus::Processing) => true,
            (WorkStatus::Failed, WorkStatus::Processing) => true,
            (WorkStatus::Failed, WorkStatus::Duplicate) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item's full lifecycle record as stored.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub url_key: String,
    pub raw_url: String,
    pub status: WorkStatus,
    pub sequence: Option<u64>,
    pub partition: Option<String>,
    pub session: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error_reason: Option<String>,
    pub error_class: Option<String>,
    pub content_hash: Option<String>,
    pub title_hash: Option<String>,
    pub resolved_session: Option<String>,
    pub resolved_sequence: Option<u64>,
}

/// One entry of the append-only audit trail kept per work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AuditEntry {
    pub fn new(from: WorkStatus, to: WorkStatus, note: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            note,
        }
    }
}

/// Outcome of `claim_or_reuse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The item is claimed for processing under this sequence number.
    /// Repeated calls while processing return the identical number.
    Claimed { sequence: u64 },
    /// The item already reached a terminal state; the caller must skip it.
    AlreadyProcessed {
        status: WorkStatus,
        session: Option<String>,
        sequence: Option<u64>,
    },
}

/// A duplicate reported by `batch_check`.
#[derive(Debug, Clone)]
pub struct DuplicateEntry {
    pub url: String,
    pub reason: String,
    pub status: WorkStatus,
    pub partition: Option<String>,
    pub session: Option<String>,
    pub sequence: Option<u64>,
}

/// Per-status tallies for one `batch_check` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCheckStats {
    pub total: usize,
    pub new: usize,
    pub duplicate: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub processing: usize,
}

/// Result of partitioning a candidate URL list into new vs duplicate.
#[derive(Debug, Clone, Default)]
pub struct BatchCheckResult {
    pub new: Vec<String>,
    pub duplicates: Vec<DuplicateEntry>,
    pub stats: BatchCheckStats,
}

/// Metadata supplied when recording a completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionMeta {
    pub title: Option<String>,
    pub content_hash: Option<String>,
    pub title_hash: Option<String>,
    pub publish_date: Option<String>,
    pub content_length: Option<usize>,
}
