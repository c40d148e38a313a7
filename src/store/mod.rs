//! Identity and deduplication store.
//!
//! URL keying ([`key`]), lifecycle records ([`record`]) and the
//! SQLite-backed [`HistoryStore`] itself ([`history`]).

pub mod history;
pub mod key;
pub mod record;

pub use history::{ContentRecord, HistoryStore, HistorySummary, InterruptionPoint, StoreStats};
pub use key::{canonicalize, url_key};
pub use record::{
    AuditEntry, BatchCheckResult, BatchCheckStats, ClaimOutcome, CompletionMeta, DuplicateEntry,
    WorkItem, WorkStatus,
};
