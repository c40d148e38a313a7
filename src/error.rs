//! Error types for newsmill operations.
//!
//! Two layers:
//!
//! - Subsystem errors (`StoreError`, `ControllerError`) for infrastructure
//!   failures that propagate with `?`.
//! - `WorkError`, the closed per-item failure type crossing the worker
//!   boundary. Every item failure is one of these variants; the keyword
//!   classifier exists only as a fallback for unstructured text arriving
//!   from external collaborators.

use thiserror::Error;

/// Errors from the identity/deduplication store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid status transition from '{from}' to '{to}' for {url}")]
    InvalidTransition {
        from: String,
        to: String,
        url: String,
    },

    #[error("No work item record for URL: {0}")]
    UnknownItem(String),
}

/// Errors from the adaptive concurrency controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Controller is already running")]
    AlreadyRunning,

    #[error("Worker crash loop: gave up after {attempts} recovery attempts")]
    CrashLoop { attempts: u32 },

    #[error("Invalid controller state transition from '{from}' to '{to}'")]
    InvalidState { from: String, to: String },
}

/// Stable classification codes persisted in the store's `error_class`
/// column and surfaced in operator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Extraction,
    RewriteTimeout,
    RewriteInvalidOutput,
    Save,
    ContentDuplicate,
    ContentTooStale,
    AlreadyProcessed,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Extraction => "extraction",
            ErrorClass::RewriteTimeout => "rewrite-timeout",
            ErrorClass::RewriteInvalidOutput => "rewrite-invalid-output",
            ErrorClass::Save => "save-failure",
            ErrorClass::ContentDuplicate => "content-duplicate",
            ErrorClass::ContentTooStale => "content-too-stale",
            ErrorClass::AlreadyProcessed => "already-processed",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Best-effort keyword classification for failure messages that arrive
    /// as unstructured text. Deterministic by contract so operator tooling
    /// and tests can rely on the mapping.
    pub fn classify(reason: &str) -> ErrorClass {
        let lower = reason.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            ErrorClass::RewriteTimeout
        } else if lower.contains("empty output") || lower.contains("invalid output") {
            ErrorClass::RewriteInvalidOutput
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("dns")
        {
            ErrorClass::Network
        } else if lower.contains("extract") || lower.contains("scrape") {
            ErrorClass::Extraction
        } else if lower.contains("save") || lower.contains("write failed") {
            ErrorClass::Save
        } else if lower.contains("content duplicate") || lower.contains("duplicate content") {
            ErrorClass::ContentDuplicate
        } else if lower.contains("stale") || lower.contains("too old") {
            ErrorClass::ContentTooStale
        } else if lower.contains("already processed") {
            ErrorClass::AlreadyProcessed
        } else {
            ErrorClass::Unknown
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages containing any of these markers are never retried, regardless
/// of variant. Deterministic contract shared with the store.
const NON_RETRYABLE_MARKERS: [&str; 4] = ["not found", "403", "404", "invalid content"];

/// A per-item processing failure crossing the worker boundary.
///
/// Closed set: workers may only fail an item with one of these variants.
/// `Other` carries unstructured text from external collaborators and is
/// classified by keyword fallback.
#[derive(Debug, Clone, Error)]
pub enum WorkError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Rewrite timed out after {seconds}s")]
    RewriteTimeout { seconds: u64 },

    #[error("Rewrite produced invalid output: {0}")]
    RewriteInvalidOutput(String),

    #[error("Failed to save output: {0}")]
    Save(String),

    #[error("Content duplicate of {original_url}")]
    ContentDuplicate { original_url: String },

    #[error("Content too stale: published {days_old} days ago")]
    ContentTooStale { days_old: i64 },

    #[error("Already processed in session {session} as #{sequence}")]
    AlreadyProcessed { session: String, sequence: u64 },

    #[error("{0}")]
    Other(String),
}

impl WorkError {
    /// The stable classification code for this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkError::Network(_) => ErrorClass::Network,
            WorkError::Extraction(_) => ErrorClass::Extraction,
            WorkError::RewriteTimeout { .. } => ErrorClass::RewriteTimeout,
            WorkError::RewriteInvalidOutput(_) => ErrorClass::RewriteInvalidOutput,
            WorkError::Save(_) => ErrorClass::Save,
            WorkError::ContentDuplicate { .. } => ErrorClass::ContentDuplicate,
            WorkError::ContentTooStale { .. } => ErrorClass::ContentTooStale,
            WorkError::AlreadyProcessed { .. } => ErrorClass::AlreadyProcessed,
            WorkError::Other(reason) => ErrorClass::classify(reason),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Duplicates and already-processed signals never retry; otherwise the
    /// message is checked against the non-retryable marker list.
    pub fn retryable(&self) -> bool {
        match self {
            WorkError::ContentDuplicate { .. }
            | WorkError::ContentTooStale { .. }
            | WorkError::AlreadyProcessed { .. } => false,
            _ => retryable_reason(&self.to_string()),
        }
    }
}

/// The message-level half of the retry contract, also applied to reasons
/// stored as plain text.
pub fn retryable_reason(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    !NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(
            ErrorClass::classify("request timed out after 90s"),
            ErrorClass::RewriteTimeout
        );
        assert_eq!(
            ErrorClass::classify("connection reset by peer"),
            ErrorClass::Network
        );
        assert_eq!(
            ErrorClass::classify("failed to extract article body"),
            ErrorClass::Extraction
        );
        assert_eq!(ErrorClass::classify("???"), ErrorClass::Unknown);
    }

    #[test]
    fn test_non_retryable_markers() {
        assert!(!retryable_reason("page not found"));
        assert!(!retryable_reason("HTTP 403 Forbidden"));
        assert!(!retryable_reason("HTTP 404"));
        assert!(!retryable_reason("invalid content returned"));
        assert!(retryable_reason("connection reset"));
        assert!(retryable_reason("rewrite timed out"));
    }

    #[test]
    fn test_work_error_class() {
        let e = WorkError::RewriteTimeout { seconds: 120 };
        assert_eq!(e.class(), ErrorClass::RewriteTimeout);
        assert!(e.retryable());

        let e = WorkError::ContentDuplicate {
            original_url: "https://a.example/x".into(),
        };
        assert_eq!(e.class(), ErrorClass::ContentDuplicate);
        assert!(!e.retryable());

        let e = WorkError::Extraction("article not found".into());
        assert!(!e.retryable());
    }

    #[test]
    fn test_other_falls_back_to_keyword_classification() {
        let e = WorkError::Other("upstream network hiccup".into());
        assert_eq!(e.class(), ErrorClass::Network);
    }

    #[test]
    fn test_error_class_roundtrip_strings() {
        assert_eq!(ErrorClass::Save.as_str(), "save-failure");
        assert_eq!(ErrorClass::AlreadyProcessed.as_str(), "already-processed");
        assert_eq!(format!("{}", ErrorClass::Network), "network");
    }
}
