//! Final run report.

/// Cap on retained error entries so a pathological run cannot balloon
/// the report.
pub const MAX_RECENT_ERRORS: usize = 50;

/// One retained failure for the operator-facing report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub url: String,
    pub class: String,
    pub reason: String,
}

/// Accounting for one complete controller run.
///
/// Every input URL lands in exactly one bucket; `is_consistent` checks
/// that the books balance.
#[derive(Debug, Clone, Default)]
pub struct ProcessingReport {
    /// URLs submitted to the run, before dedup.
    pub total_input: usize,
    /// Batch-check duplicates plus gate rejections of claimed items.
    pub duplicates_skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Most recent failures, capped at [`MAX_RECENT_ERRORS`].
    pub recent_errors: Vec<ReportedError>,
}

impl ProcessingReport {
    pub fn push_error(&mut self, url: String, class: String, reason: String) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.remove(0);
        }
        self.recent_errors.push(ReportedError { url, class, reason });
    }

    /// succeeded + failed + duplicates_skipped must account for every
    /// input URL.
    pub fn is_consistent(&self) -> bool {
        self.succeeded + self.failed + self.duplicates_skipped == self.total_input
    }
}

impl std::fmt::Display for ProcessingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} input, {} succeeded, {} failed, {} duplicates/skipped",
            self.total_input, self.succeeded, self.failed, self.duplicates_skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_check() {
        let report = ProcessingReport {
            total_input: 10,
            duplicates_skipped: 3,
            succeeded: 5,
            failed: 2,
            recent_errors: Vec::new(),
        };
        assert!(report.is_consistent());

        let off_by_one = ProcessingReport {
            total_input: 10,
            succeeded: 5,
            failed: 2,
            duplicates_skipped: 2,
            recent_errors: Vec::new(),
        };
        assert!(!off_by_one.is_consistent());
    }

    #[test]
    fn test_error_log_is_bounded() {
        let mut report = ProcessingReport::default();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            report.push_error(
                format!("https://golf.example/{}", i),
                "network".into(),
                "connection reset".into(),
            );
        }
        assert_eq!(report.recent_errors.len(), MAX_RECENT_ERRORS);
        // Oldest entries were evicted.
        assert_eq!(
            report.recent_errors[0].url,
            format!("https://golf.example/{}", 10)
        );
    }
}
