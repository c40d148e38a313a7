//! Cross-session reconciliation of failed records.
//!
//! A URL can fail in one run and succeed in a later one that uses a
//! different store file (one store per host or per campaign). Left
//! alone, the stale `failed` record keeps the URL on retry lists
//! forever. This job scans the primary store's failures against every
//! other session store and, where the same key completed elsewhere with
//! its output still present, rewrites the failure into a duplicate
//! pointing at that success. The original error reason survives in the
//! audit trail.

use std::path::PathBuf;

use crate::error::StoreError;
use crate::pipeline::OutputSink;
use crate::store::{HistoryStore, WorkStatus};

/// Outcome tallies of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Failed records examined.
    pub examined: u64,
    /// Records rewritten `failed -> duplicate`.
    pub reconciled: u64,
    /// Records with no verified success anywhere; still eligible for retry.
    pub genuinely_failed: u64,
}

/// One reconciliation pass over a primary store.
///
/// Safe to re-run: already-reconciled records are no longer `failed` and
/// drop out of the scan, so a second pass reports zero reconciled.
pub struct ReconcileJob {
    primary: HistoryStore,
    history_paths: Vec<PathBuf>,
    dry_run: bool,
}

impl ReconcileJob {
    pub fn new(primary: HistoryStore, history_paths: Vec<PathBuf>) -> Self {
        Self {
            primary,
            history_paths,
            dry_run: false,
        }
    }

    /// Report what would change without writing anything.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub async fn run(&self, sink: &dyn OutputSink) -> Result<ReconcileReport, StoreError> {
        let failed = self.primary.failed_items().await?;
        let mut report = ReconcileReport {
            examined: failed.len() as u64,
            ..Default::default()
        };
        if failed.is_empty() {
            return Ok(report);
        }

        let mut others = Vec::with_capacity(self.history_paths.len());
        for path in &self.history_paths {
            match path.to_str() {
                Some(p) => others.push(HistoryStore::open(p).await?),
                None => tracing::warn!(path = %path.display(), "skipping non-UTF8 store path"),
            }
        }

        for item in failed {
            let mut resolved = None;
            for other in &others {
                let Some(found) = other.get_by_key(&item.url_key).await? else {
                    continue;
                };
                if found.status != WorkStatus::Completed {
                    continue;
                }
                let (Some(session), Some(sequence)) = (found.session, found.sequence) else {
                    continue;
                };
                // Success only counts if its output is still on disk.
                if sink.exists(&session, sequence).await {
                    resolved = Some((session, sequence));
                    break;
                }
                tracing::debug!(
                    url = %item.raw_url,
                    session = %session,
                    "completed record without output, not a resolution"
                );
            }

            match resolved {
                Some((session, sequence)) => {
                    tracing::info!(
                        url = %item.raw_url,
                        session = %session,
                        sequence = sequence,
                        dry_run = self.dry_run,
                        "failed record resolved by another session"
                    );
                    if !self.dry_run {
                        self.primary
                            .mark_duplicate_of(&item.url_key, &session, sequence)
                            .await?;
                    }
                    report.reconciled += 1;
                }
                None => report.genuinely_failed += 1,
            }
        }

        tracing::info!(
            examined = report.examined,
            reconciled = report.reconciled,
            genuinely_failed = report.genuinely_failed,
            "reconciliation pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FsOutputSink, RewrittenArticle};
    use crate::store::{ClaimOutcome, CompletionMeta};

    async fn fail_in(store: &HistoryStore, url: &str) {
        store
            .claim_or_reuse(url, "golf.example", "2026-08-26", false)
            .await
            .unwrap();
        store.record_failure(url, "rewrite timed out").await.unwrap();
    }

    async fn complete_in(store: &HistoryStore, sink: &FsOutputSink, url: &str, session: &str) -> u64 {
        let ClaimOutcome::Claimed { sequence } = store
            .claim_or_reuse(url, "golf.example", session, false)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };
        sink.write(
            session,
            sequence,
            &RewrittenArticle {
                title: "t".into(),
                body: "b".into(),
            },
        )
        .await
        .unwrap();
        store
            .record_completion(url, sequence, CompletionMeta::default())
            .await
            .unwrap();
        sequence
    }

    #[tokio::test]
    async fn test_failed_with_success_elsewhere_becomes_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let primary = HistoryStore::open(dir.path().join("primary.db").to_str().unwrap())
            .await
            .unwrap();
        let other_path = dir.path().join("other.db");
        let other = HistoryStore::open(other_path.to_str().unwrap()).await.unwrap();
        let sink = FsOutputSink::new(dir.path().join("out"));

        let url = "https://golf.example/a";
        fail_in(&primary, url).await;
        let sequence = complete_in(&other, &sink, url, "2026-08-27").await;

        let job = ReconcileJob::new(primary.clone(), vec![other_path]);
        let report = job.run(&sink).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                examined: 1,
                reconciled: 1,
                genuinely_failed: 0,
            }
        );

        let item = primary.get(url).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Duplicate);
        assert_eq!(item.resolved_session.as_deref(), Some("2026-08-27"));
        assert_eq!(item.resolved_sequence, Some(sequence));
        // Original failure reason is preserved.
        assert_eq!(item.last_error_reason.as_deref(), Some("rewrite timed out"));

        // Second pass finds nothing left to do.
        let again = job.run(&sink).await.unwrap();
        assert_eq!(again.reconciled, 0);
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn test_failure_without_success_stays_failed() {
        let dir = tempfile::tempdir().unwrap();
        let primary = HistoryStore::open(dir.path().join("primary.db").to_str().unwrap())
            .await
            .unwrap();
        let other_path = dir.path().join("other.db");
        HistoryStore::open(other_path.to_str().unwrap()).await.unwrap();
        let sink = FsOutputSink::new(dir.path().join("out"));

        let url = "https://golf.example/lonely";
        fail_in(&primary, url).await;

        let report = ReconcileJob::new(primary.clone(), vec![other_path])
            .run(&sink)
            .await
            .unwrap();
        assert_eq!(report.genuinely_failed, 1);
        assert_eq!(report.reconciled, 0);

        let item = primary.get(url).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Failed);
    }

    #[tokio::test]
    async fn test_success_with_missing_output_does_not_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let primary = HistoryStore::open(dir.path().join("primary.db").to_str().unwrap())
            .await
            .unwrap();
        let other_path = dir.path().join("other.db");
        let other = HistoryStore::open(other_path.to_str().unwrap()).await.unwrap();
        let sink = FsOutputSink::new(dir.path().join("out"));

        let url = "https://golf.example/a";
        fail_in(&primary, url).await;
        let sequence = complete_in(&other, &sink, url, "2026-08-27").await;
        std::fs::remove_file(
            dir.path()
                .join("out")
                .join("2026-08-27")
                .join(format!("article_{:03}.md", sequence)),
        )
        .unwrap();

        let report = ReconcileJob::new(primary.clone(), vec![other_path])
            .run(&sink)
            .await
            .unwrap();
        assert_eq!(report.reconciled, 0);
        assert_eq!(report.genuinely_failed, 1);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let primary = HistoryStore::open(dir.path().join("primary.db").to_str().unwrap())
            .await
            .unwrap();
        let other_path = dir.path().join("other.db");
        let other = HistoryStore::open(other_path.to_str().unwrap()).await.unwrap();
        let sink = FsOutputSink::new(dir.path().join("out"));

        let url = "https://golf.example/a";
        fail_in(&primary, url).await;
        complete_in(&other, &sink, url, "2026-08-27").await;

        let report = ReconcileJob::new(primary.clone(), vec![other_path])
            .dry_run()
            .run(&sink)
            .await
            .unwrap();
        assert_eq!(report.reconciled, 1);

        let item = primary.get(url).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Failed);
    }
}
