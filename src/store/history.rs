//! SQLite-backed identity and deduplication store.
//!
//! Holds every work item's lifecycle record keyed by the canonical URL
//! hash, plus the content/title fingerprint indexes and interruption
//! points. A single embedded transactional database replaces the ad-hoc
//! snapshot files of earlier designs: every mutation commits immediately,
//! and concurrent readers never observe a partial write.

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::error::{ErrorClass, StoreError};

use super::key::url_key;
use super::record::{
    AuditEntry, BatchCheckResult, ClaimOutcome, CompletionMeta, DuplicateEntry, WorkItem,
    WorkStatus,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS work_items (
    url_key           TEXT PRIMARY KEY,
    raw_url           TEXT NOT NULL,
    status            TEXT NOT NULL,
    sequence          INTEGER UNIQUE,
    partition         TEXT,
    session           TEXT,
    claimed_at        TEXT,
    completed_at      TEXT,
    failed_at         TEXT,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    last_error_reason TEXT,
    error_class       TEXT,
    content_hash      TEXT,
    title_hash        TEXT,
    resolved_session  TEXT,
    resolved_sequence INTEGER,
    audit             TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
CREATE INDEX IF NOT EXISTS idx_work_items_session ON work_items(session);

CREATE TABLE IF NOT EXISTS content_records (
    content_hash   TEXT PRIMARY KEY,
    raw_url        TEXT NOT NULL,
    title          TEXT NOT NULL,
    publish_date   TEXT,
    processed_at   TEXT NOT NULL,
    content_length INTEGER,
    session        TEXT,
    sequence       INTEGER
);

CREATE TABLE IF NOT EXISTS title_index (
    title_hash   TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS interruption_points (
    partition     TEXT PRIMARY KEY,
    last_sequence INTEGER,
    recorded_at   TEXT NOT NULL,
    reason        TEXT NOT NULL
);
"#;

/// Age after which a `processing` claim is considered abandoned.
pub const DEFAULT_STALENESS_SECS: i64 = 3600;

/// A content fingerprint record used for cross-URL duplicate detection.
#[derive(Debug, Clone)]
pub struct ContentRecord {
    pub content_hash: String,
    pub raw_url: String,
    pub title: String,
    pub publish_date: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub content_length: Option<usize>,
    pub session: Option<String>,
    pub sequence: Option<u64>,
}

/// A checkpoint recorded before a worker is forcibly terminated.
#[derive(Debug, Clone)]
pub struct InterruptionPoint {
    pub partition: String,
    pub last_sequence: Option<u64>,
    pub recorded_at: DateTime<Utc>,
    pub reason: String,
}

/// Per-status record counts for operator tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub duplicate: u64,
    pub skipped: u64,
    pub content_records: u64,
}

/// Recent-window activity summary.
#[derive(Debug, Clone, Default)]
pub struct HistorySummary {
    pub total_urls: u64,
    pub total_contents: u64,
    pub recent_urls: u64,
    pub recent_contents: u64,
}

/// The identity & deduplication store.
///
/// Cheap to clone; clones share the connection pool and the sequence
/// allocator.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
    last_sequence: Arc<AtomicI64>,
    staleness_secs: i64,
}

impl HistoryStore {
    /// Open (or create) the store at `path`.
    ///
    /// Seeds the sequence allocator from a scan of the historical maximum,
    /// so numbers issued after a restart continue strictly increasing.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        let max: Option<i64> = sqlx::query("SELECT MAX(sequence) AS max_seq FROM work_items")
            .fetch_one(&pool)
            .await?
            .get("max_seq");

        tracing::info!(path = path, max_sequence = max.unwrap_or(0), "history store opened");

        Ok(Self {
            pool,
            last_sequence: Arc::new(AtomicI64::new(max.unwrap_or(0))),
            staleness_secs: DEFAULT_STALENESS_SECS,
        })
    }

    /// Override the processing-claim staleness threshold.
    pub fn with_staleness_secs(mut self, secs: i64) -> Self {
        self.staleness_secs = secs;
        self
    }

    fn next_sequence(&self) -> u64 {
        (self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1) as u64
    }

    /// Highest sequence number issued so far (0 if none).
    pub fn last_issued_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst).max(0) as u64
    }

    fn is_stale(&self, claimed_at: Option<DateTime<Utc>>) -> bool {
        match claimed_at {
            Some(t) => Utc::now() - t > Duration::seconds(self.staleness_secs),
            // A processing record without a claim timestamp cannot be
            // aged; treat it as abandoned.
            None => true,
        }
    }

    /// Look up the full record for a URL.
    pub async fn get(&self, url: &str) -> Result<Option<WorkItem>, StoreError> {
        let key = url_key(url);
        self.get_by_key(&key).await
    }

    pub(crate) async fn get_by_key(&self, key: &str) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query("SELECT * FROM work_items WHERE url_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_item))
    }

    /// Partition a candidate list into new vs duplicate. Pure read; never
    /// mutates state. Repeats of one key within the batch collapse to a
    /// single `new` entry. Unknown or malformed URLs are treated as new.
    pub async fn batch_check(&self, urls: &[String]) -> Result<BatchCheckResult, StoreError> {
        let mut result = BatchCheckResult::default();
        result.stats.total = urls.len();
        let mut seen = std::collections::HashSet::new();

        for url in urls {
            let key = url_key(url);
            if !seen.insert(key.clone()) {
                continue;
            }

            let Some(item) = self.get_by_key(&key).await? else {
                result.new.push(url.clone());
                continue;
            };

            match item.status {
                WorkStatus::New => result.new.push(url.clone()),
                WorkStatus::Processing => {
                    if self.is_stale(item.claimed_at) {
                        tracing::warn!(url = %url, "abandoned processing claim, re-offering");
                        result.new.push(url.clone());
                    } else {
                        result.stats.processing += 1;
                        result.duplicates.push(DuplicateEntry {
                            url: url.clone(),
                            reason: "currently processing".to_string(),
                            status: item.status,
                            partition: item.partition,
                            session: item.session,
                            sequence: item.sequence,
                        });
                    }
                }
                WorkStatus::Completed
                | WorkStatus::Duplicate
                | WorkStatus::Skipped
                | WorkStatus::Failed => {
                    match item.status {
                        WorkStatus::Completed => result.stats.completed += 1,
                        WorkStatus::Failed => result.stats.failed += 1,
                        WorkStatus::Skipped => result.stats.skipped += 1,
                        _ => {}
                    }
                    let reason = item
                        .last_error_reason
                        .clone()
                        .unwrap_or_else(|| "already processed".to_string());
                    result.duplicates.push(DuplicateEntry {
                        url: url.clone(),
                        reason,
                        status: item.status,
                        partition: item.partition,
                        session: item.session,
                        sequence: item.sequence,
                    });
                }
            }
        }

        result.stats.new = result.new.len();
        result.stats.duplicate = result.duplicates.len();

        tracing::debug!(
            total = result.stats.total,
            new = result.stats.new,
            duplicate = result.stats.duplicate,
            "batch check"
        );
        Ok(result)
    }

    /// Claim a URL for processing, or learn that it was already handled.
    ///
    /// Idempotent while a fresh claim is outstanding: repeat calls return
    /// the same sequence number. A stale claim is re-claimed in place,
    /// reusing its sequence so output naming stays continuous. `retry`
    /// re-opens a `failed` record and bumps its retry count.
    pub async fn claim_or_reuse(
        &self,
        url: &str,
        partition: &str,
        session: &str,
        retry: bool,
    ) -> Result<ClaimOutcome, StoreError> {
        let key = url_key(url);
        let now = Utc::now().to_rfc3339();

        let Some(item) = self.get_by_key(&key).await? else {
            let sequence = self.next_sequence();
            let audit = serde_json::to_string(&vec![AuditEntry::new(
                WorkStatus::New,
                WorkStatus::Processing,
                None,
            )])?;
            sqlx::query(
                "INSERT INTO work_items
                    (url_key, raw_url, status, sequence, partition, session, claimed_at, audit)
                 VALUES (?1, ?2, 'processing', ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&key)
            .bind(url)
            .bind(sequence as i64)
            .bind(partition)
            .bind(session)
            .bind(&now)
            .bind(&audit)
            .execute(&self.pool)
            .await?;
            return Ok(ClaimOutcome::Claimed { sequence });
        };

        match item.status {
            WorkStatus::Processing => {
                if self.is_stale(item.claimed_at) {
                    let sequence = match item.sequence {
                        Some(s) => s,
                        None => self.next_sequence(),
                    };
                    sqlx::query(
                        "UPDATE work_items
                         SET claimed_at = ?2, partition = ?3, session = ?4,
                             sequence = ?5, retry_count = retry_count + 1
                         WHERE url_key = ?1",
                    )
                    .bind(&key)
                    .bind(&now)
                    .bind(partition)
                    .bind(session)
                    .bind(sequence as i64)
                    .execute(&self.pool)
                    .await?;
                    self.append_audit(
                        &key,
                        AuditEntry::new(
                            WorkStatus::Processing,
                            WorkStatus::Processing,
                            Some("reclaimed stale processing claim".into()),
                        ),
                    )
                    .await?;
                    Ok(ClaimOutcome::Claimed { sequence })
                } else {
                    // Fresh claim: idempotent re-issue of the same number.
                    let sequence = item.sequence.ok_or_else(|| StoreError::UnknownItem(url.to_string()))?;
                    Ok(ClaimOutcome::Claimed { sequence })
                }
            }
            WorkStatus::New => {
                let sequence = match item.sequence {
                    Some(s) => s,
                    None => self.next_sequence(),
                };
                sqlx::query(
                    "UPDATE work_items
                     SET status = 'processing', claimed_at = ?2, partition = ?3,
                         session = ?4, sequence = ?5
                     WHERE url_key = ?1",
                )
                .bind(&key)
                .bind(&now)
                .bind(partition)
                .bind(session)
                .bind(sequence as i64)
                .execute(&self.pool)
                .await?;
                self.append_audit(
                    &key,
                    AuditEntry::new(WorkStatus::New, WorkStatus::Processing, None),
                )
                .await?;
                Ok(ClaimOutcome::Claimed { sequence })
            }
            WorkStatus::Failed if retry => {
                let sequence = match item.sequence {
                    Some(s) => s,
                    None => self.next_sequence(),
                };
                sqlx::query(
                    "UPDATE work_items
                     SET status = 'processing', claimed_at = ?2, partition = ?3,
                         session = ?4, sequence = ?5, retry_count = retry_count + 1
                     WHERE url_key = ?1",
                )
                .bind(&key)
                .bind(&now)
                .bind(partition)
                .bind(session)
                .bind(sequence as i64)
                .execute(&self.pool)
                .await?;
                self.append_audit(
                    &key,
                    AuditEntry::new(
                        WorkStatus::Failed,
                        WorkStatus::Processing,
                        Some("explicit retry".into()),
                    ),
                )
                .await?;
                Ok(ClaimOutcome::Claimed { sequence })
            }
            status => Ok(ClaimOutcome::AlreadyProcessed {
                status,
                session: item.session,
                sequence: item.sequence,
            }),
        }
    }

    /// Record a successful completion. Final: subsequent batch checks for
    /// this URL always report a duplicate.
    pub async fn record_completion(
        &self,
        url: &str,
        sequence: u64,
        meta: CompletionMeta,
    ) -> Result<(), StoreError> {
        let key = url_key(url);
        let item = self
            .get_by_key(&key)
            .await?
            .ok_or_else(|| StoreError::UnknownItem(url.to_string()))?;
        if !item.status.can_transition_to(WorkStatus::Completed) {
            return Err(StoreError::InvalidTransition {
                from: item.status.as_str().to_string(),
                to: "completed".to_string(),
                url: url.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE work_items
             SET status = 'completed', completed_at = ?2, sequence = ?3,
                 content_hash = ?4, title_hash = ?5
             WHERE url_key = ?1",
        )
        .bind(&key)
        .bind(&now)
        .bind(sequence as i64)
        .bind(&meta.content_hash)
        .bind(&meta.title_hash)
        .execute(&self.pool)
        .await?;
        self.append_audit(
            &key,
            AuditEntry::new(item.status, WorkStatus::Completed, None),
        )
        .await?;

        if let (Some(hash), Some(title)) = (&meta.content_hash, &meta.title) {
            self.insert_content_record(
                hash,
                url,
                title,
                meta.title_hash.as_deref(),
                meta.publish_date.as_deref(),
                meta.content_length,
                item.session.as_deref(),
                Some(sequence),
            )
            .await?;
        }
        Ok(())
    }

    /// Record a failure with its classified error class. Persisted
    /// immediately; failure data feeds operator-visible reports.
    pub async fn record_failure(&self, url: &str, reason: &str) -> Result<(), StoreError> {
        self.record_failure_class(url, reason, ErrorClass::classify(reason))
            .await
    }

    /// Record a failure with an explicit class from a structured error.
    pub async fn record_failure_class(
        &self,
        url: &str,
        reason: &str,
        class: ErrorClass,
    ) -> Result<(), StoreError> {
        let key = url_key(url);
        let now = Utc::now().to_rfc3339();

        let from = match self.get_by_key(&key).await? {
            Some(item) => {
                if item.status != WorkStatus::Failed
                    && !item.status.can_transition_to(WorkStatus::Failed)
                {
                    return Err(StoreError::InvalidTransition {
                        from: item.status.as_str().to_string(),
                        to: "failed".to_string(),
                        url: url.to_string(),
                    });
                }
                item.status
            }
            // Failures can surface before a claim (e.g. during discovery);
            // keep the record anyway so the reason is not lost.
            None => {
                sqlx::query(
                    "INSERT INTO work_items (url_key, raw_url, status) VALUES (?1, ?2, 'new')",
                )
                .bind(&key)
                .bind(url)
                .execute(&self.pool)
                .await?;
                WorkStatus::New
            }
        };

        sqlx::query(
            "UPDATE work_items
             SET status = 'failed', failed_at = ?2, last_error_reason = ?3, error_class = ?4
             WHERE url_key = ?1",
        )
        .bind(&key)
        .bind(&now)
        .bind(reason)
        .bind(class.as_str())
        .execute(&self.pool)
        .await?;
        self.append_audit(
            &key,
            AuditEntry::new(from, WorkStatus::Failed, Some(reason.to_string())),
        )
        .await?;
        Ok(())
    }

    /// Terminal skip of a claimed item (content duplicate or stale date).
    pub async fn record_skipped(&self, url: &str, reason: &str) -> Result<(), StoreError> {
        let key = url_key(url);
        let item = self
            .get_by_key(&key)
            .await?
            .ok_or_else(|| StoreError::UnknownItem(url.to_string()))?;
        if !item.status.can_transition_to(WorkStatus::Skipped) {
            return Err(StoreError::InvalidTransition {
                from: item.status.as_str().to_string(),
                to: "skipped".to_string(),
                url: url.to_string(),
            });
        }
        sqlx::query(
            "UPDATE work_items SET status = 'skipped', last_error_reason = ?2 WHERE url_key = ?1",
        )
        .bind(&key)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        self.append_audit(
            &key,
            AuditEntry::new(item.status, WorkStatus::Skipped, Some(reason.to_string())),
        )
        .await?;
        Ok(())
    }

    /// Reconciliation-only transition: a failed record whose URL succeeded
    /// in another session becomes a non-retryable duplicate pointing at
    /// that success. The original error reason stays in place.
    pub async fn mark_duplicate_of(
        &self,
        url_key_str: &str,
        resolved_session: &str,
        resolved_sequence: u64,
    ) -> Result<(), StoreError> {
        let item = self
            .get_by_key(url_key_str)
            .await?
            .ok_or_else(|| StoreError::UnknownItem(url_key_str.to_string()))?;
        if !item.status.can_transition_to(WorkStatus::Duplicate) {
            return Err(StoreError::InvalidTransition {
                from: item.status.as_str().to_string(),
                to: "duplicate".to_string(),
                url: item.raw_url,
            });
        }
        sqlx::query(
            "UPDATE work_items
             SET status = 'duplicate', resolved_session = ?2, resolved_sequence = ?3
             WHERE url_key = ?1",
        )
        .bind(url_key_str)
        .bind(resolved_session)
        .bind(resolved_sequence as i64)
        .execute(&self.pool)
        .await?;
        self.append_audit(
            url_key_str,
            AuditEntry::new(
                item.status,
                WorkStatus::Duplicate,
                Some(format!(
                    "completed in session {} as #{}",
                    resolved_session, resolved_sequence
                )),
            ),
        )
        .await?;
        Ok(())
    }

    /// All records currently in `failed` state.
    pub async fn failed_items(&self) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query("SELECT * FROM work_items WHERE status = 'failed'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_item).collect())
    }

    async fn append_audit(&self, key: &str, entry: AuditEntry) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT audit FROM work_items WHERE url_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(()) };
        let raw: String = row.get("audit");
        let mut trail: Vec<AuditEntry> = serde_json::from_str(&raw).unwrap_or_default();
        trail.push(entry);
        sqlx::query("UPDATE work_items SET audit = ?2 WHERE url_key = ?1")
            .bind(key)
            .bind(serde_json::to_string(&trail)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The audit trail for a URL, oldest first.
    pub async fn audit_trail(&self, url: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let key = url_key(url);
        let row = sqlx::query("SELECT audit FROM work_items WHERE url_key = ?1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get("audit");
                Ok(serde_json::from_str(&raw).unwrap_or_default())
            }
            None => Ok(Vec::new()),
        }
    }

    // --- Content fingerprint index ---

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_content_record(
        &self,
        content_hash: &str,
        raw_url: &str,
        title: &str,
        title_hash: Option<&str>,
        publish_date: Option<&str>,
        content_length: Option<usize>,
        session: Option<&str>,
        sequence: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO content_records
                (content_hash, raw_url, title, publish_date, processed_at,
                 content_length, session, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(content_hash) DO UPDATE SET
                raw_url = excluded.raw_url,
                title = excluded.title,
                processed_at = excluded.processed_at,
                session = excluded.session,
                sequence = excluded.sequence",
        )
        .bind(content_hash)
        .bind(raw_url)
        .bind(title)
        .bind(publish_date)
        .bind(&now)
        .bind(content_length.map(|v| v as i64))
        .bind(session)
        .bind(sequence.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        if let Some(th) = title_hash {
            sqlx::query(
                "INSERT INTO title_index (title_hash, content_hash) VALUES (?1, ?2)
                 ON CONFLICT(title_hash) DO UPDATE SET content_hash = excluded.content_hash",
            )
            .bind(th)
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn content_record(&self, content_hash: &str) -> Result<Option<ContentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM content_records WHERE content_hash = ?1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ContentRecord {
            content_hash: r.get("content_hash"),
            raw_url: r.get("raw_url"),
            title: r.get("title"),
            publish_date: r.get("publish_date"),
            processed_at: parse_ts(r.get("processed_at")).unwrap_or_else(Utc::now),
            content_length: r.get::<Option<i64>, _>("content_length").map(|v| v as usize),
            session: r.get("session"),
            sequence: r.get::<Option<i64>, _>("sequence").map(|v| v as u64),
        }))
    }

    /// Remove a stale content record and any title-index rows joining to it.
    pub async fn purge_content_record(&self, content_hash: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM content_records WHERE content_hash = ?1")
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM title_index WHERE content_hash = ?1")
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fuzzy join: title hash to content hash. Never authoritative alone.
    pub async fn title_lookup(&self, title_hash: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT content_hash FROM title_index WHERE title_hash = ?1")
            .bind(title_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("content_hash")))
    }

    // --- Interruption points ---

    pub async fn save_interruption(
        &self,
        partition: &str,
        last_sequence: Option<u64>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO interruption_points (partition, last_sequence, recorded_at, reason)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(partition) DO UPDATE SET
                last_sequence = excluded.last_sequence,
                recorded_at = excluded.recorded_at,
                reason = excluded.reason",
        )
        .bind(partition)
        .bind(last_sequence.map(|v| v as i64))
        .bind(&now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        tracing::info!(partition = partition, ?last_sequence, "interruption point saved");
        Ok(())
    }

    /// Read and clear all interruption points. The next run consumes
    /// these to resume interrupted partitions first.
    pub async fn take_interruptions(&self) -> Result<Vec<InterruptionPoint>, StoreError> {
        let rows = sqlx::query("SELECT * FROM interruption_points")
            .fetch_all(&self.pool)
            .await?;
        let points = rows
            .into_iter()
            .map(|r| InterruptionPoint {
                partition: r.get("partition"),
                last_sequence: r.get::<Option<i64>, _>("last_sequence").map(|v| v as u64),
                recorded_at: parse_ts(r.get("recorded_at")).unwrap_or_else(Utc::now),
                reason: r.get("reason"),
            })
            .collect();
        sqlx::query("DELETE FROM interruption_points")
            .execute(&self.pool)
            .await?;
        Ok(points)
    }

    // --- Operator queries ---

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END) AS processing,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                SUM(CASE WHEN status = 'duplicate' THEN 1 ELSE 0 END) AS duplicate,
                SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END) AS skipped
             FROM work_items",
        )
        .fetch_one(&self.pool)
        .await?;
        let contents: i64 = sqlx::query("SELECT COUNT(*) AS n FROM content_records")
            .fetch_one(&self.pool)
            .await?
            .get("n");

        Ok(StoreStats {
            total: row.get::<i64, _>("total") as u64,
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0) as u64,
            completed: row.get::<Option<i64>, _>("completed").unwrap_or(0) as u64,
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0) as u64,
            duplicate: row.get::<Option<i64>, _>("duplicate").unwrap_or(0) as u64,
            skipped: row.get::<Option<i64>, _>("skipped").unwrap_or(0) as u64,
            content_records: contents as u64,
        })
    }

    /// Activity within the last `days` days.
    pub async fn processing_history(&self, days: i64) -> Result<HistorySummary, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let recent_urls: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM work_items
             WHERE COALESCE(completed_at, failed_at, claimed_at) > ?1",
        )
        .bind(&cutoff)
        .fetch_one(&self.pool)
        .await?
        .get("n");
        let recent_contents: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM content_records WHERE processed_at > ?1")
                .bind(&cutoff)
                .fetch_one(&self.pool)
                .await?
                .get("n");
        let stats = self.stats().await?;
        Ok(HistorySummary {
            total_urls: stats.total,
            total_contents: stats.content_records,
            recent_urls: recent_urls as u64,
            recent_contents: recent_contents as u64,
        })
    }

    /// Administrative retention pass: drop records older than `days`.
    /// The only path that physically deletes work items.
    pub async fn prune_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let pruned = sqlx::query(
            "DELETE FROM work_items
             WHERE COALESCE(completed_at, failed_at, claimed_at) < ?1",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM content_records WHERE processed_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM title_index
             WHERE content_hash NOT IN (SELECT content_hash FROM content_records)",
        )
        .execute(&self.pool)
        .await?;
        tracing::info!(pruned = pruned, days = days, "retention pruning");
        Ok(pruned)
    }
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_item(row: SqliteRow) -> WorkItem {
    let status_raw: String = row.get("status");
    WorkItem {
        url_key: row.get("url_key"),
        raw_url: row.get("raw_url"),
        status: WorkStatus::parse(&status_raw).unwrap_or(WorkStatus::New),
        sequence: row.get::<Option<i64>, _>("sequence").map(|v| v as u64),
        partition: row.get("partition"),
        session: row.get("session"),
        claimed_at: parse_ts(row.get("claimed_at")),
        completed_at: parse_ts(row.get("completed_at")),
        failed_at: parse_ts(row.get("failed_at")),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_error_reason: row.get("last_error_reason"),
        error_class: row.get("error_class"),
        content_hash: row.get("content_hash"),
        title_hash: row.get("title_hash"),
        resolved_session: row.get("resolved_session"),
        resolved_sequence: row.get::<Option<i64>, _>("resolved_sequence").map(|v| v as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &tempfile::TempDir) -> HistoryStore {
        let path = dir.path().join("history.db");
        HistoryStore::open(path.to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_claim_then_batch_check_reports_processing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let url = "https://golf.example/a".to_string();
        let outcome = store
            .claim_or_reuse(&url, "golf.example", "2026-08-27", false)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { sequence: 1 });

        let check = store.batch_check(&[url.clone()]).await.unwrap();
        assert!(check.new.is_empty());
        assert_eq!(check.duplicates.len(), 1);
        assert_eq!(check.duplicates[0].reason, "currently processing");
        assert_eq!(check.duplicates[0].status, WorkStatus::Processing);
    }

    #[tokio::test]
    async fn test_completion_makes_batch_check_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a".to_string();

        let ClaimOutcome::Claimed { sequence } = store
            .claim_or_reuse(&url, "golf.example", "2026-08-27", false)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };
        store
            .record_completion(&url, sequence, CompletionMeta::default())
            .await
            .unwrap();

        let check = store.batch_check(&[url.clone()]).await.unwrap();
        assert!(check.new.is_empty());
        assert_eq!(check.duplicates[0].status, WorkStatus::Completed);
        assert_eq!(check.stats.completed, 1);
    }

    #[tokio::test]
    async fn test_claim_is_idempotent_while_processing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a";

        let first = store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap();
        let second = store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sequence_monotonic_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let path = path.to_str().unwrap();

        let store = HistoryStore::open(path).await.unwrap();
        for i in 0..3 {
            let url = format!("https://golf.example/{}", i);
            store
                .claim_or_reuse(&url, "golf.example", "2026-08-27", false)
                .await
                .unwrap();
        }
        assert_eq!(store.last_issued_sequence(), 3);
        drop(store);

        let reopened = HistoryStore::open(path).await.unwrap();
        let outcome = reopened
            .claim_or_reuse("https://golf.example/fresh", "golf.example", "2026-08-28", false)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { sequence: 4 });
    }

    #[tokio::test]
    async fn test_terminal_state_returns_already_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a";

        let ClaimOutcome::Claimed { sequence } = store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };
        store
            .record_completion(url, sequence, CompletionMeta::default())
            .await
            .unwrap();

        match store
            .claim_or_reuse(url, "golf.example", "2026-08-28", false)
            .await
            .unwrap()
        {
            ClaimOutcome::AlreadyProcessed {
                status,
                session,
                sequence,
            } => {
                assert_eq!(status, WorkStatus::Completed);
                assert_eq!(session.as_deref(), Some("2026-08-27"));
                assert_eq!(sequence, Some(1));
            }
            other => panic!("expected AlreadyProcessed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_retry_reuses_sequence_and_bumps_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a";

        let ClaimOutcome::Claimed { sequence } = store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };
        store.record_failure(url, "connection reset").await.unwrap();

        // Without the retry flag the failed record is terminal to callers.
        match store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap()
        {
            ClaimOutcome::AlreadyProcessed { status, .. } => {
                assert_eq!(status, WorkStatus::Failed)
            }
            other => panic!("expected AlreadyProcessed, got {:?}", other),
        }

        let retried = store
            .claim_or_reuse(url, "golf.example", "2026-08-27", true)
            .await
            .unwrap();
        assert_eq!(retried, ClaimOutcome::Claimed { sequence });

        let item = store.get(url).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Processing);
        assert_eq!(item.retry_count, 1);
    }

    #[tokio::test]
    async fn test_stale_processing_claim_is_reoffered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await.with_staleness_secs(0);
        let url = "https://golf.example/a".to_string();

        let ClaimOutcome::Claimed { sequence } = store
            .claim_or_reuse(&url, "golf.example", "2026-08-27", false)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };

        // Zero staleness: the claim ages out immediately.
        let check = store.batch_check(&[url.clone()]).await.unwrap();
        assert_eq!(check.new, vec![url.clone()]);

        // Re-claiming keeps the same sequence number.
        let reclaimed = store
            .claim_or_reuse(&url, "golf.example", "2026-08-28", false)
            .await
            .unwrap();
        assert_eq!(reclaimed, ClaimOutcome::Claimed { sequence });
        let item = store.get(&url).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
    }

    #[tokio::test]
    async fn test_failure_classification_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a";

        store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap();
        store
            .record_failure(url, "request timed out after 90s")
            .await
            .unwrap();

        let item = store.get(url).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Failed);
        assert_eq!(item.error_class.as_deref(), Some("rewrite-timeout"));
        assert_eq!(
            item.last_error_reason.as_deref(),
            Some("request timed out after 90s")
        );
    }

    #[tokio::test]
    async fn test_completed_record_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a";

        let ClaimOutcome::Claimed { sequence } = store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };
        store
            .record_completion(url, sequence, CompletionMeta::default())
            .await
            .unwrap();

        let err = store
            .record_completion(url, sequence, CompletionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_batch_check_collapses_intra_batch_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let urls = vec![
            "https://golf.example/a".to_string(),
            "https://Golf.example/a#frag".to_string(),
            "https://golf.example/b".to_string(),
        ];
        let check = store.batch_check(&urls).await.unwrap();
        assert_eq!(check.new.len(), 2);
        assert_eq!(check.stats.total, 3);
    }

    #[tokio::test]
    async fn test_audit_trail_grows_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let url = "https://golf.example/a";

        store
            .claim_or_reuse(url, "golf.example", "2026-08-27", false)
            .await
            .unwrap();
        store.record_failure(url, "HTTP 500").await.unwrap();
        store
            .claim_or_reuse(url, "golf.example", "2026-08-27", true)
            .await
            .unwrap();

        let trail = store.audit_trail(url).await.unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].to, "processing");
        assert_eq!(trail[1].to, "failed");
        assert_eq!(trail[2].to, "processing");
    }

    #[tokio::test]
    async fn test_interruption_points_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_interruption("golf.example", Some(17), "timeout")
            .await
            .unwrap();
        let points = store.take_interruptions().await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].partition, "golf.example");
        assert_eq!(points[0].last_sequence, Some(17));

        assert!(store.take_interruptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .claim_or_reuse("https://golf.example/fresh", "golf.example", "2026-08-27", false)
            .await
            .unwrap();
        let pruned = store.prune_older_than(30).await.unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        for i in 0..3 {
            let url = format!("https://golf.example/{}", i);
            store
                .claim_or_reuse(&url, "golf.example", "2026-08-27", false)
                .await
                .unwrap();
        }
        store
            .record_completion("https://golf.example/0", 1, CompletionMeta::default())
            .await
            .unwrap();
        store
            .record_failure("https://golf.example/1", "HTTP 404")
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processing, 1);
    }
}
