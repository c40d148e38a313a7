//! Content-level freshness gate.
//!
//! URL identity catches re-submissions of the same link; this layer
//! catches the same article arriving under a different URL (syndication,
//! tracking-parameter mirrors). Fingerprints are sha256 digests of
//! normalized text, so cosmetic differences in whitespace, case, or
//! punctuation do not defeat detection.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::pipeline::OutputSink;
use crate::store::HistoryStore;

/// Days after which an article's publish date disqualifies it.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// Normalize text for fingerprinting: lowercase, strip punctuation,
/// collapse whitespace runs.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_space = false;
        } else if c.is_whitespace() || c.is_ascii_punctuation() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Joint title+body fingerprint. The separator keeps a short title from
/// blending into the body text.
pub fn content_fingerprint(title: &str, body: &str) -> String {
    sha256_hex(&format!("{}|||{}", normalize(title), normalize(body)))
}

/// Title-only fingerprint for the lossy secondary index.
pub fn title_fingerprint(title: &str) -> String {
    sha256_hex(&normalize(title))
}

/// Whether a publish date falls within the freshness window.
///
/// Fails open: a missing or unparseable date never disqualifies an
/// article, only a date provably older than the window does.
pub fn is_recently_published(date: Option<&str>, max_age_days: i64) -> bool {
    let Some(raw) = date else { return true };
    let Some(published) = parse_publish_date(raw) else {
        tracing::debug!(date = raw, "unparseable publish date, passing through");
        return true;
    };
    Utc::now() - published <= Duration::days(max_age_days)
}

fn parse_publish_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

/// Verdict of a freshness check for extracted content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshnessVerdict {
    Fresh,
    /// Same content was already published; points at the original URL.
    Duplicate {
        original_url: String,
        content_hash: String,
    },
}

/// Checks extracted content against the fingerprint index before any
/// rewrite work is spent on it.
#[derive(Clone)]
pub struct FreshnessGate {
    store: HistoryStore,
}

impl FreshnessGate {
    pub fn new(store: HistoryStore) -> Self {
        Self { store }
    }

    /// Decide whether extracted content is new.
    ///
    /// Only an exact content-hash hit can reject, and even then the
    /// recorded output must still exist in the sink. The title index is
    /// lossy and merely surfaces likely duplicates in the log; a record
    /// whose output vanished, or that carries no output pointer to
    /// verify, is purged so the item can be processed again.
    pub async fn check(
        &self,
        title: &str,
        body: &str,
        sink: &dyn OutputSink,
    ) -> Result<FreshnessVerdict, StoreError> {
        let content_hash = content_fingerprint(title, body);

        let Some(record) = self.store.content_record(&content_hash).await? else {
            if let Some(joined_hash) =
                self.store.title_lookup(&title_fingerprint(title)).await?
            {
                tracing::warn!(
                    title = title,
                    content_hash = %joined_hash,
                    "title seen before with different content, passing through"
                );
            }
            return Ok(FreshnessVerdict::Fresh);
        };

        match (&record.session, record.sequence) {
            (Some(session), Some(sequence)) => {
                if sink.exists(session, sequence).await {
                    Ok(FreshnessVerdict::Duplicate {
                        original_url: record.raw_url,
                        content_hash: record.content_hash,
                    })
                } else {
                    tracing::warn!(
                        content_hash = %record.content_hash,
                        session = %session,
                        sequence = sequence,
                        "fingerprint record points at missing output, purging"
                    );
                    self.store.purge_content_record(&record.content_hash).await?;
                    Ok(FreshnessVerdict::Fresh)
                }
            }
            _ => {
                // No pointer means the completion cannot be verified, so
                // the record does not earn a rejection.
                tracing::warn!(
                    content_hash = %record.content_hash,
                    "fingerprint record has no output pointer, purging"
                );
                self.store.purge_content_record(&record.content_hash).await?;
                Ok(FreshnessVerdict::Fresh)
            }
        }
    }
}
