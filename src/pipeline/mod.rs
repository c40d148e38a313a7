//! Processing pipeline collaborators.
//!
//! The controller and workers talk to the outside world only through the
//! trait boundaries defined here. Extraction and rewriting are injected
//! by the embedding application; the filesystem sink ships in-tree
//! because output presence checks are part of dedup semantics.

pub mod sink;
pub mod worker;

use async_trait::async_trait;

use crate::error::WorkError;

pub use sink::FsOutputSink;
pub use worker::{Worker, WorkerProgress};

/// An article as pulled from its source URL.
#[derive(Debug, Clone)]
pub struct ExtractedArticle {
    pub title: String,
    pub body: String,
    pub images: Vec<String>,
    /// As reported by the source, in whatever format it uses.
    pub publish_date: Option<String>,
}

/// An article after rewriting, ready for the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenArticle {
    pub title: String,
    pub body: String,
}

/// Pulls an article out of a URL.
#[async_trait]
pub trait ArticleExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ExtractedArticle, WorkError>;
}

/// Rewrites extracted content. The expensive step; its latency drives
/// the concurrency controller.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, article: &ExtractedArticle) -> Result<RewrittenArticle, WorkError>;
}

/// Destination for finished articles, addressed by session and sequence.
///
/// `exists` is part of dedup semantics: a store record whose output this
/// returns `false` for is treated as stale and self-healed.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(
        &self,
        session: &str,
        sequence: u64,
        article: &RewrittenArticle,
    ) -> Result<(), WorkError>;

    async fn exists(&self, session: &str, sequence: u64) -> bool;
}
