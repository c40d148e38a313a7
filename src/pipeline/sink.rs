//! Filesystem output sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::WorkError;

use super::{OutputSink, RewrittenArticle};

/// Writes finished articles under `{root}/{session}/article_NNN.md`.
///
/// The zero-padded sequence keeps directory listings in processing order
/// and makes the path derivable from a store record alone.
#[derive(Debug, Clone)]
pub struct FsOutputSink {
    root: PathBuf,
}

impl FsOutputSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn article_path(&self, session: &str, sequence: u64) -> PathBuf {
        self.root
            .join(session)
            .join(format!("article_{:03}.md", sequence))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl OutputSink for FsOutputSink {
    async fn write(
        &self,
        session: &str,
        sequence: u64,
        article: &RewrittenArticle,
    ) -> Result<(), WorkError> {
        let path = self.article_path(session, sequence);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkError::Save(format!("create {}: {}", parent.display(), e)))?;
        }
        let contents = format!("# {}\n\n{}\n", article.title, article.body);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| WorkError::Save(format!("write {}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "article written");
        Ok(())
    }

    async fn exists(&self, session: &str, sequence: u64) -> bool {
        tokio::fs::metadata(self.article_path(session, sequence))
            .await
            .is_ok()
    }
}
