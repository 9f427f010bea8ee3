//! # Source Fetch Seam
//!
//! Builds start by bringing the recipe's source tree into scratch. The
//! archive/store client that talks HTTP lives outside this crate;
//! deployments plug it in through [`SourceFetcher`]. [`FileFetcher`]
//! handles `file://` URLs and plain paths: directories are copied,
//! gzip tars are extracted.

use crate::error::{Error, Result};
use crate::pack;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fetches a source URL into a destination directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Local fetcher for `file://` URLs and plain paths.
pub struct FileFetcher {
    _private: (),
}

impl FileFetcher {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for FileFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for FileFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        if !path.exists() {
            return Err(Error::InvalidArgument(format!(
                "source {} does not exist",
                path.display()
            )));
        }

        tokio::fs::create_dir_all(dest).await?;
        if path.is_dir() {
            copy_tree(&path, dest)?;
        } else {
            // Archives are staged through the pack extractor, which
            // carries the traversal and size guards.
            pack::stage_pack(&path, dest)?;
        }
        debug!("fetched {} into {}", url, dest.display());
        Ok(())
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fetch_directory() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("recipe.yaml"), b"name: hello").unwrap();
        std::fs::write(src.join("sub/main.c"), b"int main(){}").unwrap();

        let dest = temp.path().join("dest");
        let fetcher = FileFetcher::new();
        fetcher
            .fetch(&format!("file://{}", src.display()), &dest)
            .await
            .unwrap();
        assert!(dest.join("recipe.yaml").exists());
        assert!(dest.join("sub/main.c").exists());
    }

    #[tokio::test]
    async fn test_fetch_missing_source() {
        let temp = TempDir::new().unwrap();
        let fetcher = FileFetcher::new();
        let err = fetcher
            .fetch("file:///no/such/tree", &temp.path().join("dest"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
