use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::contents::{BundleContents, DirContents, MemContents};

/// Where a bundle comes from. Network fetchers live outside this crate and
/// implement the same trait.
#[async_trait::async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch(&self) -> Result<Box<dyn BundleContents>>;
}

/// Load a bundle from a directory or a `.tar.gz` archive.
pub fn load_bundle(path: &Path) -> Result<Box<dyn BundleContents>> {
    let meta = std::fs::metadata(path).with_context(|| format!("reading bundle at {}", path.display()))?;
    if meta.is_dir() {
        let c = DirContents::new(path)?;
        info!(path = %path.display(), files = c.paths().len(), "loaded bundle directory");
        return Ok(Box::new(c));
    }
    let f = File::open(path).with_context(|| format!("opening bundle archive {}", path.display()))?;
    let c = MemContents::from_tar_gz(BufReader::new(f)).with_context(|| format!("unpacking bundle archive {}", path.display()))?;
    info!(path = %path.display(), files = c.paths().len(), "loaded bundle archive");
    Ok(Box::new(c))
}

/// Bundle from the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBundleSource {
    path: PathBuf,
}

impl LocalBundleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl BundleSource for LocalBundleSource {
    async fn fetch(&self) -> Result<Box<dyn BundleContents>> {
        load_bundle(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_source_reads_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("NOTES.txt"), "hi").unwrap();
        let c = LocalBundleSource::new(dir.path()).fetch().await.unwrap();
        assert_eq!(c.paths(), vec!["NOTES.txt".to_string()]);
    }

    #[test]
    fn missing_bundle_is_an_error() {
        let err = load_bundle(Path::new("/definitely/not/here")).err().unwrap();
        assert!(err.to_string().contains("reading bundle"));
    }
}
