use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;

/// Lazy key-value view over named byte blobs. Keys are relative,
/// `/`-separated paths. Opening a path may happen any number of times and has
/// no side effects beyond I/O.
pub trait BundleContents: Send + Sync {
    /// All paths, sorted.
    fn paths(&self) -> Vec<String>;

    /// Open a path for reading; `Ok(None)` when absent.
    fn open(&self, path: &str) -> Result<Option<Box<dyn Read + Send + '_>>>;

    fn contains(&self, path: &str) -> bool {
        self.paths().iter().any(|p| p == path)
    }

    fn read_all(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.open(path)? {
            Some(mut r) => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf).with_context(|| format!("reading bundle file {}", path))?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }
}

/// Files below a directory; contents are read only when opened.
pub struct DirContents {
    root: PathBuf,
    paths: Vec<String>,
}

impl DirContents {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut paths = Vec::new();
        walk(&root, &root, &mut paths).with_context(|| format!("listing bundle directory {}", root.display()))?;
        paths.sort();
        Ok(Self { root, paths })
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
            out.push(key.join("/"));
        }
    }
    Ok(())
}

impl BundleContents for DirContents {
    fn paths(&self) -> Vec<String> {
        self.paths.clone()
    }

    fn contains(&self, path: &str) -> bool {
        self.paths.binary_search_by(|p| p.as_str().cmp(path)).is_ok()
    }

    fn open(&self, path: &str) -> Result<Option<Box<dyn Read + Send + '_>>> {
        if !self.contains(path) {
            return Ok(None);
        }
        let full = self.root.join(path);
        let f = File::open(&full).with_context(|| format!("opening {}", full.display()))?;
        Ok(Some(Box::new(BufReader::new(f))))
    }
}

/// Blobs held in memory: archives and downloaded payloads.
#[derive(Debug, Clone, Default)]
pub struct MemContents {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl MemContents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, data: impl Into<Vec<u8>>) {
        self.files.insert(path.to_string(), Arc::from(data.into()));
    }

    pub fn with(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(path, data);
        self
    }

    /// Unpack a gzip-compressed tar stream. Only regular files are kept;
    /// leading `./` is dropped from entry names.
    pub fn from_tar_gz<R: Read>(reader: R) -> Result<Self> {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let mut out = Self::new();
        for entry in archive.entries().context("reading bundle archive")? {
            let mut entry = entry.context("reading bundle archive entry")?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path().context("decoding archive entry path")?.to_string_lossy().to_string();
            let name = name.trim_start_matches("./").to_string();
            if name.is_empty() || name.split('/').any(|seg| seg == "..") {
                return Err(anyhow!("bundle archive contains invalid path {:?}", name));
            }
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).with_context(|| format!("reading archive entry {}", name))?;
            out.insert(&name, buf);
        }
        Ok(out)
    }
}

impl BundleContents for MemContents {
    fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn open(&self, path: &str) -> Result<Option<Box<dyn Read + Send + '_>>> {
        Ok(self.files.get(path).map(|b| Box::new(Cursor::new(b.clone())) as Box<dyn Read + Send>))
    }
}

/// Records every path successfully opened through it, to detect bundle files
/// nobody consumed.
pub struct TrackingContents<'a> {
    inner: &'a dyn BundleContents,
    opened: Mutex<BTreeSet<String>>,
}

impl<'a> TrackingContents<'a> {
    pub fn new(inner: &'a dyn BundleContents) -> Self {
        Self { inner, opened: Mutex::new(BTreeSet::new()) }
    }

    pub fn opened(&self) -> BTreeSet<String> {
        self.opened.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl BundleContents for TrackingContents<'_> {
    fn paths(&self) -> Vec<String> {
        self.inner.paths()
    }

    fn contains(&self, path: &str) -> bool {
        self.inner.contains(path)
    }

    fn open(&self, path: &str) -> Result<Option<Box<dyn Read + Send + '_>>> {
        let r = self.inner.open(path)?;
        if r.is_some() {
            self.opened.lock().unwrap_or_else(|p| p.into_inner()).insert(path.to_string());
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    #[test]
    fn dir_contents_lists_nested_files_lazily() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "x: 1").unwrap();
        std::fs::create_dir(dir.path().join("additional-cas")).unwrap();
        std::fs::write(dir.path().join("additional-cas").join("c.crt"), "pem").unwrap();
        let c = DirContents::new(dir.path()).unwrap();
        assert_eq!(c.paths(), vec!["a.yaml".to_string(), "additional-cas/c.crt".to_string()]);
        assert_eq!(c.read_all("a.yaml").unwrap().unwrap(), b"x: 1");
        // reopening is fine
        assert_eq!(c.read_all("a.yaml").unwrap().unwrap(), b"x: 1");
        assert!(c.read_all("missing").unwrap().is_none());
    }

    #[test]
    fn tar_gz_archives_unpack_into_memory() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let data = b"kind: ConfigMap\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "./sensor.yaml", &data[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let c = MemContents::from_tar_gz(&bytes[..]).unwrap();
        assert_eq!(c.paths(), vec!["sensor.yaml".to_string()]);
        assert_eq!(c.read_all("sensor.yaml").unwrap().unwrap(), data);
    }

    #[test]
    fn tracking_records_only_opened_paths() {
        let mem = MemContents::new().with("a", "1").with("b", "2");
        let t = TrackingContents::new(&mem);
        assert!(t.contains("b"));
        t.read_all("a").unwrap();
        t.read_all("zzz").unwrap();
        assert_eq!(t.opened().into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
    }
}
