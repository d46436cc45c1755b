use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::encoder::Tier;

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream i/o error")]
    Io(#[from] std::io::Error),
    #[error("bad stream manifest")]
    Manifest(#[from] serde_json::Error),
    #[error("stream has no manifest")]
    MissingManifest,
}

/// Metadata written alongside the encoded output.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub url: String,
    pub sd_hash: String,
    pub formats: Vec<Tier>,
}

/// A transcoded stream on local disk: a directory of playlist and segment
/// files plus its [`Manifest`].
#[derive(Debug, Clone)]
pub struct LocalStream {
    path: PathBuf,
    manifest: Manifest,
    size: i64,
    checksum: String,
}

impl LocalStream {
    /// Materialize a stream at `path` by writing `manifest` next to the
    /// encoder's output files.
    pub fn create(path: impl Into<PathBuf>, manifest: Manifest) -> Result<Self, StreamError> {
        let path = path.into();
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        fs::write(path.join(MANIFEST_NAME), bytes)?;
        Self::load(path, manifest)
    }

    /// Open an existing stream directory, reading its manifest.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let path = path.into();
        let manifest_path = path.join(MANIFEST_NAME);
        if !manifest_path.exists() {
            return Err(StreamError::MissingManifest);
        }
        let manifest: Manifest = serde_json::from_slice(&fs::read(manifest_path)?)?;
        Self::load(path, manifest)
    }

    fn load(path: PathBuf, manifest: Manifest) -> Result<Self, StreamError> {
        let files = collect_files(&path)?;
        let mut size = 0i64;
        let mut digest = Sha256::new();
        for file in &files {
            let content = fs::read(file)?;
            size += content.len() as i64;
            digest.update(&content);
        }
        Ok(Self {
            path,
            manifest,
            size,
            checksum: hex::encode(digest.finalize()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn sd_hash(&self) -> &str {
        &self.manifest.sd_hash
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Every file of the stream, paired with its path relative to the
    /// stream root. Sorted for deterministic upload and checksum order.
    pub fn files(&self) -> Result<Vec<(PathBuf, String)>, StreamError> {
        let root = &self.path;
        let mut files = Vec::new();
        for file in collect_files(root)? {
            let relative = file
                .strip_prefix(root)
                .expect("collected file is under the stream root")
                .to_string_lossy()
                .replace('\\', "/");
            files.push((file, relative));
        }
        Ok(files)
    }
}

fn collect_files(root: &Path) -> Result<Vec<PathBuf>, StreamError> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(root, &mut files)?;
    files.sort();
    Ok(files)
}
