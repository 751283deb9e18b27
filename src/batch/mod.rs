//! Log Batches
//!
//! A batch is a JSON array of process entries written by the external
//! collector into the logs directory. Its detached Ed25519 signature sits
//! next to it with the extension swapped to `.sig`.

pub mod signer;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::audit::entry::ProcessEntry;
use crate::error::{AuditError, Result};

pub use signer::{BatchSigner, SigningReport};

pub const BATCH_EXTENSION: &str = "json";
pub const SIGNATURE_EXTENSION: &str = "sig";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Ordered entries of one batch file
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    pub name: String,
    pub entries: Vec<ProcessEntry>,
}

impl LogBatch {
    /// Parse batch file bytes. A leading UTF-8 BOM is ignored.
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self> {
        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let entries: Vec<ProcessEntry> = serde_json::from_slice(body)
            .map_err(|e| AuditError::Parse(format!("{}: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read access to signed batches, in the order they become Merkle leaves.
pub trait SignedBatchSource {
    /// Batch names, sorted.
    fn batch_names(&self) -> Result<Vec<String>>;

    /// Exact bytes of a batch file, as signed.
    fn batch_bytes(&self, name: &str) -> Result<Vec<u8>>;

    /// Detached signature bytes, or `None` if the batch is unsigned.
    fn signature(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// On-disk layout rooted at the logs directory
#[derive(Debug, Clone)]
pub struct BatchDirectory {
    root: PathBuf,
}

impl BatchDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn signature_path(&self, name: &str) -> PathBuf {
        self.batch_path(name).with_extension(SIGNATURE_EXTENSION)
    }

    pub fn hashes_dir(&self) -> PathBuf {
        self.root.join("hashes")
    }

    /// `hashes/<stem>_process_<index>.hash`
    pub fn hash_path(&self, name: &str, index: usize) -> PathBuf {
        self.hashes_dir().join(hash_file_name(name, index))
    }

    pub fn roots_dir(&self) -> PathBuf {
        self.root.join("roots")
    }

    pub fn root_file(&self) -> PathBuf {
        self.roots_dir().join("latest_merkle_root.txt")
    }

    pub fn anchor_file(&self) -> PathBuf {
        self.roots_dir().join("latest_anchor.json")
    }

    pub fn proofs_dir(&self) -> PathBuf {
        self.root.join("proofs")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("runs").join("history.json")
    }

    pub fn is_signed(&self, name: &str) -> bool {
        self.signature_path(name).is_file()
    }

    /// Write a signature artifact. Existing signatures are never replaced.
    pub fn write_signature(&self, name: &str, signature: &[u8]) -> Result<PathBuf> {
        let path = self.signature_path(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| AuditError::io_at(&path, e))?;
        std::io::Write::write_all(&mut file, signature).map_err(|e| AuditError::io_at(&path, e))?;
        Ok(path)
    }

    /// Load and parse a batch.
    pub fn load_batch(&self, name: &str) -> Result<LogBatch> {
        let bytes = self.batch_bytes(name)?;
        LogBatch::parse(name, &bytes)
    }
}

impl SignedBatchSource for BatchDirectory {
    fn batch_names(&self) -> Result<Vec<String>> {
        let read_dir = fs::read_dir(&self.root).map_err(|e| AuditError::io_at(&self.root, e))?;

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| AuditError::io_at(&self.root, e))?;
            let path = entry.path();
            let is_batch = path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(BATCH_EXTENSION);
            if !is_batch {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }

        names.sort();
        debug!("Found {} batch files in {}", names.len(), self.root.display());
        Ok(names)
    }

    fn batch_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.batch_path(name);
        fs::read(&path).map_err(|e| AuditError::io_at(&path, e))
    }

    fn signature(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.signature_path(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .map_err(|e| AuditError::io_at(&path, e))
    }
}

fn batch_stem(name: &str) -> &str {
    name.strip_suffix(".json").unwrap_or(name)
}

/// File name of one entry's persisted leaf hash
pub fn hash_file_name(name: &str, index: usize) -> String {
    format!("{}_process_{}.hash", batch_stem(name), index)
}
