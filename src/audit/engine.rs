//! Merkle Engine
//!
//! Builds the Merkle root over every entry of every validly signed batch.
//! Leaves are appended in batch-name order, then in file order within a
//! batch. Unsigned, mis-signed and unparseable batches are skipped with a
//! warning and contribute no leaves.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use tracing::{debug, error, info, warn};

use crate::audit::entry::{canonicalize, digest, parse_hash, EntryHash, ProcessEntry};
use crate::audit::merkle::MerkleTree;
use crate::batch::{hash_file_name, BatchDirectory, LogBatch, SignedBatchSource};
use crate::crypto::{KeyManager, SignatureManager};
use crate::error::{AuditError, Result};

/// Why a batch contributed no leaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unsigned,
    InvalidSignature,
    Unreadable(String),
    Malformed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unsigned => write!(f, "no signature"),
            SkipReason::InvalidSignature => write!(f, "signature does not verify"),
            SkipReason::Unreadable(e) => write!(f, "unreadable: {}", e),
            SkipReason::Malformed(e) => write!(f, "malformed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBatch {
    pub name: String,
    pub reason: SkipReason,
}

/// One leaf and the entry it was hashed from
#[derive(Debug, Clone)]
pub struct LeafRecord {
    pub batch: String,
    pub index: usize,
    pub entry: ProcessEntry,
    pub canonical: Vec<u8>,
    pub hash: EntryHash,
}

/// Leaves in tree order plus the per-batch verdicts that produced them
#[derive(Debug, Clone, Default)]
pub struct LeafSet {
    pub leaves: Vec<LeafRecord>,
    pub included: Vec<String>,
    pub skipped: Vec<SkippedBatch>,
}

impl LeafSet {
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn tree(&self) -> MerkleTree {
        MerkleTree::from_leaves(self.leaves.iter().map(|l| l.hash).collect())
    }

    fn skip(&mut self, name: String, reason: SkipReason) {
        self.skipped.push(SkippedBatch { name, reason });
    }

    /// Position of the first leaf whose canonical bytes equal `canonical`.
    pub fn position_of(&self, canonical: &[u8]) -> Option<usize> {
        self.leaves.iter().position(|l| l.canonical == canonical)
    }
}

/// Walk `source` in order and collect leaves from batches whose signature
/// verifies against `public_key`.
pub fn collect_leaves<S: SignedBatchSource + ?Sized>(
    source: &S,
    public_key: &VerifyingKey,
) -> Result<LeafSet> {
    let verifier = SignatureManager::new();
    let mut set = LeafSet::default();

    for name in source.batch_names()? {
        let signature = match source.signature(&name) {
            Ok(Some(signature)) => signature,
            Ok(None) => {
                warn!("Skipping unsigned batch {}", name);
                set.skip(name, SkipReason::Unsigned);
                continue;
            }
            Err(e) => {
                warn!("Skipping {}: cannot read signature: {}", name, e);
                set.skip(name, SkipReason::Unreadable(e.to_string()));
                continue;
            }
        };

        let bytes = match source.batch_bytes(&name) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                set.skip(name, SkipReason::Unreadable(e.to_string()));
                continue;
            }
        };

        if !verifier.verify_signature(&bytes, &signature, public_key) {
            warn!("Skipping {}: signature verification failed", name);
            set.skip(name, SkipReason::InvalidSignature);
            continue;
        }

        let batch = match LogBatch::parse(&name, &bytes) {
            Ok(batch) => batch,
            Err(e) => {
                error!("Skipping {}: failed to parse entries: {}", name, e);
                set.skip(name, SkipReason::Malformed(e.to_string()));
                continue;
            }
        };

        for (index, entry) in batch.entries.into_iter().enumerate() {
            let canonical = canonicalize(&entry);
            let hash = digest(&canonical);
            set.leaves.push(LeafRecord {
                batch: name.clone(),
                index,
                entry,
                canonical,
                hash,
            });
        }
        set.included.push(name);
    }

    Ok(set)
}

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub root: EntryHash,
    pub leaf_count: usize,
    pub included: Vec<String>,
    pub skipped: Vec<SkippedBatch>,
    pub root_file: PathBuf,
}

impl BuildReport {
    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }
}

pub struct MerkleEngine {
    batches: BatchDirectory,
    public_key: VerifyingKey,
}

impl MerkleEngine {
    pub fn new(batches: BatchDirectory, public_key: VerifyingKey) -> Self {
        Self {
            batches,
            public_key,
        }
    }

    /// Engine verifying against the key store's public key.
    pub fn from_key_store(batches: BatchDirectory, keys: &KeyManager) -> Result<Self> {
        Ok(Self::new(batches, keys.load_public()?))
    }

    pub fn batches(&self) -> &BatchDirectory {
        &self.batches
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn collect_leaves(&self) -> Result<LeafSet> {
        collect_leaves(&self.batches, &self.public_key)
    }

    /// Rebuild the tree from scratch, persist per-entry hashes, then write
    /// the root file.
    ///
    /// Fails with `AuditError::NoValidBatches` when no leaf survives the skip
    /// rules. The hash directory is replaced as a whole, so it only ever
    /// holds the leaves of the current root. The root file is only touched
    /// after every hash artifact has been written.
    pub fn build_tree(&self) -> Result<BuildReport> {
        let set = self.collect_leaves()?;
        if set.is_empty() {
            return Err(AuditError::NoValidBatches(format!(
                "{} batch(es) in {}; {} skipped, none contributed entries",
                set.included.len() + set.skipped.len(),
                self.batches.root().display(),
                set.skipped.len()
            )));
        }

        write_leaf_hashes(&self.batches.hashes_dir(), &set.leaves)?;

        let tree = set.tree();
        let root = tree
            .root()
            .ok_or_else(|| AuditError::Consistency("Tree has leaves but no root".to_string()))?;

        for (position, leaf) in set.leaves.iter().enumerate() {
            debug!(
                "leaf {:>4}  {}  {}#{}",
                position,
                hex::encode(leaf.hash),
                leaf.batch,
                leaf.index
            );
        }

        let root_file = self.batches.root_file();
        write_root(&root_file, &root)?;

        info!(
            "Merkle tree built: {} leaves from {} batch(es), {} skipped, root {}",
            tree.len(),
            set.included.len(),
            set.skipped.len(),
            hex::encode(root)
        );

        Ok(BuildReport {
            root,
            leaf_count: tree.len(),
            included: set.included,
            skipped: set.skipped,
            root_file,
        })
    }
}

/// Write every leaf hash into a staging directory, then swap it in for
/// `hashes_dir`.
fn write_leaf_hashes(hashes_dir: &Path, leaves: &[LeafRecord]) -> Result<()> {
    let staging = hashes_dir.with_extension("tmp");
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| AuditError::io_at(&staging, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| AuditError::io_at(&staging, e))?;
    for leaf in leaves {
        let path = staging.join(hash_file_name(&leaf.batch, leaf.index));
        fs::write(&path, hex::encode(leaf.hash)).map_err(|e| AuditError::io_at(&path, e))?;
    }

    if hashes_dir.exists() {
        fs::remove_dir_all(hashes_dir).map_err(|e| AuditError::io_at(hashes_dir, e))?;
    }
    fs::rename(&staging, hashes_dir).map_err(|e| AuditError::io_at(hashes_dir, e))
}

fn write_root(path: &Path, root: &EntryHash) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AuditError::io_at(parent, e))?;
    }
    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, hex::encode(root)).map_err(|e| AuditError::io_at(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| AuditError::io_at(path, e))
}

/// Read the latest persisted root.
pub fn read_latest_root(batches: &BatchDirectory) -> Result<EntryHash> {
    let path = batches.root_file();
    if !path.exists() {
        return Err(AuditError::NotFound(format!(
            "Merkle root not found at {}; build the tree first",
            path.display()
        )));
    }
    let contents = fs::read_to_string(&path).map_err(|e| AuditError::io_at(&path, e))?;
    parse_hash(&contents).ok_or_else(|| AuditError::parse_at(&path, "not a 32-byte hex digest"))
}
