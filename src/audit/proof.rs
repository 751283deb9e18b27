//! Inclusion Proofs
//!
//! Proofs are generated by rebuilding the leaf sequence exactly as the
//! engine does and are verified from the entry and the proof alone.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::engine::MerkleEngine;
use crate::audit::entry::{
    canonicalize, entries_match, hash_entry, parse_hash, EntryHash, ProcessEntry, HASH_ALGORITHM,
};
use crate::audit::merkle::replay_path;
use crate::batch::SignedBatchSource;
use crate::error::{AuditError, Result};

/// Where an entry lives in the batch store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryLocator {
    pub batch_name: String,
    pub index: usize,
}

/// Self-contained proof that one entry is a leaf under `merkle_root`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub entry: EntryLocator,
    pub merkle_root: String,
    pub entry_position: usize,
    /// Sibling digests, leaf to root, hex encoded
    pub proof: Vec<String>,
    pub algorithm: String,
    pub total_entries: usize,
}

impl InclusionProof {
    pub fn root(&self) -> Option<EntryHash> {
        parse_hash(&self.merkle_root)
    }
}

/// Check `proof` for `entry` without any stored state.
///
/// The entry's leaf hash is recomputed and the sibling path replayed; the
/// result must equal the proof's own root. Malformed proofs verify as false.
pub fn verify_proof(entry: &ProcessEntry, proof: &InclusionProof) -> bool {
    if proof.algorithm != HASH_ALGORITHM {
        debug!("Unsupported proof algorithm {}", proof.algorithm);
        return false;
    }
    let Some(root) = proof.root() else {
        return false;
    };
    let Some(path) = proof
        .proof
        .iter()
        .map(|h| parse_hash(h))
        .collect::<Option<Vec<EntryHash>>>()
    else {
        return false;
    };

    let leaf = hash_entry(entry);
    replay_path(&leaf, proof.entry_position, proof.total_entries, &path) == Some(root)
}

/// Like [`verify_proof`], and additionally require the proof's root to be
/// `expected_root` (for example the anchored root).
pub fn verify_against_root(
    entry: &ProcessEntry,
    proof: &InclusionProof,
    expected_root: &EntryHash,
) -> bool {
    proof.root().as_ref() == Some(expected_root) && verify_proof(entry, proof)
}

pub fn load_proof(path: &Path) -> Result<InclusionProof> {
    let contents = fs::read(path).map_err(|e| AuditError::io_at(path, e))?;
    serde_json::from_slice(&contents).map_err(|e| AuditError::parse_at(path, e))
}

pub struct ProofService {
    engine: MerkleEngine,
}

impl ProofService {
    pub fn new(engine: MerkleEngine) -> Self {
        Self { engine }
    }

    /// First entry, across all batches in enumeration order, whose canonical
    /// form equals `target`.
    pub fn find_entry(&self, target: &ProcessEntry) -> Result<Option<EntryLocator>> {
        let batches = self.engine.batches();
        for name in batches.batch_names()? {
            let batch = match batches.load_batch(&name) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Skipping {} during lookup: {}", name, e);
                    continue;
                }
            };
            if let Some(index) = batch.entries.iter().position(|e| entries_match(e, target)) {
                return Ok(Some(EntryLocator {
                    batch_name: name,
                    index,
                }));
            }
        }
        Ok(None)
    }

    /// Build a proof for the first included leaf matching `target`.
    pub fn generate_proof(&self, target: &ProcessEntry) -> Result<InclusionProof> {
        let set = self.engine.collect_leaves()?;
        if set.is_empty() {
            return Err(AuditError::NoValidBatches(
                "Tree has no leaves; nothing to prove".to_string(),
            ));
        }

        let canonical = canonicalize(target);
        let position = set.position_of(&canonical).ok_or_else(|| {
            AuditError::Consistency("Entry is not among the included leaves".to_string())
        })?;

        let tree = set.tree();
        let root = tree
            .root()
            .ok_or_else(|| AuditError::Consistency("Tree has leaves but no root".to_string()))?;
        let path = tree.proof_path(position)?;
        let leaf = &set.leaves[position];

        info!(
            "Proof generated for {}#{} at position {} of {}",
            leaf.batch,
            leaf.index,
            position,
            tree.len()
        );

        Ok(InclusionProof {
            entry: EntryLocator {
                batch_name: leaf.batch.clone(),
                index: leaf.index,
            },
            merkle_root: hex::encode(root),
            entry_position: position,
            proof: path.iter().map(hex::encode).collect(),
            algorithm: HASH_ALGORITHM.to_string(),
            total_entries: tree.len(),
        })
    }

    pub fn verify_proof(&self, entry: &ProcessEntry, proof: &InclusionProof) -> bool {
        verify_proof(entry, proof)
    }

    /// Write `proof` under the proofs directory, as `file_name` or as
    /// `proof_<timestamp>.json`.
    pub fn save_proof(&self, proof: &InclusionProof, file_name: Option<&str>) -> Result<PathBuf> {
        let file_name = match file_name {
            Some(name) => {
                if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
                    return Err(AuditError::Config(format!(
                        "Proof name must be a plain file name: {}",
                        name
                    )));
                }
                name.to_string()
            }
            None => format!("proof_{}.json", Utc::now().format("%Y%m%d_%H%M%S_%3f")),
        };

        let dir = self.engine.batches().proofs_dir();
        fs::create_dir_all(&dir).map_err(|e| AuditError::io_at(&dir, e))?;
        let path = dir.join(file_name);
        let json = serde_json::to_vec_pretty(proof)?;
        fs::write(&path, json).map_err(|e| AuditError::io_at(&path, e))?;

        info!("Proof saved to {}", path.display());
        Ok(path)
    }

    pub fn load_proof(&self, path: &Path) -> Result<InclusionProof> {
        load_proof(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchDirectory;
    use crate::crypto::SignatureManager;
    use serde_json::json;
    use tempfile::tempdir;

    fn signed_store(dir: &Path, batches: &[(&str, &str)]) -> ProofService {
        let manager = SignatureManager::new();
        let key = manager.generate_keypair();
        let store = BatchDirectory::new(dir);
        for (name, body) in batches {
            fs::write(store.batch_path(name), body).unwrap();
            fs::write(
                store.signature_path(name),
                manager.create_signature(body.as_bytes(), &key),
            )
            .unwrap();
        }
        ProofService::new(MerkleEngine::new(store, key.verifying_key()))
    }

    #[test]
    fn test_proof_json_field_names() {
        let temp_dir = tempdir().unwrap();
        let service = signed_store(temp_dir.path(), &[("a.json", r#"[{"pid":1},{"pid":2}]"#)]);
        let proof = service.generate_proof(&json!({"pid": 2})).unwrap();

        let value = serde_json::to_value(&proof).unwrap();
        assert_eq!(value["entry"], json!({"batchName": "a.json", "index": 1}));
        assert_eq!(value["entryPosition"], json!(1));
        assert_eq!(value["totalEntries"], json!(2));
        assert_eq!(value["algorithm"], json!("sha3_256"));
        assert_eq!(value["proof"].as_array().unwrap().len(), 1);
        assert!(value["merkleRoot"].is_string());
    }

    #[test]
    fn test_tampered_proofs_fail() {
        let temp_dir = tempdir().unwrap();
        let service = signed_store(
            temp_dir.path(),
            &[("a.json", r#"[{"pid":1},{"pid":2},{"pid":3}]"#)],
        );
        let entry = json!({"pid": 3});
        let proof = service.generate_proof(&entry).unwrap();
        assert!(verify_proof(&entry, &proof));

        let mut flipped = proof.clone();
        let mut root = proof.root().unwrap();
        root[0] ^= 0x01;
        flipped.merkle_root = hex::encode(root);
        assert!(!verify_proof(&entry, &flipped));

        assert!(!verify_proof(&json!({"pid": 4}), &proof));

        let mut wrong_algorithm = proof.clone();
        wrong_algorithm.algorithm = "sha256".to_string();
        assert!(!verify_proof(&entry, &wrong_algorithm));

        let mut garbage = proof.clone();
        garbage.proof[0] = "zz".to_string();
        assert!(!verify_proof(&entry, &garbage));

        let mut shifted = proof;
        shifted.entry_position = 3;
        assert!(!verify_proof(&entry, &shifted));
    }

    #[test]
    fn test_find_entry_scans_all_batches() {
        let temp_dir = tempdir().unwrap();
        let service = signed_store(temp_dir.path(), &[("a.json", r#"[{"pid":1}]"#)]);
        fs::write(temp_dir.path().join("b.json"), r#"[{"name":"y","pid":2}]"#).unwrap();

        let found = service.find_entry(&json!({"pid": 2, "name": "y"})).unwrap();
        assert_eq!(
            found,
            Some(EntryLocator {
                batch_name: "b.json".to_string(),
                index: 0
            })
        );

        // Unsigned data is findable but never provable.
        assert!(matches!(
            service.generate_proof(&json!({"pid": 2, "name": "y"})),
            Err(AuditError::Consistency(_))
        ));
        assert_eq!(service.find_entry(&json!({"pid": 9})).unwrap(), None);
    }

    #[test]
    fn test_no_leaves_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let service = signed_store(temp_dir.path(), &[("a.json", "[]")]);
        assert!(matches!(
            service.generate_proof(&json!({"pid": 1})),
            Err(AuditError::NoValidBatches(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let service = signed_store(temp_dir.path(), &[("a.json", r#"[{"pid":1},{"pid":2}]"#)]);
        let proof = service.generate_proof(&json!({"pid": 1})).unwrap();

        let path = service.save_proof(&proof, None).unwrap();
        assert!(path.starts_with(temp_dir.path().join("proofs")));
        assert_eq!(service.load_proof(&path).unwrap(), proof);

        let named = service.save_proof(&proof, Some("pid1.json")).unwrap();
        assert!(verify_proof(&json!({"pid": 1}), &load_proof(&named).unwrap()));

        assert!(service.save_proof(&proof, Some("../escape.json")).is_err());
    }

    #[test]
    fn test_verify_against_root() {
        let temp_dir = tempdir().unwrap();
        let service = signed_store(temp_dir.path(), &[("a.json", r#"[{"pid":1},{"pid":2}]"#)]);
        let entry = json!({"pid": 1});
        let proof = service.generate_proof(&entry).unwrap();
        let root = proof.root().unwrap();

        assert!(verify_against_root(&entry, &proof, &root));
        assert!(!verify_against_root(&entry, &proof, &[0u8; 32]));
    }
}
