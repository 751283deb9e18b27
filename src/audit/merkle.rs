//! Merkle Tree for Process Entries
//!
//! Append-only binary Merkle tree over entry hashes. Internal nodes are
//! `SHA3-256(left || right)`; on a level with an odd number of nodes the last
//! node is paired with itself. Proof paths list one sibling per level, from
//! the leaf upwards, and their left/right position is implied by the leaf
//! index and the leaf count.

use tracing::debug;

use crate::audit::entry::{digest, EntryHash};
use crate::error::{AuditError, Result};

/// Hash two child nodes into their parent.
pub fn hash_pair(left: &EntryHash, right: &EntryHash) -> EntryHash {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    digest(&combined)
}

/// Append-only Merkle tree
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<EntryHash>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from leaves in the given order.
    pub fn from_leaves(leaves: Vec<EntryHash>) -> Self {
        Self { leaves }
    }

    /// Append a leaf and return its position.
    pub fn append(&mut self, leaf: EntryHash) -> usize {
        self.leaves.push(leaf);
        self.leaves.len() - 1
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaves(&self) -> &[EntryHash] {
        &self.leaves
    }

    /// Root over all leaves, or `None` for an empty tree.
    pub fn root(&self) -> Option<EntryHash> {
        self.levels().last().and_then(|top| top.first().copied())
    }

    /// Sibling path for the leaf at `index`.
    pub fn proof_path(&self, index: usize) -> Result<Vec<EntryHash>> {
        if index >= self.leaves.len() {
            return Err(AuditError::Consistency(format!(
                "Leaf index {} out of range for {} leaves",
                index,
                self.leaves.len()
            )));
        }

        let levels = self.levels();
        let mut path = Vec::with_capacity(levels.len());
        let mut idx = index;

        for level in &levels[..levels.len() - 1] {
            let sibling = if idx % 2 == 1 {
                level[idx - 1]
            } else {
                *level.get(idx + 1).unwrap_or(&level[idx])
            };
            path.push(sibling);
            idx /= 2;
        }

        debug!("Proof path for leaf {}: {} siblings", index, path.len());
        Ok(path)
    }

    /// All levels from the leaves (first) up to the root (last).
    fn levels(&self) -> Vec<Vec<EntryHash>> {
        if self.leaves.is_empty() {
            return Vec::new();
        }

        let mut levels = vec![self.leaves.clone()];
        while levels[levels.len() - 1].len() > 1 {
            let next: Vec<EntryHash> = levels[levels.len() - 1]
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        levels
    }
}

/// Number of siblings a proof must carry for a tree of `total` leaves.
pub fn expected_path_len(total: usize) -> usize {
    let mut width = total;
    let mut depth = 0;
    while width > 1 {
        width = (width + 1) / 2;
        depth += 1;
    }
    depth
}

/// Recompute the root from a leaf and its sibling path.
///
/// Returns `None` when the path cannot belong to a tree of `total` leaves:
/// index out of range, wrong number of siblings, or a duplicated-node step
/// whose sibling is not the running hash itself.
pub fn replay_path(
    leaf: &EntryHash,
    index: usize,
    total: usize,
    path: &[EntryHash],
) -> Option<EntryHash> {
    if total == 0 || index >= total || path.len() != expected_path_len(total) {
        return None;
    }

    let mut hash = *leaf;
    let mut idx = index;
    let mut width = total;

    for sibling in path {
        hash = if idx % 2 == 1 {
            hash_pair(sibling, &hash)
        } else if idx + 1 < width {
            hash_pair(&hash, sibling)
        } else {
            if *sibling != hash {
                return None;
            }
            hash_pair(&hash, &hash)
        };
        idx /= 2;
        width = (width + 1) / 2;
    }

    Some(hash)
}
