//! Audit Trail
//!
//! Canonical entry hashing, the append-only Merkle tree built over signed
//! log batches, and inclusion proofs against its root.

pub mod engine;
pub mod entry;
pub mod merkle;
pub mod proof;

pub use engine::{read_latest_root, BuildReport, MerkleEngine};
pub use entry::{canonicalize, hash_entry, EntryHash, ProcessEntry};
pub use merkle::MerkleTree;
pub use proof::{verify_proof, EntryLocator, InclusionProof, ProofService};
