use audit_anchor::audit::proof::{load_proof, verify_against_root};
use audit_anchor::audit::{verify_proof, InclusionProof, MerkleEngine, ProofService};
use audit_anchor::error::AuditError;
use serde_json::{json, Value};
use std::fs;

mod common;
use common::*;

/// Five entries over two batches, so the tree has an odd level
fn proof_store() -> (TestStore, ProofService, Vec<Value>) {
    let store = TestStore::new();
    let first = vec![
        json!({"pid": 10, "name": "sshd", "user": "root"}),
        json!({"pid": 11, "name": "bash", "user": "alice"}),
        json!({"pid": 12, "name": "vim", "user": "alice"}),
    ];
    let second = vec![
        json!({"pid": 20, "name": "nginx", "ports": [80, 443]}),
        json!({"pid": 21, "name": "cron", "env": {"PATH": "/usr/bin", "HOME": "/root"}}),
    ];
    store.write_signed_batch("2024-01-01.json", &Value::Array(first.clone()));
    store.write_signed_batch("2024-01-02.json", &Value::Array(second.clone()));

    let engine = MerkleEngine::from_key_store(store.batches.clone(), &store.keys).unwrap();
    engine.build_tree().unwrap();
    let entries = first.into_iter().chain(second).collect();
    (store, ProofService::new(engine), entries)
}

#[test]
fn test_every_included_leaf_verifies() {
    let (store, service, entries) = proof_store();
    let root = audit_anchor::audit::read_latest_root(&store.batches).unwrap();

    for (position, entry) in entries.iter().enumerate() {
        let proof = service.generate_proof(entry).unwrap();
        assert_eq!(proof.entry_position, position);
        assert_eq!(proof.total_entries, 5);
        assert_eq!(proof.proof.len(), 3);
        assert_eq!(proof.algorithm, "sha3_256");
        assert!(verify_proof(entry, &proof), "position {} failed", position);
        assert!(verify_against_root(entry, &proof, &root));
    }
}

#[test]
fn test_key_order_does_not_matter_for_lookup() {
    let (_store, service, _) = proof_store();
    let reordered = json!({"env": {"HOME": "/root", "PATH": "/usr/bin"}, "name": "cron", "pid": 21});

    let locator = service.find_entry(&reordered).unwrap().unwrap();
    assert_eq!(locator.batch_name, "2024-01-02.json");
    assert_eq!(locator.index, 1);
    assert!(verify_proof(&reordered, &service.generate_proof(&reordered).unwrap()));
}

#[test]
fn test_tampered_proofs_fail() {
    let (_store, service, entries) = proof_store();
    let entry = &entries[1];
    let proof = service.generate_proof(entry).unwrap();

    // Root bit-flipped
    let mut flipped = proof.clone();
    let mut root = hex::decode(&flipped.merkle_root).unwrap();
    root[0] ^= 0x01;
    flipped.merkle_root = hex::encode(root);
    assert!(!verify_proof(entry, &flipped));

    // Entry altered
    assert!(!verify_proof(&json!({"pid": 11, "name": "bash", "user": "mallory"}), &proof));

    // Sibling altered
    let mut sibling = proof.clone();
    sibling.proof[0] = "00".repeat(32);
    assert!(!verify_proof(entry, &sibling));

    // Wrong position
    let mut moved = proof.clone();
    moved.entry_position = 0;
    assert!(!verify_proof(entry, &moved));

    // Truncated path
    let mut short = proof.clone();
    short.proof.pop();
    assert!(!verify_proof(entry, &short));

    // Position beyond the tree
    let mut outside = proof.clone();
    outside.entry_position = 7;
    assert!(!verify_proof(entry, &outside));

    // Unknown algorithm
    let mut algorithm = proof;
    algorithm.algorithm = "sha256".to_string();
    assert!(!verify_proof(entry, &algorithm));
}

#[test]
fn test_proof_against_other_root_fails() {
    let (_store, service, entries) = proof_store();
    let proof = service.generate_proof(&entries[0]).unwrap();
    assert!(!verify_against_root(&entries[0], &proof, &[0u8; 32]));
}

#[test]
fn test_saved_proof_layout() {
    let (store, service, entries) = proof_store();
    let proof = service.generate_proof(&entries[3]).unwrap();
    let path = service.save_proof(&proof, None).unwrap();

    assert_eq!(path.parent().unwrap(), store.batches.proofs_dir());
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("proof_") && name.ends_with(".json"));

    let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["entry"]["batchName"], "2024-01-02.json");
    assert_eq!(raw["entry"]["index"], 0);
    assert_eq!(raw["entryPosition"], 3);
    assert_eq!(raw["totalEntries"], 5);
    assert_eq!(raw["algorithm"], "sha3_256");

    let loaded: InclusionProof = load_proof(&path).unwrap();
    assert_eq!(loaded, proof);
    assert!(verify_proof(&entries[3], &loaded));
}

#[test]
fn test_proof_name_must_be_plain() {
    let (_store, service, entries) = proof_store();
    let proof = service.generate_proof(&entries[0]).unwrap();
    assert!(matches!(
        service.save_proof(&proof, Some("../escape.json")),
        Err(AuditError::Config(_))
    ));
}

#[test]
fn test_unknown_entry_has_no_proof() {
    let (_store, service, _) = proof_store();
    let missing = json!({"pid": 99});
    assert_eq!(service.find_entry(&missing).unwrap(), None);
    assert!(matches!(
        service.generate_proof(&missing),
        Err(AuditError::Consistency(_))
    ));
}

#[test]
fn test_proof_files_do_not_become_batches() {
    let (store, service, entries) = proof_store();
    let proof = service.generate_proof(&entries[0]).unwrap();
    service.save_proof(&proof, Some("p.json")).unwrap();

    let engine = MerkleEngine::from_key_store(store.batches.clone(), &store.keys).unwrap();
    let report = engine.build_tree().unwrap();
    assert_eq!(report.leaf_count, 5);
    assert!(report.skipped.is_empty());
}

#[test]
fn test_large_integer_entries_are_told_apart() {
    let store = TestStore::new();
    let batch: Value = serde_json::from_str(
        r#"[{"pid":12345678901234567890123,"name":"a"},{"pid":12345678901234567890124,"name":"a"}]"#,
    )
    .unwrap();
    store.write_signed_batch("big.json", &batch);

    let engine = MerkleEngine::from_key_store(store.batches.clone(), &store.keys).unwrap();
    assert_eq!(engine.build_tree().unwrap().leaf_count, 2);
    let service = ProofService::new(engine);

    let second = &batch[1];
    let locator = service.find_entry(second).unwrap().unwrap();
    assert_eq!(locator.index, 1);

    let proof = service.generate_proof(second).unwrap();
    assert_eq!(proof.entry_position, 1);
    assert!(verify_proof(second, &proof));
    assert!(!verify_proof(&batch[0], &proof));
}
