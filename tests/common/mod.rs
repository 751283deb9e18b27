//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use audit_anchor::anchor::ledger::{
    serialize_transaction, transaction_signature, Blockhash, SignatureStatus, Transaction,
};
use audit_anchor::anchor::LedgerClient;
use audit_anchor::batch::BatchDirectory;
use audit_anchor::crypto::{KdfParams, KeyManager, SignatureManager};
use audit_anchor::error::{AuditError, Result};
use audit_anchor::retry::RetryPolicy;
use ed25519_dalek::SigningKey;
use serde_json::Value;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub const PROGRAM_ID: &str = "BPFLoaderUpgradeab1e11111111111111111111111";

/// A log directory and key store under one temp dir, with a plain endpoint key
pub struct TestStore {
    pub dir: TempDir,
    pub batches: BatchDirectory,
    pub keys: KeyManager,
    pub signing_key: SigningKey,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let batches = BatchDirectory::new(dir.path().join("logs"));
        fs::create_dir_all(batches.root()).expect("Failed to create logs dir");
        let keys = KeyManager::new(dir.path().join("keys")).with_kdf_params(KdfParams::insecure_fast());
        let signing_key = keys
            .generate_and_store(None, false)
            .expect("Failed to generate endpoint key");
        Self {
            dir,
            batches,
            keys,
            signing_key,
        }
    }

    pub fn write_batch(&self, name: &str, entries: &Value) {
        fs::write(self.batches.batch_path(name), entries.to_string()).expect("Failed to write batch");
    }

    pub fn sign_batch(&self, name: &str) {
        let body = fs::read(self.batches.batch_path(name)).expect("Failed to read batch");
        let signature = SignatureManager::new().create_signature(&body, &self.signing_key);
        fs::write(self.batches.signature_path(name), signature).expect("Failed to write signature");
    }

    pub fn write_signed_batch(&self, name: &str, entries: &Value) {
        self.write_batch(name, entries);
        self.sign_batch(name);
    }

    /// Drop a batch's signature so it can be signed again.
    pub fn unsign_batch(&self, name: &str) {
        fs::remove_file(self.batches.signature_path(name)).expect("Failed to remove signature");
    }
}

/// Millisecond-scale policy so retry tests do not sleep for real
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::quick()
        .with_max_attempts(max_attempts)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

pub fn test_blockhash() -> Blockhash {
    Blockhash::new_from_array([7u8; 32])
}

/// In-memory ledger that records what it was sent
#[derive(Default)]
pub struct MockLedgerClient {
    /// Transient failures to return from `send_transaction` before succeeding
    pub send_failures: AtomicU32,
    pub send_calls: AtomicU32,
    pub status_calls: AtomicU32,
    /// Status returned for every submitted signature; `None` means pending
    pub status: Mutex<Option<SignatureStatus>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
}

impl MockLedgerClient {
    pub fn confirmed() -> Self {
        let client = Self::default();
        client.set_status(Some(SignatureStatus {
            slot: 42,
            confirmations: None,
            err: None,
            confirmation_status: Some("finalized".to_string()),
        }));
        client
    }

    pub fn set_status(&self, status: Option<SignatureStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn sent_transactions(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn latest_blockhash(&self) -> Result<Blockhash> {
        Ok(test_blockhash())
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<String> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.send_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.send_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AuditError::TransientNetwork("node is behind".to_string()));
        }
        self.sent.lock().unwrap().push(serialize_transaction(transaction)?);
        transaction_signature(transaction)
            .ok_or_else(|| AuditError::Crypto("unsigned transaction".to_string()))
    }

    async fn signature_status(&self, _signature: &str) -> Result<Option<SignatureStatus>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.status.lock().unwrap().clone())
    }
}
