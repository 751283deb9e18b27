//! Batch signing at the collecting endpoint.

use ed25519_dalek::SigningKey;
use tracing::{info, warn};

use super::{BatchDirectory, SignedBatchSource};
use crate::crypto::KeyManager;
use crate::error::{AuditError, Result};

/// Outcome of one signing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningReport {
    pub signed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl SigningReport {
    pub fn summary(&self) -> String {
        format!(
            "{} signed, {} already signed, {} failed",
            self.signed.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

pub struct BatchSigner<'a> {
    batches: &'a BatchDirectory,
    keys: &'a KeyManager,
}

impl<'a> BatchSigner<'a> {
    pub fn new(batches: &'a BatchDirectory, keys: &'a KeyManager) -> Self {
        Self { batches, keys }
    }

    /// Load the endpoint key and sign every unsigned batch.
    pub fn sign_with_stored_key(&self, password: Option<&str>) -> Result<SigningReport> {
        let key = self.keys.load_signing_key(password)?;
        self.sign_unsigned(&key)
    }

    /// Sign the exact file bytes of each batch that has no signature yet.
    ///
    /// Batches that are already signed are left untouched. A file that cannot
    /// be read or whose signature cannot be written is recorded as failed and
    /// the pass continues.
    pub fn sign_unsigned(&self, key: &SigningKey) -> Result<SigningReport> {
        let mut report = SigningReport::default();

        for name in self.batches.batch_names()? {
            if self.batches.is_signed(&name) {
                report.skipped.push(name);
                continue;
            }

            match self.sign_one(&name, key) {
                Ok(()) => {
                    info!("Signed {}", name);
                    report.signed.push(name);
                }
                Err(e) => {
                    warn!("Failed to sign {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!("Signing pass: {}", report.summary());
        Ok(report)
    }

    fn sign_one(&self, name: &str, key: &SigningKey) -> Result<()> {
        let bytes = self.batches.batch_bytes(name)?;
        let signature = self.keys.sign(&bytes, key);
        self.batches.write_signature(name, &signature)?;
        Ok(())
    }

    /// Check one batch's signature against the stored public key.
    pub fn verify_batch(&self, name: &str) -> Result<bool> {
        let public = self.keys.load_public()?;
        let signature = self
            .batches
            .signature(name)?
            .ok_or_else(|| AuditError::NotFound(format!("No signature for {}", name)))?;
        let bytes = self.batches.batch_bytes(name)?;
        Ok(self.keys.verify(&bytes, &signature, &public))
    }
}
