//! Chain Anchor
//!
//! Submits the latest Merkle root to the ledger program as a `submit_root`
//! instruction against the signer's derived `merkle` account.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ledger::{
    derive_address, keypair_from_file, parse_pubkey, pubkey_of, sign_transaction, AccountMeta,
    Instruction, LedgerClient, Message, Pubkey, SignatureStatus, SYSTEM_PROGRAM_ID,
};
use crate::audit::engine::read_latest_root;
use crate::audit::entry::EntryHash;
use crate::batch::BatchDirectory;
use crate::crypto::KeyManager;
use crate::error::{AuditError, Result};
use crate::retry::RetryPolicy;

/// Anchor-program discriminator of the `submit_root` instruction
pub const SUBMIT_ROOT_DISCRIMINATOR: [u8; 8] = [15, 86, 198, 221, 22, 34, 184, 178];
pub const MERKLE_SEED: &[u8] = b"merkle";

/// Instruction payload: discriminator followed by the raw root.
pub fn submit_root_data(root: &EntryHash) -> Vec<u8> {
    let mut data = Vec::with_capacity(SUBMIT_ROOT_DISCRIMINATOR.len() + root.len());
    data.extend_from_slice(&SUBMIT_ROOT_DISCRIMINATOR);
    data.extend_from_slice(root);
    data
}

/// Read the program id from an IDL file's `address` field.
pub fn program_id_from_idl(path: &Path) -> Result<Pubkey> {
    let contents = fs::read_to_string(path).map_err(|e| AuditError::io_at(path, e))?;
    let idl: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| AuditError::parse_at(path, e))?;
    let address = idl
        .get("address")
        .and_then(|a| a.as_str())
        .ok_or_else(|| AuditError::parse_at(path, "missing \"address\""))?;
    parse_pubkey(address)
}

/// Which key signs and pays for the anchoring transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorSigner {
    /// The endpoint key that signs log batches
    EndpointKey,
    /// A separate wallet keypair file
    Wallet(PathBuf),
}

impl AnchorSigner {
    pub fn resolve(&self, keys: &KeyManager, password: Option<&str>) -> Result<SigningKey> {
        match self {
            AnchorSigner::EndpointKey => keys.load_signing_key(password),
            AnchorSigner::Wallet(path) => keypair_from_file(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    /// Accepted by the node, confirmation not checked
    Submitted,
    Confirmed,
    Finalized,
    /// Confirmation polling gave up before the node confirmed it
    Unconfirmed,
    Failed,
}

/// Persisted outcome of one anchoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub root: String,
    pub signature: String,
    pub status: AnchorStatus,
    pub slot: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    pub derived_address: String,
    pub program_id: String,
}

impl AnchorRecord {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AuditError::io_at(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).map_err(|e| AuditError::io_at(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read(path).map_err(|e| AuditError::io_at(path, e))?;
        serde_json::from_slice(&contents).map_err(|e| AuditError::parse_at(path, e))
    }
}

pub struct ChainAnchor<C: LedgerClient> {
    client: C,
    program_id: Pubkey,
    signer: SigningKey,
    submit_policy: RetryPolicy,
    confirm_policy: RetryPolicy,
}

impl<C: LedgerClient> ChainAnchor<C> {
    pub fn new(client: C, program_id: Pubkey, signer: SigningKey) -> Self {
        Self {
            client,
            program_id,
            signer,
            submit_policy: RetryPolicy::network(),
            confirm_policy: RetryPolicy::blockchain(),
        }
    }

    pub fn with_retry_policies(mut self, submit: RetryPolicy, confirm: RetryPolicy) -> Self {
        self.submit_policy = submit;
        self.confirm_policy = confirm;
        self
    }

    pub fn signer_address(&self) -> Pubkey {
        pubkey_of(&self.signer)
    }

    /// The account the program stores roots in for this signer.
    pub fn derived_address(&self) -> Result<Pubkey> {
        let signer = self.signer_address();
        derive_address(&[MERKLE_SEED, signer.as_ref()], &self.program_id)
            .map(|(address, _bump)| address)
    }

    pub fn build_instruction(&self, root: &EntryHash) -> Result<Instruction> {
        Ok(Instruction::new_with_bytes(
            self.program_id,
            &submit_root_data(root),
            vec![
                AccountMeta::new(self.derived_address()?, false),
                AccountMeta::new(self.signer_address(), true),
                AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            ],
        ))
    }

    /// Submit `root`. The blockhash fetch and the send are each retried on
    /// transient errors; the last error is returned once attempts run out.
    pub async fn submit_root(&self, root: &EntryHash) -> Result<AnchorRecord> {
        let instruction = self.build_instruction(root)?;
        let derived_address = instruction.accounts[0].pubkey;

        let blockhash = self
            .submit_policy
            .run_with_predicate(
                "fetch latest blockhash",
                || self.client.latest_blockhash(),
                AuditError::is_transient,
            )
            .await
            .into_result()?;

        let message =
            Message::new_with_blockhash(&[instruction], Some(&self.signer_address()), &blockhash);
        let transaction = sign_transaction(message, &self.signer)?;

        let signature = self
            .submit_policy
            .run_with_predicate(
                "send transaction",
                || self.client.send_transaction(&transaction),
                AuditError::is_transient,
            )
            .await
            .into_result()?;

        info!(
            "Merkle root {} submitted, transaction {}",
            hex::encode(root),
            signature
        );

        Ok(AnchorRecord {
            root: hex::encode(root),
            signature,
            status: AnchorStatus::Submitted,
            slot: None,
            submitted_at: Utc::now(),
            derived_address: derived_address.to_string(),
            program_id: self.program_id.to_string(),
        })
    }

    /// Poll until the node reports the transaction settled: confirmed, or
    /// executed with an error (`status.err`). Pending counts as transient.
    pub async fn await_confirmation(&self, signature: &str) -> Result<SignatureStatus> {
        self.confirm_policy
            .run_with_predicate(
                "confirm transaction",
                || async move {
                    match self.client.signature_status(signature).await? {
                        Some(status) if status.err.is_some() || status.is_confirmed() => Ok(status),
                        _ => Err(AuditError::TransientNetwork(format!(
                            "Transaction {} not yet confirmed",
                            signature
                        ))),
                    }
                },
                AuditError::is_transient,
            )
            .await
            .into_result()
    }

    /// Anchor the latest persisted root and record the result next to it.
    ///
    /// A missing root file is fatal and never retried. Only a transaction the
    /// ledger executed with an error is `Failed`; when the status lookup
    /// itself fails the transaction may still land, so it is `Unconfirmed`.
    pub async fn anchor_latest(&self, batches: &BatchDirectory, confirm: bool) -> Result<AnchorRecord> {
        let root = read_latest_root(batches)?;
        let mut record = self.submit_root(&root).await?;

        if confirm {
            match self.await_confirmation(&record.signature).await {
                Ok(status) if status.err.is_some() => {
                    record.slot = Some(status.slot);
                    record.status = AnchorStatus::Failed;
                    record.save(&batches.anchor_file())?;
                    return Err(AuditError::PermanentProtocol(format!(
                        "Transaction {} failed: {}",
                        record.signature,
                        status.err.as_ref().map(|e| e.to_string()).unwrap_or_default()
                    )));
                }
                Ok(status) => {
                    record.slot = Some(status.slot);
                    record.status = match status.confirmation_status.as_deref() {
                        Some("finalized") => AnchorStatus::Finalized,
                        _ => AnchorStatus::Confirmed,
                    };
                    info!("Anchor confirmed in slot {}", status.slot);
                }
                Err(e) => {
                    warn!("Anchor not confirmed yet: {}", e);
                    record.status = AnchorStatus::Unconfirmed;
                }
            }
        }

        record.save(&batches.anchor_file())?;
        Ok(record)
    }
}
