//! Ledger Data Model
//!
//! Addresses, derived program addresses, instructions and transactions come
//! from the solana crates. This module signs transactions with the endpoint
//! key, reads wallet keypair files and defines the `LedgerClient` seam used
//! to talk to a node.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use serde::Deserialize;

pub use solana_hash::Hash as Blockhash;
pub use solana_instruction::{AccountMeta, Instruction};
pub use solana_message::Message;
pub use solana_pubkey::Pubkey;
pub use solana_signature::Signature;
pub use solana_transaction::Transaction;

use crate::error::{AuditError, Result};

/// The system program owns newly created accounts.
pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::new_from_array([0u8; 32]);

/// Ledger address of an ed25519 key
pub fn pubkey_of(key: &SigningKey) -> Pubkey {
    Pubkey::new_from_array(key.verifying_key().to_bytes())
}

pub fn parse_pubkey(s: &str) -> Result<Pubkey> {
    s.trim()
        .parse()
        .map_err(|e| AuditError::Parse(format!("Invalid address {}: {}", s, e)))
}

/// Derived address and bump for `seeds` under `program_id`.
pub fn derive_address(seeds: &[&[u8]], program_id: &Pubkey) -> Result<(Pubkey, u8)> {
    Pubkey::try_find_program_address(seeds, program_id).ok_or_else(|| {
        AuditError::PermanentProtocol(format!(
            "No valid derived address for program {}",
            program_id
        ))
    })
}

/// Sign `message` with `signer`, which must be its only required signer.
pub fn sign_transaction(message: Message, signer: &SigningKey) -> Result<Transaction> {
    let payer = pubkey_of(signer);
    if message.header.num_required_signatures != 1 || message.account_keys.first() != Some(&payer) {
        return Err(AuditError::Crypto(format!(
            "Message needs {} signature(s) and {} is not the fee payer",
            message.header.num_required_signatures, payer
        )));
    }

    let mut transaction = Transaction::new_unsigned(message);
    let signature = signer.sign(&transaction.message_data());
    transaction.signatures = vec![Signature::from(signature.to_bytes())];
    Ok(transaction)
}

/// Wire bytes of a signed transaction
pub fn serialize_transaction(transaction: &Transaction) -> Result<Vec<u8>> {
    bincode::serialize(transaction)
        .map_err(|e| AuditError::PermanentProtocol(format!("Transaction encoding: {}", e)))
}

/// Identifier of the transaction: its first signature, base58.
pub fn transaction_signature(transaction: &Transaction) -> Option<String> {
    transaction.signatures.first().map(|s| s.to_string())
}

/// Load a keypair file: a JSON array of 64 bytes, secret then public.
pub fn keypair_from_file(path: &Path) -> Result<SigningKey> {
    let contents = fs::read_to_string(path).map_err(|e| AuditError::io_at(path, e))?;
    let bytes: zeroize::Zeroizing<Vec<u8>> = zeroize::Zeroizing::new(
        serde_json::from_str(&contents).map_err(|e| AuditError::parse_at(path, e))?,
    );
    if bytes.len() != 64 {
        return Err(AuditError::Crypto(format!(
            "Keypair file {} must hold 64 bytes, got {}",
            path.display(),
            bytes.len()
        )));
    }

    let mut secret = zeroize::Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&bytes[..32]);
    let key = SigningKey::from_bytes(&secret);
    if key.verifying_key().as_bytes()[..] != bytes[32..] {
        return Err(AuditError::Crypto(format!(
            "Keypair file {} has mismatched public key",
            path.display()
        )));
    }
    Ok(key)
}

/// Node-reported state of a submitted transaction
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub confirmation_status: Option<String>,
}

impl SignatureStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.confirmation_status.as_deref(),
            Some("confirmed") | Some("finalized")
        )
    }
}

/// Calls the anchor needs from a ledger node
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn latest_blockhash(&self) -> Result<Blockhash>;

    /// Submit a signed transaction; returns its signature.
    async fn send_transaction(&self, transaction: &Transaction) -> Result<String>;

    /// `None` while the node has not seen the transaction.
    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>>;
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for std::sync::Arc<T> {
    async fn latest_blockhash(&self) -> Result<Blockhash> {
        (**self).latest_blockhash().await
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<String> {
        (**self).send_transaction(transaction).await
    }

    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        (**self).signature_status(signature).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn pk(s: &str) -> Pubkey {
        parse_pubkey(s).unwrap()
    }

    #[test]
    fn test_system_program_base58() {
        assert_eq!(SYSTEM_PROGRAM_ID.to_string(), "11111111111111111111111111111111");
        assert_eq!(pk("11111111111111111111111111111111"), SYSTEM_PROGRAM_ID);
        assert!(matches!(parse_pubkey("not-an-address"), Err(AuditError::Parse(_))));
    }

    #[test]
    fn test_derive_address() {
        let program_id = pk("BPFLoaderUpgradeab1e11111111111111111111111");
        let (address, bump) = derive_address(&[b"merkle", &[0u8; 32]], &program_id).unwrap();
        assert_eq!(address, pk("FfwRCJRiSXG9RhGRzuGym2QnNuWytj95WWEFkKEh9UW9"));
        assert_eq!(bump, 255);
        assert!(!address.is_on_curve());
    }

    #[test]
    fn test_signed_transaction_layout() {
        let payer_key = SigningKey::generate(&mut OsRng);
        let payer = pubkey_of(&payer_key);
        let program_id = pk("BPFLoaderUpgradeab1e11111111111111111111111");
        let derived = pk("FfwRCJRiSXG9RhGRzuGym2QnNuWytj95WWEFkKEh9UW9");

        let ix = Instruction::new_with_bytes(
            program_id,
            &[1, 2, 3],
            vec![
                AccountMeta::new(derived, false),
                AccountMeta::new(payer, true),
                AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            ],
        );
        let message =
            Message::new_with_blockhash(&[ix], Some(&payer), &Blockhash::new_from_array([7u8; 32]));

        assert_eq!(message.header.num_required_signatures, 1);
        assert_eq!(message.header.num_readonly_signed_accounts, 0);
        assert_eq!(message.header.num_readonly_unsigned_accounts, 2);
        assert_eq!(message.account_keys, vec![payer, derived, SYSTEM_PROGRAM_ID, program_id]);
        assert_eq!(message.instructions[0].program_id_index, 3);
        assert_eq!(message.instructions[0].accounts, vec![1, 0, 2]);

        let tx = sign_transaction(message.clone(), &payer_key).unwrap();
        let bytes = tx.message_data();
        let wire = serialize_transaction(&tx).unwrap();
        assert_eq!(wire[0], 1);
        assert_eq!(&wire[65..], bytes.as_slice());
        assert!(wire.ends_with(&[1, 2, 3]));

        let raw: [u8; 64] = tx.signatures[0].as_ref().try_into().unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&raw);
        assert!(payer_key.verifying_key().verify_strict(&bytes, &signature).is_ok());
        assert_eq!(transaction_signature(&tx), Some(tx.signatures[0].to_string()));

        let stranger = SigningKey::generate(&mut OsRng);
        assert!(matches!(sign_transaction(message, &stranger), Err(AuditError::Crypto(_))));
    }

    #[test]
    fn test_keypair_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let path = dir.path().join("wallet.json");
        fs::write(&path, serde_json::to_string(&key.to_keypair_bytes().to_vec()).unwrap()).unwrap();
        assert_eq!(keypair_from_file(&path).unwrap().to_bytes(), key.to_bytes());

        let mut bad = key.to_keypair_bytes();
        bad[40] ^= 1;
        fs::write(&path, serde_json::to_string(&bad.to_vec()).unwrap()).unwrap();
        assert!(matches!(keypair_from_file(&path), Err(AuditError::Crypto(_))));

        fs::write(&path, "[1,2,3]").unwrap();
        assert!(keypair_from_file(&path).is_err());
    }
}
