use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;

use crate::error::AuditError;

/// Raw Ed25519 signature bytes as written to `.sig` artifacts
pub type SignatureBytes = [u8; SIGNATURE_LENGTH];

pub struct SignatureManager;

impl SignatureManager {
    pub fn new() -> Self {
        Self
    }

    /// Generate a new keypair
    pub fn generate_keypair(&self) -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    pub fn create_signature(&self, data: &[u8], signing_key: &SigningKey) -> SignatureBytes {
        signing_key.sign(data).to_bytes()
    }

    /// Check `signature` over `data`. Malformed signatures verify as false.
    pub fn verify_signature(
        &self,
        data: &[u8],
        signature: &[u8],
        verifying_key: &VerifyingKey,
    ) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify(data, &signature).is_ok()
    }
}

impl Default for SignatureManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn signing_key_from_hex(hex_str: &str) -> Result<SigningKey, AuditError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| AuditError::Crypto(format!("Invalid private key hex: {}", e)))?;
    let seed: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        AuditError::Crypto(format!(
            "Private key must be {} bytes, got {}",
            SECRET_KEY_LENGTH,
            b.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn verifying_key_from_hex(hex_str: &str) -> Result<VerifyingKey, AuditError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| AuditError::Crypto(format!("Invalid public key hex: {}", e)))?;
    let key: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        AuditError::Crypto(format!(
            "Public key must be {} bytes, got {}",
            PUBLIC_KEY_LENGTH,
            b.len()
        ))
    })?;
    VerifyingKey::from_bytes(&key)
        .map_err(|e| AuditError::Crypto(format!("Invalid public key: {}", e)))
}
