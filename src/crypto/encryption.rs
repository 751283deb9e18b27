//! Password-based sealing of private key material.
//!
//! A 32-byte key is derived from the password with Argon2id and a random
//! salt, then the secret is encrypted with AES-256-GCM. The random nonce is
//! stored as the first 12 bytes of the ciphertext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::AuditError;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_AAD: &[u8] = b"audit-anchor/ed25519-private";

/// Argon2id cost parameters, persisted with each sealed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 4,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// On-disk form of an encrypted private key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub salt: String,
    #[serde(default)]
    pub kdf: KdfParams,
}

fn derive_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, AuditError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| AuditError::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| AuditError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

/// Encrypt `secret` under a key derived from `password` and a fresh salt.
pub fn seal(secret: &[u8], password: &str, params: KdfParams) -> Result<SealedSecret, AuditError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt, &params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| AuditError::Crypto(format!("Cipher init failed: {}", e)))?;
    let encrypted = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: secret,
                aad: KEY_AAD,
            },
        )
        .map_err(|_| AuditError::Crypto("Encryption failed".to_string()))?;

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + encrypted.len());
    ciphertext.extend_from_slice(&nonce_bytes);
    ciphertext.extend_from_slice(&encrypted);

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(SealedSecret {
        ciphertext: b64.encode(ciphertext),
        salt: b64.encode(salt),
        kdf: params,
    })
}

/// Decrypt a sealed secret. Any failure is reported as `AuditError::Auth`.
pub fn open(sealed: &SealedSecret, password: &str) -> Result<Zeroizing<Vec<u8>>, AuditError> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let salt = b64
        .decode(&sealed.salt)
        .map_err(|e| AuditError::Auth(format!("Corrupt salt: {}", e)))?;
    let ciphertext = b64
        .decode(&sealed.ciphertext)
        .map_err(|e| AuditError::Auth(format!("Corrupt ciphertext: {}", e)))?;
    if ciphertext.len() <= NONCE_LEN {
        return Err(AuditError::Auth("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LEN);
    let key = derive_key(password, &salt, &sealed.kdf)
        .map_err(|e| AuditError::Auth(e.to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| AuditError::Auth(format!("Cipher init failed: {}", e)))?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: encrypted,
                aad: KEY_AAD,
            },
        )
        .map_err(|_| AuditError::Auth("Wrong password or corrupt key store".to_string()))?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let sealed = seal(b"secret seed", "hunter2", KdfParams::insecure_fast()).unwrap();
        let opened = open(&sealed, "hunter2").unwrap();
        assert_eq!(opened.as_slice(), b"secret seed");
    }

    #[test]
    fn test_wrong_password_is_auth_error() {
        let sealed = seal(b"secret seed", "hunter2", KdfParams::insecure_fast()).unwrap();
        assert!(matches!(open(&sealed, "hunter3"), Err(AuditError::Auth(_))));
    }

    #[test]
    fn test_fresh_salt_and_nonce_each_time() {
        let a = seal(b"same", "pw", KdfParams::insecure_fast()).unwrap();
        let b = seal(b"same", "pw", KdfParams::insecure_fast()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_corrupt_store_is_auth_error() {
        let mut sealed = seal(b"secret seed", "pw", KdfParams::insecure_fast()).unwrap();
        sealed.ciphertext = "AAAA".to_string();
        assert!(matches!(open(&sealed, "pw"), Err(AuditError::Auth(_))));

        sealed.ciphertext = "not base64!".to_string();
        assert!(matches!(open(&sealed, "pw"), Err(AuditError::Auth(_))));
    }
}
