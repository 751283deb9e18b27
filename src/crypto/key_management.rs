//! Endpoint Key Management
//!
//! File-backed Ed25519 key store for the log-signing endpoint. The public key
//! is always kept as hex text. The private key is stored either as plain hex
//! or, when a password is supplied, sealed with a password-derived key.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::{debug, info};

use super::encryption::{self, KdfParams, SealedSecret};
use super::signatures::{
    signing_key_from_hex, verifying_key_from_hex, SignatureBytes, SignatureManager,
};
use crate::error::AuditError;

pub const PUBLIC_KEY_FILE: &str = "ed25519_public.hex";
pub const PLAIN_PRIVATE_KEY_FILE: &str = "ed25519_private.hex";
pub const ENCRYPTED_PRIVATE_KEY_FILE: &str = "ed25519_private.encrypted";

/// How the private key is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Plain,
    Encrypted,
}

impl KeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Plain => "plain",
            KeyMode::Encrypted => "encrypted",
        }
    }
}

/// Key store rooted at a directory
pub struct KeyManager {
    key_dir: PathBuf,
    signature_manager: SignatureManager,
    kdf_params: KdfParams,
}

impl KeyManager {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            signature_manager: SignatureManager::new(),
            kdf_params: KdfParams::default(),
        }
    }

    /// Override the KDF cost used for newly sealed keys.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    fn public_path(&self) -> PathBuf {
        self.key_dir.join(PUBLIC_KEY_FILE)
    }

    fn plain_path(&self) -> PathBuf {
        self.key_dir.join(PLAIN_PRIVATE_KEY_FILE)
    }

    fn encrypted_path(&self) -> PathBuf {
        self.key_dir.join(ENCRYPTED_PRIVATE_KEY_FILE)
    }

    /// Create a fresh keypair (not persisted).
    pub fn generate(&self) -> SigningKey {
        self.signature_manager.generate_keypair()
    }

    /// Which private key mode is present on disk, if any. Encrypted wins.
    pub fn key_mode(&self) -> Option<KeyMode> {
        if self.has_encrypted_key() {
            Some(KeyMode::Encrypted)
        } else if self.plain_path().exists() {
            Some(KeyMode::Plain)
        } else {
            None
        }
    }

    pub fn has_encrypted_key(&self) -> bool {
        self.encrypted_path().exists()
    }

    /// Generate and persist a keypair, encrypted when `password` is given.
    ///
    /// Refuses to replace an existing private key unless `force` is set.
    pub fn generate_and_store(
        &self,
        password: Option<&str>,
        force: bool,
    ) -> Result<SigningKey, AuditError> {
        if let Some(mode) = self.key_mode() {
            if !force {
                return Err(AuditError::Config(format!(
                    "A {} private key already exists in {}",
                    mode.as_str(),
                    self.key_dir.display()
                )));
            }
        }

        // The old key stays in place until the new one has been written.
        let key = self.generate();
        let stale = match password {
            Some(password) => {
                self.encrypt_and_store(&key, password)?;
                self.plain_path()
            }
            None => {
                self.store_plain(&key)?;
                self.encrypted_path()
            }
        };
        if stale.exists() {
            fs::remove_file(&stale).map_err(|e| AuditError::io_at(&stale, e))?;
            debug!("Removed old private key {}", stale.display());
        }
        Ok(key)
    }

    /// Seal the private key with `password` and write it with the public key.
    pub fn encrypt_and_store(&self, key: &SigningKey, password: &str) -> Result<(), AuditError> {
        self.ensure_dir()?;

        let seed = zeroize::Zeroizing::new(key.to_bytes());
        let sealed = encryption::seal(seed.as_slice(), password, self.kdf_params)?;
        let json = serde_json::to_vec_pretty(&sealed)?;

        write_private(&self.encrypted_path(), &json)?;
        self.store_public(&key.verifying_key())?;

        info!(
            "Encrypted keypair stored in {} (public key {})",
            self.key_dir.display(),
            hex::encode(key.verifying_key().to_bytes())
        );
        Ok(())
    }

    /// Write the private key as plain hex, for low-friction environments.
    pub fn store_plain(&self, key: &SigningKey) -> Result<(), AuditError> {
        self.ensure_dir()?;

        let private_hex = zeroize::Zeroizing::new(hex::encode(key.to_bytes()));
        write_private(&self.plain_path(), private_hex.as_bytes())?;
        self.store_public(&key.verifying_key())?;

        info!(
            "Plain keypair stored in {} (public key {})",
            self.key_dir.display(),
            hex::encode(key.verifying_key().to_bytes())
        );
        Ok(())
    }

    fn store_public(&self, key: &VerifyingKey) -> Result<(), AuditError> {
        write_replacing(&self.public_path(), hex::encode(key.to_bytes()).as_bytes(), 0o644)
    }

    fn ensure_dir(&self) -> Result<(), AuditError> {
        fs::create_dir_all(&self.key_dir).map_err(|e| AuditError::io_at(&self.key_dir, e))
    }

    /// Decrypt the sealed private key.
    ///
    /// Fails with `AuditError::Auth` on a wrong password and on a missing or
    /// corrupt store.
    pub fn load_private(&self, password: &str) -> Result<SigningKey, AuditError> {
        let path = self.encrypted_path();
        let contents = fs::read(&path).map_err(|e| {
            AuditError::Auth(format!("Cannot read key store {}: {}", path.display(), e))
        })?;
        let sealed: SealedSecret = serde_json::from_slice(&contents)
            .map_err(|e| AuditError::Auth(format!("Corrupt key store: {}", e)))?;

        let seed = encryption::open(&sealed, password)?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| AuditError::Auth("Decrypted key has wrong length".to_string()))?;

        let key = SigningKey::from_bytes(&seed);
        self.check_matches_public(&key)?;
        Ok(key)
    }

    /// Read the unencrypted private key.
    pub fn load_plain_private(&self) -> Result<SigningKey, AuditError> {
        let path = self.plain_path();
        let contents = zeroize::Zeroizing::new(fs::read_to_string(&path).map_err(|e| {
            AuditError::NotFound(format!("Private key {}: {}", path.display(), e))
        })?);
        let key = signing_key_from_hex(&contents)?;
        self.check_matches_public(&key)?;
        Ok(key)
    }

    /// Load whichever private key is present.
    pub fn load_signing_key(&self, password: Option<&str>) -> Result<SigningKey, AuditError> {
        match (self.key_mode(), password) {
            (Some(KeyMode::Encrypted), Some(password)) => self.load_private(password),
            (Some(KeyMode::Encrypted), None) => Err(AuditError::Auth(
                "Private key is encrypted; a password is required".to_string(),
            )),
            (Some(KeyMode::Plain), _) => self.load_plain_private(),
            (None, _) => Err(AuditError::NotFound(format!(
                "No private key in {}",
                self.key_dir.display()
            ))),
        }
    }

    /// Read the public key. Fails with `AuditError::NotFound` if absent.
    pub fn load_public(&self) -> Result<VerifyingKey, AuditError> {
        let path = self.public_path();
        if !path.exists() {
            return Err(AuditError::NotFound(format!(
                "Public key not found at {}",
                path.display()
            )));
        }
        let contents = fs::read_to_string(&path).map_err(|e| AuditError::io_at(&path, e))?;
        verifying_key_from_hex(&contents)
    }

    fn check_matches_public(&self, key: &SigningKey) -> Result<(), AuditError> {
        if !self.public_path().exists() {
            return Ok(());
        }
        if self.load_public()? != key.verifying_key() {
            return Err(AuditError::Crypto(
                "Stored public key does not match the private key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sign(&self, data: &[u8], key: &SigningKey) -> SignatureBytes {
        self.signature_manager.create_signature(data, key)
    }

    /// Never fails; any mismatch or malformed input yields `false`.
    pub fn verify(&self, data: &[u8], signature: &[u8], key: &VerifyingKey) -> bool {
        self.signature_manager.verify_signature(data, signature, key)
    }

    /// Verify a detached signature file against a data file with the stored
    /// public key.
    pub fn verify_file(&self, data_path: &Path, signature_path: &Path) -> Result<bool, AuditError> {
        let public = self.load_public()?;
        let data = fs::read(data_path).map_err(|e| AuditError::io_at(data_path, e))?;
        let signature =
            fs::read(signature_path).map_err(|e| AuditError::io_at(signature_path, e))?;
        Ok(self.verify(&data, &signature, &public))
    }
}

/// Private key material is only ever readable by the owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), AuditError> {
    write_replacing(path, contents, 0o600)
}

/// Write `contents` to `<path>.tmp`, created with `mode`, then rename it over
/// `path`. A failed write leaves the previous file untouched.
fn write_replacing(path: &Path, contents: &[u8], mode: u32) -> Result<(), AuditError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if tmp.is_file() {
        fs::remove_file(&tmp).map_err(|e| AuditError::io_at(&tmp, e))?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).map_err(|e| AuditError::io_at(&tmp, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| AuditError::io_at(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| AuditError::io_at(path, e))
}
