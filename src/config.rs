use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::anchor::chain::{program_id_from_idl, AnchorSigner};
use crate::anchor::ledger::Pubkey;
use crate::batch::BatchDirectory;
use crate::crypto::KeyManager;
use crate::error::AuditError;
use crate::retry::RetryPolicy;

/// Prefix for environment overrides, e.g. `AUDIT_ANCHOR__LEDGER__RPC_URL`.
pub const ENV_PREFIX: &str = "AUDIT_ANCHOR";
/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "audit-anchor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub logs_dir: PathBuf,
    pub key_dir: PathBuf,
}

impl StorageConfig {
    pub fn batches(&self) -> BatchDirectory {
        BatchDirectory::new(&self.logs_dir)
    }

    pub fn keys(&self) -> KeyManager {
        KeyManager::new(&self.key_dir)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            key_dir: PathBuf::from("endpoint_keys"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Base58 program id; read from `idl_path` when unset
    pub program_id: Option<String>,
    pub idl_path: PathBuf,
    /// Separate fee-paying wallet; the endpoint key signs when unset
    pub wallet_path: Option<PathBuf>,
    pub commitment: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            program_id: None,
            idl_path: PathBuf::from("idl.json"),
            wallet_path: None,
            commitment: "confirmed".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn program_id(&self) -> Result<Pubkey, AuditError> {
        match &self.program_id {
            Some(id) => id
                .parse()
                .map_err(|e| AuditError::Config(format!("ledger.program_id: {}", e))),
            None => program_id_from_idl(&self.idl_path),
        }
    }

    pub fn anchor_signer(&self) -> AnchorSigner {
        match &self.wallet_path {
            Some(path) => AnchorSigner::Wallet(path.clone()),
            None => AnchorSigner::EndpointKey,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub network: RetrySettings,
    pub blockchain: RetrySettings,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: RetrySettings::from(&RetryPolicy::network()),
            blockchain: RetrySettings::from(&RetryPolicy::blockchain()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    fn validate(&self, name: &str) -> Result<(), AuditError> {
        if self.max_attempts == 0 {
            return Err(AuditError::Config(format!(
                "retry.{}.max_attempts must be at least 1",
                name
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(AuditError::Config(format!(
                "retry.{}.base_delay_ms exceeds max_delay_ms",
                name
            )));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(AuditError::Config(format!(
                "retry.{}.multiplier must be at least 1.0",
                name
            )));
        }
        Ok(())
    }
}

impl From<&RetryPolicy> for RetrySettings {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl AppConfig {
    /// Layer built-in defaults, the config file and `AUDIT_ANCHOR__*`
    /// environment variables.
    ///
    /// An explicit `path` must exist; the default `audit-anchor.toml` is
    /// optional. Ledger and retry settings are not checked here, so offline
    /// commands work with any ledger section; call `validate` before
    /// anchoring.
    pub fn load(path: Option<&Path>) -> Result<Self, AuditError> {
        let defaults = config::Config::try_from(&AppConfig::default()).map_err(config_error)?;

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: AppConfig = settings.try_deserialize().map_err(config_error)?;
        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        self.retry.network.validate("network")?;
        self.retry.blockchain.validate("blockchain")?;
        if self.ledger.rpc_url.trim().is_empty() {
            return Err(AuditError::Config("ledger.rpc_url is empty".to_string()));
        }
        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> AuditError {
    AuditError::Config(err.to_string())
}
