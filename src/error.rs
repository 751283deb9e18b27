use thiserror::Error;

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(format!("JSON error: {}", err))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Protocol error: {0}")]
    PermanentProtocol(String),

    #[error("No valid batches: {0}")]
    NoValidBatches(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = AuditError> = std::result::Result<T, E>;

impl AuditError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    pub fn io_at(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io(format!("{}: {}", path.display(), err))
    }

    pub fn parse_at(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::Parse(format!("{}: {}", path.display(), err))
    }
}
