pub mod anchor;
pub mod audit;
pub mod batch;
pub mod config;
pub mod crypto;
pub mod error;
pub mod retry;
pub mod workflow;

pub use error::{AuditError, Result};
