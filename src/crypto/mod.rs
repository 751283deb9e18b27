//! Cryptographic Primitives
//!
//! Ed25519 signing for log batches and the endpoint key store.

pub mod encryption;
pub mod key_management;
pub mod signatures;

pub use encryption::{KdfParams, SealedSecret};
pub use key_management::{KeyManager, KeyMode};
pub use signatures::{SignatureBytes, SignatureManager};
