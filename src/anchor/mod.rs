//! Ledger Anchoring
//!
//! Publishes Merkle roots to an external append-only ledger so they cannot
//! be altered later without detection.

pub mod chain;
pub mod ledger;
pub mod rpc;

pub use chain::{AnchorRecord, AnchorSigner, AnchorStatus, ChainAnchor};
pub use ledger::{LedgerClient, Pubkey};
pub use rpc::RpcLedgerClient;
