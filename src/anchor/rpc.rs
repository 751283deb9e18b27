//! JSON-RPC Ledger Client
//!
//! Talks to a ledger node over HTTP. Transport failures, rate limiting and
//! server errors are reported as transient; anything the node rejects is
//! a permanent protocol error.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::ledger::{serialize_transaction, Blockhash, LedgerClient, SignatureStatus, Transaction};
use crate::error::{AuditError, Result};

/// Node is behind or temporarily unable to serve the request.
const TRANSIENT_RPC_CODES: &[i64] = &[-32004, -32005, -32014, -32016];

pub struct RpcLedgerClient {
    url: String,
    commitment: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
}

impl RpcLedgerClient {
    pub fn new(url: impl Into<String>, commitment: impl Into<String>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuditError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            commitment: commitment.into(),
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        debug!("RPC {} -> {}", method, self.url);

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http_client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuditError::TransientNetwork(format!("{}: {}", method, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AuditError::TransientNetwork(format!(
                "{}: HTTP {}",
                method, status
            )));
        }
        if !status.is_success() {
            return Err(AuditError::PermanentProtocol(format!(
                "{}: HTTP {}",
                method, status
            )));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| AuditError::PermanentProtocol(format!("{}: bad response: {}", method, e)))?;

        if let Some(error) = parsed.error {
            let message = format!("{}: {} (code {})", method, error.message, error.code);
            return Err(if TRANSIENT_RPC_CODES.contains(&error.code) {
                AuditError::TransientNetwork(message)
            } else {
                AuditError::PermanentProtocol(message)
            });
        }

        parsed
            .result
            .ok_or_else(|| AuditError::PermanentProtocol(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn latest_blockhash(&self) -> Result<Blockhash> {
        let response: WithContext<BlockhashValue> = self
            .call(
                "getLatestBlockhash",
                json!([{ "commitment": self.commitment }]),
            )
            .await?;
        response
            .value
            .blockhash
            .parse()
            .map_err(|e| AuditError::PermanentProtocol(format!("getLatestBlockhash: {}", e)))
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<String> {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serialize_transaction(transaction)?);
        self.call(
            "sendTransaction",
            json!([
                encoded,
                { "encoding": "base64", "preflightCommitment": self.commitment }
            ]),
        )
        .await
    }

    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        let response: WithContext<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await?;
        Ok(response.value.into_iter().next().flatten())
    }
}
