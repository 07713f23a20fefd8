//! Ethereum JSON-RPC chain client.
//!
//! Transfers are ERC-20 `transfer(address,uint256)` calls sent with
//! `eth_sendTransaction` from an account the node manages, so signing stays
//! inside the node. Confirmation polls `eth_getTransactionReceipt`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ChainClient, ChainError, ReceiptStatus};
use crate::address::WalletAddress;
use crate::types::{TokenAmount, TransferReference};

/// Selector of `transfer(address,uint256)`.
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Connection settings for [`RpcChainClient`].
#[derive(Clone)]
pub struct RpcSettings {
    pub rpc_url: String,
    pub token_contract: WalletAddress,
    pub sender: WalletAddress,
    pub gas_limit: u64,
    pub receipt_poll_interval: Duration,
    pub request_timeout: Duration,
    /// Bearer token for authenticated endpoints.
    pub auth_token: Option<SecretString>,
}

impl fmt::Debug for RpcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSettings")
            .field("rpc_url", &self.rpc_url)
            .field("token_contract", &self.token_contract)
            .field("sender", &self.sender)
            .field("gas_limit", &self.gas_limit)
            .field("receipt_poll_interval", &self.receipt_poll_interval)
            .field("request_timeout", &self.request_timeout)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// [`ChainClient`] backed by an Ethereum JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcChainClient {
    http: reqwest::Client,
    settings: RpcSettings,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl From<reqwest::Error> for ChainError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::TimedOut(value.to_string())
        } else if value.is_decode() {
            Self::Malformed(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl RpcChainClient {
    /// Builds a client for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Transport`] if the HTTP client cannot be built.
    pub fn new(settings: RpcSettings) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.request_timeout)
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            http,
            settings,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.http.post(&self.settings.rpc_url).json(&body);
        if let Some(token) = &self.settings.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Transport(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let payload: RpcResponse = response.json().await?;
        debug!(method, id, "JSON-RPC call completed");
        interpret_response(payload)
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn submit_transfer(
        &self,
        destination: &WalletAddress,
        amount: TokenAmount,
    ) -> Result<TransferReference, ChainError> {
        let tx = json!({
            "from": self.settings.sender.to_checksum(),
            "to": self.settings.token_contract.to_checksum(),
            "gas": format!("{:#x}", self.settings.gas_limit),
            "data": encode_transfer_call(destination, amount),
        });

        match self.call("eth_sendTransaction", json!([tx])).await? {
            Value::String(hash) if hash.starts_with("0x") => Ok(TransferReference::new(hash)),
            other => Err(ChainError::Malformed(format!(
                "unexpected transaction hash: {other}"
            ))),
        }
    }

    /// Polls until a mined receipt is found.
    ///
    /// A submitted transaction can still be mined after any lookup error, so
    /// no error ends the loop. The caller bounds the wait.
    async fn await_receipt(
        &self,
        reference: &TransferReference,
    ) -> Result<ReceiptStatus, ChainError> {
        loop {
            let lookup = self
                .call("eth_getTransactionReceipt", json!([reference.as_str()]))
                .await
                .and_then(|receipt| match receipt {
                    Value::Null => Ok(None),
                    receipt => receipt_status(&receipt).map(Some),
                });

            match lookup {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => debug!(transfer_reference = %reference, "Receipt pending"),
                Err(err) => {
                    warn!(
                        transfer_reference = %reference,
                        error = %err,
                        "Receipt lookup failed, retrying"
                    );
                },
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }
}

/// ABI-encodes `transfer(destination, amount)` as `0x`-prefixed calldata.
#[must_use]
pub fn encode_transfer_call(destination: &WalletAddress, amount: TokenAmount) -> String {
    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(destination.as_bytes());
    data.extend_from_slice(&amount.to_be_word());
    format!("0x{}", hex::encode(data))
}

fn interpret_response(payload: RpcResponse) -> Result<Value, ChainError> {
    if let Some(err) = payload.error {
        return Err(classify_rpc_error(err.code, &err.message));
    }
    Ok(payload.result.unwrap_or(Value::Null))
}

fn classify_rpc_error(code: i64, message: &str) -> ChainError {
    let detail = format!("{message} (code {code})");
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("insufficient funds") || lowered.contains("exceeds balance") {
        ChainError::InsufficientFunds(detail)
    } else {
        ChainError::Signer(detail)
    }
}

fn receipt_status(receipt: &Value) -> Result<ReceiptStatus, ChainError> {
    match receipt.get("status").and_then(Value::as_str) {
        Some("0x1") => Ok(ReceiptStatus::Succeeded),
        Some("0x0") => Ok(ReceiptStatus::Reverted),
        other => Err(ChainError::Malformed(format!(
            "unexpected receipt status: {other:?}"
        ))),
    }
}
