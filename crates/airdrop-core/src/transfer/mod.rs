//! Token transfer execution.
//!
//! [`TransferExecutor`] turns an external [`ChainClient`] capability into a
//! single-attempt contract: one call submits at most one transfer and always
//! resolves, within bounded time, to either a [`TransferReceipt`] or a
//! [`TransferFailure`]. It never resubmits on its own, since a duplicate
//! submission could pay twice.
//!
//! A timeout that fires after submission leaves the on-chain outcome
//! unknown. It is still reported as [`TransferFailureCause::Timeout`], and the
//! submitted reference is carried in the failure so an operator can
//! reconcile it by hand.

pub mod rpc;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::address::WalletAddress;
use crate::types::{TokenAmount, TransferReference};

/// Default bound on handing a transfer to the chain client.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on waiting for a submitted transfer to be mined.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(180);

/// Errors reported by a [`ChainClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainError {
    /// The signer refused to sign or the node refused the transaction.
    #[error("signer rejected transfer: {0}")]
    Signer(String),

    /// The sending account cannot cover the transfer or its fees.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The chain endpoint could not be reached.
    #[error("chain transport error: {0}")]
    Transport(String),

    /// The endpoint answered with something that could not be understood.
    #[error("malformed chain response: {0}")]
    Malformed(String),

    /// A request was sent but no answer arrived in time.
    #[error("chain request timed out: {0}")]
    TimedOut(String),
}

impl ChainError {
    /// Whether the request may have taken effect on the node even though it
    /// reported an error.
    #[must_use]
    pub const fn outcome_unknown(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::Malformed(_))
    }
}

/// Final status of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Succeeded,
    Reverted,
}

/// The chain-client capability: account, signer, submission, and receipts.
///
/// Implementations are constructed once at startup and shared.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Submits one token transfer and returns its transaction reference once
    /// the chain has accepted it for inclusion.
    async fn submit_transfer(
        &self,
        destination: &WalletAddress,
        amount: TokenAmount,
    ) -> Result<TransferReference, ChainError>;

    /// Waits until the referenced transaction is mined and reports its
    /// status. Lookup failures never end the wait, since the transaction can
    /// still be mined; callers bound it.
    async fn await_receipt(&self, reference: &TransferReference)
    -> Result<ReceiptStatus, ChainError>;
}

/// Why a transfer did not settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFailureCause {
    RejectedBySigner,
    NetworkUnavailable,
    InsufficientFunds,
    Timeout,
    /// Mined, but the token contract call failed.
    Reverted,
}

impl TransferFailureCause {
    /// Stable machine-readable name, also stored in the ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RejectedBySigner => "rejected_by_signer",
            Self::NetworkUnavailable => "network_unavailable",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Timeout => "timeout",
            Self::Reverted => "reverted",
        }
    }
}

impl fmt::Display for TransferFailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer that did not settle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transfer failed ({cause}): {detail}")]
pub struct TransferFailure {
    pub cause: TransferFailureCause,
    /// Set when the transfer was submitted before failing; its on-chain
    /// outcome may need manual reconciliation.
    pub reference: Option<TransferReference>,
    pub detail: String,
}

impl TransferFailure {
    fn before_submit(cause: TransferFailureCause, detail: impl Into<String>) -> Self {
        Self {
            cause,
            reference: None,
            detail: detail.into(),
        }
    }

    fn after_submit(
        cause: TransferFailureCause,
        reference: &TransferReference,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            cause,
            reference: Some(reference.clone()),
            detail: detail.into(),
        }
    }
}

impl From<&ChainError> for TransferFailureCause {
    fn from(err: &ChainError) -> Self {
        match err {
            ChainError::Signer(_) => Self::RejectedBySigner,
            ChainError::InsufficientFunds(_) => Self::InsufficientFunds,
            ChainError::Transport(_) | ChainError::Malformed(_) => Self::NetworkUnavailable,
            ChainError::TimedOut(_) => Self::Timeout,
        }
    }
}

/// A confirmed, successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub reference: TransferReference,
    pub destination: WalletAddress,
    pub amount: TokenAmount,
}

/// Time bounds for the two phases of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTimeouts {
    pub submit: Duration,
    pub confirm: Duration,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            submit: DEFAULT_SUBMIT_TIMEOUT,
            confirm: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

/// Presents a single-attempt, bounded-time transfer contract over a
/// [`ChainClient`].
#[derive(Clone)]
pub struct TransferExecutor {
    client: Arc<dyn ChainClient>,
    timeouts: TransferTimeouts,
}

impl fmt::Debug for TransferExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferExecutor")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl TransferExecutor {
    #[must_use]
    pub fn new(client: Arc<dyn ChainClient>, timeouts: TransferTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Submits exactly one transfer of `amount` to `destination` and waits
    /// for a definitive outcome.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferFailure`] when the transfer was refused, could not
    /// be submitted, reverted, or did not resolve within the configured
    /// timeouts.
    pub async fn transfer(
        &self,
        destination: &WalletAddress,
        amount: TokenAmount,
    ) -> Result<TransferReceipt, TransferFailure> {
        let submitted = tokio::time::timeout(
            self.timeouts.submit,
            self.client.submit_transfer(destination, amount),
        )
        .await;

        let reference = match submitted {
            Ok(Ok(reference)) => reference,
            Ok(Err(err)) => {
                if err.outcome_unknown() {
                    error!(
                        destination = %destination,
                        error = %err,
                        "Transfer submission failed; on-chain outcome unknown"
                    );
                } else {
                    warn!(destination = %destination, error = %err, "Transfer submission failed");
                }
                return Err(TransferFailure::before_submit((&err).into(), err.to_string()));
            },
            Err(_) => {
                // The request may still have reached the node.
                error!(
                    destination = %destination,
                    timeout_secs = self.timeouts.submit.as_secs(),
                    "Transfer submission timed out; on-chain outcome unknown"
                );
                return Err(TransferFailure::before_submit(
                    TransferFailureCause::Timeout,
                    "submission timed out",
                ));
            },
        };

        info!(
            destination = %destination,
            amount = %amount,
            transfer_reference = %reference,
            "Transfer submitted"
        );

        let confirmed =
            tokio::time::timeout(self.timeouts.confirm, self.client.await_receipt(&reference))
                .await;

        match confirmed {
            Ok(Ok(ReceiptStatus::Succeeded)) => Ok(TransferReceipt {
                reference,
                destination: *destination,
                amount,
            }),
            Ok(Ok(ReceiptStatus::Reverted)) => {
                warn!(transfer_reference = %reference, "Transfer reverted on chain");
                Err(TransferFailure::after_submit(
                    TransferFailureCause::Reverted,
                    &reference,
                    "transaction reverted",
                ))
            },
            Ok(Err(err)) => {
                error!(
                    transfer_reference = %reference,
                    error = %err,
                    "Receipt lookup failed after submission; on-chain outcome unknown"
                );
                Err(TransferFailure::after_submit((&err).into(), &reference, err.to_string()))
            },
            Err(_) => {
                error!(
                    transfer_reference = %reference,
                    timeout_secs = self.timeouts.confirm.as_secs(),
                    "Confirmation timed out; on-chain outcome unknown, manual reconciliation required"
                );
                Err(TransferFailure::after_submit(
                    TransferFailureCause::Timeout,
                    &reference,
                    "confirmation timed out",
                ))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted chain client.
    struct ScriptedClient {
        submit: Result<TransferReference, ChainError>,
        receipt: Result<ReceiptStatus, ChainError>,
        submit_delay: Duration,
        receipt_delay: Duration,
        submissions: AtomicUsize,
        destinations: Mutex<Vec<WalletAddress>>,
    }

    impl ScriptedClient {
        fn new(
            submit: Result<TransferReference, ChainError>,
            receipt: Result<ReceiptStatus, ChainError>,
        ) -> Self {
            Self {
                submit,
                receipt,
                submit_delay: Duration::ZERO,
                receipt_delay: Duration::ZERO,
                submissions: AtomicUsize::new(0),
                destinations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedClient {
        async fn submit_transfer(
            &self,
            destination: &WalletAddress,
            _amount: TokenAmount,
        ) -> Result<TransferReference, ChainError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            self.destinations.lock().unwrap().push(*destination);
            tokio::time::sleep(self.submit_delay).await;
            self.submit.clone()
        }

        async fn await_receipt(
            &self,
            _reference: &TransferReference,
        ) -> Result<ReceiptStatus, ChainError> {
            tokio::time::sleep(self.receipt_delay).await;
            self.receipt.clone()
        }
    }

    fn destination() -> WalletAddress {
        WalletAddress::from_bytes([0x42; 20])
    }

    fn executor(client: &Arc<ScriptedClient>) -> TransferExecutor {
        TransferExecutor::new(
            Arc::clone(client) as Arc<dyn ChainClient>,
            TransferTimeouts {
                submit: Duration::from_secs(5),
                confirm: Duration::from_secs(10),
            },
        )
    }

    #[tokio::test]
    async fn test_successful_transfer_returns_receipt() {
        let client = Arc::new(ScriptedClient::new(
            Ok(TransferReference::new("0xabc")),
            Ok(ReceiptStatus::Succeeded),
        ));

        let receipt = executor(&client)
            .transfer(&destination(), TokenAmount::new(10))
            .await
            .expect("transfer should settle");

        assert_eq!(receipt.reference.as_str(), "0xabc");
        assert_eq!(receipt.destination, destination());
        assert_eq!(receipt.amount, TokenAmount::new(10));
        assert_eq!(client.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(*client.destinations.lock().unwrap(), vec![destination()]);
    }

    #[tokio::test]
    async fn test_submission_errors_map_to_causes() {
        let cases = [
            (
                ChainError::Signer("locked".into()),
                TransferFailureCause::RejectedBySigner,
            ),
            (
                ChainError::InsufficientFunds("low balance".into()),
                TransferFailureCause::InsufficientFunds,
            ),
            (
                ChainError::Transport("connection refused".into()),
                TransferFailureCause::NetworkUnavailable,
            ),
            (
                ChainError::Malformed("expected value at line 1 column 1".into()),
                TransferFailureCause::NetworkUnavailable,
            ),
            (
                ChainError::TimedOut("operation timed out".into()),
                TransferFailureCause::Timeout,
            ),
        ];

        for (err, cause) in cases {
            let client = Arc::new(ScriptedClient::new(Err(err), Ok(ReceiptStatus::Succeeded)));
            let failure = executor(&client)
                .transfer(&destination(), TokenAmount::new(1))
                .await
                .unwrap_err();

            assert_eq!(failure.cause, cause);
            assert!(failure.reference.is_none());
            assert_eq!(client.submissions.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_revert_keeps_reference() {
        let client = Arc::new(ScriptedClient::new(
            Ok(TransferReference::new("0xdead")),
            Ok(ReceiptStatus::Reverted),
        ));

        let failure = executor(&client)
            .transfer(&destination(), TokenAmount::new(1))
            .await
            .unwrap_err();

        assert_eq!(failure.cause, TransferFailureCause::Reverted);
        assert_eq!(failure.reference, Some(TransferReference::new("0xdead")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_submission_times_out() {
        let mut scripted = ScriptedClient::new(
            Ok(TransferReference::new("0xlate")),
            Ok(ReceiptStatus::Succeeded),
        );
        scripted.submit_delay = Duration::from_secs(60);
        let client = Arc::new(scripted);

        let failure = executor(&client)
            .transfer(&destination(), TokenAmount::new(1))
            .await
            .unwrap_err();

        assert_eq!(failure.cause, TransferFailureCause::Timeout);
        assert!(failure.reference.is_none());
        assert_eq!(client.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_confirmation_times_out_with_reference() {
        let mut scripted = ScriptedClient::new(
            Ok(TransferReference::new("0xpending")),
            Ok(ReceiptStatus::Succeeded),
        );
        scripted.receipt_delay = Duration::from_secs(600);
        let client = Arc::new(scripted);

        let failure = executor(&client)
            .transfer(&destination(), TokenAmount::new(1))
            .await
            .unwrap_err();

        assert_eq!(failure.cause, TransferFailureCause::Timeout);
        assert_eq!(failure.reference, Some(TransferReference::new("0xpending")));
        assert_eq!(client.submissions.load(Ordering::SeqCst), 1);
    }
}
