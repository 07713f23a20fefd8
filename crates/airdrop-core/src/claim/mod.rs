//! Claim orchestration.
//!
//! [`ClaimCoordinator::submit_claim`] drives one claim from raw input to a
//! terminal ledger state:
//!
//! 1. validate the participant id and wallet address (no state on failure);
//! 2. atomically reserve a slot in the ledger;
//! 3. run exactly one transfer;
//! 4. record the outcome as `Settled` or `Failed`.
//!
//! A reservation is never released. A participant whose transfer failed
//! keeps their slot and is refused on any later claim.
//!
//! Steps 3 and 4 run on a spawned task. Dropping the future returned by
//! `submit_claim` after the reservation does not cancel the transfer or its
//! reconciliation.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::address::{AddressError, WalletAddress};
use crate::ledger::{
    AdmissionRejection, ClaimLedger, LedgerError, ReservationRequest, run_blocking,
};
use crate::transfer::{TransferExecutor, TransferFailure, TransferFailureCause};
use crate::types::{TokenAmount, TransferReference};

/// Longest accepted participant id, in bytes.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Longest stored display name, in characters. Longer names are truncated.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// An inbound claim, as received from a calling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub participant_id: String,
    /// Unvalidated address text.
    pub wallet_address: String,
    pub display_name: Option<String>,
}

impl ClaimRequest {
    #[must_use]
    pub fn new(participant_id: impl Into<String>, wallet_address: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            wallet_address: wallet_address.into(),
            display_name: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// A claim whose transfer was confirmed and recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettledClaim {
    pub participant_id: String,
    pub wallet_address: WalletAddress,
    pub transfer_reference: TransferReference,
}

/// The transfer outcome that could not be written back to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    Settled(TransferReference),
    Failed(TransferFailureCause),
}

impl fmt::Display for ReconciliationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settled(reference) => write!(f, "settled as {reference}"),
            Self::Failed(cause) => write!(f, "failed ({cause})"),
        }
    }
}

/// Why a claim did not settle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClaimError {
    /// The wallet address is malformed. No state was created.
    #[error("invalid wallet address: {0}")]
    InvalidAddress(#[source] AddressError),

    /// The participant id is empty or too long. No state was created.
    #[error("invalid participant id: {reason}")]
    InvalidParticipantId {
        /// What is wrong with the id.
        reason: &'static str,
    },

    /// Admission was refused. No state was created.
    #[error("claim rejected: {0}")]
    Rejected(AdmissionRejection),

    /// The transfer failed and the record is now `Failed`.
    #[error("claim processing failed: {0}")]
    ProcessingFailed(#[source] TransferFailure),

    /// The transfer outcome is known but could not be recorded. The ledger
    /// still shows the record as `Reserved`.
    #[error(
        "reconciliation failed for participant {participant_id}: transfer {outcome}, ledger error: {source}"
    )]
    ReconciliationFailed {
        participant_id: String,
        outcome: ReconciliationOutcome,
        source: LedgerError,
    },

    /// The transfer task was torn down before reporting an outcome, which
    /// only happens while the runtime shuts down.
    #[error("claim for participant {participant_id} was interrupted")]
    Interrupted { participant_id: String },

    /// The ledger could not be reached during admission. No state was
    /// created; the caller may retry.
    #[error("ledger unavailable: {0}")]
    Unavailable(#[source] LedgerError),
}

impl ClaimError {
    /// Stable machine-readable kind for calling layers to branch on.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "invalid_address",
            Self::InvalidParticipantId { .. } => "invalid_participant_id",
            Self::Rejected(reason) => reason.as_str(),
            Self::ProcessingFailed(_) => "processing_failed",
            Self::ReconciliationFailed { .. } => "reconciliation_failed",
            Self::Interrupted { .. } => "interrupted",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Orchestrates claims against a shared ledger and transfer executor.
#[derive(Clone)]
pub struct ClaimCoordinator {
    ledger: Arc<dyn ClaimLedger>,
    executor: Arc<TransferExecutor>,
    amount: TokenAmount,
}

impl fmt::Debug for ClaimCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimCoordinator")
            .field("executor", &self.executor)
            .field("amount", &self.amount)
            .finish_non_exhaustive()
    }
}

impl ClaimCoordinator {
    /// Creates a coordinator that sends `amount` to every admitted
    /// participant.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn ClaimLedger>,
        executor: Arc<TransferExecutor>,
        amount: TokenAmount,
    ) -> Self {
        Self {
            ledger,
            executor,
            amount,
        }
    }

    /// The per-participant amount.
    #[must_use]
    pub const fn amount(&self) -> TokenAmount {
        self.amount
    }

    /// Runs one claim to a terminal outcome.
    ///
    /// # Errors
    ///
    /// See [`ClaimError`]. Only `ProcessingFailed`, `ReconciliationFailed`
    /// and `Interrupted` are returned after a reservation was made.
    pub async fn submit_claim(&self, request: ClaimRequest) -> Result<SettledClaim, ClaimError> {
        validate_participant_id(&request.participant_id)?;
        let wallet =
            WalletAddress::parse(&request.wallet_address).map_err(ClaimError::InvalidAddress)?;

        let mut reservation = ReservationRequest::new(request.participant_id, wallet);
        if let Some(name) = request.display_name.as_deref().and_then(normalize_display_name) {
            reservation = reservation.with_display_name(name);
        }

        let record = run_blocking(&self.ledger, move |ledger| ledger.reserve(&reservation))
            .await
            .map_err(|err| match err.rejection() {
                Some(reason) => ClaimError::Rejected(reason),
                None => ClaimError::Unavailable(err),
            })?;

        let participant_id = record.participant_id;
        let task = tokio::spawn(transfer_and_reconcile(
            Arc::clone(&self.ledger),
            Arc::clone(&self.executor),
            self.amount,
            participant_id.clone(),
            wallet,
        ));

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => {
                error!(
                    participant_id = %participant_id,
                    "Claim task cancelled before its outcome was recorded; record left reserved"
                );
                Err(ClaimError::Interrupted { participant_id })
            },
        }
    }
}

async fn transfer_and_reconcile(
    ledger: Arc<dyn ClaimLedger>,
    executor: Arc<TransferExecutor>,
    amount: TokenAmount,
    participant_id: String,
    wallet: WalletAddress,
) -> Result<SettledClaim, ClaimError> {
    match executor.transfer(&wallet, amount).await {
        Ok(receipt) => {
            let reference = receipt.reference;
            let (id, settled_ref) = (participant_id.clone(), reference.clone());
            let recorded =
                run_blocking(&ledger, move |ledger| ledger.mark_settled(&id, &settled_ref)).await;
            match recorded {
                Ok(_) => {
                    info!(
                        participant_id = %participant_id,
                        wallet_address = %wallet,
                        transfer_reference = %reference,
                        "Claim settled"
                    );
                    Ok(SettledClaim {
                        participant_id,
                        wallet_address: wallet,
                        transfer_reference: reference,
                    })
                },
                Err(source) => Err(reconciliation_failed(
                    participant_id,
                    ReconciliationOutcome::Settled(reference),
                    source,
                )),
            }
        },
        Err(failure) => {
            let cause = failure.cause;
            let id = participant_id.clone();
            let recorded =
                run_blocking(&ledger, move |ledger| ledger.mark_failed(&id, cause.as_str())).await;
            match recorded {
                Ok(_) => {
                    if let Some(reference) = &failure.reference {
                        error!(
                            participant_id = %participant_id,
                            transfer_reference = %reference,
                            cause = %cause,
                            "Claim marked failed after submission; verify on chain before any manual resend"
                        );
                    } else {
                        warn!(
                            participant_id = %participant_id,
                            cause = %cause,
                            "Claim failed"
                        );
                    }
                    Err(ClaimError::ProcessingFailed(failure))
                },
                Err(source) => Err(reconciliation_failed(
                    participant_id,
                    ReconciliationOutcome::Failed(cause),
                    source,
                )),
            }
        },
    }
}

fn reconciliation_failed(
    participant_id: String,
    outcome: ReconciliationOutcome,
    source: LedgerError,
) -> ClaimError {
    error!(
        participant_id = %participant_id,
        outcome = %outcome,
        error = %source,
        "RECONCILIATION FAILED: transfer outcome not recorded, manual reconciliation required"
    );
    ClaimError::ReconciliationFailed {
        participant_id,
        outcome,
        source,
    }
}

fn validate_participant_id(participant_id: &str) -> Result<(), ClaimError> {
    if participant_id.trim().is_empty() {
        return Err(ClaimError::InvalidParticipantId {
            reason: "participant id is empty",
        });
    }
    if participant_id.len() > MAX_PARTICIPANT_ID_LEN {
        return Err(ClaimError::InvalidParticipantId {
            reason: "participant id exceeds 128 bytes",
        });
    }
    Ok(())
}

fn normalize_display_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect())
}
