//! Read-only projections over the ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::address::WalletAddress;
use crate::ledger::{ClaimLedger, ClaimState, LedgerError, LedgerStats, run_blocking};
use crate::types::TransferReference;

/// Current state of one participant's claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantStatus {
    pub state: ClaimState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_reference: Option<TransferReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
}

/// One settled participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WinnerEntry {
    pub display_name: Option<String>,
    pub wallet_address: WalletAddress,
    pub join_date: DateTime<Utc>,
    pub transfer_reference: TransferReference,
}

/// All settled participants, oldest reservation first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WinnersList {
    pub total: usize,
    pub winners: Vec<WinnerEntry>,
}

/// Ledger counters alongside the configured cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DistributionStats {
    pub capacity: u64,
    pub remaining: u64,
    #[serde(flatten)]
    pub counts: LedgerStats,
}

/// Read-side handle on a shared ledger.
#[derive(Clone)]
pub struct StatusReader {
    ledger: Arc<dyn ClaimLedger>,
}

impl std::fmt::Debug for StatusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReader").finish_non_exhaustive()
    }
}

impl StatusReader {
    #[must_use]
    pub fn new(ledger: Arc<dyn ClaimLedger>) -> Self {
        Self { ledger }
    }

    /// Status of `participant_id`, or `None` if they never claimed.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger cannot be read.
    pub async fn status_of(
        &self,
        participant_id: &str,
    ) -> Result<Option<ParticipantStatus>, LedgerError> {
        let participant_id = participant_id.to_string();
        let record = run_blocking(&self.ledger, move |ledger| {
            ledger.find_by_participant(&participant_id)
        })
        .await?;

        Ok(record.map(|record| ParticipantStatus {
            state: record.state,
            transfer_reference: record.transfer_reference,
            failure_cause: record.failure_cause,
        }))
    }

    /// Settled participants in reservation order.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger cannot be read.
    pub async fn winners(&self) -> Result<WinnersList, LedgerError> {
        let settled = run_blocking(&self.ledger, |ledger| ledger.list_settled()).await?;

        let winners: Vec<WinnerEntry> = settled
            .into_iter()
            .filter_map(|record| {
                let join_date = record.created_at();
                Some(WinnerEntry {
                    transfer_reference: record.transfer_reference?,
                    display_name: record.display_name,
                    wallet_address: record.wallet_address,
                    join_date,
                })
            })
            .collect();

        Ok(WinnersList {
            total: winners.len(),
            winners,
        })
    }

    /// Record counts and remaining capacity.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger cannot be read.
    pub async fn stats(&self) -> Result<DistributionStats, LedgerError> {
        let counts = run_blocking(&self.ledger, |ledger| ledger.stats()).await?;
        let capacity = self.ledger.capacity();
        Ok(DistributionStats {
            capacity,
            remaining: capacity.saturating_sub(counts.total),
            counts,
        })
    }
}
