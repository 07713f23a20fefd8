//! Storage-agnostic ledger interface.

use super::record::{ClaimState, LedgerStats, ParticipantRecord, ReservationRequest};
use super::storage::LedgerError;
use crate::types::TransferReference;

/// Durable store of participant records.
///
/// Implementations are the sole arbiter of the uniqueness and capacity
/// invariants. Every mutating method must be atomic at the storage layer so
/// that callers in other threads or other processes sharing the same store
/// observe a linearizable sequence of outcomes.
pub trait ClaimLedger: Send + Sync {
    /// Atomically admits a participant.
    ///
    /// Succeeds only if neither the participant nor the wallet already has a
    /// record and the record count is below capacity; otherwise fails with
    /// [`LedgerError::Rejected`]. The checks and the insert happen in one
    /// storage transaction.
    fn reserve(&self, request: &ReservationRequest) -> Result<ParticipantRecord, LedgerError>;

    /// Moves a `Reserved` record to `Settled`.
    ///
    /// Repeating the call with the same reference after success is a no-op
    /// success. A different reference on a settled record is
    /// [`LedgerError::SettlementConflict`].
    fn mark_settled(
        &self,
        participant_id: &str,
        reference: &TransferReference,
    ) -> Result<ParticipantRecord, LedgerError>;

    /// Moves a `Reserved` record to `Failed`, recording `cause`.
    ///
    /// Repeating the call on a failed record is a no-op success.
    fn mark_failed(
        &self,
        participant_id: &str,
        cause: &str,
    ) -> Result<ParticipantRecord, LedgerError>;

    /// Looks up a record by participant id.
    fn find_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Option<ParticipantRecord>, LedgerError>;

    /// All settled records, oldest reservation first.
    fn list_settled(&self) -> Result<Vec<ParticipantRecord>, LedgerError>;

    /// All records in `state`, oldest reservation first.
    fn list_in_state(&self, state: ClaimState) -> Result<Vec<ParticipantRecord>, LedgerError>;

    /// Record counts by state.
    fn stats(&self) -> Result<LedgerStats, LedgerError>;

    /// Configured participant cap.
    fn capacity(&self) -> u64;
}
