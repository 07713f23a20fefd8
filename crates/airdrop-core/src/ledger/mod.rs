//! Participant ledger.
//!
//! The ledger is the durable record of every admitted participant and the
//! only component allowed to decide admission. It enforces, under arbitrary
//! concurrency:
//!
//! - at most one record per participant id;
//! - at most one record per wallet address;
//! - at most `max_participants` records in total;
//! - no transfer reference recorded twice.
//!
//! # Example
//!
//! ```rust,no_run
//! use airdrop_core::address::WalletAddress;
//! use airdrop_core::ledger::{ClaimLedger, LedgerOptions, ReservationRequest, SqliteClaimLedger};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = SqliteClaimLedger::open("/var/lib/airdrop/ledger.db", LedgerOptions::default())?;
//!
//! let wallet = WalletAddress::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed")?;
//! let record = ledger.reserve(&ReservationRequest::new("user-1", wallet))?;
//! assert!(record.transfer_reference.is_none());
//! # Ok(())
//! # }
//! ```

mod backend;
mod record;
mod storage;

#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use backend::ClaimLedger;
pub use record::{ClaimState, LedgerStats, ParticipantRecord, ReservationRequest};
pub use storage::{
    AdmissionRejection, DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_PARTICIPANTS, LedgerError,
    LedgerOptions, SqliteClaimLedger,
};

/// Runs a ledger operation on the blocking thread pool.
///
/// Storage calls may wait on another connection's write lock, so they never
/// run on an async worker.
pub(crate) async fn run_blocking<T, F>(
    ledger: &Arc<dyn ClaimLedger>,
    op: F,
) -> Result<T, LedgerError>
where
    F: FnOnce(&dyn ClaimLedger) -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    let ledger = Arc::clone(ledger);
    tokio::task::spawn_blocking(move || op(ledger.as_ref()))
        .await
        .map_err(|err| LedgerError::Unavailable(format!("ledger task did not complete: {err}")))?
}
