//! Participant records and their claim states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::address::WalletAddress;
use crate::types::TransferReference;

/// Lifecycle state of a participant's claim.
///
/// `Reserved` is entered only by an atomic reservation. `Settled` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Reserved,
    Settled,
    Failed,
}

impl ClaimState {
    /// Stable storage and wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "settled" => Ok(Self::Settled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown claim state: {other}")),
        }
    }
}

impl ToSql for ClaimState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ClaimState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Input to [`ClaimLedger::reserve`](super::ClaimLedger::reserve).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    /// Opaque external account id.
    pub participant_id: String,
    /// Validated destination address.
    pub wallet_address: WalletAddress,
    /// Optional human-facing name shown in the winners listing.
    pub display_name: Option<String>,
}

impl ReservationRequest {
    #[must_use]
    pub fn new(participant_id: impl Into<String>, wallet_address: WalletAddress) -> Self {
        Self {
            participant_id: participant_id.into(),
            wallet_address,
            display_name: None,
        }
    }

    /// Sets the display name (builder pattern).
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// A durable participant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRecord {
    /// Insertion sequence, used to break ties between equal timestamps.
    pub seq_id: u64,
    pub participant_id: String,
    pub wallet_address: WalletAddress,
    pub display_name: Option<String>,
    pub state: ClaimState,
    /// Present exactly when `state` is [`ClaimState::Settled`].
    pub transfer_reference: Option<TransferReference>,
    /// Transfer failure cause recorded with [`ClaimState::Failed`].
    pub failure_cause: Option<String>,
    /// Reservation time in nanoseconds since the Unix epoch.
    pub created_at_ns: u64,
    /// Time of the terminal transition, if any.
    pub finalized_at_ns: Option<u64>,
}

impl ParticipantRecord {
    /// Reservation time as a UTC timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        timestamp_from_ns(self.created_at_ns)
    }
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn timestamp_from_ns(ns: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns as i64)
}

/// Record counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: u64,
    pub reserved: u64,
    pub settled: u64,
    pub failed: u64,
}
