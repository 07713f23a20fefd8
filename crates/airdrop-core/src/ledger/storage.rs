//! `SQLite`-backed participant ledger.
//!
//! The database runs in WAL mode with a busy timeout so that several
//! processes can share one file. Every mutation runs inside a
//! `BEGIN IMMEDIATE` transaction, which takes the database write lock before
//! the first read; admission checks, the participant count, and the insert
//! therefore observe one consistent snapshot and no other writer can
//! interleave.

// SQLite returns i64 for row IDs, counts, and timestamps, but they're always
// non-negative.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::Type;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior, params,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::backend::ClaimLedger;
use super::record::{ClaimState, LedgerStats, ParticipantRecord, ReservationRequest};
use crate::address::WalletAddress;
use crate::types::TransferReference;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Default participant cap.
pub const DEFAULT_MAX_PARTICIPANTS: u64 = 1000;

/// Default time a writer waits for another connection's write lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

macro_rules! select_participants {
    ($tail:literal) => {
        concat!(
            "SELECT seq_id, participant_id, wallet_address, display_name, state, \
             transfer_reference, failure_cause, created_at_ns, finalized_at_ns \
             FROM participants ",
            $tail
        )
    };
}

/// Why an admission was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionRejection {
    /// The participant already has a record.
    #[error("participant has already claimed")]
    AlreadyClaimed,

    /// The wallet address is already bound to another record.
    #[error("wallet address is already in use")]
    AddressInUse,

    /// The participant cap has been reached.
    #[error("participant capacity reached")]
    CapacityReached,
}

impl AdmissionRejection {
    /// Stable machine-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyClaimed => "already_claimed",
            Self::AddressInUse => "address_in_use",
            Self::CapacityReached => "capacity_reached",
        }
    }
}

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Admission refused; no record was created.
    #[error("admission rejected: {0}")]
    Rejected(#[from] AdmissionRejection),

    /// No record exists for the participant.
    #[error("participant not found: {participant_id}")]
    NotFound {
        /// The participant that was looked up.
        participant_id: String,
    },

    /// The record is already in a terminal state that forbids the transition.
    #[error("participant {participant_id} is already final ({state})")]
    AlreadyFinal {
        /// The participant whose record is final.
        participant_id: String,
        /// The terminal state found.
        state: ClaimState,
    },

    /// A settled record was asked to settle with a different reference.
    #[error(
        "settlement conflict for {participant_id}: recorded {recorded}, attempted {attempted}"
    )]
    SettlementConflict {
        /// The participant whose record conflicts.
        participant_id: String,
        /// Reference already stored.
        recorded: TransferReference,
        /// Reference supplied by the caller.
        attempted: TransferReference,
    },

    /// The reference is already held by another record.
    #[error("transfer reference {reference} is already recorded")]
    DuplicateTransferReference {
        /// The duplicated reference.
        reference: TransferReference,
    },

    /// Connection mutex was poisoned by a panicking thread.
    #[error("ledger connection lock poisoned")]
    LockPoisoned,

    /// The ledger task could not be run to completion.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Returns the admission rejection, if this error is one.
    #[must_use]
    pub const fn rejection(&self) -> Option<AdmissionRejection> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Tunables for [`SqliteClaimLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerOptions {
    /// Maximum number of records, across all states.
    pub max_participants: u64,
    /// How long a writer waits on another connection's lock.
    pub busy_timeout: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl LedgerOptions {
    /// Options with the given cap and the default busy timeout.
    #[must_use]
    pub fn with_max_participants(max_participants: u64) -> Self {
        Self {
            max_participants,
            ..Self::default()
        }
    }
}

/// The participant ledger backed by `SQLite`.
#[derive(Debug)]
pub struct SqliteClaimLedger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    options: LedgerOptions,
}

impl SqliteClaimLedger {
    /// Opens or creates a ledger at the specified path.
    ///
    /// Several ledgers (in one or many processes) may open the same file;
    /// admission stays atomic across all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, options: LedgerOptions) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::initialize_connection(&conn, &options)?;
        info!(
            path = %path.display(),
            max_participants = options.max_participants,
            "Opened participant ledger"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            options,
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory(options: LedgerOptions) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn, &options)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            options,
        })
    }

    /// Path of the backing database file, `None` for in-memory ledgers.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize_connection(
        conn: &Connection,
        options: &LedgerOptions,
    ) -> Result<(), LedgerError> {
        // Must be set before anything that can contend for the write lock.
        conn.busy_timeout(options.busy_timeout)?;

        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
            warn!(journal_mode = %mode, "WAL mode unavailable for participant ledger");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    fn load_record(
        conn: &Connection,
        participant_id: &str,
    ) -> Result<Option<ParticipantRecord>, LedgerError> {
        let record = conn
            .query_row(
                select_participants!("WHERE participant_id = ?1"),
                params![participant_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn require_record(
        conn: &Connection,
        participant_id: &str,
    ) -> Result<ParticipantRecord, LedgerError> {
        Self::load_record(conn, participant_id)?.ok_or_else(|| LedgerError::NotFound {
            participant_id: participant_id.to_string(),
        })
    }
}

impl ClaimLedger for SqliteClaimLedger {
    fn reserve(&self, request: &ReservationRequest) -> Result<ParticipantRecord, LedgerError> {
        let wallet = request.wallet_address.to_checksum();
        let mut conn = self.lock()?;

        // Dropping `tx` without commit rolls back, so every early return
        // below releases the write lock with no changes.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (participant_taken, wallet_taken, count): (bool, bool, i64) = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM participants WHERE participant_id = ?1),
                    EXISTS(SELECT 1 FROM participants WHERE wallet_address = ?2),
                    (SELECT COUNT(*) FROM participants)",
            params![request.participant_id, wallet],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let rejection = if participant_taken {
            Some(AdmissionRejection::AlreadyClaimed)
        } else if wallet_taken {
            Some(AdmissionRejection::AddressInUse)
        } else if count as u64 >= self.options.max_participants {
            Some(AdmissionRejection::CapacityReached)
        } else {
            None
        };
        if let Some(reason) = rejection {
            debug!(
                participant_id = %request.participant_id,
                wallet_address = %wallet,
                reason = reason.as_str(),
                "Reservation rejected"
            );
            return Err(reason.into());
        }

        let created_at_ns = now_ns();
        tx.execute(
            "INSERT INTO participants (participant_id, wallet_address, display_name, state, created_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.participant_id,
                wallet,
                request.display_name,
                ClaimState::Reserved,
                created_at_ns,
            ],
        )
        .map_err(map_reserve_constraint)?;
        let seq_id = tx.last_insert_rowid() as u64;

        tx.commit()?;

        info!(
            participant_id = %request.participant_id,
            wallet_address = %wallet,
            seq_id,
            "Reserved participant slot"
        );

        Ok(ParticipantRecord {
            seq_id,
            participant_id: request.participant_id.clone(),
            wallet_address: request.wallet_address,
            display_name: request.display_name.clone(),
            state: ClaimState::Reserved,
            transfer_reference: None,
            failure_cause: None,
            created_at_ns,
            finalized_at_ns: None,
        })
    }

    fn mark_settled(
        &self,
        participant_id: &str,
        reference: &TransferReference,
    ) -> Result<ParticipantRecord, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::require_record(&tx, participant_id)?;
        match current.state {
            ClaimState::Reserved => {},
            ClaimState::Settled => {
                let recorded = current
                    .transfer_reference
                    .clone()
                    .unwrap_or_else(|| TransferReference::new(""));
                if &recorded == reference {
                    return Ok(current);
                }
                error!(
                    participant_id = %participant_id,
                    recorded = %recorded,
                    attempted = %reference,
                    "Settlement conflict on already-settled record"
                );
                return Err(LedgerError::SettlementConflict {
                    participant_id: participant_id.to_string(),
                    recorded,
                    attempted: reference.clone(),
                });
            },
            ClaimState::Failed => {
                return Err(LedgerError::AlreadyFinal {
                    participant_id: participant_id.to_string(),
                    state: current.state,
                });
            },
        }

        let finalized_at_ns = now_ns();
        tx.execute(
            "UPDATE participants
             SET state = ?1, transfer_reference = ?2, finalized_at_ns = ?3
             WHERE participant_id = ?4 AND state = ?5",
            params![
                ClaimState::Settled,
                reference.as_str(),
                finalized_at_ns,
                participant_id,
                ClaimState::Reserved,
            ],
        )
        .map_err(|e| {
            if is_constraint_on(&e, "transfer_reference") {
                LedgerError::DuplicateTransferReference {
                    reference: reference.clone(),
                }
            } else {
                LedgerError::Database(e)
            }
        })?;

        tx.commit()?;

        info!(
            participant_id = %participant_id,
            transfer_reference = %reference,
            "Participant settled"
        );

        Ok(ParticipantRecord {
            state: ClaimState::Settled,
            transfer_reference: Some(reference.clone()),
            finalized_at_ns: Some(finalized_at_ns),
            ..current
        })
    }

    fn mark_failed(
        &self,
        participant_id: &str,
        cause: &str,
    ) -> Result<ParticipantRecord, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::require_record(&tx, participant_id)?;
        match current.state {
            ClaimState::Reserved => {},
            ClaimState::Failed => return Ok(current),
            ClaimState::Settled => {
                return Err(LedgerError::AlreadyFinal {
                    participant_id: participant_id.to_string(),
                    state: current.state,
                });
            },
        }

        let finalized_at_ns = now_ns();
        tx.execute(
            "UPDATE participants
             SET state = ?1, failure_cause = ?2, finalized_at_ns = ?3
             WHERE participant_id = ?4 AND state = ?5",
            params![
                ClaimState::Failed,
                cause,
                finalized_at_ns,
                participant_id,
                ClaimState::Reserved,
            ],
        )?;

        tx.commit()?;

        warn!(participant_id = %participant_id, cause = %cause, "Participant marked failed");

        Ok(ParticipantRecord {
            state: ClaimState::Failed,
            failure_cause: Some(cause.to_string()),
            finalized_at_ns: Some(finalized_at_ns),
            ..current
        })
    }

    fn find_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Option<ParticipantRecord>, LedgerError> {
        let conn = self.lock()?;
        Self::load_record(&conn, participant_id)
    }

    fn list_settled(&self) -> Result<Vec<ParticipantRecord>, LedgerError> {
        self.list_in_state(ClaimState::Settled)
    }

    fn list_in_state(&self, state: ClaimState) -> Result<Vec<ParticipantRecord>, LedgerError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(select_participants!(
            "WHERE state = ?1 ORDER BY created_at_ns ASC, seq_id ASC"
        ))?;

        let records = stmt
            .query_map(params![state], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM participants GROUP BY state")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, ClaimState>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = LedgerStats::default();
        for (state, count) in counts {
            match state {
                ClaimState::Reserved => stats.reserved = count,
                ClaimState::Settled => stats.settled = count,
                ClaimState::Failed => stats.failed = count,
            }
            stats.total += count;
        }

        Ok(stats)
    }

    fn capacity(&self) -> u64 {
        self.options.max_participants
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let wallet_text: String = row.get(2)?;
    let wallet_address = WalletAddress::parse(&wallet_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(ParticipantRecord {
        seq_id: row.get::<_, i64>(0)? as u64,
        participant_id: row.get(1)?,
        wallet_address,
        display_name: row.get(3)?,
        state: row.get(4)?,
        transfer_reference: row.get::<_, Option<String>>(5)?.map(TransferReference::from),
        failure_cause: row.get(6)?,
        created_at_ns: row.get::<_, i64>(7)? as u64,
        finalized_at_ns: row.get::<_, Option<i64>>(8)?.map(|ns| ns as u64),
    })
}

/// Backstop for the UNIQUE constraints; the transaction's own checks should
/// make these unreachable.
fn map_reserve_constraint(err: rusqlite::Error) -> LedgerError {
    if is_constraint_on(&err, "participant_id") {
        AdmissionRejection::AlreadyClaimed.into()
    } else if is_constraint_on(&err, "wallet_address") {
        AdmissionRejection::AddressInUse.into()
    } else {
        LedgerError::Database(err)
    }
}

fn is_constraint_on(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, Some(message)) => {
            inner.code == ErrorCode::ConstraintViolation
                && message.contains(&format!("participants.{column}"))
        },
        _ => false,
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
