//! Tests for the participant ledger.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use tempfile::TempDir;

use super::*;
use crate::address::WalletAddress;
use crate::types::TransferReference;

fn wallet(n: u8) -> WalletAddress {
    let mut bytes = [0x11u8; 20];
    bytes[19] = n;
    WalletAddress::from_bytes(bytes)
}

fn request(participant: &str, n: u8) -> ReservationRequest {
    ReservationRequest::new(participant, wallet(n))
}

fn memory_ledger(max_participants: u64) -> SqliteClaimLedger {
    SqliteClaimLedger::in_memory(LedgerOptions::with_max_participants(max_participants))
        .expect("failed to create in-memory ledger")
}

/// Helper to create a file-backed ledger in a temp dir.
fn temp_ledger(max_participants: u64) -> (SqliteClaimLedger, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("participants.db");
    let ledger = SqliteClaimLedger::open(&path, LedgerOptions::with_max_participants(max_participants))
        .expect("failed to open ledger");
    (ledger, dir)
}

fn reference(text: &str) -> TransferReference {
    TransferReference::new(text)
}

// =============================================================================
// Reservation
// =============================================================================

#[test]
fn test_reserve_settle_and_read_back() {
    let ledger = memory_ledger(10);

    let reserved = ledger.reserve(&request("u1", 0xAA)).unwrap();
    assert_eq!(reserved.state, ClaimState::Reserved);
    assert!(reserved.transfer_reference.is_none());

    let settled = ledger.mark_settled("u1", &reference("tx1")).unwrap();
    assert_eq!(settled.state, ClaimState::Settled);

    let found = ledger.find_by_participant("u1").unwrap().expect("record exists");
    assert_eq!(found.state, ClaimState::Settled);
    assert_eq!(found.transfer_reference, Some(reference("tx1")));
    assert_eq!(found.wallet_address, wallet(0xAA));
    assert!(found.finalized_at_ns.is_some());
}

#[test]
fn test_same_wallet_different_participant_is_address_in_use() {
    let ledger = memory_ledger(10);

    ledger.reserve(&request("u1", 0xAA)).unwrap();
    let err = ledger.reserve(&request("u2", 0xAA)).unwrap_err();

    assert_eq!(err.rejection(), Some(AdmissionRejection::AddressInUse));
    assert!(ledger.find_by_participant("u2").unwrap().is_none());
}

#[test]
fn test_same_participant_different_wallet_is_already_claimed() {
    let ledger = memory_ledger(10);

    ledger.reserve(&request("u1", 0xAA)).unwrap();
    let err = ledger.reserve(&request("u1", 0xBB)).unwrap_err();

    assert_eq!(err.rejection(), Some(AdmissionRejection::AlreadyClaimed));
    assert_eq!(ledger.stats().unwrap().total, 1);
}

#[test]
fn test_participant_conflict_takes_precedence_over_wallet_conflict() {
    let ledger = memory_ledger(10);

    ledger.reserve(&request("u1", 0xAA)).unwrap();
    ledger.reserve(&request("u2", 0xBB)).unwrap();
    let err = ledger.reserve(&request("u1", 0xBB)).unwrap_err();

    assert_eq!(err.rejection(), Some(AdmissionRejection::AlreadyClaimed));
}

#[test]
fn test_capacity_reached() {
    let ledger = memory_ledger(1);

    ledger.reserve(&request("u1", 0xAA)).unwrap();
    let err = ledger.reserve(&request("u2", 0xBB)).unwrap_err();

    assert_eq!(err.rejection(), Some(AdmissionRejection::CapacityReached));
    assert_eq!(ledger.capacity(), 1);
}

#[test]
fn test_failed_records_still_consume_capacity_and_identity() {
    let ledger = memory_ledger(2);

    ledger.reserve(&request("u1", 0xAA)).unwrap();
    ledger.mark_failed("u1", "timeout").unwrap();

    let again = ledger.reserve(&request("u1", 0xCC)).unwrap_err();
    assert_eq!(again.rejection(), Some(AdmissionRejection::AlreadyClaimed));

    let same_wallet = ledger.reserve(&request("u9", 0xAA)).unwrap_err();
    assert_eq!(same_wallet.rejection(), Some(AdmissionRejection::AddressInUse));

    ledger.reserve(&request("u2", 0xBB)).unwrap();
    let full = ledger.reserve(&request("u3", 0xDD)).unwrap_err();
    assert_eq!(full.rejection(), Some(AdmissionRejection::CapacityReached));
}

#[test]
fn test_wallet_uniqueness_ignores_letter_case() {
    let ledger = memory_ledger(10);
    let checksummed = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    let first = WalletAddress::parse(checksummed).unwrap();
    let second = WalletAddress::parse(&checksummed.to_ascii_lowercase()).unwrap();

    ledger.reserve(&ReservationRequest::new("u1", first)).unwrap();
    let err = ledger.reserve(&ReservationRequest::new("u2", second)).unwrap_err();

    assert_eq!(err.rejection(), Some(AdmissionRejection::AddressInUse));
}

#[test]
fn test_display_name_round_trips() {
    let ledger = memory_ledger(10);

    ledger
        .reserve(&request("u1", 1).with_display_name("alice"))
        .unwrap();
    ledger.reserve(&request("u2", 2)).unwrap();

    assert_eq!(
        ledger.find_by_participant("u1").unwrap().unwrap().display_name.as_deref(),
        Some("alice")
    );
    assert!(ledger.find_by_participant("u2").unwrap().unwrap().display_name.is_none());
}

// =============================================================================
// Settlement and failure transitions
// =============================================================================

#[test]
fn test_mark_settled_is_idempotent_for_same_reference() {
    let ledger = memory_ledger(10);
    ledger.reserve(&request("u1", 0xAA)).unwrap();

    let first = ledger.mark_settled("u1", &reference("tx1")).unwrap();
    let second = ledger.mark_settled("u1", &reference("tx1")).unwrap();

    assert_eq!(first, second);
    assert_eq!(
        ledger.find_by_participant("u1").unwrap().unwrap(),
        first
    );
}

#[test]
fn test_mark_settled_with_different_reference_conflicts() {
    let ledger = memory_ledger(10);
    ledger.reserve(&request("u1", 0xAA)).unwrap();
    ledger.mark_settled("u1", &reference("tx1")).unwrap();

    let err = ledger.mark_settled("u1", &reference("tx2")).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::SettlementConflict { ref recorded, ref attempted, .. }
            if recorded.as_str() == "tx1" && attempted.as_str() == "tx2"
    ));

    let record = ledger.find_by_participant("u1").unwrap().unwrap();
    assert_eq!(record.transfer_reference, Some(reference("tx1")));
}

#[test]
fn test_transfer_reference_is_unique_across_records() {
    let ledger = memory_ledger(10);
    ledger.reserve(&request("u1", 1)).unwrap();
    ledger.reserve(&request("u2", 2)).unwrap();
    ledger.mark_settled("u1", &reference("tx1")).unwrap();

    let err = ledger.mark_settled("u2", &reference("tx1")).unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateTransferReference { .. }));

    let record = ledger.find_by_participant("u2").unwrap().unwrap();
    assert_eq!(record.state, ClaimState::Reserved);
}

#[test]
fn test_terminal_states_are_final() {
    let ledger = memory_ledger(10);
    ledger.reserve(&request("settled", 1)).unwrap();
    ledger.reserve(&request("failed", 2)).unwrap();
    ledger.mark_settled("settled", &reference("tx1")).unwrap();
    ledger.mark_failed("failed", "insufficient_funds").unwrap();

    let err = ledger.mark_failed("settled", "timeout").unwrap_err();
    assert!(matches!(
        err,
        LedgerError::AlreadyFinal { state: ClaimState::Settled, .. }
    ));

    let err = ledger.mark_settled("failed", &reference("tx2")).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::AlreadyFinal { state: ClaimState::Failed, .. }
    ));
}

#[test]
fn test_mark_failed_twice_keeps_first_cause() {
    let ledger = memory_ledger(10);
    ledger.reserve(&request("u1", 1)).unwrap();

    ledger.mark_failed("u1", "timeout").unwrap();
    let again = ledger.mark_failed("u1", "network_unavailable").unwrap();

    assert_eq!(again.state, ClaimState::Failed);
    assert_eq!(again.failure_cause.as_deref(), Some("timeout"));
}

#[test]
fn test_transitions_on_unknown_participant_are_not_found() {
    let ledger = memory_ledger(10);

    assert!(matches!(
        ledger.mark_settled("ghost", &reference("tx1")),
        Err(LedgerError::NotFound { .. })
    ));
    assert!(matches!(
        ledger.mark_failed("ghost", "timeout"),
        Err(LedgerError::NotFound { .. })
    ));
    assert!(ledger.find_by_participant("ghost").unwrap().is_none());
}

// =============================================================================
// Queries
// =============================================================================

#[test]
fn test_list_settled_is_ordered_and_restartable() {
    let ledger = memory_ledger(10);
    for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
        ledger.reserve(&request(id, u8::try_from(i).unwrap())).unwrap();
    }
    ledger.mark_settled("c", &reference("tx-c")).unwrap();
    ledger.mark_settled("a", &reference("tx-a")).unwrap();
    ledger.mark_failed("b", "timeout").unwrap();

    let first = ledger.list_settled().unwrap();
    let ids: Vec<&str> = first.iter().map(|r| r.participant_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);

    let second = ledger.list_settled().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_list_in_state_and_stats() {
    let ledger = memory_ledger(10);
    ledger.reserve(&request("a", 1)).unwrap();
    ledger.reserve(&request("b", 2)).unwrap();
    ledger.reserve(&request("c", 3)).unwrap();
    ledger.mark_settled("a", &reference("tx-a")).unwrap();
    ledger.mark_failed("b", "reverted").unwrap();

    let pending = ledger.list_in_state(ClaimState::Reserved).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].participant_id, "c");

    let stats = ledger.stats().unwrap();
    assert_eq!(
        stats,
        LedgerStats {
            total: 3,
            reserved: 1,
            settled: 1,
            failed: 1,
        }
    );
}

#[test]
fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("participants.db");

    {
        let ledger = SqliteClaimLedger::open(&path, LedgerOptions::default()).unwrap();
        ledger.reserve(&request("u1", 1)).unwrap();
        ledger.mark_settled("u1", &reference("tx1")).unwrap();
    }

    let reopened = SqliteClaimLedger::open(&path, LedgerOptions::default()).unwrap();
    let record = reopened.find_by_participant("u1").unwrap().unwrap();
    assert_eq!(record.state, ClaimState::Settled);
    assert_eq!(reopened.path(), Some(path.as_path()));

    let err = reopened.reserve(&request("u1", 2)).unwrap_err();
    assert_eq!(err.rejection(), Some(AdmissionRejection::AlreadyClaimed));
}

// =============================================================================
// Concurrency: independent connections share one database file, standing in
// for separate processes.
// =============================================================================

fn open_connections(path: &std::path::Path, count: usize, max: u64) -> Vec<SqliteClaimLedger> {
    (0..count)
        .map(|_| {
            SqliteClaimLedger::open(path, LedgerOptions::with_max_participants(max))
                .expect("failed to open ledger connection")
        })
        .collect()
}

#[test]
fn test_concurrent_same_wallet_admits_exactly_one() {
    let (_primary, dir) = temp_ledger(100);
    let path = dir.path().join("participants.db");
    let ledgers = open_connections(&path, 12, 100);
    let barrier = Arc::new(Barrier::new(ledgers.len()));

    let handles: Vec<_> = ledgers
        .into_iter()
        .enumerate()
        .map(|(i, ledger)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ledger.reserve(&request(&format!("user-{i}"), 0xAA))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        let err = result.as_ref().unwrap_err();
        assert_eq!(err.rejection(), Some(AdmissionRejection::AddressInUse));
    }
}

#[test]
fn test_concurrent_same_participant_admits_exactly_one() {
    let (_primary, dir) = temp_ledger(100);
    let path = dir.path().join("participants.db");
    let ledgers = open_connections(&path, 12, 100);
    let barrier = Arc::new(Barrier::new(ledgers.len()));

    let handles: Vec<_> = ledgers
        .into_iter()
        .enumerate()
        .map(|(i, ledger)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ledger.reserve(&request("same-user", u8::try_from(i).unwrap()))
            })
        })
        .collect();

    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Result::is_ok)
        .count();
    assert_eq!(admitted, 1);
}

#[test]
fn test_concurrent_reservations_never_exceed_capacity() {
    let (primary, dir) = temp_ledger(5);
    let path = dir.path().join("participants.db");
    let ledgers = open_connections(&path, 20, 5);
    let barrier = Arc::new(Barrier::new(ledgers.len()));

    let handles: Vec<_> = ledgers
        .into_iter()
        .enumerate()
        .map(|(i, ledger)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ledger.reserve(&request(&format!("user-{i}"), u8::try_from(i).unwrap()))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 5);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.rejection() == Some(AdmissionRejection::CapacityReached))
    );
    assert_eq!(primary.stats().unwrap().total, 5);
}

// =============================================================================
// Property: the ledger agrees with a simple model for any reservation sequence
// =============================================================================

fn model_outcome(
    by_participant: &HashMap<u8, u8>,
    wallets: &HashSet<u8>,
    max: usize,
    participant: u8,
    wallet_n: u8,
) -> Option<AdmissionRejection> {
    if by_participant.contains_key(&participant) {
        Some(AdmissionRejection::AlreadyClaimed)
    } else if wallets.contains(&wallet_n) {
        Some(AdmissionRejection::AddressInUse)
    } else if by_participant.len() >= max {
        Some(AdmissionRejection::CapacityReached)
    } else {
        None
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_reservations_match_model(
        max in 1usize..6,
        ops in prop::collection::vec((0u8..8, 0u8..8), 0..40),
    ) {
        let ledger = memory_ledger(max as u64);
        let mut by_participant: HashMap<u8, u8> = HashMap::new();
        let mut wallets: HashSet<u8> = HashSet::new();

        for (participant, wallet_n) in ops {
            let expected = model_outcome(&by_participant, &wallets, max, participant, wallet_n);
            let actual = ledger.reserve(&request(&format!("p{participant}"), wallet_n));

            match expected {
                None => {
                    prop_assert!(actual.is_ok());
                    by_participant.insert(participant, wallet_n);
                    wallets.insert(wallet_n);
                },
                Some(reason) => {
                    prop_assert_eq!(actual.unwrap_err().rejection(), Some(reason));
                },
            }
        }

        let stats = ledger.stats().unwrap();
        prop_assert_eq!(stats.total as usize, by_participant.len());
        prop_assert!(stats.total as usize <= max);
        for (participant, wallet_n) in &by_participant {
            let record = ledger.find_by_participant(&format!("p{participant}")).unwrap().unwrap();
            prop_assert_eq!(record.wallet_address, wallet(*wallet_n));
        }
    }
}
