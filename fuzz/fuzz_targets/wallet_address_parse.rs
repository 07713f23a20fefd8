//! Fuzz harness for `WalletAddress::parse`.
//!
//! Any accepted input must round-trip through its checksummed form to the
//! same address, and the checksummed form must itself be accepted.

#![no_main]
use airdrop_core::WalletAddress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(address) = WalletAddress::parse(text) {
        let canonical = address.to_checksum();
        let reparsed = WalletAddress::parse(&canonical).expect("checksummed form must parse");
        assert_eq!(reparsed, address);
        assert_eq!(
            WalletAddress::parse(&canonical.to_lowercase()).expect("lowercase form must parse"),
            address
        );
    }
});
