//! airdrop-core - claim admission and distribution engine for one-time
//! token airdrops
//!
//! A bounded set of participants, each identified by an external id and a
//! wallet address, may claim a fixed token amount exactly once. This crate
//! decides admission under concurrency, drives the on-chain transfer, and
//! records every attempt durably so nothing is paid twice or forgotten.
//!
//! # Runtime Requirements
//!
//! The async entry points ([`claim::ClaimCoordinator`] and
//! [`status::StatusReader`]) run inside a tokio runtime. Ledger calls are
//! dispatched to the blocking pool, so any runtime flavor works.
//!
//! # Modules
//!
//! - [`address`]: EIP-55 wallet address parsing and canonical form
//! - [`ledger`]: durable participant records with atomic reservation
//! - [`transfer`]: single-attempt token transfers over a chain client
//! - [`claim`]: end-to-end claim orchestration and reconciliation
//! - [`status`]: read-only status, winners, and counters
//! - [`config`]: TOML configuration for the daemon

pub mod address;
pub mod claim;
pub mod config;
pub mod ledger;
pub mod status;
pub mod transfer;
pub mod types;

pub use address::{AddressError, WalletAddress};
pub use types::{TokenAmount, TransferReference};
