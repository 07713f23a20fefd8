//! airdrop-daemon - HTTP front end for the airdrop claim engine
//!
//! The binary in `main.rs` loads configuration, opens the ledger, connects to
//! the chain endpoint, and serves the router built by [`http::router`].
//!
//! # Modules
//!
//! - [`http`]: axum routes for claims, participant status, winners, and
//!   counters, with structured JSON errors

pub mod http;

pub use http::{AppState, router};
