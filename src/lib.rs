//! The Reconquest escrow core.
//!
//! This crate implements the cryptographic heart of a peer-to-peer
//! Bitcoin-collateralized loan platform: deterministic ephemeral key
//! derivation, 2-of-3 P2WSH escrow construction, the pre-signed transaction
//! ceremony and the machinery that drives a loan from posting to settlement.
//!
//! [`ceremony::Coordinator`] is the entry point for embedders. Everything it
//! needs from the outside world comes in through two traits:
//! [`chain::BlockchainAdapter`] (UTXO lookup, fees, broadcast) and
//! [`monitor::RateSource`] (BTC spot price). Both have deterministic
//! in-memory implementations so the whole lifecycle can run in tests.
//!
//! Private key material never rests: it is derived from the user's
//! passphrase on every signing event and zeroised when the scoped handle in
//! [`keys`] is released.

mod test_macros;

pub mod audit;
pub mod ceremony;
pub mod chain;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod escrow;
pub mod keys;
pub mod loan;
pub mod monitor;
pub mod notify;
pub mod outcome;
pub mod release;
pub mod store;
