//! Abstraction over the Bitcoin chain.
//!
//! The core never talks to a node directly; everything goes through
//! [`BlockchainAdapter`]. Two backends ship with the crate: a Bitcoin Core
//! JSON-RPC client ([`rpc::CoreRpcChain`]) and a deterministic in-memory
//! chain ([`mock::MockChain`]) that the test suite and the demo CLI run
//! against.

pub mod mock;
pub mod rpc;

use core::fmt;
use bitcoin::{Address, Amount, Transaction, Txid};

use crate::config::Network;
use crate::error::{Classify, ErrorKind};

/// An unspent output on the escrow address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
    pub confirmations: u32,
}

/// Confirmation state of a transaction the adapter knows about.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TxStatus {
    pub confirmations: u32,
    pub block_height: Option<u32>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FeePriority {
    Fast,
    Normal,
    Slow,
    Economy,
}

impl FeePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            FeePriority::Fast => "fast",
            FeePriority::Normal => "normal",
            FeePriority::Slow => "slow",
            FeePriority::Economy => "economy",
        }
    }
}

/// Fee rates used when the upstream estimator is unreachable, in sat/vbyte.
pub fn fallback_fee_rate(network: Network, priority: FeePriority) -> u64 {
    match (network, priority) {
        (Network::Testnet, FeePriority::Economy) => 1,
        (Network::Testnet, FeePriority::Slow) => 1,
        (Network::Testnet, FeePriority::Normal) => 2,
        (Network::Testnet, FeePriority::Fast) => 5,
        (Network::Mainnet, FeePriority::Economy) => 2,
        (Network::Mainnet, FeePriority::Slow) => 3,
        (Network::Mainnet, FeePriority::Normal) => 5,
        (Network::Mainnet, FeePriority::Fast) => 10,
    }
}

/// The chain operations the core needs.
///
/// The public surface is blocking and called from one thread at a time per
/// loan; implementations may be concurrent internally but must deliver
/// results in call order.
pub trait BlockchainAdapter: Send + Sync {
    /// Unspent outputs currently sitting on `address`.
    fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError>;

    /// Current fee rate for the priority, in sat/vbyte. Implementations fall
    /// back to [`fallback_fee_rate`] when the estimator fails, so this does
    /// not error.
    fn fee_rate(&self, priority: FeePriority) -> u64;

    /// Relay floor below which transactions are not accepted.
    fn min_fee_rate(&self) -> u64;

    /// Submits a raw transaction. Re-broadcasting an already-known
    /// transaction returns its txid as success.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// Confirmation state of `txid`, or [`ChainError::NotFound`].
    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError>;

    /// Height of the current chain tip.
    fn tip_height(&self) -> Result<u32, ChainError>;
}

#[derive(Debug)]
pub enum ChainError {
    /// The transaction conflicts with one already in the mempool or chain.
    MempoolConflict,
    FeeTooLow,
    /// Consensus or policy rejection with the node's reason.
    Rejected(String),
    /// The backend could not be reached.
    Network(String),
    /// The deadline for the call expired; the operation's effect is unknown
    /// and callers must reconcile via [`BlockchainAdapter::tx_status`].
    Timeout,
    NotFound,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::MempoolConflict => write!(f, "conflicts with an existing spend"),
            ChainError::FeeTooLow => write!(f, "fee below relay minimum"),
            ChainError::Rejected(reason) => write!(f, "rejected by node: {}", reason),
            ChainError::Network(reason) => write!(f, "chain backend unreachable: {}", reason),
            ChainError::Timeout => write!(f, "chain call deadline expired"),
            ChainError::NotFound => write!(f, "transaction not found"),
        }
    }
}

impl Classify for ChainError {
    fn kind(&self) -> ErrorKind {
        match self {
            ChainError::MempoolConflict => ErrorKind::Conflict,
            ChainError::FeeTooLow
            | ChainError::Rejected(_)
            | ChainError::Network(_)
            | ChainError::Timeout
            | ChainError::NotFound => ErrorKind::External,
        }
    }
}
