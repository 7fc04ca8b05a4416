//! Runtime configuration of the escrow core.

use core::time::Duration;

/// The chains the platform operates on.
///
/// Selects the bech32 HRP of escrow addresses and the fee fallback table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }

    /// Human readable part of bech32 addresses on this network.
    pub fn hrp(self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
        }
    }
}

/// LTV thresholds in basis points. The highest one is the liquidation
/// threshold; the lower two only warn.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LtvThresholds {
    pub warn1_bps: u32,
    pub warn2_bps: u32,
    pub liquidate_bps: u32,
}

impl Default for LtvThresholds {
    fn default() -> Self {
        LtvThresholds { warn1_bps: 7_500, warn2_bps: 8_500, liquidate_bps: 9_500 }
    }
}

/// Broadcast retry policy: exponential back-off with jitter.
#[derive(Debug, Copy, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    /// Fraction of the delay randomised both ways, 0.0..1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(60),
            multiplier: 3,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub ltv_thresholds: LtvThresholds,
    /// Confirmations the funding transaction needs before the ceremony
    /// proceeds to signing.
    pub confirmations_required: u32,
    /// Days added to the loan term when computing the recovery timelock.
    pub grace_period_days: u32,
    /// PBKDF2 iteration count. Must never be configured below
    /// [`crate::keys::MIN_PBKDF2_ITERATIONS`].
    pub pbkdf2_iterations: u32,
    pub broadcast_retry: RetryPolicy,
    /// Poll interval of the LTV monitor.
    pub monitor_interval: Duration,
    /// Deadlines for external I/O.
    pub rate_deadline: Duration,
    pub utxo_deadline: Duration,
    pub broadcast_deadline: Duration,
}

impl Config {
    pub fn testnet() -> Self {
        Config::with_network(Network::Testnet)
    }

    pub fn mainnet() -> Self {
        Config::with_network(Network::Mainnet)
    }

    fn with_network(network: Network) -> Self {
        Config {
            network,
            ltv_thresholds: Default::default(),
            confirmations_required: 3,
            grace_period_days: 14,
            pbkdf2_iterations: crate::keys::MIN_PBKDF2_ITERATIONS,
            broadcast_retry: Default::default(),
            monitor_interval: Duration::from_secs(60),
            rate_deadline: Duration::from_secs(10),
            utxo_deadline: Duration::from_secs(15),
            broadcast_deadline: Duration::from_secs(30),
        }
    }
}
