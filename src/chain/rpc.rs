//! Bitcoin Core JSON-RPC backend.
//!
//! Talks to a node that watches the escrow addresses (import them
//! watch-only). The HTTP transport carries the configured deadline, so every
//! call returns within it; a deadline expiry on broadcast means the outcome
//! is unknown and the caller reconciles through [`super::BlockchainAdapter::tx_status`].

use std::time::Duration;

use bitcoin::{Address, Transaction, Txid};
use bitcoincore_rpc::{jsonrpc, Client, RpcApi};
use slog::warn;

use super::{fallback_fee_rate, BlockchainAdapter, ChainError, FeePriority, TxStatus, Utxo};
use crate::config::Network;

/// Confirmation targets requested from `estimatesmartfee` per priority.
fn conf_target(priority: FeePriority) -> u16 {
    match priority {
        FeePriority::Fast => 2,
        FeePriority::Normal => 6,
        FeePriority::Slow => 36,
        FeePriority::Economy => 144,
    }
}

pub struct CoreRpcChain {
    client: Client,
    network: Network,
    log: slog::Logger,
}

impl CoreRpcChain {
    pub fn new(
        url: &str,
        user: &str,
        password: &str,
        deadline: Duration,
        network: Network,
        log: slog::Logger,
    ) -> Result<Self, ChainError> {
        let transport = jsonrpc::simple_http::Builder::new()
            .url(url)
            .map_err(|error| ChainError::Network(error.to_string()))?
            .timeout(deadline)
            .auth(user, Some(password))
            .build();
        let client = Client::from_jsonrpc(jsonrpc::client::Client::with_transport(transport));
        Ok(CoreRpcChain { client, network, log })
    }
}

impl BlockchainAdapter for CoreRpcChain {
    fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let entries = self
            .client
            .list_unspent(Some(0), None, Some(&[address]), Some(true), None)
            .map_err(map_error)?;
        Ok(entries
            .into_iter()
            .map(|entry| Utxo {
                txid: entry.txid,
                vout: entry.vout,
                value: entry.amount,
                confirmations: entry.confirmations,
            })
            .collect())
    }

    fn fee_rate(&self, priority: FeePriority) -> u64 {
        let estimate = self
            .client
            .estimate_smart_fee(conf_target(priority), None)
            .ok()
            .and_then(|result| result.fee_rate);
        match estimate {
            Some(per_kvb) => (per_kvb.to_sat() / 1_000).max(1),
            None => {
                let rate = fallback_fee_rate(self.network, priority);
                warn!(self.log, "fee estimator unavailable, using fallback";
                    "priority" => priority.as_str(), "rate" => rate);
                rate
            },
        }
    }

    fn min_fee_rate(&self) -> u64 {
        self.client
            .get_network_info()
            .ok()
            .map(|info| (info.relay_fee.to_sat() / 1_000).max(1))
            .unwrap_or(1)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        match self.client.send_raw_transaction(tx) {
            Ok(txid) => Ok(txid),
            Err(error) => match map_broadcast_error(error) {
                BroadcastFailure::AlreadyKnown => Ok(tx.compute_txid()),
                BroadcastFailure::Chain(error) => Err(error),
            },
        }
    }

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError> {
        let info = self
            .client
            .get_raw_transaction_info(txid, None)
            .map_err(|error| match map_error(error) {
                ChainError::Rejected(_) => ChainError::NotFound,
                other => other,
            })?;
        let block_height = match info.blockhash {
            Some(hash) => self
                .client
                .get_block_header_info(&hash)
                .ok()
                .map(|header| header.height as u32),
            None => None,
        };
        Ok(TxStatus {
            confirmations: info.confirmations.unwrap_or(0),
            block_height,
        })
    }

    fn tip_height(&self) -> Result<u32, ChainError> {
        self.client
            .get_block_count()
            .map(|height| height as u32)
            .map_err(map_error)
    }
}

enum BroadcastFailure {
    AlreadyKnown,
    Chain(ChainError),
}

fn map_broadcast_error(error: bitcoincore_rpc::Error) -> BroadcastFailure {
    const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

    if let bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rpc)) = &error {
        let lower = rpc.message.to_ascii_lowercase();
        if rpc.code == RPC_VERIFY_ALREADY_IN_CHAIN
            || lower.contains("already in the mempool")
            || lower.contains("txn-already-known")
        {
            return BroadcastFailure::AlreadyKnown;
        }
        return BroadcastFailure::Chain(classify_reject(&rpc.message));
    }
    BroadcastFailure::Chain(map_error(error))
}

/// Maps a node rejection message onto the adapter error contract.
fn classify_reject(message: &str) -> ChainError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("txn-mempool-conflict") || lower.contains("missingorspent") || lower.contains("already spent") {
        return ChainError::MempoolConflict;
    }
    if lower.contains("min relay fee") || lower.contains("mempool min fee") || lower.contains("insufficient fee") {
        return ChainError::FeeTooLow;
    }
    ChainError::Rejected(message.to_string())
}

fn map_error(error: bitcoincore_rpc::Error) -> ChainError {
    match &error {
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rpc)) => {
            ChainError::Rejected(rpc.message.clone())
        },
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Transport(transport)) => {
            let text = transport.to_string();
            if text.contains("timed out") || text.contains("timeout") {
                ChainError::Timeout
            } else {
                ChainError::Network(text)
            }
        },
        other => ChainError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_messages_classified() {
        assert!(matches!(classify_reject("txn-mempool-conflict"), ChainError::MempoolConflict));
        assert!(matches!(classify_reject("bad-txns-inputs-missingorspent"), ChainError::MempoolConflict));
        assert!(matches!(classify_reject("min relay fee not met, 110 < 141"), ChainError::FeeTooLow));
        assert!(matches!(classify_reject("mempool min fee not met"), ChainError::FeeTooLow));
        assert!(matches!(classify_reject("non-mandatory-script-verify-flag"), ChainError::Rejected(_)));
    }

    #[test]
    fn priorities_map_to_targets() {
        assert!(conf_target(FeePriority::Fast) < conf_target(FeePriority::Normal));
        assert!(conf_target(FeePriority::Normal) < conf_target(FeePriority::Slow));
        assert!(conf_target(FeePriority::Slow) < conf_target(FeePriority::Economy));
    }
}
