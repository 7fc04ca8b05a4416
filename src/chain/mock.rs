//! Deterministic in-memory chain.
//!
//! Drives the full ceremony in tests and the demo CLI: funding is injected
//! with [`MockChain::fund_address`], blocks are mined on demand and broadcast
//! failures can be queued to exercise the retry path. Behaviour mirrors the
//! contract of the real backend, including idempotent re-broadcast and
//! conflict detection on double spends.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, Txid};
use bitcoin::hashes::{sha256d, Hash};
use slog::{debug, warn};

use super::{fallback_fee_rate, BlockchainAdapter, ChainError, FeePriority, TxStatus, Utxo};
use crate::config::Network;

struct TrackedUtxo {
    txid: Txid,
    vout: u32,
    value: Amount,
    /// Height the creating transaction confirmed at; `None` while in the
    /// mempool.
    height: Option<u32>,
}

struct RecordedTx {
    confirmed_height: Option<u32>,
}

struct State {
    height: u32,
    utxos: HashMap<ScriptBuf, Vec<TrackedUtxo>>,
    txs: HashMap<Txid, RecordedTx>,
    spent: HashMap<OutPoint, Txid>,
    fee_rates: HashMap<&'static str, u64>,
    estimator_down: bool,
    min_fee_rate: u64,
    queued_failures: VecDeque<ChainError>,
    broadcasts: Vec<Txid>,
    funding_counter: u64,
}

pub struct MockChain {
    network: Network,
    state: Mutex<State>,
    log: slog::Logger,
}

impl MockChain {
    pub fn new(network: Network, log: slog::Logger) -> Self {
        MockChain {
            network,
            log,
            state: Mutex::new(State {
                height: 850_000,
                utxos: HashMap::new(),
                txs: HashMap::new(),
                spent: HashMap::new(),
                fee_rates: HashMap::new(),
                estimator_down: false,
                min_fee_rate: 1,
                queued_failures: VecDeque::new(),
                broadcasts: Vec::new(),
                funding_counter: 0,
            }),
        }
    }

    /// Confirms a synthetic funding transaction paying `value` to `address`
    /// and returns its txid.
    pub fn fund_address(&self, address: &Address, value: Amount) -> Txid {
        let mut state = self.state.lock().unwrap();
        state.funding_counter += 1;
        let txid = Txid::from_byte_array(
            sha256d::Hash::hash(&state.funding_counter.to_be_bytes()).to_byte_array(),
        );
        let height = state.height;
        state.txs.insert(txid, RecordedTx { confirmed_height: Some(height) });
        state
            .utxos
            .entry(address.script_pubkey())
            .or_insert_with(Vec::new)
            .push(TrackedUtxo { txid, vout: 0, value, height: Some(height) });
        debug!(self.log, "mock funding confirmed"; "txid" => %txid, "value" => value.to_sat());
        txid
    }

    /// Mines `blocks` new blocks; mempool transactions confirm in the first.
    pub fn mine(&self, blocks: u32) {
        if blocks == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.height += 1;
        let confirm_at = state.height;
        for tx in state.txs.values_mut() {
            if tx.confirmed_height.is_none() {
                tx.confirmed_height = Some(confirm_at);
            }
        }
        for utxos in state.utxos.values_mut() {
            for utxo in utxos.iter_mut() {
                if utxo.height.is_none() {
                    utxo.height = Some(confirm_at);
                }
            }
        }
        state.height += blocks.saturating_sub(1);
    }

    pub fn set_fee_rate(&self, priority: FeePriority, rate: u64) {
        self.state.lock().unwrap().fee_rates.insert(priority.as_str(), rate);
    }

    pub fn set_estimator_down(&self, down: bool) {
        self.state.lock().unwrap().estimator_down = down;
    }

    /// Makes the next broadcast fail with `error`; queued failures apply in
    /// order before broadcasts succeed again.
    pub fn queue_broadcast_failure(&self, error: ChainError) {
        self.state.lock().unwrap().queued_failures.push_back(error);
    }

    /// Every txid accepted by [`BlockchainAdapter::broadcast`], in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

impl BlockchainAdapter for MockChain {
    fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let state = self.state.lock().unwrap();
        let tip = state.height;
        Ok(state
            .utxos
            .get(&address.script_pubkey())
            .map(|utxos| {
                utxos
                    .iter()
                    .map(|utxo| Utxo {
                        txid: utxo.txid,
                        vout: utxo.vout,
                        value: utxo.value,
                        confirmations: utxo.height.map(|h| tip - h + 1).unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn fee_rate(&self, priority: FeePriority) -> u64 {
        let state = self.state.lock().unwrap();
        if state.estimator_down {
            let rate = fallback_fee_rate(self.network, priority);
            warn!(self.log, "fee estimator unavailable, using fallback";
                "priority" => priority.as_str(), "rate" => rate);
            return rate;
        }
        state
            .fee_rates
            .get(priority.as_str())
            .copied()
            .unwrap_or_else(|| fallback_fee_rate(self.network, priority))
    }

    fn min_fee_rate(&self) -> u64 {
        self.state.lock().unwrap().min_fee_rate
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut state = self.state.lock().unwrap();
        let txid = tx.compute_txid();
        if state.txs.contains_key(&txid) {
            // idempotent re-broadcast
            return Ok(txid);
        }
        if let Some(error) = state.queued_failures.pop_front() {
            return Err(error);
        }
        for input in &tx.input {
            if let Some(spender) = state.spent.get(&input.previous_output) {
                if *spender != txid {
                    return Err(ChainError::MempoolConflict);
                }
            }
        }
        for input in &tx.input {
            state.spent.insert(input.previous_output, txid);
            for utxos in state.utxos.values_mut() {
                utxos.retain(|utxo| {
                    !(utxo.txid == input.previous_output.txid && utxo.vout == input.previous_output.vout)
                });
            }
        }
        for (vout, output) in tx.output.iter().enumerate() {
            state
                .utxos
                .entry(output.script_pubkey.clone())
                .or_insert_with(Vec::new)
                .push(TrackedUtxo {
                    txid,
                    vout: vout as u32,
                    value: output.value,
                    height: None,
                });
        }
        state.txs.insert(txid, RecordedTx { confirmed_height: None });
        state.broadcasts.push(txid);
        debug!(self.log, "mock broadcast accepted"; "txid" => %txid);
        Ok(txid)
    }

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError> {
        let state = self.state.lock().unwrap();
        let tx = state.txs.get(txid).ok_or(ChainError::NotFound)?;
        Ok(match tx.confirmed_height {
            Some(height) => TxStatus {
                confirmations: state.height - height + 1,
                block_height: Some(height),
            },
            None => TxStatus { confirmations: 0, block_height: None },
        })
    }

    fn tip_height(&self) -> Result<u32, ChainError> {
        Ok(self.state.lock().unwrap().height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Sequence, TxIn, TxOut, Witness};
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;

    use crate::escrow::{script, test_keys};

    fn chain() -> MockChain {
        MockChain::new(Network::Testnet, slog::Logger::root(slog::Discard, slog::o!()))
    }

    fn escrow_address() -> Address {
        let keys = test_keys::escrow_keys();
        script::address(&script::witness_script(&keys), Network::Testnet)
    }

    fn spend(txid: Txid, vout: u32, destination: &Address, value: Amount) -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid, vout },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value, script_pubkey: destination.script_pubkey() }],
        }
    }

    #[test]
    fn funding_shows_up_and_confirms() {
        let chain = chain();
        let address = escrow_address();
        let txid = chain.fund_address(&address, Amount::from_sat(2_500_000));

        let utxos = chain.get_utxos(&address).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].txid, txid);
        assert_eq!(utxos[0].confirmations, 1);

        chain.mine(2);
        assert_eq!(chain.get_utxos(&address).unwrap()[0].confirmations, 3);
    }

    #[test]
    fn broadcast_is_idempotent() {
        let chain = chain();
        let address = escrow_address();
        let funding = chain.fund_address(&address, Amount::from_sat(2_500_000));
        let tx = spend(funding, 0, &address, Amount::from_sat(2_400_000));

        let a = chain.broadcast(&tx).unwrap();
        let b = chain.broadcast(&tx).unwrap();
        assert_eq!(a, b);
        assert_eq!(chain.broadcasts().len(), 1);
    }

    #[test]
    fn double_spend_conflicts() {
        let chain = chain();
        let address = escrow_address();
        let funding = chain.fund_address(&address, Amount::from_sat(2_500_000));

        chain.broadcast(&spend(funding, 0, &address, Amount::from_sat(2_400_000))).unwrap();
        let rival = spend(funding, 0, &address, Amount::from_sat(2_300_000));
        assert!(matches!(chain.broadcast(&rival), Err(ChainError::MempoolConflict)));
    }

    #[test]
    fn queued_failures_apply_in_order() {
        let chain = chain();
        let address = escrow_address();
        let funding = chain.fund_address(&address, Amount::from_sat(2_500_000));
        let tx = spend(funding, 0, &address, Amount::from_sat(2_400_000));

        chain.queue_broadcast_failure(ChainError::Network("down".into()));
        assert!(matches!(chain.broadcast(&tx), Err(ChainError::Network(_))));
        chain.broadcast(&tx).unwrap();
    }

    #[test]
    fn estimator_outage_uses_fallback() {
        let chain = chain();
        chain.set_fee_rate(FeePriority::Normal, 17);
        assert_eq!(chain.fee_rate(FeePriority::Normal), 17);
        chain.set_estimator_down(true);
        assert_eq!(chain.fee_rate(FeePriority::Normal), 2);
    }

    #[test]
    fn unknown_tx_is_not_found() {
        let chain = chain();
        let txid = Txid::from_byte_array([9; 32]);
        assert!(matches!(chain.tx_status(&txid), Err(ChainError::NotFound)));
    }
}
