//! Construction of the four pre-signed spending templates.
//!
//! Every template spends the single escrow UTXO and differs only in outputs
//! and lock semantics:
//!
//! * `repayment` — everything minus fee back to the borrower.
//! * `default` — the lender is made whole up to the debt, any remainder at or
//!   above dust returns to the borrower.
//! * `liquidation` — everything minus fee to the lender.
//! * `recovery` — everything minus fee to the borrower, time-locked so it
//!   only becomes valid if the platform disappears.
//!
//! Templates are deterministic: identical inputs produce identical
//! transactions, txids and sighashes, which is what lets three parties sign
//! independently and still agree.

use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;

use super::{sighash, TemplateKind};
use crate::error::{Classify, ErrorKind};

/// Outputs below this many satoshis are uneconomical to spend and are folded
/// into the fee (or the lender's share, per the default-split rule).
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Blocks per day used by the recovery timelock formula.
pub const BLOCKS_PER_DAY: u32 = 144;

const TX_VERSION: Version = Version(2);

/// Estimated virtual size of a template: header + one P2WSH input + its
/// outputs. Deliberately pessimistic so the realised fee rate never falls
/// below the requested one.
fn estimated_vbytes(outputs: u64) -> u64 {
    11 + 104 + 43 * outputs
}

fn fee_for(outputs: u64, rate_sat_vb: u64) -> Amount {
    Amount::from_sat(estimated_vbytes(outputs) * rate_sat_vb)
}

/// The confirmed escrow UTXO all templates spend.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EscrowUtxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
}

impl EscrowUtxo {
    fn outpoint(&self) -> OutPoint {
        OutPoint { txid: self.txid, vout: self.vout }
    }
}

/// Everything needed to build the full template set for one loan.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub utxo: EscrowUtxo,
    pub witness_script: ScriptBuf,
    /// Destination of borrower-bound outputs.
    pub borrower_script: ScriptBuf,
    /// Destination of lender-bound outputs.
    pub lender_script: ScriptBuf,
    /// Requested fee rate in sat/vbyte.
    pub fee_rate: u64,
    /// Relay floor reported by the chain adapter; the requested rate is
    /// clamped up to it.
    pub min_fee_rate: u64,
    /// Outstanding debt converted to satoshis at construction time.
    pub debt: Amount,
    /// Absolute block height the recovery template is locked until.
    pub recovery_lock_height: u32,
}

impl BuildParams {
    fn effective_rate(&self) -> u64 {
        self.fee_rate.max(self.min_fee_rate)
    }
}

/// Construction parameters recorded alongside each template for audit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TemplateParams {
    pub destinations: Vec<ScriptBuf>,
    pub fee: Amount,
    pub fee_rate: u64,
    pub lock_height: Option<u32>,
}

/// One canonical unsigned spending transaction plus its signing digest.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Template {
    pub kind: TemplateKind,
    pub tx: Transaction,
    pub txid: Txid,
    /// BIP-174 serialisation carrying `witness_utxo` and `witness_script`.
    pub psbt: Vec<u8>,
    /// Precomputed BIP-143 digest of input 0; the value every signer signs
    /// and the vault verifies against.
    pub sighash: [u8; 32],
    pub params: TemplateParams,
}

/// Builds all four templates. Order follows [`TemplateKind::ALL`].
pub fn build_all(params: &BuildParams) -> Result<Vec<Template>, BuildError> {
    TemplateKind::ALL.iter().map(|kind| build(*kind, params)).collect()
}

/// Builds one template kind.
pub fn build(kind: TemplateKind, params: &BuildParams) -> Result<Template, BuildError> {
    let rate = params.effective_rate();
    let (outputs, lock_time, sequence) = match kind {
        TemplateKind::Repayment => (
            vec![single_output(params, &params.borrower_script, rate, kind)?],
            LockTime::ZERO,
            Sequence::ENABLE_RBF_NO_LOCKTIME,
        ),
        TemplateKind::Liquidation => (
            vec![single_output(params, &params.lender_script, rate, kind)?],
            LockTime::ZERO,
            Sequence::ENABLE_RBF_NO_LOCKTIME,
        ),
        TemplateKind::Default => (
            default_outputs(params, rate)?,
            LockTime::ZERO,
            Sequence::ENABLE_RBF_NO_LOCKTIME,
        ),
        TemplateKind::Recovery => {
            let lock_time = LockTime::from_height(params.recovery_lock_height)
                .map_err(|_| BuildError(BuildErrorInner::LockHeightOutOfRange(params.recovery_lock_height)))?;
            (
                vec![single_output(params, &params.borrower_script, rate, kind)?],
                lock_time,
                // Anything below final enables the absolute lock time.
                Sequence::ZERO,
            )
        },
    };

    let tx = Transaction {
        version: TX_VERSION,
        lock_time,
        input: vec![TxIn {
            previous_output: params.utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: outputs,
    };
    let txid = tx.compute_txid();
    let sighash = sighash::digest(&tx, 0, &params.witness_script, params.utxo.value)
        .map_err(|error| BuildError(BuildErrorInner::Sighash(error)))?;
    let psbt = serialize_psbt(&tx, params)?;
    let fee = params.utxo.value - tx.output.iter().map(|out| out.value).sum::<Amount>();

    Ok(Template {
        kind,
        txid,
        sighash,
        psbt,
        params: TemplateParams {
            destinations: tx.output.iter().map(|out| out.script_pubkey.clone()).collect(),
            fee,
            fee_rate: rate,
            lock_height: match kind {
                TemplateKind::Recovery => Some(params.recovery_lock_height),
                _ => None,
            },
        },
        tx,
    })
}

fn single_output(
    params: &BuildParams,
    destination: &ScriptBuf,
    rate: u64,
    kind: TemplateKind,
) -> Result<TxOut, BuildError> {
    let fee = fee_for(1, rate);
    let value = params.utxo.value
        .checked_sub(fee)
        .filter(|value| *value >= DUST_LIMIT)
        .ok_or(BuildError(BuildErrorInner::ValueBelowDust { kind, fee }))?;
    Ok(TxOut { value, script_pubkey: destination.clone() })
}

/// The fair-split rule of the default template, also used for admin-resolved
/// disputes: the lender receives the debt (capped by what is there after the
/// network fee), the borrower the remainder — unless that remainder is dust,
/// in which case the lender takes everything.
fn default_outputs(params: &BuildParams, rate: u64) -> Result<Vec<TxOut>, BuildError> {
    let two_output_fee = fee_for(2, rate);
    if let Some(available) = params.utxo.value.checked_sub(two_output_fee) {
        let lender_value = params.debt.min(available);
        let remainder = available - lender_value;
        if lender_value >= DUST_LIMIT && remainder >= DUST_LIMIT {
            return Ok(vec![
                TxOut { value: lender_value, script_pubkey: params.lender_script.clone() },
                TxOut { value: remainder, script_pubkey: params.borrower_script.clone() },
            ]);
        }
        if lender_value < DUST_LIMIT {
            // A dust-sized debt folds into the fee; the borrower keeps the
            // remainder as a single output.
            let one_output_fee = fee_for(1, rate);
            let value = params.utxo.value
                .checked_sub(one_output_fee + lender_value)
                .filter(|value| *value >= DUST_LIMIT)
                .ok_or(BuildError(BuildErrorInner::ValueBelowDust {
                    kind: TemplateKind::Default,
                    fee: one_output_fee,
                }))?;
            return Ok(vec![TxOut { value, script_pubkey: params.borrower_script.clone() }]);
        }
    }
    // Sub-dust borrower remainder: the lender is entitled to the full
    // balance, so the whole residual routes there as a single output.
    single_output(params, &params.lender_script, rate, TemplateKind::Default).map(|out| vec![out])
}

fn serialize_psbt(tx: &Transaction, params: &BuildParams) -> Result<Vec<u8>, BuildError> {
    let mut psbt = bitcoin::Psbt::from_unsigned_tx(tx.clone())
        .map_err(|error| BuildError(BuildErrorInner::Psbt(error)))?;
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: params.utxo.value,
        script_pubkey: super::script::script_pubkey(&params.witness_script),
    });
    psbt.inputs[0].witness_script = Some(params.witness_script.clone());
    Ok(psbt.serialize())
}

#[derive(Debug)]
pub struct BuildError(BuildErrorInner);

#[derive(Debug)]
enum BuildErrorInner {
    /// After the network fee nothing spendable remains.
    ValueBelowDust { kind: TemplateKind, fee: Amount },
    LockHeightOutOfRange(u32),
    Psbt(bitcoin::psbt::Error),
    Sighash(sighash::SighashError),
}

impl core::fmt::Display for BuildError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match &self.0 {
            BuildErrorInner::ValueBelowDust { kind, fee } => {
                write!(f, "{} output below dust after {} fee", kind, fee)
            },
            BuildErrorInner::LockHeightOutOfRange(height) => {
                write!(f, "recovery lock height {} is not a valid block height", height)
            },
            BuildErrorInner::Psbt(_) => write!(f, "psbt encoding failed"),
            BuildErrorInner::Sighash(error) => write!(f, "{}", error),
        }
    }
}

impl Classify for BuildError {
    fn kind(&self) -> ErrorKind {
        match self.0 {
            BuildErrorInner::ValueBelowDust { .. } => ErrorKind::UserInput,
            BuildErrorInner::LockHeightOutOfRange(_) => ErrorKind::UserInput,
            BuildErrorInner::Psbt(_) | BuildErrorInner::Sighash(_) => ErrorKind::Internal,
        }
    }
}

/// Recovery timelock: funding height plus the loan term (in 30-day months)
/// plus the grace period, all at 144 blocks per day.
pub fn recovery_lock_height(funding_height: u32, term_months: u32, grace_days: u32) -> u32 {
    funding_height + (term_months * 30 + grace_days) * BLOCKS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    use crate::config::Network;
    use crate::escrow::{script, test_keys};

    fn params() -> BuildParams {
        let keys = test_keys::escrow_keys();
        let witness_script = script::witness_script(&keys);
        let borrower_script = script::address(&witness_script, Network::Testnet).script_pubkey();
        // any distinct script works for the lender side in these tests
        let (_, lender_key) = test_keys::key(7);
        let lender_script = ScriptBuf::new_p2wpkh(&bitcoin::CompressedPublicKey(lender_key).wpubkey_hash());
        BuildParams {
            utxo: EscrowUtxo {
                txid: Txid::from_byte_array([0x22; 32]),
                vout: 0,
                value: Amount::from_sat(2_500_000),
            },
            witness_script,
            borrower_script,
            lender_script,
            fee_rate: 2,
            min_fee_rate: 1,
            debt: Amount::from_sat(1_000_000),
            recovery_lock_height: 850_000 + (3 * 30 + 14) * BLOCKS_PER_DAY,
        }
    }

    #[test]
    fn repayment_pays_borrower_minus_fee() {
        let params = params();
        let template = build(TemplateKind::Repayment, &params).unwrap();
        assert_eq!(template.tx.output.len(), 1);
        // 158 vbytes at 2 sat/vb
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 316));
        assert_eq!(template.tx.output[0].script_pubkey, params.borrower_script);
        assert_eq!(template.tx.lock_time, LockTime::ZERO);
        assert_eq!(template.params.fee, Amount::from_sat(316));
    }

    #[test]
    fn default_splits_fairly() {
        let params = params();
        let template = build(TemplateKind::Default, &params).unwrap();
        assert_eq!(template.tx.output.len(), 2);
        assert_eq!(template.tx.output[0].value, params.debt);
        assert_eq!(template.tx.output[0].script_pubkey, params.lender_script);
        // 201 vbytes at 2 sat/vb
        assert_eq!(template.tx.output[1].value, Amount::from_sat(2_500_000 - 402 - 1_000_000));
        assert_eq!(template.tx.output[1].script_pubkey, params.borrower_script);
    }

    #[test]
    fn default_with_debt_above_collateral_pays_lender_everything() {
        // Scenario: 1012.50 EUR debt at 25 000 EUR/BTC is 4 050 000 sats but
        // only 2 500 000 sats of collateral exist.
        let mut params = params();
        params.debt = Amount::from_sat(4_050_000);
        let template = build(TemplateKind::Default, &params).unwrap();
        assert_eq!(template.tx.output.len(), 1);
        assert_eq!(template.tx.output[0].script_pubkey, params.lender_script);
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 316));
    }

    #[test]
    fn default_dust_remainder_goes_to_lender() {
        let mut params = params();
        // remainder after debt and fee would be 100 sats
        params.debt = Amount::from_sat(2_500_000 - 402 - 100);
        let template = build(TemplateKind::Default, &params).unwrap();
        assert_eq!(template.tx.output.len(), 1);
        assert_eq!(template.tx.output[0].script_pubkey, params.lender_script);
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 316));
    }

    #[test]
    fn default_dust_debt_folds_into_fee() {
        let mut params = params();
        params.debt = Amount::from_sat(100);
        let template = build(TemplateKind::Default, &params).unwrap();
        assert_eq!(template.tx.output.len(), 1);
        assert_eq!(template.tx.output[0].script_pubkey, params.borrower_script);
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 316 - 100));
    }

    #[test]
    fn liquidation_pays_lender_everything() {
        let params = params();
        let template = build(TemplateKind::Liquidation, &params).unwrap();
        assert_eq!(template.tx.output.len(), 1);
        assert_eq!(template.tx.output[0].script_pubkey, params.lender_script);
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 316));
    }

    #[test]
    fn recovery_is_timelocked() {
        let params = params();
        let template = build(TemplateKind::Recovery, &params).unwrap();
        assert_eq!(
            template.tx.lock_time,
            LockTime::from_height(params.recovery_lock_height).unwrap(),
        );
        // sequence must be non-final or the lock time is ignored
        assert!(template.tx.input[0].sequence.enables_absolute_lock_time());
        assert_eq!(template.tx.output[0].script_pubkey, params.borrower_script);
        assert_eq!(template.params.lock_height, Some(params.recovery_lock_height));
    }

    #[test]
    fn fee_rate_clamped_to_relay_floor() {
        let mut params = params();
        params.fee_rate = 1;
        params.min_fee_rate = 5;
        let template = build(TemplateKind::Repayment, &params).unwrap();
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 158 * 5));
        assert_eq!(template.params.fee_rate, 5);
    }

    #[test]
    fn templates_are_deterministic() {
        let params = params();
        let a = build_all(&params).unwrap();
        let b = build_all(&params).unwrap();
        assert_eq!(a, b);
        let txids: std::collections::BTreeSet<_> = a.iter().map(|t| t.txid).collect();
        assert_eq!(txids.len(), 4, "all four templates spend differently");
    }

    #[test]
    fn tiny_escrow_rejected() {
        let mut params = params();
        params.utxo.value = Amount::from_sat(700);
        assert!(build(TemplateKind::Repayment, &params).is_err());
    }

    #[test]
    fn psbt_carries_witness_data() {
        let params = params();
        let template = build(TemplateKind::Repayment, &params).unwrap();
        let psbt = bitcoin::Psbt::deserialize(&template.psbt).unwrap();
        assert_eq!(psbt.unsigned_tx, template.tx);
        let input = &psbt.inputs[0];
        assert_eq!(input.witness_script.as_ref(), Some(&params.witness_script));
        let witness_utxo = input.witness_utxo.as_ref().unwrap();
        assert_eq!(witness_utxo.value, params.utxo.value);
        assert_eq!(witness_utxo.script_pubkey, script::script_pubkey(&params.witness_script));
    }

    #[test]
    fn recovery_lock_height_formula() {
        assert_eq!(recovery_lock_height(850_000, 3, 14), 850_000 + 104 * 144);
        assert_eq!(recovery_lock_height(0, 0, 0), 0);
    }
}
