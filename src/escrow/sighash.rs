//! BIP-143 sighash for the escrow input.
//!
//! All four templates spend a single P2WSH input with SIGHASH_ALL, so the
//! digest every participant signs — and the digest the vault verifies against
//! — comes from this one function. Producing it in exactly one place is what
//! guarantees signers and verifiers agree byte-for-byte.

use bitcoin::{Amount, EcdsaSighashType, ScriptBuf, Transaction};
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::SighashCache;

use crate::error::{Classify, ErrorKind};

/// Computes the BIP-143 digest of `input_index` of `tx`.
///
/// `witness_script` becomes the scriptCode, `value` the committed input
/// amount.
pub fn digest(
    tx: &Transaction,
    input_index: usize,
    witness_script: &ScriptBuf,
    value: Amount,
) -> Result<[u8; 32], SighashError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(input_index, witness_script, value, EcdsaSighashType::All)
        .map_err(|_| SighashError { input_index, inputs: tx.input.len() })?;
    Ok(sighash.to_byte_array())
}

/// The requested input does not exist in the transaction.
#[derive(Debug)]
pub struct SighashError {
    input_index: usize,
    inputs: usize,
}

impl core::fmt::Display for SighashError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "sighash input {} out of range ({} inputs)", self.input_index, self.inputs)
    }
}

impl Classify for SighashError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}
