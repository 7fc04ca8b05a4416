//! Witness script and address of the escrow.
//!
//! The script is the textbook sorted 2-of-3:
//! `OP_2 <pk1> <pk2> <pk3> OP_3 OP_CHECKMULTISIG` with keys in BIP-67 order,
//! wrapped in a P2WSH output. Sorting makes the script a pure function of the
//! key *set*, so every participant derives the same address without agreeing
//! on an order first.

use bitcoin::{Address, ScriptBuf};
use bitcoin::blockdata::script;
use bitcoin::blockdata::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2, OP_PUSHNUM_3};

use super::EscrowKeys;
use crate::config::Network;

/// Builds the 2-of-3 witness script over the escrow keys.
pub fn witness_script(keys: &EscrowKeys) -> ScriptBuf {
    let sorted = keys.sorted();
    let mut builder = script::Builder::new().push_opcode(OP_PUSHNUM_2);
    for key in sorted {
        builder = builder.push_slice(key.serialize());
    }
    builder.push_opcode(OP_PUSHNUM_3).push_opcode(OP_CHECKMULTISIG).into_script()
}

/// P2WSH scriptPubKey committing to the witness script:
/// `OP_0 <SHA-256(witness_script)>`.
pub fn script_pubkey(witness_script: &ScriptBuf) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&witness_script.wscript_hash())
}

/// Bech32 address of the escrow on the configured network.
pub fn address(witness_script: &ScriptBuf, network: Network) -> Address {
    Address::p2wsh(witness_script, network.to_bitcoin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::test_keys;

    #[test]
    fn script_shape() {
        let keys = test_keys::escrow_keys();
        let script = witness_script(&keys);
        let bytes = script.as_bytes();

        // OP_2, three 33-byte pushes, OP_3, OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 3 * 34 + 2);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[1], 33);
        assert_eq!(bytes[35], 33);
        assert_eq!(bytes[69], 33);
        assert_eq!(bytes[103], 0x53);
        assert_eq!(bytes[104], 0xae);
        assert!(script.is_multisig());
    }

    #[test]
    fn script_is_permutation_invariant() {
        use crate::escrow::EscrowKeys;

        let (_, a) = test_keys::key(1);
        let (_, b) = test_keys::key(2);
        let (_, c) = test_keys::key(3);

        let reference = witness_script(&EscrowKeys::new(a, b, c).unwrap());
        for (x, y, z) in [(a, c, b), (b, a, c), (b, c, a), (c, a, b), (c, b, a)] {
            let keys = EscrowKeys::new(x, y, z).unwrap();
            assert_eq!(witness_script(&keys), reference);
            assert_eq!(script_pubkey(&witness_script(&keys)), script_pubkey(&reference));
            assert_eq!(
                address(&witness_script(&keys), Network::Testnet),
                address(&reference, Network::Testnet),
            );
        }
    }

    #[test]
    fn script_pubkey_is_v0_p2wsh() {
        let keys = test_keys::escrow_keys();
        let spk = script_pubkey(&witness_script(&keys));
        assert!(spk.is_p2wsh());
        let bytes = spk.as_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[0], 0x00); // witness version 0
        assert_eq!(bytes[1], 32); // 32-byte program
    }

    #[test]
    fn address_hrp_follows_network() {
        let keys = test_keys::escrow_keys();
        let script = witness_script(&keys);
        assert!(address(&script, Network::Testnet).to_string().starts_with("tb1q"));
        assert!(address(&script, Network::Mainnet).to_string().starts_with("bc1q"));
    }

    #[test]
    fn address_matches_script_pubkey() {
        let keys = test_keys::escrow_keys();
        let script = witness_script(&keys);
        assert_eq!(address(&script, Network::Testnet).script_pubkey(), script_pubkey(&script));
    }
}
