//! The 2-of-3 escrow contract.
//!
//! This module owns everything that touches consensus rules: the witness
//! script, the four pre-signed spending templates, BIP-143 sighashing and the
//! signature vault that collects and verifies partial signatures.

pub mod script;
pub mod sighash;
pub mod templates;
pub mod vault;

use core::fmt;
use secp256k1::PublicKey;

use crate::error::{Classify, ErrorKind};

/// A signing role inside the escrow.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    Borrower,
    Lender,
    Platform,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Borrower, Role::Lender, Role::Platform];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Borrower => "borrower",
            Role::Lender => "lender",
            Role::Platform => "platform",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four spending shapes pre-signed during the ceremony.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TemplateKind {
    Repayment,
    Default,
    Liquidation,
    Recovery,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 4] = [
        TemplateKind::Repayment,
        TemplateKind::Default,
        TemplateKind::Liquidation,
        TemplateKind::Recovery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKind::Repayment => "repayment",
            TemplateKind::Default => "default",
            TemplateKind::Liquidation => "liquidation",
            TemplateKind::Recovery => "recovery",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three registered public keys of one escrow.
///
/// Construction enforces pairwise distinctness. Two identical keys would
/// collapse the 2-of-3 into a 2-of-2 and can strand funds, so this is checked
/// here once and the rest of the crate relies on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EscrowKeys {
    pub borrower: PublicKey,
    pub lender: PublicKey,
    pub platform: PublicKey,
}

impl EscrowKeys {
    pub fn new(borrower: PublicKey, lender: PublicKey, platform: PublicKey) -> Result<Self, KeyError> {
        if borrower == lender || borrower == platform || lender == platform {
            Err(KeyError(KeyErrorInner::DuplicateKeys))
        } else {
            Ok(EscrowKeys { borrower, lender, platform })
        }
    }

    pub fn key_for(&self, role: Role) -> &PublicKey {
        match role {
            Role::Borrower => &self.borrower,
            Role::Lender => &self.lender,
            Role::Platform => &self.platform,
        }
    }

    pub fn role_of(&self, key: &PublicKey) -> Option<Role> {
        Role::ALL.iter().copied().find(|role| self.key_for(*role) == key)
    }

    /// Keys in BIP-67 order: lexicographic over the compressed serialisation.
    pub(crate) fn sorted(&self) -> [&PublicKey; 3] {
        let mut keys = [&self.borrower, &self.lender, &self.platform];
        keys.sort_by_key(|key| key.serialize());
        keys
    }

    /// Position of a role's key within the sorted script keys.
    pub(crate) fn script_position(&self, role: Role) -> usize {
        let target = self.key_for(role);
        self.sorted()
            .iter()
            .position(|key| *key == target)
            .expect("every role's key is in the sorted set")
    }
}

#[derive(Debug)]
pub struct KeyError(KeyErrorInner);

#[derive(Debug)]
enum KeyErrorInner {
    DuplicateKeys,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            KeyErrorInner::DuplicateKeys => write!(f, "escrow keys are not pairwise distinct"),
        }
    }
}

impl Classify for KeyError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::UserInput
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Role {
    fn arbitrary(gen: &mut quickcheck::Gen) -> Self {
        *gen.choose(&Role::ALL).unwrap()
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    use secp256k1::{PublicKey, SecretKey, SECP256K1};

    /// Deterministic keys for tests; index picks the scalar.
    pub(crate) fn key(index: u8) -> (SecretKey, PublicKey) {
        let mut bytes = [0u8; 32];
        bytes[31] = index;
        let secret = SecretKey::from_slice(&bytes).unwrap();
        (secret, PublicKey::from_secret_key(SECP256K1, &secret))
    }

    pub(crate) fn escrow_keys() -> super::EscrowKeys {
        let (_, borrower) = key(1);
        let (_, lender) = key(2);
        let (_, platform) = key(3);
        super::EscrowKeys::new(borrower, lender, platform).unwrap()
    }
}
