//! Deterministic ephemeral key derivation.
//!
//! Participants never store private keys. The 32-byte signing scalar is
//! recomputed from the passphrase on every signing event and lives only
//! inside a [`DerivedKey`] whose backing storage is zeroed when the handle is
//! released — on every exit path, panic included.
//!
//! The derivation is PBKDF2-HMAC-SHA256 over a salt that binds the scalar to
//! one (loan, user, role) triple, so the same passphrase yields unrelated
//! keys across loans.

use core::fmt;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use secp256k1::ecdsa::Signature;
use zeroize::Zeroize;

use crate::error::{Classify, ErrorKind};

/// Work factor floor. Configurations may raise it, never lower it.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// The two roles that derive keys from passphrases. The platform key is
/// brokered through [`crate::crypto::Signer`] instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeriveRole {
    Borrower,
    Lender,
}

impl DeriveRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DeriveRole::Borrower => "borrower",
            DeriveRole::Lender => "lender",
        }
    }
}

impl fmt::Display for DeriveRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn salt(loan_id: u64, user_id: u64, role: DeriveRole) -> String {
    format!("reconquest:{}:{}:{}:escrow-key-v1", loan_id, user_id, role.as_str())
}

/// Derives the signing scalar for `(passphrase, loan, user, role)`.
///
/// The output must be a valid secp256k1 scalar in `[1, n-1]`; the negligible
/// out-of-range case is surfaced as [`DerivationError`] rather than wrapped,
/// because silently reducing would break re-derivation equality checks.
pub fn derive(
    passphrase: &[u8],
    loan_id: u64,
    user_id: u64,
    role: DeriveRole,
    iterations: u32,
) -> Result<DerivedKey, DerivationError> {
    let iterations = iterations.max(MIN_PBKDF2_ITERATIONS);
    let salt = salt(loan_id, user_id, role);
    let mut scalar = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase, salt.as_bytes(), iterations, &mut scalar);

    // from_slice rejects zero and values at or above the group order.
    match SecretKey::from_slice(&scalar) {
        Ok(_) => Ok(DerivedKey { scalar, role }),
        Err(_) => {
            scalar.zeroize();
            Err(DerivationError { role })
        },
    }
}

/// Runs `f` with a freshly derived key and zeroises the scalar before
/// returning, whether `f` returns or panics.
pub fn with_derived<R>(
    passphrase: &[u8],
    loan_id: u64,
    user_id: u64,
    role: DeriveRole,
    iterations: u32,
    f: impl FnOnce(&DerivedKey) -> R,
) -> Result<R, DerivationError> {
    let key = derive(passphrase, loan_id, user_id, role, iterations)?;
    Ok(f(&key))
}

/// Derives the key and returns its passphrase-encrypted backup blob.
///
/// The scalar itself is zeroised before this returns; only the AES-GCM
/// wrapped copy leaves.
pub fn with_backup_blob(
    passphrase: &[u8],
    loan_id: u64,
    user_id: u64,
    role: DeriveRole,
    iterations: u32,
) -> Result<Vec<u8>, DerivationError> {
    let iterations = iterations.max(MIN_PBKDF2_ITERATIONS);
    with_derived(passphrase, loan_id, user_id, role, iterations, |key| {
        crate::crypto::keywrap::wrap(passphrase, key.scalar_bytes(), iterations)
    })
}

/// Scoped handle over a derived scalar.
///
/// Dropping the handle zeroes the backing storage. The scalar can be used for
/// signing through [`DerivedKey::sign`] but cannot be moved out.
pub struct DerivedKey {
    scalar: [u8; 32],
    role: DeriveRole,
}

impl DerivedKey {
    pub fn role(&self) -> DeriveRole {
        self.role
    }

    /// Compressed public key of the scalar.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.secret())
    }

    /// Signs a sighash digest. Low-S, deterministic nonce.
    pub fn sign(&self, digest: &[u8; 32]) -> Signature {
        crate::crypto::sign(&self.secret(), digest)
    }

    /// Exposes the scalar bytes to the key backup wrap. Callers must not
    /// retain the reference past the closure they run in.
    pub(crate) fn scalar_bytes(&self) -> &[u8; 32] {
        &self.scalar
    }

    fn secret(&self) -> SecretKey {
        SecretKey::from_slice(&self.scalar).expect("validated at derivation")
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.scalar.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never print the scalar
        write!(f, "DerivedKey({} key for {})", self.role, self.public_key())
    }
}

/// PBKDF2 produced a scalar outside `[1, n-1]`.
///
/// Not retried automatically: the user must pick a different passphrase.
#[derive(Debug)]
pub struct DerivationError {
    role: DeriveRole,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "derived {} scalar out of range, choose a different passphrase", self.role)
    }
}

impl Classify for DerivationError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::CryptoFailure
    }
}
