//! Signing primitives shared by the vault and the participants.
//!
//! Everything here works on 32-byte sighash digests and compressed secp256k1
//! keys. Signatures produced by this module are always low-S (the underlying
//! library grinds RFC 6979 nonces and normalizes), and signatures accepted by
//! [`verify`] must be low-S — a high-S submission is rejected before it ever
//! reaches ECDSA verification.

use core::fmt;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use secp256k1::ecdsa::Signature;

use crate::error::{Classify, ErrorKind};

pub mod keywrap;

/// Byte appended to DER signatures on the wire (SIGHASH_ALL).
pub const SIGHASH_ALL_BYTE: u8 = 0x01;

/// Signs `digest` with `key`. The result is low-S and deterministic.
pub fn sign(key: &SecretKey, digest: &[u8; 32]) -> Signature {
    SECP256K1.sign_ecdsa(&Message::from_digest(*digest), key)
}

/// Verifies an ECDSA signature over `digest`.
pub fn verify(pubkey: &PublicKey, digest: &[u8; 32], signature: &Signature) -> Result<(), SignatureError> {
    if !is_low_s(signature) {
        return Err(SignatureError(SignatureErrorInner::HighS));
    }
    SECP256K1
        .verify_ecdsa(&Message::from_digest(*digest), signature, pubkey)
        .map_err(|error| SignatureError(SignatureErrorInner::Invalid(error)))
}

/// Whether the signature is in canonical low-S form.
pub fn is_low_s(signature: &Signature) -> bool {
    let mut normalized = *signature;
    normalized.normalize_s();
    normalized.serialize_compact() == signature.serialize_compact()
}

/// Parses a DER signature carrying a trailing sighash byte.
///
/// Only SIGHASH_ALL is accepted; the escrow never pre-signs anything else.
pub fn parse_der_with_hashtype(bytes: &[u8]) -> Result<Signature, SignatureError> {
    let (&hashtype, der) = bytes.split_last().ok_or(SignatureError(SignatureErrorInner::Empty))?;
    if hashtype != SIGHASH_ALL_BYTE {
        return Err(SignatureError(SignatureErrorInner::UnsupportedHashtype(hashtype)));
    }
    Signature::from_der(der).map_err(|error| SignatureError(SignatureErrorInner::Der(error)))
}

/// Serialises a signature the way it appears in a witness stack: DER plus the
/// SIGHASH_ALL byte.
pub fn serialize_with_hashtype(signature: &Signature) -> Vec<u8> {
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(SIGHASH_ALL_BYTE);
    bytes
}

/// Parses a 33-byte compressed public key from hex.
pub fn pubkey_from_hex(hex: &str) -> Result<PublicKey, PubKeyError> {
    use bitcoin::hashes::hex::FromHex;

    let bytes = Vec::<u8>::from_hex(hex).map_err(|_| PubKeyError(PubKeyErrorInner::NotHex))?;
    if bytes.len() != 33 {
        return Err(PubKeyError(PubKeyErrorInner::BadLength(bytes.len())));
    }
    PublicKey::from_slice(&bytes).map_err(|error| PubKeyError(PubKeyErrorInner::NotAKey(error)))
}

/// Access to a signing key whose scalar may live outside this process.
///
/// The platform key is brokered through this trait so it can be backed by an
/// HSM; nothing in the core ever asks for the raw bytes.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, digest: &[u8; 32]) -> Result<Signature, SignerUnavailable>;
}

/// In-process signer. Production deployments substitute an HSM client.
pub struct LocalSigner {
    key: SecretKey,
}

impl LocalSigner {
    pub fn new(key: SecretKey) -> Self {
        LocalSigner { key }
    }

    pub fn random() -> Self {
        LocalSigner { key: SecretKey::new(&mut rand::thread_rng()) }
    }
}

impl Signer for LocalSigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.key)
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<Signature, SignerUnavailable> {
        Ok(sign(&self.key, digest))
    }
}

/// The external signer could not produce a signature.
#[derive(Debug)]
pub struct SignerUnavailable;

impl Classify for SignerUnavailable {
    fn kind(&self) -> ErrorKind {
        ErrorKind::External
    }
}

#[derive(Debug)]
pub struct SignatureError(SignatureErrorInner);

#[derive(Debug)]
enum SignatureErrorInner {
    Empty,
    UnsupportedHashtype(u8),
    Der(secp256k1::Error),
    HighS,
    Invalid(secp256k1::Error),
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            SignatureErrorInner::Empty => write!(f, "empty signature"),
            SignatureErrorInner::UnsupportedHashtype(byte) => write!(f, "unsupported sighash byte {:#04x}", byte),
            SignatureErrorInner::Der(_) => write!(f, "invalid DER encoding"),
            SignatureErrorInner::HighS => write!(f, "signature is not low-S"),
            SignatureErrorInner::Invalid(_) => write!(f, "signature verification failed"),
        }
    }
}

impl Classify for SignatureError {
    fn kind(&self) -> ErrorKind {
        match self.0 {
            SignatureErrorInner::Empty
            | SignatureErrorInner::UnsupportedHashtype(_)
            | SignatureErrorInner::Der(_) => ErrorKind::UserInput,
            SignatureErrorInner::HighS | SignatureErrorInner::Invalid(_) => ErrorKind::CryptoFailure,
        }
    }
}

#[derive(Debug)]
pub struct PubKeyError(PubKeyErrorInner);

#[derive(Debug)]
enum PubKeyErrorInner {
    NotHex,
    BadLength(usize),
    NotAKey(secp256k1::Error),
}

impl fmt::Display for PubKeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            PubKeyErrorInner::NotHex => write!(f, "public key is not hex"),
            PubKeyErrorInner::BadLength(len) => write!(f, "public key is {} bytes, expected 33", len),
            PubKeyErrorInner::NotAKey(_) => write!(f, "bytes do not encode a curve point"),
        }
    }
}

impl Classify for PubKeyError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::UserInput
    }
}
