//! Collection and verification of partial signatures.
//!
//! No signature enters the vault without passing full ECDSA verification
//! against the registered key and the template's precomputed sighash. The
//! vault therefore only ever holds signatures that will satisfy the script,
//! and `finalize` cannot produce an invalid witness from vault state.

use core::fmt;
use bitcoin::{Transaction, Witness};
use secp256k1::PublicKey;
use secp256k1::ecdsa::Signature;

use super::{templates::Template, EscrowKeys, Role};
use crate::crypto;
use crate::error::{Classify, ErrorKind};

/// Signing progress of one template.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TemplateStatus {
    Pending,
    BorrowerSigned,
    LenderSigned,
    PlatformSigned,
    /// Two role-distinct verified signatures are stored; the template can be
    /// finalised at any time.
    Complete,
    Broadcast,
    Failed,
}

impl TemplateStatus {
    fn accepts_signatures(self) -> bool {
        matches!(
            self,
            TemplateStatus::Pending
                | TemplateStatus::BorrowerSigned
                | TemplateStatus::LenderSigned
                | TemplateStatus::PlatformSigned
        )
    }
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TemplateStatus::Pending => "pending",
            TemplateStatus::BorrowerSigned => "borrower-signed",
            TemplateStatus::LenderSigned => "lender-signed",
            TemplateStatus::PlatformSigned => "platform-signed",
            TemplateStatus::Complete => "complete",
            TemplateStatus::Broadcast => "broadcast",
            TemplateStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A verified signature tagged with its role. Immutable once stored.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartialSignature {
    pub role: Role,
    pub pubkey: PublicKey,
    pub signature: Signature,
}

/// A template together with its collected signatures.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PreSignedTemplate {
    pub template: Template,
    pub signatures: Vec<PartialSignature>,
    pub status: TemplateStatus,
}

impl PreSignedTemplate {
    pub fn new(template: Template) -> Self {
        PreSignedTemplate {
            template,
            signatures: Vec::new(),
            status: TemplateStatus::Pending,
        }
    }

    pub fn signature_for(&self, role: Role) -> Option<&PartialSignature> {
        self.signatures.iter().find(|sig| sig.role == role)
    }

    fn distinct_roles(&self) -> usize {
        let mut roles: Vec<Role> = self.signatures.iter().map(|sig| sig.role).collect();
        roles.sort();
        roles.dedup();
        roles.len()
    }
}

/// Result of a submission, distinguishing fresh stores from idempotent
/// replays.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubmitOutcome {
    Stored(TemplateStatus),
    /// The identical signature was already present; nothing changed.
    AlreadyStored(TemplateStatus),
}

/// Verifies and stores a partial signature.
///
/// `der_with_hashtype` is the wire form: DER followed by the 0x01 SIGHASH_ALL
/// byte.
pub fn submit(
    entry: &mut PreSignedTemplate,
    keys: &EscrowKeys,
    role: Role,
    pubkey: &PublicKey,
    der_with_hashtype: &[u8],
) -> Result<SubmitOutcome, VaultError> {
    if keys.key_for(role) != pubkey {
        return Err(VaultError(VaultErrorInner::RoleKeyMismatch(role)));
    }
    let signature = crypto::parse_der_with_hashtype(der_with_hashtype)
        .map_err(|error| VaultError(VaultErrorInner::Signature(error)))?;

    if let Some(existing) = entry.signature_for(role) {
        if existing.signature == signature {
            return Ok(SubmitOutcome::AlreadyStored(entry.status));
        }
        return Err(VaultError(VaultErrorInner::ConflictingResubmission(role)));
    }
    if !entry.status.accepts_signatures() {
        return Err(VaultError(VaultErrorInner::NotSignable(entry.status)));
    }

    crypto::verify(pubkey, &entry.template.sighash, &signature)
        .map_err(|error| VaultError(VaultErrorInner::Signature(error)))?;

    entry.signatures.push(PartialSignature { role, pubkey: *pubkey, signature });
    entry.status = if entry.distinct_roles() >= 2 {
        TemplateStatus::Complete
    } else {
        match role {
            Role::Borrower => TemplateStatus::BorrowerSigned,
            Role::Lender => TemplateStatus::LenderSigned,
            Role::Platform => TemplateStatus::PlatformSigned,
        }
    };
    Ok(SubmitOutcome::Stored(entry.status))
}

/// Assembles the broadcastable transaction from a `Complete` template.
///
/// CHECKMULTISIG pops signatures in script key order, so the witness carries
/// the two signatures whose keys sort first (BIP-67) among the signing set,
/// in that order, below the witness script and above the off-by-one empty
/// element.
pub fn finalize(entry: &PreSignedTemplate, keys: &EscrowKeys) -> Result<Transaction, VaultError> {
    if entry.status != TemplateStatus::Complete {
        return Err(VaultError(VaultErrorInner::NotComplete(entry.status)));
    }

    let mut chosen: Vec<&PartialSignature> = entry.signatures.iter().collect();
    chosen.sort_by_key(|sig| keys.script_position(sig.role));
    if chosen.len() < 2 {
        return Err(VaultError(VaultErrorInner::MissingSignature));
    }
    chosen.truncate(2);

    let mut witness = Witness::new();
    witness.push(&[] as &[u8]);
    for sig in &chosen {
        witness.push(crypto::serialize_with_hashtype(&sig.signature));
    }
    witness.push(crate::escrow::script::witness_script(keys).as_bytes());

    let mut tx = entry.template.tx.clone();
    tx.input[0].witness = witness;

    // Policy check: the realised vsize must not exceed what the fee was
    // estimated for, or the effective rate silently drops below the request.
    let outputs = tx.output.len() as u64;
    let budget = 11 + 104 + 43 * outputs;
    let vsize = tx.vsize() as u64;
    if vsize > budget {
        return Err(VaultError(VaultErrorInner::OversizeTransaction { vsize, budget }));
    }
    Ok(tx)
}

#[derive(Debug)]
pub struct VaultError(VaultErrorInner);

#[derive(Debug)]
enum VaultErrorInner {
    RoleKeyMismatch(Role),
    Signature(crypto::SignatureError),
    ConflictingResubmission(Role),
    NotSignable(TemplateStatus),
    NotComplete(TemplateStatus),
    MissingSignature,
    OversizeTransaction { vsize: u64, budget: u64 },
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            VaultErrorInner::RoleKeyMismatch(role) => {
                write!(f, "submitted key is not the registered {} key", role)
            },
            VaultErrorInner::Signature(error) => write!(f, "{}", error),
            VaultErrorInner::ConflictingResubmission(role) => {
                write!(f, "a different {} signature is already stored", role)
            },
            VaultErrorInner::NotSignable(status) => {
                write!(f, "template in status {} does not accept signatures", status)
            },
            VaultErrorInner::NotComplete(status) => {
                write!(f, "cannot finalize template in status {}", status)
            },
            VaultErrorInner::MissingSignature => write!(f, "fewer than two signatures stored"),
            VaultErrorInner::OversizeTransaction { vsize, budget } => {
                write!(f, "finalized transaction is {} vbytes, budget {}", vsize, budget)
            },
        }
    }
}

impl Classify for VaultError {
    fn kind(&self) -> ErrorKind {
        match &self.0 {
            VaultErrorInner::RoleKeyMismatch(_) => ErrorKind::UserInput,
            VaultErrorInner::Signature(error) => error.kind(),
            VaultErrorInner::ConflictingResubmission(_) => ErrorKind::Conflict,
            VaultErrorInner::NotSignable(_) | VaultErrorInner::NotComplete(_) => ErrorKind::StateViolation,
            VaultErrorInner::MissingSignature | VaultErrorInner::OversizeTransaction { .. } => ErrorKind::Internal,
        }
    }
}
