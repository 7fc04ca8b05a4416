//! Append-only audit trail.
//!
//! Every ceremony transition, signature submission, broadcast attempt and
//! LTV event lands here exactly once, with a strictly increasing id. The log
//! is the reference for post-hoc dispute forensics, so entries are never
//! mutated or deleted, and no secret material is ever written: the sanitiser
//! below is consulted by everything that logs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bitcoin::Txid;
use bitcoin::hashes::{sha256, Hash};

use crate::codec;
use crate::escrow::Role;
use crate::loan::LoanId;

/// Replacement for values whose field name matches the secret list.
pub const REDACTED: &str = "[redacted]";

/// Field names that must never appear with their value in logs or audit
/// entries. Matching is case-insensitive on substrings, so `der_signature`
/// and `userPassphrase` are both caught.
const SECRET_FIELDS: &[&str] = &["passphrase", "signature", "secret", "scalar", "privkey", "private_key", "seed"];

pub fn is_secret_field(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SECRET_FIELDS.iter().any(|secret| lower.contains(secret))
}

/// Returns the value to log for `field`.
pub fn redact<'a>(field: &str, value: &'a str) -> &'a str {
    if is_secret_field(field) {
        REDACTED
    } else {
        value
    }
}

/// What happened.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuditKind {
    LoanPosted = 0,
    LenderCommitted = 1,
    KeyRegistered = 2,
    AddressDerived = 3,
    FundingConfirmed = 4,
    TemplatesBuilt = 5,
    SignatureAccepted = 6,
    SignatureRejected = 7,
    OutcomeDecided = 8,
    BroadcastAttempted = 9,
    BroadcastSucceeded = 10,
    BroadcastFailed = 11,
    LtvThreshold = 12,
    StateChanged = 13,
    DisputeOpened = 14,
    AdminDecided = 15,
    ReleaseHalted = 16,
}

impl AuditKind {
    fn from_num(num: u8) -> Option<Self> {
        use AuditKind::*;
        [
            LoanPosted, LenderCommitted, KeyRegistered, AddressDerived, FundingConfirmed,
            TemplatesBuilt, SignatureAccepted, SignatureRejected, OutcomeDecided,
            BroadcastAttempted, BroadcastSucceeded, BroadcastFailed, LtvThreshold,
            StateChanged, DisputeOpened, AdminDecided, ReleaseHalted,
        ]
        .iter()
        .copied()
        .find(|kind| *kind as u8 == num)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::LoanPosted => "loan-posted",
            AuditKind::LenderCommitted => "lender-committed",
            AuditKind::KeyRegistered => "key-registered",
            AuditKind::AddressDerived => "address-derived",
            AuditKind::FundingConfirmed => "funding-confirmed",
            AuditKind::TemplatesBuilt => "templates-built",
            AuditKind::SignatureAccepted => "signature-accepted",
            AuditKind::SignatureRejected => "signature-rejected",
            AuditKind::OutcomeDecided => "outcome-decided",
            AuditKind::BroadcastAttempted => "broadcast-attempted",
            AuditKind::BroadcastSucceeded => "broadcast-succeeded",
            AuditKind::BroadcastFailed => "broadcast-failed",
            AuditKind::LtvThreshold => "ltv-threshold",
            AuditKind::StateChanged => "state-changed",
            AuditKind::DisputeOpened => "dispute-opened",
            AuditKind::AdminDecided => "admin-decided",
            AuditKind::ReleaseHalted => "release-halted",
        }
    }
}

/// One immutable line of the trail.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuditEntry {
    pub id: u64,
    pub kind: AuditKind,
    pub loan: LoanId,
    pub actor: Option<Role>,
    /// SHA-256 over the sanitised inputs of the transition.
    pub inputs_digest: [u8; 32],
    pub outcome: String,
    pub broadcast: Option<Txid>,
    pub at: u64,
}

impl AuditEntry {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        codec::RecordVersion::CURRENT.serialize(out);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.loan.to_be_bytes());
        out.push(match self.actor {
            None => 0,
            Some(Role::Borrower) => 1,
            Some(Role::Lender) => 2,
            Some(Role::Platform) => 3,
        });
        out.extend_from_slice(&self.inputs_digest);
        codec::write_bytes(out, self.outcome.as_bytes());
        match &self.broadcast {
            Some(txid) => {
                out.push(1);
                out.extend_from_slice(txid.as_ref());
            },
            None => out.push(0),
        }
        out.extend_from_slice(&self.at.to_be_bytes());
    }

    pub fn deserialize(bytes: &mut &[u8]) -> Result<Self, EntryDeserError> {
        let _version = codec::RecordVersion::deserialize(bytes)?;
        let id = codec::be::<u64>(bytes)?;
        let kind_byte = *bytes.first().ok_or(EntryDeserError::UnexpectedEnd)?;
        *bytes = &bytes[1..];
        let kind = AuditKind::from_num(kind_byte).ok_or(EntryDeserError::InvalidKind(kind_byte))?;
        let loan = codec::be::<u64>(bytes)?;
        let actor_byte = *bytes.first().ok_or(EntryDeserError::UnexpectedEnd)?;
        *bytes = &bytes[1..];
        let actor = match actor_byte {
            0 => None,
            1 => Some(Role::Borrower),
            2 => Some(Role::Lender),
            3 => Some(Role::Platform),
            other => return Err(EntryDeserError::InvalidActor(other)),
        };
        let inputs_digest = codec::array::<32>(bytes)?;
        let outcome = String::from_utf8(codec::read_bytes(bytes)?)
            .map_err(|_| EntryDeserError::InvalidOutcome)?;
        let broadcast_flag = *bytes.first().ok_or(EntryDeserError::UnexpectedEnd)?;
        *bytes = &bytes[1..];
        let broadcast = match broadcast_flag {
            0 => None,
            1 => Some(Txid::from_byte_array(codec::array::<32>(bytes)?)),
            other => return Err(EntryDeserError::InvalidActor(other)),
        };
        let at = codec::be::<u64>(bytes)?;
        Ok(AuditEntry { id, kind, loan, actor, inputs_digest, outcome, broadcast, at })
    }
}

#[derive(Debug)]
pub enum EntryDeserError {
    UnexpectedEnd,
    UnsupportedVersion(u32),
    InvalidKind(u8),
    InvalidActor(u8),
    InvalidOutcome,
}

impl From<codec::UnexpectedEnd> for EntryDeserError {
    fn from(_: codec::UnexpectedEnd) -> Self {
        EntryDeserError::UnexpectedEnd
    }
}

impl From<codec::RecordVersionError> for EntryDeserError {
    fn from(error: codec::RecordVersionError) -> Self {
        match error {
            codec::RecordVersionError::UnexpectedEnd => EntryDeserError::UnexpectedEnd,
            codec::RecordVersionError::UnsupportedVersion(version) => EntryDeserError::UnsupportedVersion(version),
        }
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for AuditKind {
    fn arbitrary(gen: &mut quickcheck::Gen) -> Self {
        let byte = <u8 as quickcheck::Arbitrary>::arbitrary(gen) % 17;
        AuditKind::from_num(byte).expect("all discriminants covered")
    }
}

crate::test_macros::impl_arbitrary!(
    AuditEntry,
    id,
    kind,
    loan,
    actor,
    inputs_digest,
    outcome,
    broadcast,
    at,
);

/// An entry before the log assigns its id.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub loan: LoanId,
    pub actor: Option<Role>,
    /// Raw inputs of the transition; only their digest is retained.
    pub inputs: Vec<u8>,
    pub outcome: String,
    pub broadcast: Option<Txid>,
    pub at: u64,
}

/// The append-only sink.
pub struct AuditLog {
    next_id: AtomicU64,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        AuditLog { next_id: AtomicU64::new(1), entries: Mutex::new(Vec::new()) }
    }

    pub fn append(&self, record: AuditRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = AuditEntry {
            id,
            kind: record.kind,
            loan: record.loan,
            actor: record.actor,
            inputs_digest: sha256::Hash::hash(&record.inputs).to_byte_array(),
            outcome: record.outcome,
            broadcast: record.broadcast,
            at: record.at,
        };
        self.entries.lock().unwrap().push(entry);
        id
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn entries_for(&self, loan: LoanId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.loan == loan)
            .cloned()
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        AuditLog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: AuditKind) -> AuditRecord {
        AuditRecord {
            kind,
            loan: 7,
            actor: Some(Role::Borrower),
            inputs: b"input".to_vec(),
            outcome: "ok".into(),
            broadcast: None,
            at: 1_700_000_000,
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let log = AuditLog::new();
        let a = log.append(record(AuditKind::LoanPosted));
        let b = log.append(record(AuditKind::LenderCommitted));
        let c = log.append(record(AuditKind::StateChanged));
        assert!(a < b && b < c);
        let entries = log.entries();
        assert!(entries.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn per_loan_filter() {
        let log = AuditLog::new();
        log.append(record(AuditKind::LoanPosted));
        let mut other = record(AuditKind::LoanPosted);
        other.loan = 8;
        log.append(other);
        assert_eq!(log.entries_for(7).len(), 1);
        assert_eq!(log.entries_for(8).len(), 1);
        assert_eq!(log.entries_for(9).len(), 0);
    }

    #[test]
    fn inputs_are_stored_as_digest_only() {
        let log = AuditLog::new();
        let mut secret_inputs = record(AuditKind::SignatureAccepted);
        secret_inputs.inputs = b"3045022100deadbeef".to_vec();
        log.append(secret_inputs);
        let entry = &log.entries()[0];
        assert_eq!(entry.inputs_digest, sha256::Hash::hash(b"3045022100deadbeef").to_byte_array());
    }

    #[test]
    fn secret_fields_redacted() {
        assert!(is_secret_field("passphrase"));
        assert!(is_secret_field("userPassphrase"));
        assert!(is_secret_field("der_signature"));
        assert!(is_secret_field("PRIVATE_KEY"));
        assert!(!is_secret_field("pubkey"));
        assert!(!is_secret_field("loan_id"));

        assert_eq!(redact("passphrase", "hunter2"), REDACTED);
        assert_eq!(redact("pubkey", "02abc"), "02abc");
    }

    quickcheck::quickcheck! {
        fn entry_roundtrips(entry: AuditEntry) -> bool {
            let mut bytes = Vec::new();
            entry.serialize(&mut bytes);
            let mut cursor = &*bytes;
            let decoded = AuditEntry::deserialize(&mut cursor).unwrap();
            decoded == entry && cursor.is_empty()
        }
    }

    #[test]
    fn garbage_entry_rejected() {
        let log = AuditLog::new();
        log.append(record(AuditKind::LoanPosted));
        let entry = log.entries().remove(0);
        let mut bytes = Vec::new();
        entry.serialize(&mut bytes);

        // flip the kind byte to an unassigned value
        bytes[12] = 0xee;
        assert!(AuditEntry::deserialize(&mut &*bytes).is_err());

        // truncation at every prefix must error, not panic
        for len in 0..bytes.len() {
            let _ = AuditEntry::deserialize(&mut &bytes[..len]);
        }
    }
}
