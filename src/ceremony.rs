//! The loan ceremony coordinator.
//!
//! [`Coordinator`] is the input boundary of the core: the API layer calls it,
//! it drives the per-loan state machine, owns the escrow construction and the
//! signature collection, and records every transition in the audit log. All
//! mutations run inside the loan's critical section in [`crate::store`].
//!
//! The ceremony order is rigid on purpose:
//!
//! 1. keys are registered and checked pairwise distinct,
//! 2. the escrow address is derived and funded,
//! 3. only once funding has the configured confirmations are the four
//!    templates built — they commit to the funding outpoint — and
//! 4. signing starts, with the platform signing first through its abstract
//!    signer.

use core::fmt;
use std::sync::Arc;

use bitcoin::Txid;
use slog::{info, o, warn};

use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::chain::{BlockchainAdapter, ChainError, FeePriority};
use crate::config::Config;
use crate::crypto::{self, Signer, SignerUnavailable};
use crate::error::{Classify, ErrorKind};
use crate::escrow::templates::{self, BuildError, BuildParams, EscrowUtxo, Template};
use crate::escrow::vault::{self, PreSignedTemplate, SubmitOutcome, TemplateStatus, VaultError};
use crate::escrow::{script, EscrowKeys, KeyError, Role, TemplateKind};
use crate::keys::{self, DerivationError, DeriveRole};
use crate::loan::{Loan, LoanId, LoanState, LoanTerms, TransitionError, UserId};
use crate::monitor::{RateError, RateSource};
use crate::notify::{NotificationIntent, NotificationKind, Outbox};
use crate::outcome::{self, AdminDecision, Outcome};
use crate::store::{LoanStore, UnknownLoan};

/// Wall-clock source, unix seconds. Injected so tests can move time.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_secs()
    }
}

/// Settable clock for tests and simulations.
pub struct ManualClock(std::sync::atomic::AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        ManualClock(std::sync::atomic::AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The templates whose completion finishes the ceremony. Liquidation is
/// built and pre-signed with the rest but only the lender and platform are
/// party to it, so it completes on its own schedule.
const CEREMONY_TEMPLATES: [TemplateKind; 3] =
    [TemplateKind::Repayment, TemplateKind::Default, TemplateKind::Recovery];

pub struct Coordinator {
    pub(crate) store: Arc<LoanStore>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) outbox: Arc<Outbox>,
    chain: Arc<dyn BlockchainAdapter>,
    rates: Arc<dyn RateSource>,
    platform: Arc<dyn Signer>,
    pub(crate) clock: Arc<dyn Clock>,
    config: Config,
    log: slog::Logger,
}

impl Coordinator {
    pub fn new(
        config: Config,
        chain: Arc<dyn BlockchainAdapter>,
        rates: Arc<dyn RateSource>,
        platform: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        log: slog::Logger,
    ) -> Self {
        Coordinator {
            store: Arc::new(LoanStore::new()),
            audit: Arc::new(AuditLog::new()),
            outbox: Arc::new(Outbox::new()),
            chain,
            rates,
            platform,
            clock,
            config,
            log,
        }
    }

    pub fn store(&self) -> &Arc<LoanStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn chain(&self) -> &Arc<dyn BlockchainAdapter> {
        &self.chain
    }

    fn record(&self, kind: AuditKind, loan: LoanId, actor: Option<Role>, inputs: &[u8], outcome: String) {
        self.audit.append(AuditRecord {
            kind,
            loan,
            actor,
            inputs: inputs.to_vec(),
            outcome,
            broadcast: None,
            at: self.clock.now(),
        });
    }

    /// Creates and posts a loan offer.
    pub fn post_loan(&self, borrower: UserId, terms: LoanTerms) -> LoanId {
        let now = self.clock.now();
        let id = self.store.insert(|id| {
            let mut loan = Loan::new(id, borrower, terms, now);
            loan.transition(LoanState::Posted).expect("draft posts");
            loan
        });
        info!(self.log, "loan posted"; "loan" => id, "borrower" => borrower);
        self.record(AuditKind::LoanPosted, id, Some(Role::Borrower), &borrower.to_be_bytes(), format!("principal {}", terms.principal));
        id
    }

    /// A lender takes the offer.
    pub fn commit_lender(&self, id: LoanId, lender: UserId) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            if record.loan.lender_id == Some(lender) {
                return Ok(());
            }
            record.loan.transition(LoanState::Committed)?;
            record.loan.lender_id = Some(lender);
            Ok::<_, CeremonyError>(())
        })??;
        self.record(AuditKind::LenderCommitted, id, Some(Role::Lender), &lender.to_be_bytes(), "committed".into());
        Ok(())
    }

    /// Registers one party's escrow public key (hex, compressed).
    ///
    /// Once all three keys are present and pairwise distinct the loan moves
    /// to `KeysRegistered` and the keys become immutable.
    pub fn register_key(&self, id: LoanId, role: Role, pubkey_hex: &str) -> Result<(), CeremonyError> {
        let pubkey = crypto::pubkey_from_hex(pubkey_hex)?;
        self.store.with_loan(id, |record| {
            let loan = &mut record.loan;
            let slot = match role {
                Role::Borrower => &mut loan.borrower_pubkey,
                Role::Lender => &mut loan.lender_pubkey,
                Role::Platform => &mut loan.platform_pubkey,
            };
            match slot {
                Some(existing) if *existing == pubkey => return Ok(()),
                Some(_) => return Err(CeremonyError::KeysImmutable(role)),
                None => *slot = Some(pubkey),
            }
            if let (Some(borrower), Some(lender), Some(platform)) =
                (loan.borrower_pubkey, loan.lender_pubkey, loan.platform_pubkey)
            {
                // distinctness is enforced here; on failure the offending key
                // is dropped again so the party can correct it
                if let Err(error) = EscrowKeys::new(borrower, lender, platform) {
                    let slot = match role {
                        Role::Borrower => &mut loan.borrower_pubkey,
                        Role::Lender => &mut loan.lender_pubkey,
                        Role::Platform => &mut loan.platform_pubkey,
                    };
                    *slot = None;
                    return Err(error.into());
                }
                loan.transition(LoanState::KeysRegistered)?;
            }
            Ok(())
        })??;
        self.record(AuditKind::KeyRegistered, id, Some(role), pubkey_hex.as_bytes(), format!("{} key registered", role));
        Ok(())
    }

    /// Registers the platform's own key from its signer.
    pub fn register_platform_key(&self, id: LoanId) -> Result<(), CeremonyError> {
        let pubkey = self.platform.public_key();
        self.register_key(id, Role::Platform, &pubkey.to_string())
    }

    /// Sets where a party's template outputs pay to.
    pub fn register_payout(&self, id: LoanId, role: Role, address: &str) -> Result<(), CeremonyError> {
        let parsed = address
            .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
            .map_err(|_| CeremonyError::InvalidAddress)?
            .require_network(self.config.network.to_bitcoin())
            .map_err(|_| CeremonyError::InvalidAddress)?;
        let script = parsed.script_pubkey();
        self.store.with_loan(id, |record| match role {
            Role::Borrower => {
                record.loan.borrower_payout = Some(script);
                Ok(())
            },
            Role::Lender => {
                record.loan.lender_payout = Some(script);
                Ok(())
            },
            Role::Platform => Err(CeremonyError::InvalidAddress),
        })??;
        Ok(())
    }

    /// Derives the escrow address from the registered keys.
    pub fn derive_address(&self, id: LoanId) -> Result<(bitcoin::Address, bitcoin::ScriptBuf), CeremonyError> {
        let network = self.config.network;
        let (address, witness_script, fresh) = self.store.with_loan(id, |record| {
            let loan = &mut record.loan;
            let keys = escrow_keys(loan)?;
            let witness_script = script::witness_script(&keys);
            let address = script::address(&witness_script, network);
            if let Some(existing) = &loan.escrow_address {
                // escrow address is immutable once derived
                return Ok((existing.clone(), loan.witness_script.clone().expect("set with address"), false));
            }
            loan.transition(LoanState::AwaitingDeposit)?;
            loan.witness_script = Some(witness_script.clone());
            loan.escrow_address = Some(address.clone());
            Ok::<_, CeremonyError>((address, witness_script, true))
        })??;
        if fresh {
            self.record(AuditKind::AddressDerived, id, None, address.to_string().as_bytes(), address.to_string());
        }
        Ok((address, witness_script))
    }

    /// Records the funding hint from the borrower's wallet. The chain is
    /// still the authority; see [`Coordinator::confirm_funding`].
    pub fn declare_funding(&self, id: LoanId, txid: Txid, vout: u32) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            if record.loan.state != LoanState::AwaitingDeposit {
                return Err(CeremonyError::Transition(TransitionError {
                    from: record.loan.state,
                    to: LoanState::AwaitingDeposit,
                }));
            }
            info!(self.log, "funding declared"; "loan" => id, "txid" => %txid, "vout" => vout);
            Ok(())
        })??;
        Ok(())
    }

    /// Checks the chain for a sufficiently confirmed funding UTXO and, once
    /// found, builds and platform-signs the four templates.
    ///
    /// Returns `false` while the deposit is missing or under-confirmed; the
    /// loan stays in `AwaitingDeposit`.
    pub fn confirm_funding(&self, id: LoanId) -> Result<bool, CeremonyError> {
        let snapshot = self.store.snapshot(id)?;
        if snapshot.state == LoanState::Funded || snapshot.state == LoanState::Active {
            return Ok(true);
        }
        if snapshot.state != LoanState::AwaitingDeposit {
            return Err(CeremonyError::Transition(TransitionError {
                from: snapshot.state,
                to: LoanState::Funded,
            }));
        }
        let address = snapshot.escrow_address.clone().ok_or(CeremonyError::AddressNotDerived)?;

        let utxos = self.chain.get_utxos(&address)?;
        let required = snapshot.terms.collateral;
        let funding = utxos
            .iter()
            .find(|utxo| utxo.value >= required && utxo.confirmations >= self.config.confirmations_required);
        let funding = match funding {
            Some(utxo) => *utxo,
            None => return Ok(false),
        };
        let tip = self.chain.tip_height()?;
        let funding_height = tip + 1 - funding.confirmations;

        let price = self.rates.btc_price_cents(snapshot.terms.principal.currency)?;
        let fee_rate = self.chain.fee_rate(FeePriority::Normal);
        let min_fee_rate = self.chain.min_fee_rate();
        let now = self.clock.now();
        let grace_days = self.config.grace_period_days;

        let built = self.store.with_loan(id, |record| -> Result<Vec<(TemplateKind, TemplateStatus)>, CeremonyError> {
            let loan = &mut record.loan;
            if loan.state != LoanState::AwaitingDeposit {
                // raced with another confirmation; the first writer won
                return Ok(Vec::new());
            }
            let keys = escrow_keys(loan)?;
            let witness_script = loan.witness_script.clone().ok_or(CeremonyError::AddressNotDerived)?;
            let borrower_script = loan.borrower_payout.clone().ok_or(CeremonyError::MissingPayout(Role::Borrower))?;
            let lender_script = loan.lender_payout.clone().ok_or(CeremonyError::MissingPayout(Role::Lender))?;

            let lock_height = templates::recovery_lock_height(funding_height, loan.terms.term_months, grace_days);
            let params = BuildParams {
                utxo: EscrowUtxo { txid: funding.txid, vout: funding.vout, value: funding.value },
                witness_script,
                borrower_script,
                lender_script,
                fee_rate,
                min_fee_rate,
                debt: loan.terms.debt_sats(price),
                recovery_lock_height: lock_height,
            };
            let built = templates::build_all(&params)?;

            loan.funding_txid = Some(funding.txid);
            loan.funding_vout = Some(funding.vout);
            loan.funding_height = Some(funding_height);
            loan.confirmed_collateral = Some(funding.value);
            loan.funded_at = Some(now);
            loan.due_at = Some(now + loan.terms.term_seconds());
            loan.timelock_expiry_block = Some(lock_height);
            loan.transition(LoanState::Funded)?;

            let mut statuses = Vec::new();
            for template in built {
                let kind = template.kind;
                let mut entry = PreSignedTemplate::new(template);
                let signature = self.platform.sign(&entry.template.sighash)?;
                let wire = crypto::serialize_with_hashtype(&signature);
                vault::submit(&mut entry, &keys, Role::Platform, &keys.platform, &wire)?;
                statuses.push((kind, entry.status));
                record.templates.insert(kind, entry);
            }
            Ok(statuses)
        })??;

        if built.is_empty() {
            return Ok(true);
        }
        self.record(
            AuditKind::FundingConfirmed,
            id,
            None,
            funding.txid.as_ref(),
            format!("{} sats at {} confirmations", funding.value.to_sat(), funding.confirmations),
        );
        self.record(
            AuditKind::TemplatesBuilt,
            id,
            Some(Role::Platform),
            &[],
            format!("{} templates platform-signed", built.len()),
        );
        info!(self.log, "funding confirmed, templates built"; "loan" => id, "txid" => %funding.txid);
        Ok(true)
    }

    /// A party submits a signature for one template.
    pub fn submit_signature(
        &self,
        id: LoanId,
        kind: TemplateKind,
        role: Role,
        pubkey_hex: &str,
        der_sig_hex: &str,
    ) -> Result<SubmitOutcome, CeremonyError> {
        use bitcoin::hashes::hex::FromHex;

        let pubkey = crypto::pubkey_from_hex(pubkey_hex)?;
        let wire = Vec::<u8>::from_hex(der_sig_hex).map_err(|_| CeremonyError::InvalidSignatureHex)?;

        let result = self
            .store
            .with_loan(id, |record| -> Result<(SubmitOutcome, bool), CeremonyError> {
                let keys = escrow_keys(&record.loan)?;
                let entry = record
                    .templates
                    .get_mut(&kind)
                    .ok_or(CeremonyError::TemplatesNotBuilt)?;
                let outcome = vault::submit(entry, &keys, role, &pubkey, &wire)?;

                // the ceremony finishes when all three settlement templates
                // hold two role-distinct signatures
                let complete = CEREMONY_TEMPLATES.iter().all(|kind| {
                    record
                        .templates
                        .get(kind)
                        .map(|entry| entry.status == TemplateStatus::Complete)
                        .unwrap_or(false)
                });
                let activated = complete && record.loan.state == LoanState::Funded;
                if activated {
                    record.loan.transition(LoanState::Active)?;
                }
                Ok((outcome, activated))
            })
            .map_err(CeremonyError::from)
            .and_then(|inner| inner);

        match result {
            Ok((outcome, activated)) => {
                self.record(
                    AuditKind::SignatureAccepted,
                    id,
                    Some(role),
                    pubkey_hex.as_bytes(),
                    format!("{} now {:?}", kind, outcome),
                );
                if activated {
                    self.on_activated(id)?;
                }
                Ok(outcome)
            },
            Err(error) => {
                self.record(
                    AuditKind::SignatureRejected,
                    id,
                    Some(role),
                    pubkey_hex.as_bytes(),
                    format!("{}: {}", kind, error),
                );
                warn!(self.log, "signature rejected"; "loan" => id, "role" => role.as_str(),
                    "der_signature" => crate::audit::redact("der_signature", der_sig_hex),
                    "error" => %error);
                Err(error)
            },
        }
    }

    fn on_activated(&self, id: LoanId) -> Result<(), CeremonyError> {
        let loan = self.store.snapshot(id)?;
        self.record(AuditKind::StateChanged, id, None, &[], "active".into());
        self.outbox.push(NotificationIntent {
            loan: id,
            recipient: loan.borrower_id,
            kind: NotificationKind::LoanActivated,
            at: self.clock.now(),
        });
        info!(self.log, "ceremony complete, loan active"; "loan" => id);
        Ok(())
    }

    /// Borrower (or lender on their behalf) declares the fiat repayment sent.
    pub fn declare_repaid(&self, id: LoanId, by: Role) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            record.loan.repaid_declared = true;
            record.loan.repaid_at = Some(self.clock.now());
            // moving into Repaying is part of the declaration when active
            if record.loan.state == LoanState::Active {
                record.loan.transition(LoanState::Repaying)?;
            }
            Ok::<_, CeremonyError>(())
        })??;
        self.record(AuditKind::StateChanged, id, Some(by), &[], "repaid-declared".into());
        Ok(())
    }

    /// The lender confirms the fiat arrived.
    pub fn declare_fiat_confirmed(&self, id: LoanId) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            record.loan.fiat_confirmed = true;
        })?;
        self.record(AuditKind::StateChanged, id, Some(Role::Lender), &[], "fiat-confirmed".into());
        Ok(())
    }

    /// Lender withdraws before the loan activates.
    pub fn cancel_by_lender(&self, id: LoanId) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            record.loan.lender_cancelled = true;
            if record.loan.funding_txid.is_none() {
                // nothing on chain yet, the loan just ends
                record.loan.transition(LoanState::Cancelled)?;
            }
            Ok::<_, CeremonyError>(())
        })??;
        self.record(AuditKind::StateChanged, id, Some(Role::Lender), &[], "lender-cancelled".into());
        Ok(())
    }

    /// Opens a dispute; outcome decisions return `UnderReview` until an
    /// admin rules.
    pub fn open_dispute(&self, id: LoanId, by: Role) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            record.loan.dispute_open = true;
            if record.loan.state == LoanState::Active {
                record.loan.transition(LoanState::UnderReview)?;
            }
            Ok::<_, CeremonyError>(())
        })??;
        self.record(AuditKind::DisputeOpened, id, Some(by), &[], "dispute opened".into());
        Ok(())
    }

    /// Records the admin ruling for a disputed loan and closes the dispute.
    pub fn admin_decide(&self, id: LoanId, decision: AdminDecision) -> Result<(), CeremonyError> {
        self.store.with_loan(id, |record| {
            record.loan.admin_decision = decision;
            record.loan.dispute_open = false;
        })?;
        self.record(AuditKind::AdminDecided, id, None, &[], format!("{:?}", decision));
        Ok(())
    }

    /// Evaluates the outcome engine on current facts. Pure read; safe to
    /// poll.
    pub fn trigger_outcome(&self, id: LoanId) -> Result<Outcome, CeremonyError> {
        let facts = self.facts(id)?;
        Ok(outcome::decide(&facts))
    }

    /// Assembles the engine's fact tuple from the store, the chain tip and
    /// the freshest rate. A failing rate source yields `ltv_bps: None`, so
    /// stale prices can never trigger a liquidation.
    pub fn facts(&self, id: LoanId) -> Result<outcome::LoanFacts, CeremonyError> {
        let loan = self.store.snapshot(id)?;
        let tip = self.chain.tip_height()?;
        let ltv = match self.rates.btc_price_cents(loan.terms.principal.currency) {
            Ok(price) => {
                let collateral = loan.confirmed_collateral.unwrap_or(loan.terms.collateral);
                crate::loan::ltv_bps(loan.terms.debt(), collateral, price)
            },
            Err(error) => {
                warn!(self.log, "rate unavailable for facts"; "loan" => id, "error" => %error);
                None
            },
        };
        Ok(loan.facts(
            self.clock.now(),
            ltv,
            self.config.ltv_thresholds.liquidate_bps,
            tip,
        ))
    }

    /// Borrower-initiated recovery after the timelock.
    ///
    /// Re-derives the borrower's ephemeral key from the passphrase, signs the
    /// recovery template if their signature is not yet in the vault, and
    /// broadcasts the finalised transaction.
    pub fn request_recovery(&self, id: LoanId, passphrase: &[u8]) -> Result<Txid, CeremonyError> {
        let loan = self.store.snapshot(id)?;
        if loan.state == LoanState::Recovered {
            if let Some(txid) = loan.release_txid {
                return Ok(txid);
            }
        }
        let tip = self.chain.tip_height()?;
        let expiry = loan.timelock_expiry_block.ok_or(CeremonyError::TemplatesNotBuilt)?;
        if tip < expiry {
            return Err(CeremonyError::TimelockNotExpired { tip, expiry });
        }

        let iterations = self.config.pbkdf2_iterations;
        let registered = loan.borrower_pubkey.ok_or(CeremonyError::TemplatesNotBuilt)?;
        let wire = keys::with_derived(
            passphrase,
            id,
            loan.borrower_id,
            DeriveRole::Borrower,
            iterations,
            |key| {
                if key.public_key() != registered {
                    return Err(CeremonyError::WrongPassphrase);
                }
                let sighash = self.store.with_loan(id, |record| {
                    record
                        .templates
                        .get(&TemplateKind::Recovery)
                        .map(|entry| entry.template.sighash)
                        .ok_or(CeremonyError::TemplatesNotBuilt)
                })??;
                Ok(crypto::serialize_with_hashtype(&key.sign(&sighash)))
            },
        )??;

        let tx = self.store.with_loan(id, |record| -> Result<bitcoin::Transaction, CeremonyError> {
            let keys = escrow_keys(&record.loan)?;
            let entry = record
                .templates
                .get_mut(&TemplateKind::Recovery)
                .ok_or(CeremonyError::TemplatesNotBuilt)?;
            if entry.signature_for(Role::Borrower).is_none() {
                vault::submit(entry, &keys, Role::Borrower, &keys.borrower, &wire)?;
            }
            Ok(vault::finalize(entry, &keys)?)
        })??;

        let txid = self.chain.broadcast(&tx)?;
        self.store.with_loan(id, |record| {
            record.loan.release_txid = Some(txid);
            let _ = record.loan.transition(LoanState::Recovered);
            if let Some(entry) = record.templates.get_mut(&TemplateKind::Recovery) {
                entry.status = TemplateStatus::Broadcast;
            }
        })?;
        self.audit.append(AuditRecord {
            kind: AuditKind::BroadcastSucceeded,
            loan: id,
            actor: Some(Role::Borrower),
            inputs: Vec::new(),
            outcome: "recovery broadcast".into(),
            broadcast: Some(txid),
            at: self.clock.now(),
        });
        info!(self.log, "recovery broadcast"; "loan" => id, "txid" => %txid);
        Ok(txid)
    }

    /// Clone of a template entry, e.g. for a client that wants the PSBT.
    pub fn template(&self, id: LoanId, kind: TemplateKind) -> Result<Template, CeremonyError> {
        self.store.with_loan(id, |record| {
            record
                .templates
                .get(&kind)
                .map(|entry| entry.template.clone())
                .ok_or(CeremonyError::TemplatesNotBuilt)
        })?
    }

    pub fn logger(&self) -> slog::Logger {
        self.log.new(o!())
    }
}

fn escrow_keys(loan: &Loan) -> Result<EscrowKeys, CeremonyError> {
    match (loan.borrower_pubkey, loan.lender_pubkey, loan.platform_pubkey) {
        (Some(borrower), Some(lender), Some(platform)) => {
            Ok(EscrowKeys::new(borrower, lender, platform)?)
        },
        _ => Err(CeremonyError::KeysIncomplete),
    }
}

#[derive(Debug)]
pub enum CeremonyError {
    Unknown(UnknownLoan),
    Transition(TransitionError),
    Key(crypto::PubKeyError),
    Keys(KeyError),
    KeysIncomplete,
    KeysImmutable(Role),
    InvalidAddress,
    InvalidSignatureHex,
    AddressNotDerived,
    MissingPayout(Role),
    TemplatesNotBuilt,
    Vault(VaultError),
    Build(BuildError),
    Chain(ChainError),
    Derivation(DerivationError),
    WrongPassphrase,
    TimelockNotExpired { tip: u32, expiry: u32 },
    Rate(RateError),
    Signer(SignerUnavailable),
}

impl fmt::Display for CeremonyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CeremonyError::Unknown(error) => write!(f, "{}", error),
            CeremonyError::Transition(error) => write!(f, "{}", error),
            CeremonyError::Key(error) => write!(f, "{}", error),
            CeremonyError::Keys(error) => write!(f, "{}", error),
            CeremonyError::KeysIncomplete => write!(f, "not all three keys are registered"),
            CeremonyError::KeysImmutable(role) => {
                write!(f, "the {} key is registered and immutable", role)
            },
            CeremonyError::InvalidAddress => write!(f, "invalid address for this network"),
            CeremonyError::InvalidSignatureHex => write!(f, "signature is not hex"),
            CeremonyError::AddressNotDerived => write!(f, "escrow address not derived yet"),
            CeremonyError::MissingPayout(role) => write!(f, "no payout address for {}", role),
            CeremonyError::TemplatesNotBuilt => write!(f, "templates not built yet"),
            CeremonyError::Vault(error) => write!(f, "{}", error),
            CeremonyError::Build(error) => write!(f, "{}", error),
            CeremonyError::Chain(error) => write!(f, "{}", error),
            CeremonyError::Derivation(error) => write!(f, "{}", error),
            CeremonyError::WrongPassphrase => {
                write!(f, "passphrase does not reproduce the registered key")
            },
            CeremonyError::TimelockNotExpired { tip, expiry } => {
                write!(f, "recovery locked until block {} (tip {})", expiry, tip)
            },
            CeremonyError::Rate(error) => write!(f, "{}", error),
            CeremonyError::Signer(_) => write!(f, "platform signer unavailable"),
        }
    }
}

impl Classify for CeremonyError {
    fn kind(&self) -> ErrorKind {
        match self {
            CeremonyError::Unknown(error) => error.kind(),
            CeremonyError::Transition(error) => error.kind(),
            CeremonyError::Key(error) => error.kind(),
            CeremonyError::Keys(error) => error.kind(),
            CeremonyError::KeysIncomplete => ErrorKind::StateViolation,
            CeremonyError::KeysImmutable(_) => ErrorKind::Conflict,
            CeremonyError::InvalidAddress | CeremonyError::InvalidSignatureHex => ErrorKind::UserInput,
            CeremonyError::AddressNotDerived
            | CeremonyError::MissingPayout(_)
            | CeremonyError::TemplatesNotBuilt => ErrorKind::StateViolation,
            CeremonyError::Vault(error) => error.kind(),
            CeremonyError::Build(error) => error.kind(),
            CeremonyError::Chain(error) => error.kind(),
            CeremonyError::Derivation(error) => error.kind(),
            CeremonyError::WrongPassphrase => ErrorKind::CryptoFailure,
            CeremonyError::TimelockNotExpired { .. } => ErrorKind::StateViolation,
            CeremonyError::Rate(error) => error.kind(),
            CeremonyError::Signer(error) => error.kind(),
        }
    }
}

impl From<UnknownLoan> for CeremonyError {
    fn from(error: UnknownLoan) -> Self {
        CeremonyError::Unknown(error)
    }
}

impl From<TransitionError> for CeremonyError {
    fn from(error: TransitionError) -> Self {
        CeremonyError::Transition(error)
    }
}

impl From<crypto::PubKeyError> for CeremonyError {
    fn from(error: crypto::PubKeyError) -> Self {
        CeremonyError::Key(error)
    }
}

impl From<KeyError> for CeremonyError {
    fn from(error: KeyError) -> Self {
        CeremonyError::Keys(error)
    }
}

impl From<VaultError> for CeremonyError {
    fn from(error: VaultError) -> Self {
        CeremonyError::Vault(error)
    }
}

impl From<BuildError> for CeremonyError {
    fn from(error: BuildError) -> Self {
        CeremonyError::Build(error)
    }
}

impl From<ChainError> for CeremonyError {
    fn from(error: ChainError) -> Self {
        CeremonyError::Chain(error)
    }
}

impl From<DerivationError> for CeremonyError {
    fn from(error: DerivationError) -> Self {
        CeremonyError::Derivation(error)
    }
}

impl From<RateError> for CeremonyError {
    fn from(error: RateError) -> Self {
        CeremonyError::Rate(error)
    }
}

impl From<SignerUnavailable> for CeremonyError {
    fn from(error: SignerUnavailable) -> Self {
        CeremonyError::Signer(error)
    }
}
