//! The loan: the durable unit of coordination.
//!
//! A [`Loan`] carries the economic terms, the three registered public keys,
//! the on-chain state of the escrow and the lifecycle position. State only
//! ever moves forward along the edges of [`LoanState::permits`]; the single
//! sanctioned detour is the admin-triggered `UnderReview` branch.

use core::fmt;
use bitcoin::{Amount, ScriptBuf, Txid};
use secp256k1::PublicKey;

use crate::error::{Classify, ErrorKind};
use crate::outcome::{AdminDecision, LoanFacts};

pub type LoanId = u64;
pub type UserId = u64;

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Currency {
    Eur,
    Usd,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
        }
    }
}

/// Fiat value in minor units (cents) with its currency tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FiatAmount {
    pub cents: u64,
    pub currency: Currency,
}

impl fmt::Display for FiatAmount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:02} {}", self.cents / 100, self.cents % 100, self.currency.as_str())
    }
}

/// Economic terms fixed at posting time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoanTerms {
    pub principal: FiatAmount,
    /// Annual interest in basis points (5 % = 500).
    pub annual_rate_bps: u32,
    pub term_months: u32,
    /// Collateral the borrower must lock.
    pub collateral: Amount,
}

impl LoanTerms {
    /// Principal plus simple interest over the full term.
    pub fn debt(&self) -> FiatAmount {
        let interest = u128::from(self.principal.cents)
            * u128::from(self.annual_rate_bps)
            * u128::from(self.term_months)
            / (10_000 * 12);
        FiatAmount {
            cents: self.principal.cents + interest as u64,
            currency: self.principal.currency,
        }
    }

    /// Debt converted to satoshis at `price_cents` per whole bitcoin.
    pub fn debt_sats(&self, price_cents: u64) -> Amount {
        let debt = self.debt();
        let sats = u128::from(debt.cents) * 100_000_000 / u128::from(price_cents);
        Amount::from_sat(sats as u64)
    }

    pub fn term_seconds(&self) -> u64 {
        u64::from(self.term_months) * 30 * SECONDS_PER_DAY
    }
}

/// Loan-to-value in basis points given collateral and a spot price, `None`
/// when the collateral is zero.
pub fn ltv_bps(debt: FiatAmount, collateral: Amount, price_cents: u64) -> Option<u32> {
    let collateral_cents = u128::from(collateral.to_sat()) * u128::from(price_cents) / 100_000_000;
    if collateral_cents == 0 {
        return None;
    }
    let bps = u128::from(debt.cents) * 10_000 / collateral_cents;
    Some(bps.min(u128::from(u32::MAX)) as u32)
}

/// Lifecycle position of a loan.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LoanState {
    Draft,
    Posted,
    Committed,
    KeysRegistered,
    AwaitingDeposit,
    Funded,
    Active,
    Repaying,
    Repaid,
    Defaulted,
    Liquidated,
    Cancelled,
    Recovered,
    UnderReview,
    Completed,
}

impl LoanState {
    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn permits(self, to: LoanState) -> bool {
        use LoanState::*;

        matches!(
            (self, to),
            (Draft, Posted)
                | (Posted, Committed)
                | (Committed, KeysRegistered)
                | (KeysRegistered, AwaitingDeposit)
                | (AwaitingDeposit, Funded)
                | (Funded, Active)
                | (Active, Repaying)
                | (Active, Defaulted)
                | (Active, Liquidated)
                | (Active, Recovered)
                | (Active, UnderReview)
                | (Repaying, Repaid)
                | (Repaid, Completed)
                | (Defaulted, Completed)
                | (Liquidated, Completed)
                | (Recovered, Completed)
                // lender withdrawal before the loan activates
                | (Posted, Cancelled)
                | (Committed, Cancelled)
                | (KeysRegistered, Cancelled)
                | (AwaitingDeposit, Cancelled)
                | (Funded, Cancelled)
                // admin resolution of a review
                | (UnderReview, Repaying)
                | (UnderReview, Defaulted)
                | (UnderReview, Liquidated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoanState::Draft => "draft",
            LoanState::Posted => "posted",
            LoanState::Committed => "committed",
            LoanState::KeysRegistered => "keys-registered",
            LoanState::AwaitingDeposit => "awaiting-deposit",
            LoanState::Funded => "funded",
            LoanState::Active => "active",
            LoanState::Repaying => "repaying",
            LoanState::Repaid => "repaid",
            LoanState::Defaulted => "defaulted",
            LoanState::Liquidated => "liquidated",
            LoanState::Cancelled => "cancelled",
            LoanState::Recovered => "recovered",
            LoanState::UnderReview => "under-review",
            LoanState::Completed => "completed",
        }
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Loan {
    pub id: LoanId,
    pub terms: LoanTerms,
    pub borrower_id: UserId,
    pub lender_id: Option<UserId>,

    pub borrower_pubkey: Option<PublicKey>,
    pub lender_pubkey: Option<PublicKey>,
    pub platform_pubkey: Option<PublicKey>,
    pub witness_script: Option<ScriptBuf>,
    pub escrow_address: Option<bitcoin::Address>,

    /// Where borrower-bound template outputs pay to.
    pub borrower_payout: Option<ScriptBuf>,
    /// Where lender-bound template outputs pay to.
    pub lender_payout: Option<ScriptBuf>,

    pub funding_txid: Option<Txid>,
    pub funding_vout: Option<u32>,
    pub funding_height: Option<u32>,
    pub confirmed_collateral: Option<Amount>,
    pub release_txid: Option<Txid>,
    pub release_error: Option<String>,

    pub state: LoanState,

    pub requested_at: u64,
    pub funded_at: Option<u64>,
    pub due_at: Option<u64>,
    pub repaid_at: Option<u64>,
    pub timelock_expiry_block: Option<u32>,

    pub repaid_declared: bool,
    pub fiat_confirmed: bool,
    pub lender_cancelled: bool,
    pub dispute_open: bool,
    pub admin_decision: AdminDecision,

    /// LTV thresholds (bps) already signalled, for lifetime deduplication.
    pub ltv_signalled: Vec<u32>,
}

impl Loan {
    pub fn new(id: LoanId, borrower_id: UserId, terms: LoanTerms, requested_at: u64) -> Self {
        Loan {
            id,
            terms,
            borrower_id,
            lender_id: None,
            borrower_pubkey: None,
            lender_pubkey: None,
            platform_pubkey: None,
            witness_script: None,
            escrow_address: None,
            borrower_payout: None,
            lender_payout: None,
            funding_txid: None,
            funding_vout: None,
            funding_height: None,
            confirmed_collateral: None,
            release_txid: None,
            release_error: None,
            state: LoanState::Draft,
            requested_at,
            funded_at: None,
            due_at: None,
            repaid_at: None,
            timelock_expiry_block: None,
            repaid_declared: false,
            fiat_confirmed: false,
            lender_cancelled: false,
            dispute_open: false,
            admin_decision: AdminDecision::None,
            ltv_signalled: Vec::new(),
        }
    }

    /// Moves the loan to `to`.
    ///
    /// Idempotent: transitioning into the current state succeeds without
    /// mutation and reports `false`.
    pub fn transition(&mut self, to: LoanState) -> Result<bool, TransitionError> {
        if self.state == to {
            return Ok(false);
        }
        if !self.state.permits(to) {
            return Err(TransitionError { from: self.state, to });
        }
        self.state = to;
        Ok(true)
    }

    /// Snapshot consumed by the outcome engine.
    pub fn facts(&self, now: u64, ltv_bps: Option<u32>, liquidation_threshold_bps: u32, tip_height: u32) -> LoanFacts {
        LoanFacts {
            now,
            due_at: self.due_at.unwrap_or(u64::MAX),
            funded: self.funding_txid.is_some(),
            active: matches!(
                self.state,
                LoanState::Active | LoanState::Repaying | LoanState::UnderReview
            ),
            repaid_declared: self.repaid_declared,
            fiat_confirmed: self.fiat_confirmed,
            ltv_bps,
            liquidation_threshold_bps,
            dispute_open: self.dispute_open,
            timelock_expired: self
                .timelock_expiry_block
                .map(|expiry| tip_height >= expiry)
                .unwrap_or(false),
            collateral_released: self.release_txid.is_some(),
            lender_cancelled: self.lender_cancelled,
            admin_decision: self.admin_decision,
        }
    }
}

/// The lifecycle forbids the requested move.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransitionError {
    pub from: LoanState,
    pub to: LoanState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "loan cannot move from {} to {}", self.from, self.to)
    }
}

impl Classify for TransitionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::StateViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> LoanTerms {
        LoanTerms {
            principal: FiatAmount { cents: 100_000, currency: Currency::Eur },
            annual_rate_bps: 500,
            term_months: 3,
            collateral: Amount::from_sat(2_500_000),
        }
    }

    #[test]
    fn debt_accrues_simple_interest() {
        // 1000 EUR at 5 % for a quarter year is 1012.50 EUR
        assert_eq!(terms().debt().cents, 101_250);
    }

    #[test]
    fn debt_converts_to_sats() {
        // 1012.50 EUR at 25 000 EUR/BTC
        assert_eq!(terms().debt_sats(2_500_000), Amount::from_sat(4_050_000));
    }

    #[test]
    fn ltv_matches_hand_computation() {
        let debt = terms().debt();
        // collateral worth 625.00 EUR at 25 000 EUR/BTC -> LTV 162 %
        let ltv = ltv_bps(debt, Amount::from_sat(2_500_000), 2_500_000).unwrap();
        assert_eq!(ltv, 16_200);
        // at 81 000 EUR/BTC the same collateral is worth 2025 EUR -> 50 %
        let ltv = ltv_bps(debt, Amount::from_sat(2_500_000), 8_100_000).unwrap();
        assert_eq!(ltv, 5_000);
        assert_eq!(ltv_bps(debt, Amount::ZERO, 2_500_000), None);
    }

    #[test]
    fn happy_path_transitions() {
        let mut loan = Loan::new(1, 10, terms(), 0);
        for state in [
            LoanState::Posted,
            LoanState::Committed,
            LoanState::KeysRegistered,
            LoanState::AwaitingDeposit,
            LoanState::Funded,
            LoanState::Active,
            LoanState::Repaying,
            LoanState::Repaid,
            LoanState::Completed,
        ] {
            assert!(loan.transition(state).unwrap());
        }
    }

    #[test]
    fn transitions_are_idempotent() {
        let mut loan = Loan::new(1, 10, terms(), 0);
        assert!(loan.transition(LoanState::Posted).unwrap());
        assert!(!loan.transition(LoanState::Posted).unwrap());
        assert_eq!(loan.state, LoanState::Posted);
    }

    #[test]
    fn no_regression() {
        let mut loan = Loan::new(1, 10, terms(), 0);
        loan.transition(LoanState::Posted).unwrap();
        loan.transition(LoanState::Committed).unwrap();
        assert!(loan.transition(LoanState::Posted).is_err());
        assert!(loan.transition(LoanState::Draft).is_err());
    }

    #[test]
    fn review_branch_resolves_forward() {
        let mut loan = Loan::new(1, 10, terms(), 0);
        for state in [
            LoanState::Posted,
            LoanState::Committed,
            LoanState::KeysRegistered,
            LoanState::AwaitingDeposit,
            LoanState::Funded,
            LoanState::Active,
            LoanState::UnderReview,
            LoanState::Defaulted,
            LoanState::Completed,
        ] {
            assert!(loan.transition(state).unwrap());
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut loan = Loan::new(1, 10, terms(), 0);
        assert!(loan.transition(LoanState::Active).is_err());
        assert_eq!(loan.state, LoanState::Draft);
    }
}
