//! The deterministic outcome engine.
//!
//! A pure total function from loan facts to the action the platform takes.
//! Keeping it side-effect free is what lets the dispute-resolution UI call it
//! to preview outcomes and what makes the rule order directly testable.

use crate::escrow::TemplateKind;

/// Resolution recorded by an administrator for a disputed loan.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AdminDecision {
    None,
    BorrowerNotDefaulted,
    BorrowerDefaulted,
    TimeoutDefault,
}

/// What the platform should do with a loan right now.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    CooperativeClose,
    Default,
    Liquidation,
    Cancellation,
    Recovery,
    /// A dispute is open; no transaction is broadcast until a human decides.
    UnderReview,
    NoAction,
}

impl Outcome {
    /// The spending template an outcome finalises, if any.
    pub fn template(self) -> Option<TemplateKind> {
        match self {
            Outcome::CooperativeClose => Some(TemplateKind::Repayment),
            Outcome::Default => Some(TemplateKind::Default),
            Outcome::Liquidation => Some(TemplateKind::Liquidation),
            // lender withdrew before activation, collateral returns home
            Outcome::Cancellation => Some(TemplateKind::Repayment),
            Outcome::Recovery => Some(TemplateKind::Recovery),
            Outcome::UnderReview | Outcome::NoAction => None,
        }
    }
}

/// Snapshot of everything the engine is allowed to look at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoanFacts {
    pub now: u64,
    pub due_at: u64,
    pub funded: bool,
    pub active: bool,
    pub repaid_declared: bool,
    pub fiat_confirmed: bool,
    /// Current loan-to-value in basis points; `None` when no fresh rate is
    /// available.
    pub ltv_bps: Option<u32>,
    pub liquidation_threshold_bps: u32,
    pub dispute_open: bool,
    pub timelock_expired: bool,
    pub collateral_released: bool,
    pub lender_cancelled: bool,
    pub admin_decision: AdminDecision,
}

#[cfg(test)]
impl quickcheck::Arbitrary for AdminDecision {
    fn arbitrary(gen: &mut quickcheck::Gen) -> Self {
        *gen.choose(&[
            AdminDecision::None,
            AdminDecision::BorrowerNotDefaulted,
            AdminDecision::BorrowerDefaulted,
            AdminDecision::TimeoutDefault,
        ])
        .unwrap()
    }
}

crate::test_macros::impl_arbitrary!(
    LoanFacts,
    now,
    due_at,
    funded,
    active,
    repaid_declared,
    fiat_confirmed,
    ltv_bps,
    liquidation_threshold_bps,
    dispute_open,
    timelock_expired,
    collateral_released,
    lender_cancelled,
    admin_decision,
);

/// Applies the rules in order; the first match wins.
pub fn decide(facts: &LoanFacts) -> Outcome {
    match facts.admin_decision {
        AdminDecision::BorrowerNotDefaulted => return Outcome::CooperativeClose,
        AdminDecision::BorrowerDefaulted => return Outcome::Default,
        AdminDecision::TimeoutDefault => return Outcome::Liquidation,
        AdminDecision::None => {},
    }
    if facts.dispute_open {
        return Outcome::UnderReview;
    }
    if facts.repaid_declared && facts.fiat_confirmed {
        return Outcome::CooperativeClose;
    }
    if facts.timelock_expired && !facts.collateral_released {
        return Outcome::Recovery;
    }
    if let Some(ltv) = facts.ltv_bps {
        if ltv >= facts.liquidation_threshold_bps {
            return Outcome::Liquidation;
        }
    }
    if facts.now > facts.due_at && !facts.repaid_declared {
        return Outcome::Default;
    }
    if facts.funded && !facts.active && facts.lender_cancelled {
        return Outcome::Cancellation;
    }
    Outcome::NoAction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_facts() -> LoanFacts {
        LoanFacts {
            now: 1_000,
            due_at: 2_000,
            funded: true,
            active: true,
            repaid_declared: false,
            fiat_confirmed: false,
            ltv_bps: Some(5_000),
            liquidation_threshold_bps: 9_500,
            dispute_open: false,
            timelock_expired: false,
            collateral_released: false,
            lender_cancelled: false,
            admin_decision: AdminDecision::None,
        }
    }

    quickcheck::quickcheck! {
        fn total_and_deterministic(facts: LoanFacts) -> bool {
            decide(&facts) == decide(&facts)
        }

        fn admin_decision_always_wins(facts: LoanFacts) -> bool {
            let mut facts = facts;
            facts.admin_decision = AdminDecision::BorrowerDefaulted;
            decide(&facts) == Outcome::Default
        }

        fn dispute_blocks_broadcast(facts: LoanFacts) -> bool {
            let mut facts = facts;
            facts.admin_decision = AdminDecision::None;
            facts.dispute_open = true;
            decide(&facts) == Outcome::UnderReview
        }
    }

    #[test]
    fn cooperative_close_needs_both_declarations() {
        let mut facts = quiet_facts();
        facts.repaid_declared = true;
        assert_eq!(decide(&facts), Outcome::NoAction);
        facts.fiat_confirmed = true;
        assert_eq!(decide(&facts), Outcome::CooperativeClose);
    }

    #[test]
    fn recovery_before_liquidation_and_default() {
        let mut facts = quiet_facts();
        facts.timelock_expired = true;
        facts.ltv_bps = Some(9_900);
        facts.now = 3_000;
        assert_eq!(decide(&facts), Outcome::Recovery);
        facts.collateral_released = true;
        assert_eq!(decide(&facts), Outcome::Liquidation);
    }

    #[test]
    fn ltv_spike_liquidates() {
        let mut facts = quiet_facts();
        facts.ltv_bps = Some(9_700);
        assert_eq!(decide(&facts), Outcome::Liquidation);
        // exactly at threshold counts
        facts.ltv_bps = Some(9_500);
        assert_eq!(decide(&facts), Outcome::Liquidation);
        // no fresh rate, no action on stale prices
        facts.ltv_bps = None;
        assert_eq!(decide(&facts), Outcome::NoAction);
    }

    #[test]
    fn overdue_without_repayment_defaults() {
        let mut facts = quiet_facts();
        facts.now = 2_001;
        assert_eq!(decide(&facts), Outcome::Default);
        facts.repaid_declared = true;
        assert_eq!(decide(&facts), Outcome::NoAction);
    }

    #[test]
    fn lender_cancellation_before_activation() {
        let mut facts = quiet_facts();
        facts.active = false;
        facts.lender_cancelled = true;
        assert_eq!(decide(&facts), Outcome::Cancellation);
        facts.active = true;
        assert_eq!(decide(&facts), Outcome::NoAction);
    }

    #[test]
    fn admin_decisions_map_to_templates() {
        let mut facts = quiet_facts();
        for (decision, outcome, template) in [
            (AdminDecision::BorrowerNotDefaulted, Outcome::CooperativeClose, TemplateKind::Repayment),
            (AdminDecision::BorrowerDefaulted, Outcome::Default, TemplateKind::Default),
            (AdminDecision::TimeoutDefault, Outcome::Liquidation, TemplateKind::Liquidation),
        ] {
            facts.admin_decision = decision;
            let decided = decide(&facts);
            assert_eq!(decided, outcome);
            assert_eq!(decided.template(), Some(template));
        }
    }
}
