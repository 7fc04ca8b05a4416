//! Finalisation and broadcast of settlement transactions.
//!
//! On a repayment (or default/liquidation) signal the releaser asks the
//! outcome engine what to do, finalises the selected template from the vault
//! and pushes it to the chain, retrying with jittered exponential back-off.
//! An escrow UTXO that turns out to be already spent counts as success — the
//! money moved, which is the post-condition that matters.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use rand::Rng;
use slog::{info, warn};

use crate::audit::{AuditKind, AuditRecord};
use crate::ceremony::{CeremonyError, Coordinator};
use crate::chain::ChainError;
use crate::config::RetryPolicy;
use crate::error::Classify;
use crate::escrow::vault::{self, TemplateStatus};
use crate::loan::{LoanId, LoanState};
use crate::notify::{NotificationIntent, NotificationKind};
use crate::outcome::Outcome;

/// Sleep strategy, injected so tests and demos never block on real delays.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested delays instead of waiting.
pub struct RecordingSleeper(std::sync::Mutex<Vec<Duration>>);

impl RecordingSleeper {
    pub fn new() -> Self {
        RecordingSleeper(std::sync::Mutex::new(Vec::new()))
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.0.lock().unwrap().clone()
    }
}

impl Default for RecordingSleeper {
    fn default() -> Self {
        RecordingSleeper::new()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReleaseResult {
    Broadcast(Txid),
    /// The escrow UTXO was spent by a transaction we did not broadcast
    /// (e.g. a borrower-side recovery). Terminal success.
    AlreadySpent,
    /// The outcome engine selected no template.
    NoAction(Outcome),
}

pub struct Releaser {
    coordinator: Arc<Coordinator>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    log: slog::Logger,
}

impl Releaser {
    pub fn new(coordinator: Arc<Coordinator>, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>, log: slog::Logger) -> Self {
        Releaser { coordinator, policy, sleeper, log }
    }

    /// Consults the outcome engine and, if it selects a template, finalises
    /// and broadcasts it.
    pub fn release(&self, id: LoanId) -> Result<ReleaseResult, CeremonyError> {
        let coordinator = &self.coordinator;
        let facts = coordinator.facts(id)?;
        let outcome = crate::outcome::decide(&facts);
        coordinator.audit.append(AuditRecord {
            kind: AuditKind::OutcomeDecided,
            loan: id,
            actor: None,
            inputs: format!("{:?}", facts).into_bytes(),
            outcome: format!("{:?}", outcome),
            broadcast: None,
            at: coordinator.clock.now(),
        });
        let kind = match outcome.template() {
            Some(kind) => kind,
            None => return Ok(ReleaseResult::NoAction(outcome)),
        };

        let tx = coordinator.store.with_loan(id, |record| -> Result<bitcoin::Transaction, CeremonyError> {
            let keys = match (record.loan.borrower_pubkey, record.loan.lender_pubkey, record.loan.platform_pubkey) {
                (Some(b), Some(l), Some(p)) => crate::escrow::EscrowKeys::new(b, l, p)?,
                _ => return Err(CeremonyError::KeysIncomplete),
            };
            let entry = record
                .templates
                .get(&kind)
                .ok_or(CeremonyError::TemplatesNotBuilt)?;
            Ok(vault::finalize(entry, &keys)?)
        })??;
        let txid = tx.compute_txid();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            coordinator.audit.append(AuditRecord {
                kind: AuditKind::BroadcastAttempted,
                loan: id,
                actor: None,
                inputs: attempt.to_be_bytes().to_vec(),
                outcome: format!("{} attempt {}", kind, attempt),
                broadcast: Some(txid),
                at: coordinator.clock.now(),
            });
            let error = match coordinator.chain().broadcast(&tx) {
                Ok(txid) => {
                    self.settle(id, outcome, kind, txid)?;
                    return Ok(ReleaseResult::Broadcast(txid));
                },
                Err(ChainError::MempoolConflict) => {
                    // our own transaction already in flight counts as
                    // success; anything else spent the UTXO first
                    if coordinator.chain().tx_status(&txid).is_ok() {
                        self.settle(id, outcome, kind, txid)?;
                        return Ok(ReleaseResult::Broadcast(txid));
                    }
                    self.settle_spent_elsewhere(id, outcome)?;
                    return Ok(ReleaseResult::AlreadySpent);
                },
                Err(ChainError::Timeout) => {
                    // the send may have left the host; reconcile before
                    // counting the attempt as failed
                    match coordinator.chain().tx_status(&txid) {
                        Ok(_) => {
                            self.settle(id, outcome, kind, txid)?;
                            return Ok(ReleaseResult::Broadcast(txid));
                        },
                        Err(_) => ChainError::Timeout,
                    }
                },
                Err(error) => error,
            };

            warn!(self.log, "broadcast failed"; "loan" => id, "attempt" => attempt, "error" => %error);
            coordinator.audit.append(AuditRecord {
                kind: AuditKind::BroadcastFailed,
                loan: id,
                actor: None,
                inputs: Vec::new(),
                outcome: error.to_string(),
                broadcast: Some(txid),
                at: coordinator.clock.now(),
            });
            if attempt >= self.policy.max_attempts {
                return self.halt(id, attempt, error);
            }
            self.sleeper.sleep(self.backoff_delay(attempt));
        }
    }

    /// Delay before the next attempt: `initial × multiplier^(attempt-1)`,
    /// randomised by the jitter fraction both ways.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.initial_delay.as_secs_f64()
            * f64::from(self.policy.multiplier).powi(attempt as i32 - 1);
        let jitter = self.policy.jitter;
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64(base * factor)
    }

    fn settle(&self, id: LoanId, outcome: Outcome, kind: crate::escrow::TemplateKind, txid: Txid) -> Result<(), CeremonyError> {
        let coordinator = &self.coordinator;
        let (borrower, lender) = coordinator.store.with_loan(id, |record| {
            record.loan.release_txid = Some(txid);
            record.loan.release_error = None;
            for state in settle_states(outcome) {
                // transitions are idempotent; an already-passed station is a
                // no-op
                let _ = record.loan.transition(*state);
            }
            if let Some(entry) = record.templates.get_mut(&kind) {
                entry.status = TemplateStatus::Broadcast;
            }
            (record.loan.borrower_id, record.loan.lender_id)
        })?;
        coordinator.audit.append(AuditRecord {
            kind: AuditKind::BroadcastSucceeded,
            loan: id,
            actor: None,
            inputs: Vec::new(),
            outcome: format!("{:?} via {}", outcome, kind),
            broadcast: Some(txid),
            at: coordinator.clock.now(),
        });
        let at = coordinator.clock.now();
        let notification = match outcome {
            Outcome::CooperativeClose | Outcome::Cancellation | Outcome::Recovery => {
                Some(NotificationKind::CollateralReleased { txid })
            },
            Outcome::Default => Some(NotificationKind::LoanDefaulted { txid }),
            Outcome::Liquidation => Some(NotificationKind::LoanLiquidated { txid }),
            Outcome::UnderReview | Outcome::NoAction => None,
        };
        if let Some(kind) = notification {
            coordinator.outbox.push(NotificationIntent { loan: id, recipient: borrower, kind: kind.clone(), at });
            if matches!(outcome, Outcome::Default | Outcome::Liquidation) {
                if let Some(lender) = lender {
                    coordinator.outbox.push(NotificationIntent { loan: id, recipient: lender, kind, at });
                }
            }
        }
        info!(self.log, "settlement broadcast"; "loan" => id, "outcome" => format!("{:?}", outcome), "txid" => %txid);
        Ok(())
    }

    fn settle_spent_elsewhere(&self, id: LoanId, outcome: Outcome) -> Result<(), CeremonyError> {
        self.coordinator.store.with_loan(id, |record| {
            record.loan.release_error = Some("escrow utxo already spent".into());
            for state in settle_states(outcome) {
                let _ = record.loan.transition(*state);
            }
        })?;
        self.coordinator.audit.append(AuditRecord {
            kind: AuditKind::BroadcastSucceeded,
            loan: id,
            actor: None,
            inputs: Vec::new(),
            outcome: "escrow already spent elsewhere".into(),
            broadcast: None,
            at: self.coordinator.clock.now(),
        });
        Ok(())
    }

    fn halt(&self, id: LoanId, attempts: u32, error: ChainError) -> Result<ReleaseResult, CeremonyError> {
        let coordinator = &self.coordinator;
        let borrower = coordinator.store.with_loan(id, |record| {
            record.loan.release_error = Some(error.to_string());
            record.loan.borrower_id
        })?;
        coordinator.audit.append(AuditRecord {
            kind: AuditKind::ReleaseHalted,
            loan: id,
            actor: None,
            inputs: attempts.to_be_bytes().to_vec(),
            outcome: format!("halted after {} attempts: {}", attempts, error),
            broadcast: None,
            at: coordinator.clock.now(),
        });
        coordinator.outbox.push(NotificationIntent {
            loan: id,
            recipient: borrower,
            kind: NotificationKind::ReleaseFailed { attempts },
            at: coordinator.clock.now(),
        });
        warn!(self.log, "release halted for operator attention";
            "loan" => id, "attempts" => attempts, "kind" => error.kind().as_str());
        Err(CeremonyError::Chain(error))
    }
}

fn settle_states(outcome: Outcome) -> &'static [LoanState] {
    match outcome {
        Outcome::CooperativeClose => &[LoanState::Repaying, LoanState::Repaid, LoanState::Completed],
        Outcome::Default => &[LoanState::Defaulted],
        Outcome::Liquidation => &[LoanState::Liquidated],
        Outcome::Cancellation => &[LoanState::Cancelled],
        Outcome::Recovery => &[LoanState::Recovered],
        Outcome::UnderReview | Outcome::NoAction => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;

    use crate::ceremony::testutil::{activated_loan, harness, Harness, BORROWER_PASS};
    use crate::chain::BlockchainAdapter;
    use crate::escrow::TemplateKind;

    fn releaser_with(harness: &Harness, sleeper: Arc<dyn Sleeper>) -> Releaser {
        Releaser::new(
            Arc::clone(&harness.coordinator),
            harness.coordinator.config().broadcast_retry,
            sleeper,
            harness.coordinator.logger(),
        )
    }

    /// Moves the clock past the due date while keeping LTV healthy so the
    /// default rule, not the liquidation rule, fires.
    fn run_past_due(harness: &Harness) {
        harness.rates.set(8_100_000);
        harness.clock.advance(95 * 86_400);
    }

    #[test]
    fn default_pays_lender_entire_collateral() {
        let harness = harness();
        let (id, _, _) = activated_loan(&harness);
        run_past_due(&harness);

        let releaser = releaser_with(&harness, Arc::new(RecordingSleeper::new()));
        let result = releaser.release(id).unwrap();
        let txid = match result {
            ReleaseResult::Broadcast(txid) => txid,
            other => panic!("expected broadcast, got {:?}", other),
        };

        let loan = harness.coordinator.store().snapshot(id).unwrap();
        assert_eq!(loan.state, LoanState::Defaulted);
        assert_eq!(loan.release_txid, Some(txid));

        // debt at the opening price exceeded the collateral, so the default
        // template pays the lender everything minus the fee and the borrower
        // nothing
        let template = harness.coordinator.template(id, TemplateKind::Default).unwrap();
        assert_eq!(template.tx.output.len(), 1);
        assert_eq!(template.tx.output[0].value, Amount::from_sat(2_500_000 - 316));
    }

    #[test]
    fn retries_with_growing_backoff() {
        let harness = harness();
        let (id, _, _) = activated_loan(&harness);
        run_past_due(&harness);

        harness.chain.queue_broadcast_failure(ChainError::Network("down".into()));
        harness.chain.queue_broadcast_failure(ChainError::Network("still down".into()));

        let sleeper = Arc::new(RecordingSleeper::new());
        let releaser = releaser_with(&harness, sleeper.clone());
        assert!(matches!(releaser.release(id).unwrap(), ReleaseResult::Broadcast(_)));

        let slept = sleeper.slept();
        assert_eq!(slept.len(), 2);
        // 60s then 180s, each within the 20% jitter band
        assert!(slept[0] >= Duration::from_secs(48) && slept[0] <= Duration::from_secs(72));
        assert!(slept[1] >= Duration::from_secs(144) && slept[1] <= Duration::from_secs(216));
    }

    #[test]
    fn halts_after_attempt_cap() {
        let harness = harness();
        let (id, _, _) = activated_loan(&harness);
        run_past_due(&harness);

        for _ in 0..5 {
            harness.chain.queue_broadcast_failure(ChainError::Network("gone".into()));
        }
        let releaser = releaser_with(&harness, Arc::new(RecordingSleeper::new()));
        assert!(releaser.release(id).is_err());

        let loan = harness.coordinator.store().snapshot(id).unwrap();
        assert!(loan.release_error.is_some());
        // state untouched until an operator intervenes
        assert_eq!(loan.state, LoanState::Active);
        assert!(harness
            .coordinator
            .audit()
            .entries_for(id)
            .iter()
            .any(|entry| entry.kind == crate::audit::AuditKind::ReleaseHalted));
        assert!(harness
            .coordinator
            .outbox()
            .drain()
            .iter()
            .any(|intent| matches!(intent.kind, NotificationKind::ReleaseFailed { attempts: 5 })));
    }

    #[test]
    fn spent_escrow_counts_as_success() {
        let harness = harness();
        let coordinator = &harness.coordinator;
        let (id, _, _) = activated_loan(&harness);

        // borrower recovers unilaterally after the timelock
        let expiry = coordinator.store().snapshot(id).unwrap().timelock_expiry_block.unwrap();
        let tip = harness.chain.tip_height().unwrap();
        harness.chain.mine(expiry - tip + 1);
        coordinator.request_recovery(id, BORROWER_PASS).unwrap();

        // much later the platform tries the cooperative close
        coordinator.declare_fiat_confirmed(id).unwrap();
        coordinator.declare_repaid(id, crate::escrow::Role::Borrower).unwrap();
        let releaser = releaser_with(&harness, Arc::new(RecordingSleeper::new()));
        assert_eq!(releaser.release(id).unwrap(), ReleaseResult::AlreadySpent);
    }

    #[test]
    fn timeout_reconciles_through_tx_status() {
        let harness = harness();
        let (id, _, _) = activated_loan(&harness);
        run_past_due(&harness);

        harness.chain.queue_broadcast_failure(ChainError::Timeout);
        let sleeper = Arc::new(RecordingSleeper::new());
        let releaser = releaser_with(&harness, sleeper.clone());
        // status lookup finds nothing, so the timeout costs one attempt and
        // the retry succeeds
        assert!(matches!(releaser.release(id).unwrap(), ReleaseResult::Broadcast(_)));
        assert_eq!(sleeper.slept().len(), 1);
    }

    #[test]
    fn no_action_on_quiet_loan() {
        let harness = harness();
        let (id, _, _) = activated_loan(&harness);
        harness.rates.set(8_100_000);

        let releaser = releaser_with(&harness, Arc::new(RecordingSleeper::new()));
        assert_eq!(releaser.release(id).unwrap(), ReleaseResult::NoAction(Outcome::NoAction));
        assert!(harness.chain.broadcasts().is_empty());
    }
}
