//! LTV monitoring.
//!
//! A single timer-driven task walks the active loans, recomputes their
//! loan-to-value against a fresh spot price and emits at most one event per
//! (loan, threshold) over the loan's lifetime. At the liquidation threshold
//! it hands the loan to the [`crate::release::Releaser`].
//!
//! The monitor never acts on stale prices: if the rate source fails, the
//! cycle is skipped and the next tick tries again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use slog::{info, warn};

use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::ceremony::Clock;
use crate::config::LtvThresholds;
use crate::error::{Classify, ErrorKind};
use crate::loan::{self, LoanId, LoanState};
use crate::notify::{NotificationIntent, NotificationKind, Outbox};
use crate::release::Releaser;
use crate::store::LoanStore;

/// Source of the BTC spot price in fiat minor units per whole bitcoin.
///
/// Implementations wrap whatever oracle the deployment scrapes; the core
/// only requires that failures are reported rather than served stale.
pub trait RateSource: Send + Sync {
    fn btc_price_cents(&self, currency: loan::Currency) -> Result<u64, RateError>;
}

/// The rate source produced no usable price.
#[derive(Debug, Clone)]
pub struct RateError(pub String);

impl core::fmt::Display for RateError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "rate source failed: {}", self.0)
    }
}

impl Classify for RateError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::External
    }
}

/// Fixed price, for tests and the demo CLI.
pub struct FixedRate(Mutex<u64>);

impl FixedRate {
    pub fn new(price_cents: u64) -> Self {
        FixedRate(Mutex::new(price_cents))
    }

    pub fn set(&self, price_cents: u64) {
        *self.0.lock().unwrap() = price_cents;
    }
}

impl RateSource for FixedRate {
    fn btc_price_cents(&self, _currency: loan::Currency) -> Result<u64, RateError> {
        Ok(*self.0.lock().unwrap())
    }
}

/// Severity of a threshold crossing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LtvSeverity {
    Warn1,
    Warn2,
    Liquidate,
}

impl LtvSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            LtvSeverity::Warn1 => "warn-1",
            LtvSeverity::Warn2 => "warn-2",
            LtvSeverity::Liquidate => "liquidate",
        }
    }
}

/// Emitted once per (loan, threshold); never mutated afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LtvEvent {
    pub loan: LoanId,
    pub severity: LtvSeverity,
    pub price_cents: u64,
    pub ltv_bps: u32,
    pub at: u64,
}

pub struct LtvMonitor {
    store: Arc<LoanStore>,
    rates: Arc<dyn RateSource>,
    releaser: Arc<Releaser>,
    audit: Arc<AuditLog>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    thresholds: LtvThresholds,
    subscribers: Mutex<Vec<Sender<LtvEvent>>>,
    log: slog::Logger,
}

impl LtvMonitor {
    pub fn new(
        store: Arc<LoanStore>,
        rates: Arc<dyn RateSource>,
        releaser: Arc<Releaser>,
        audit: Arc<AuditLog>,
        outbox: Arc<Outbox>,
        clock: Arc<dyn Clock>,
        thresholds: LtvThresholds,
        log: slog::Logger,
    ) -> Self {
        LtvMonitor {
            store,
            rates,
            releaser,
            audit,
            outbox,
            clock,
            thresholds,
            subscribers: Mutex::new(Vec::new()),
            log,
        }
    }

    /// Registers a channel that receives every emitted event.
    pub fn subscribe(&self, sender: Sender<LtvEvent>) {
        self.subscribers.lock().unwrap().push(sender);
    }

    /// One monitoring pass over all loans. Returns the events emitted.
    pub fn tick(&self) -> Vec<LtvEvent> {
        let mut emitted = Vec::new();
        for id in self.store.loan_ids() {
            // Snapshot outside the lock to decide cheaply, re-check inside.
            let snapshot = match self.store.snapshot(id) {
                Ok(loan) => loan,
                Err(_) => continue,
            };
            if snapshot.state != LoanState::Active {
                continue;
            }
            let price = match self.rates.btc_price_cents(snapshot.terms.principal.currency) {
                Ok(price) => price,
                Err(error) => {
                    warn!(self.log, "rate source unavailable, skipping cycle"; "error" => %error);
                    return emitted;
                },
            };
            let collateral = snapshot.confirmed_collateral.unwrap_or(snapshot.terms.collateral);
            let ltv = match loan::ltv_bps(snapshot.terms.debt(), collateral, price) {
                Some(ltv) => ltv,
                None => continue,
            };
            for (threshold, severity) in [
                (self.thresholds.warn1_bps, LtvSeverity::Warn1),
                (self.thresholds.warn2_bps, LtvSeverity::Warn2),
                (self.thresholds.liquidate_bps, LtvSeverity::Liquidate),
            ] {
                if ltv < threshold {
                    continue;
                }
                let fresh = self
                    .store
                    .with_loan(id, |record| {
                        if record.loan.ltv_signalled.contains(&threshold) {
                            false
                        } else {
                            record.loan.ltv_signalled.push(threshold);
                            true
                        }
                    })
                    .unwrap_or(false);
                if !fresh {
                    continue;
                }
                let event = LtvEvent {
                    loan: id,
                    severity,
                    price_cents: price,
                    ltv_bps: ltv,
                    at: self.clock.now(),
                };
                self.emit(&snapshot, event, threshold);
                emitted.push(event);
                if severity == LtvSeverity::Liquidate {
                    if let Err(error) = self.releaser.release(id) {
                        warn!(self.log, "liquidation release failed"; "loan" => id, "error" => %error);
                    }
                }
            }
        }
        emitted
    }

    fn emit(&self, loan: &loan::Loan, event: LtvEvent, threshold: u32) {
        info!(self.log, "ltv threshold crossed";
            "loan" => event.loan, "severity" => event.severity.as_str(), "ltv_bps" => event.ltv_bps);
        self.audit.append(AuditRecord {
            kind: AuditKind::LtvThreshold,
            loan: event.loan,
            actor: None,
            inputs: event.ltv_bps.to_be_bytes().to_vec(),
            outcome: format!("{} at {} bps", event.severity.as_str(), event.ltv_bps),
            broadcast: None,
            at: event.at,
        });
        self.outbox.push(NotificationIntent {
            loan: event.loan,
            recipient: loan.borrower_id,
            kind: NotificationKind::LtvWarning { ltv_bps: event.ltv_bps, threshold_bps: threshold },
            at: event.at,
        });
        self.subscribers
            .lock()
            .unwrap()
            .retain(|sender| sender.send(event).is_ok());
    }

    /// Spawns the timer loop. The task polls every `interval` until the
    /// returned handle is stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> MonitorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let monitor = Arc::clone(&self);
        let thread = std::thread::Builder::new()
            .name("ltv-monitor".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    monitor.tick();
                    // coarse sleep; shutdown latency is bounded by 250ms
                    let mut remaining = interval;
                    while !remaining.is_zero() && !stop_flag.load(Ordering::Relaxed) {
                        let step = remaining.min(Duration::from_millis(250));
                        std::thread::sleep(step);
                        remaining = remaining.saturating_sub(step);
                    }
                }
            })
            .expect("failed to spawn monitor thread");
        MonitorHandle { stop, thread: Some(thread) }
    }
}

pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::ceremony::testutil::{activated_loan, harness, Harness};
    use crate::escrow::TemplateKind;
    use crate::release::{RecordingSleeper, Releaser};

    fn monitor_for(harness: &Harness, rates: Arc<dyn RateSource>) -> LtvMonitor {
        let coordinator = &harness.coordinator;
        let releaser = Arc::new(Releaser::new(
            Arc::clone(coordinator),
            coordinator.config().broadcast_retry,
            Arc::new(RecordingSleeper::new()),
            coordinator.logger(),
        ));
        LtvMonitor::new(
            Arc::clone(coordinator.store()),
            rates,
            releaser,
            Arc::clone(coordinator.audit()),
            Arc::clone(coordinator.outbox()),
            Arc::clone(&harness.clock) as Arc<dyn crate::ceremony::Clock>,
            coordinator.config().ltv_thresholds,
            coordinator.logger(),
        )
    }

    #[test]
    fn thresholds_fire_once_and_liquidation_delegates() {
        let harness = harness();
        // healthy opening price so activation leaves LTV at 50%
        harness.rates.set(8_100_000);
        let (id, _, _) = activated_loan(&harness);
        let monitor = monitor_for(&harness, harness.rates.clone());
        let (sender, receiver) = mpsc::channel();
        monitor.subscribe(sender);

        assert!(monitor.tick().is_empty());

        // drop toward the first warning band (LTV ~79%)
        harness.rates.set(5_100_000);
        let events = monitor.tick();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, LtvSeverity::Warn1);
        assert_eq!(receiver.try_recv().unwrap(), events[0]);

        // same price again: the threshold already signalled, nothing emitted
        assert!(monitor.tick().is_empty());
        assert!(receiver.try_recv().is_err());

        // crash through warn-2 and the liquidation threshold (LTV ~97%)
        harness.rates.set(4_175_000);
        let events = monitor.tick();
        let severities: Vec<LtvSeverity> = events.iter().map(|event| event.severity).collect();
        assert_eq!(severities, vec![LtvSeverity::Warn2, LtvSeverity::Liquidate]);

        // liquidation went out through the releaser
        let loan = harness.coordinator.store().snapshot(id).unwrap();
        assert_eq!(loan.state, LoanState::Liquidated);
        let template = harness.coordinator.template(id, TemplateKind::Liquidation).unwrap();
        assert_eq!(loan.release_txid, Some(template.txid));
        assert!(harness.chain.broadcasts().contains(&template.txid));
    }

    #[test]
    fn rate_outage_skips_cycle_without_acting() {
        struct DownSource;

        impl RateSource for DownSource {
            fn btc_price_cents(&self, _currency: loan::Currency) -> Result<u64, RateError> {
                Err(RateError("scraper offline".into()))
            }
        }

        let harness = harness();
        harness.rates.set(8_100_000);
        let (id, _, _) = activated_loan(&harness);

        let monitor = monitor_for(&harness, Arc::new(DownSource));
        assert!(monitor.tick().is_empty());
        assert_eq!(harness.coordinator.store().snapshot(id).unwrap().state, LoanState::Active);
        assert!(harness.chain.broadcasts().is_empty());
    }

    #[test]
    fn inactive_loans_are_ignored() {
        let harness = harness();
        harness.rates.set(8_100_000);
        let coordinator = &harness.coordinator;
        // posted but never funded
        let id = coordinator.post_loan(crate::ceremony::testutil::BORROWER, crate::ceremony::testutil::terms());

        let monitor = monitor_for(&harness, harness.rates.clone());
        harness.rates.set(1_000);
        assert!(monitor.tick().is_empty());
        assert_eq!(coordinator.store().snapshot(id).unwrap().state, LoanState::Posted);
    }
}
