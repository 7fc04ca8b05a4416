//! Notification intents.
//!
//! The core never sends email. It records structured intents in an outbox; a
//! separate delivery component drains and renders them. Intents carry no
//! secret material — only identifiers and already-public on-chain facts.

use std::sync::Mutex;

use bitcoin::Txid;

use crate::loan::{LoanId, UserId};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NotificationKind {
    LoanActivated,
    LtvWarning { ltv_bps: u32, threshold_bps: u32 },
    CollateralReleased { txid: Txid },
    ReleaseFailed { attempts: u32 },
    LoanDefaulted { txid: Txid },
    LoanLiquidated { txid: Txid },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NotificationIntent {
    pub loan: LoanId,
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub at: u64,
}

/// Collects intents until the delivery component drains them.
pub struct Outbox {
    intents: Mutex<Vec<NotificationIntent>>,
}

impl Outbox {
    pub fn new() -> Self {
        Outbox { intents: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, intent: NotificationIntent) {
        self.intents.lock().unwrap().push(intent);
    }

    /// Removes and returns everything queued so far, in arrival order.
    pub fn drain(&self) -> Vec<NotificationIntent> {
        std::mem::take(&mut *self.intents.lock().unwrap())
    }

    pub fn pending(&self) -> usize {
        self.intents.lock().unwrap().len()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Outbox::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_in_order() {
        let outbox = Outbox::new();
        outbox.push(NotificationIntent {
            loan: 1,
            recipient: 10,
            kind: NotificationKind::LoanActivated,
            at: 100,
        });
        outbox.push(NotificationIntent {
            loan: 1,
            recipient: 10,
            kind: NotificationKind::LtvWarning { ltv_bps: 7_600, threshold_bps: 7_500 },
            at: 200,
        });
        assert_eq!(outbox.pending(), 2);
        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].at, 100);
        assert_eq!(outbox.pending(), 0);
    }
}
