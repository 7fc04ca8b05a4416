//! The loan store: source of truth and serialisation point.
//!
//! Mutations of a loan, its templates or its signatures all happen inside
//! [`LoanStore::with_loan`], which holds that loan's lock for the duration of
//! the closure. Loans are independent: operations on different loans run in
//! parallel, operations on the same loan are totally ordered.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Classify, ErrorKind};
use crate::escrow::vault::PreSignedTemplate;
use crate::escrow::TemplateKind;
use crate::loan::{Loan, LoanId, LoanState};

/// A loan and everything it exclusively owns.
#[derive(Debug, Clone)]
pub struct LoanRecord {
    pub loan: Loan,
    pub templates: BTreeMap<TemplateKind, PreSignedTemplate>,
}

pub struct LoanStore {
    next_id: AtomicU64,
    loans: RwLock<HashMap<LoanId, Arc<Mutex<LoanRecord>>>>,
}

impl LoanStore {
    pub fn new() -> Self {
        LoanStore {
            next_id: AtomicU64::new(1),
            loans: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates an id and stores the loan `make` builds for it.
    pub fn insert(&self, make: impl FnOnce(LoanId) -> Loan) -> LoanId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = LoanRecord { loan: make(id), templates: BTreeMap::new() };
        self.loans.write().unwrap().insert(id, Arc::new(Mutex::new(record)));
        id
    }

    /// Runs `f` inside the loan's critical section.
    pub fn with_loan<R>(&self, id: LoanId, f: impl FnOnce(&mut LoanRecord) -> R) -> Result<R, UnknownLoan> {
        let cell = self
            .loans
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(UnknownLoan(id))?;
        let mut record = cell.lock().unwrap();
        Ok(f(&mut record))
    }

    /// Clone of the loan taken under its lock.
    pub fn snapshot(&self, id: LoanId) -> Result<Loan, UnknownLoan> {
        self.with_loan(id, |record| record.loan.clone())
    }

    pub fn loan_ids(&self) -> Vec<LoanId> {
        let mut ids: Vec<LoanId> = self.loans.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Removes a loan and, by ownership, its templates and signatures.
    /// Allowed only while the loan is still a draft.
    pub fn delete(&self, id: LoanId) -> Result<(), DeleteError> {
        let mut loans = self.loans.write().unwrap();
        let cell = loans.get(&id).ok_or(DeleteError::Unknown(UnknownLoan(id)))?;
        let state = cell.lock().unwrap().loan.state;
        if state != LoanState::Draft {
            return Err(DeleteError::NotDraft(state));
        }
        loans.remove(&id);
        Ok(())
    }
}

impl Default for LoanStore {
    fn default() -> Self {
        LoanStore::new()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnknownLoan(pub LoanId);

impl core::fmt::Display for UnknownLoan {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "unknown loan {}", self.0)
    }
}

impl Classify for UnknownLoan {
    fn kind(&self) -> ErrorKind {
        ErrorKind::UserInput
    }
}

#[derive(Debug)]
pub enum DeleteError {
    Unknown(UnknownLoan),
    NotDraft(LoanState),
}

impl Classify for DeleteError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeleteError::Unknown(error) => error.kind(),
            DeleteError::NotDraft(_) => ErrorKind::StateViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;

    use crate::loan::{Currency, FiatAmount, LoanTerms};

    fn terms() -> LoanTerms {
        LoanTerms {
            principal: FiatAmount { cents: 100_000, currency: Currency::Eur },
            annual_rate_bps: 500,
            term_months: 3,
            collateral: Amount::from_sat(2_500_000),
        }
    }

    #[test]
    fn ids_allocate_sequentially() {
        let store = LoanStore::new();
        let a = store.insert(|id| Loan::new(id, 10, terms(), 0));
        let b = store.insert(|id| Loan::new(id, 11, terms(), 0));
        assert!(a < b);
        assert_eq!(store.loan_ids(), vec![a, b]);
    }

    #[test]
    fn unknown_loan_surfaces() {
        let store = LoanStore::new();
        assert_eq!(store.with_loan(99, |_| ()).unwrap_err(), UnknownLoan(99));
    }

    #[test]
    fn delete_only_in_draft() {
        let store = LoanStore::new();
        let id = store.insert(|id| Loan::new(id, 10, terms(), 0));
        store
            .with_loan(id, |record| record.loan.transition(LoanState::Posted).unwrap())
            .unwrap();
        assert!(matches!(store.delete(id), Err(DeleteError::NotDraft(LoanState::Posted))));

        let draft = store.insert(|id| Loan::new(id, 10, terms(), 0));
        store.delete(draft).unwrap();
        assert!(store.snapshot(draft).is_err());
    }

    #[test]
    fn critical_section_serialises_writers() {
        let store = Arc::new(LoanStore::new());
        let id = store.insert(|id| Loan::new(id, 10, terms(), 0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store
                        .with_loan(id, |record| {
                            // non-atomic read-modify-write, only safe under
                            // the loan lock
                            let seen = record.loan.requested_at;
                            record.loan.requested_at = seen + 1;
                        })
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.snapshot(id).unwrap().requested_at, 800);
    }
}
