//! Per-run ceiling on synchronous external lookups.

use std::sync::atomic::{AtomicU32, Ordering};

/// Hard ceiling, decremented on every attempted external call whatever the
/// outcome. Once exhausted the external step is skipped for the rest of the
/// run.
#[derive(Debug)]
pub struct SyncBudget {
    limit: u32,
    remaining: AtomicU32,
}

impl SyncBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            remaining: AtomicU32::new(limit),
        }
    }

    /// Take one unit. Returns false once the budget is spent.
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn used(&self) -> u32 {
        self.limit - self.remaining()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_a_hard_ceiling() {
        let budget = SyncBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.used(), 2);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_zero_budget() {
        let budget = SyncBudget::new(0);
        assert!(budget.is_exhausted());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 0);
    }
}
