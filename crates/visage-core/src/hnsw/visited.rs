//! Thread-local visited tracking for graph traversal.
//!
//! An epoch array makes per-query reset O(1):
//! - `is_visited(label)` is one array read and compare
//! - `visit(label)` is one array write
//! - resetting between queries increments the epoch instead of zeroing

use std::cell::RefCell;

thread_local! {
    static VISITED: RefCell<Option<EpochVisited>> = const { RefCell::new(None) };
}

struct EpochVisited {
    epochs: Vec<u32>,
    current_epoch: u32,
}

impl EpochVisited {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: vec![0; capacity.max(1024)],
            current_epoch: 1,
        }
    }

    #[inline(always)]
    fn ensure_capacity_for(&mut self, label: usize) {
        if label < self.epochs.len() {
            return;
        }
        let required = label.saturating_add(1);
        let new_len = required
            .checked_next_power_of_two()
            .unwrap_or(required)
            .max(1024);
        self.epochs.resize(new_len, 0);
    }

    #[inline(always)]
    fn is_visited(&self, label: usize) -> bool {
        label < self.epochs.len() && self.epochs[label] == self.current_epoch
    }

    #[inline(always)]
    fn visit(&mut self, label: usize) {
        self.ensure_capacity_for(label);
        self.epochs[label] = self.current_epoch;
    }

    #[inline(always)]
    fn advance_epoch(&mut self) {
        self.current_epoch = self.current_epoch.wrapping_add(1);
        if self.current_epoch == 0 {
            // Epoch counter wrapped: stale marks could alias, so reset fully.
            self.epochs.fill(0);
            self.current_epoch = 1;
        }
    }
}

/// Owned borrow of the thread-local visited set, valid for one traversal.
///
/// Acquiring takes the set out of the thread-local slot (allocating on first
/// use) and advances the epoch so marks from earlier traversals are
/// invisible. Dropping returns the allocation for reuse.
pub struct VisitedGuard {
    set: Option<EpochVisited>,
}

impl VisitedGuard {
    pub fn acquire(capacity_hint: usize) -> Self {
        let mut set = VISITED
            .with(|cell| cell.borrow_mut().take())
            .unwrap_or_else(|| EpochVisited::with_capacity(capacity_hint));
        set.ensure_capacity_for(capacity_hint.saturating_sub(1));
        set.advance_epoch();
        VisitedGuard { set: Some(set) }
    }

    #[inline(always)]
    pub fn is_visited(&self, label: usize) -> bool {
        self.set
            .as_ref()
            .map(|s| s.is_visited(label))
            .unwrap_or(false)
    }

    #[inline(always)]
    pub fn visit(&mut self, label: usize) {
        if let Some(set) = self.set.as_mut() {
            set.visit(label);
        }
    }
}

impl Drop for VisitedGuard {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            VISITED.with(|cell| {
                let mut slot = cell.borrow_mut();
                if slot.is_none() {
                    *slot = Some(set);
                }
            });
        }
    }
}
