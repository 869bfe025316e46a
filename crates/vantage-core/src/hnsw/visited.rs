//! Thread-local visited-set pool for graph traversal
//!
//! Beam search marks every node it touches. Allocating a fresh bitmap per
//! query would dominate small searches, so each thread keeps a small pool of
//! epoch-stamped arrays: `reset` bumps the epoch instead of zeroing memory,
//! and marking or testing a node is a single array access.

use std::cell::RefCell;

const POOL_LIMIT: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<VisitedMarks>> = const { RefCell::new(Vec::new()) };
}

/// Epoch-stamped visited marks.
pub struct VisitedMarks {
    epochs: Vec<u32>,
    current: u32,
}

impl VisitedMarks {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: vec![0; capacity.max(1024)],
            current: 1,
        }
    }

    fn capacity(&self) -> usize {
        self.epochs.len()
    }

    fn reset(&mut self) {
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            // Epoch counter wrapped; start over with clean stamps.
            self.epochs.fill(0);
            self.current = 1;
        }
    }

    #[inline(always)]
    pub fn seen(&self, id: u32) -> bool {
        let id = id as usize;
        id < self.epochs.len() && self.epochs[id] == self.current
    }

    #[inline(always)]
    pub fn mark(&mut self, id: u32) {
        let id = id as usize;
        if id >= self.epochs.len() {
            let new_len = (id + 1).next_power_of_two().max(1024);
            self.epochs.resize(new_len, 0);
        }
        self.epochs[id] = self.current;
    }
}

/// RAII handle that returns its marks to the thread-local pool on drop.
pub struct VisitedGuard {
    marks: Option<VisitedMarks>,
}

impl VisitedGuard {
    /// Borrow a reset visited set with room for at least `capacity` ids.
    pub fn acquire(capacity: usize) -> Self {
        let mut marks = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.iter().position(|m| m.capacity() >= capacity) {
                Some(idx) => pool.swap_remove(idx),
                None => VisitedMarks::with_capacity(capacity),
            }
        });
        marks.reset();
        Self { marks: Some(marks) }
    }
}

impl Drop for VisitedGuard {
    fn drop(&mut self) {
        if let Some(marks) = self.marks.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_LIMIT {
                    pool.push(marks);
                }
            });
        }
    }
}

impl std::ops::Deref for VisitedGuard {
    type Target = VisitedMarks;

    fn deref(&self) -> &Self::Target {
        self.marks.as_ref().expect("visited marks present until drop")
    }
}

impl std::ops::DerefMut for VisitedGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.marks.as_mut().expect("visited marks present until drop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_test() {
        let mut guard = VisitedGuard::acquire(100);
        assert!(!guard.seen(0));
        guard.mark(0);
        guard.mark(73);
        assert!(guard.seen(0));
        assert!(guard.seen(73));
        assert!(!guard.seen(74));
    }

    #[test]
    fn reuse_comes_back_clean() {
        {
            let mut guard = VisitedGuard::acquire(100);
            guard.mark(42);
            assert!(guard.seen(42));
        }
        let guard = VisitedGuard::acquire(100);
        assert!(!guard.seen(42));
    }

    #[test]
    fn grows_for_ids_beyond_capacity() {
        let mut guard = VisitedGuard::acquire(16);
        guard.mark(5000);
        assert!(guard.seen(5000));
        assert!(!guard.seen(5001));
    }
}
