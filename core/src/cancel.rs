//! Cooperative cancellation (spec §5).
//!
//! Long-running operations check [`CancellationToken::is_cancelled`] at file
//! boundaries and every 100 records; they never poll anything stronger than
//! an atomic flag, so cancellation is cheap to check from a tight loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How often streaming loops should check a [`CancellationToken`].
pub const CHECK_EVERY_N_RECORDS: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let tok = CancellationToken::new();
        assert!(!tok.is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let tok = CancellationToken::new();
        let clone = tok.clone();
        clone.cancel();
        assert!(tok.is_cancelled());
    }
}
