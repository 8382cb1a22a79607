use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide work generation. Bumped whenever upstream tells us the
/// outstanding work is worthless (a new block was seen).
#[derive(Debug, Default)]
pub struct RestartEpoch(AtomicU64);

impl RestartEpoch {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advances the epoch and returns the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_stale(&self, stamped: u64) -> bool {
        stamped != self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_invalidates_previous_stamp() {
        let epoch = RestartEpoch::new();
        let stamp = epoch.current();
        assert!(!epoch.is_stale(stamp));
        assert_eq!(epoch.bump(), stamp + 1);
        assert!(epoch.is_stale(stamp));
        assert!(!epoch.is_stale(epoch.current()));
    }
}
