use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by all workers and the supervisor.
///
/// Every field only ever increases. Updates use relaxed atomics; the sums
/// are eventually consistent with the number of actions performed and no
/// ordering between different tallies is promised.
#[derive(Debug, Default)]
pub struct Tallies {
    pub mutations_cnt: AtomicU64,
    pub crashes_cnt: AtomicU64,
    pub unique_crashes_cnt: AtomicU64,
    pub verified_crashes_cnt: AtomicU64,
    pub blacklisted_crashes_cnt: AtomicU64,
    pub timeouts_cnt: AtomicU64,
    pub threads_finished: AtomicU64,
}

/// Point-in-time copy of all tallies, for display and the final summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TallySnapshot {
    pub mutations: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub verified_crashes: u64,
    pub blacklisted_crashes: u64,
    pub timeouts: u64,
    pub threads_finished: u64,
}

impl Tallies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            mutations: self.mutations_cnt.load(Ordering::Relaxed),
            crashes: self.crashes_cnt.load(Ordering::Relaxed),
            unique_crashes: self.unique_crashes_cnt.load(Ordering::Relaxed),
            verified_crashes: self.verified_crashes_cnt.load(Ordering::Relaxed),
            blacklisted_crashes: self.blacklisted_crashes_cnt.load(Ordering::Relaxed),
            timeouts: self.timeouts_cnt.load(Ordering::Relaxed),
            threads_finished: self.threads_finished.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let tallies = Tallies::new();
        tallies.mutations_cnt.fetch_add(3, Ordering::Relaxed);
        tallies.crashes_cnt.fetch_add(2, Ordering::Relaxed);
        tallies.timeouts_cnt.fetch_add(1, Ordering::Relaxed);

        let snap = tallies.snapshot();
        assert_eq!(snap.mutations, 3);
        assert_eq!(snap.crashes, 2);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.unique_crashes, 0);
    }

    #[test]
    fn tallies_never_decrease_across_snapshots() {
        let tallies = Tallies::new();
        let mut last = tallies.snapshot();
        for _ in 0..10 {
            tallies.mutations_cnt.fetch_add(1, Ordering::Relaxed);
            tallies.crashes_cnt.fetch_add(1, Ordering::Relaxed);
            let next = tallies.snapshot();
            assert!(next.mutations >= last.mutations);
            assert!(next.crashes >= last.crashes);
            last = next;
        }
    }
}
