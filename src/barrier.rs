//! Completion barrier over the workers of one run.
//!
//! Every worker reports exactly once. The barrier turns those reports into
//! two one-shot decisions:
//!
//! - the first *successful* report, while others are still missing, asks the
//!   controller to switch off illumination early
//! - the report that completes the quorum finalizes the run; the run succeeds
//!   only if every report was successful
//!
//! Reports after finalization (or while disarmed) are ignored, so a late
//! report from a stopped run cannot finalize the next one.

use serde::Serialize;

/// Counters of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionTally {
    /// Number of workers of the run
    pub expected_workers: usize,
    /// Reports received so far
    pub reported_count: usize,
    /// Reports that were successful
    pub success_count: usize,
}

/// What a report triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Still waiting for other workers.
    Pending,
    /// First success before the quorum: stop illumination now.
    EarlyShutdown,
    /// Quorum reached; emitted once per run.
    Finalized {
        /// Every worker succeeded
        success: bool,
    },
    /// Report not counted.
    Ignored,
}

/// One-run completion barrier.
#[derive(Debug, Clone, Default)]
pub struct CompletionBarrier {
    tally: CompletionTally,
    active: bool,
    early_shutdown_sent: bool,
}

impl CompletionBarrier {
    /// A disarmed barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for a run with `expected_workers` workers. Zero disarms.
    pub fn configure(&mut self, expected_workers: usize) {
        self.tally = CompletionTally {
            expected_workers,
            ..CompletionTally::default()
        };
        self.active = expected_workers > 0;
        self.early_shutdown_sent = false;
    }

    /// Stop counting (free run, or the run was torn down).
    pub fn disarm(&mut self) {
        self.active = false;
    }

    /// Whether reports are being counted.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Counters so far.
    pub fn tally(&self) -> CompletionTally {
        self.tally
    }

    /// Record one worker report.
    pub fn increment(&mut self, ok: bool) -> BarrierOutcome {
        if !self.active || self.tally.reported_count >= self.tally.expected_workers {
            return BarrierOutcome::Ignored;
        }

        self.tally.reported_count += 1;
        if ok {
            self.tally.success_count += 1;
        }

        if self.tally.reported_count == self.tally.expected_workers {
            self.active = false;
            return BarrierOutcome::Finalized {
                success: self.tally.success_count == self.tally.expected_workers,
            };
        }
        if ok && !self.early_shutdown_sent {
            self.early_shutdown_sent = true;
            return BarrierOutcome::EarlyShutdown;
        }
        BarrierOutcome::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_three_successes() {
        let mut barrier = CompletionBarrier::new();
        barrier.configure(3);
        assert_eq!(barrier.increment(true), BarrierOutcome::EarlyShutdown);
        assert_eq!(barrier.increment(true), BarrierOutcome::Pending);
        assert_eq!(
            barrier.increment(true),
            BarrierOutcome::Finalized { success: true }
        );
        assert_eq!(barrier.increment(true), BarrierOutcome::Ignored);
    }

    #[test]
    fn test_failure_first_delays_early_shutdown() {
        let mut barrier = CompletionBarrier::new();
        barrier.configure(3);
        assert_eq!(barrier.increment(false), BarrierOutcome::Pending);
        assert_eq!(barrier.increment(true), BarrierOutcome::EarlyShutdown);
        assert_eq!(
            barrier.increment(true),
            BarrierOutcome::Finalized { success: false }
        );
    }

    #[test]
    fn test_single_success_of_two_finalizes_without_early_shutdown() {
        let mut barrier = CompletionBarrier::new();
        barrier.configure(2);
        assert_eq!(barrier.increment(false), BarrierOutcome::Pending);
        assert_eq!(
            barrier.increment(true),
            BarrierOutcome::Finalized { success: false }
        );
    }

    #[test]
    fn test_disarmed_barrier_ignores_reports() {
        let mut barrier = CompletionBarrier::new();
        assert_eq!(barrier.increment(true), BarrierOutcome::Ignored);
        barrier.configure(2);
        barrier.disarm();
        assert_eq!(barrier.increment(true), BarrierOutcome::Ignored);
        assert_eq!(barrier.tally().reported_count, 0);
    }

    proptest! {
        #[test]
        fn finalizes_exactly_once(reports in proptest::collection::vec(any::<bool>(), 1..8), expected in 1usize..4) {
            let mut barrier = CompletionBarrier::new();
            barrier.configure(expected);

            let outcomes: Vec<_> = reports.iter().map(|ok| barrier.increment(*ok)).collect();
            let finals: Vec<_> = outcomes
                .iter()
                .enumerate()
                .filter(|(_, o)| matches!(o, BarrierOutcome::Finalized { .. }))
                .collect();
            let early = outcomes.iter().filter(|o| **o == BarrierOutcome::EarlyShutdown).count();

            prop_assert!(early <= 1);
            if reports.len() >= expected {
                prop_assert_eq!(finals.len(), 1);
                prop_assert_eq!(finals[0].0, expected - 1);
                let success = reports[..expected].iter().all(|ok| *ok);
                prop_assert_eq!(*finals[0].1, BarrierOutcome::Finalized { success });
                prop_assert!(outcomes[expected..].iter().all(|o| *o == BarrierOutcome::Ignored));
            } else {
                prop_assert!(finals.is_empty());
            }
        }
    }
}
