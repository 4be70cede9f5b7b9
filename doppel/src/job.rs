// Copyright 2025 Oxide Computer Company
//! State machines for the two I/O shapes the array produces.
//!
//! A logical read becomes a chain of sub-reads: one balanced dispatch,
//! then, on failure, a walk of the remaining mirrors, then an optional
//! heal write-back.  A logical write (or unmap/flush) becomes one sub-I/O
//! per operational mirror, aggregated under a fixed tolerance policy.
//!
//! Neither machine touches a device or a lock.  They consume completion
//! events and hand back the next action, which keeps every transition
//! directly testable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use doppel_common::{DoppelError, SlotData, SlotId};

/**
 * Fan-out tolerance contract: a logical write (or unmap/flush) succeeds
 * when at least this many of its dispatched sub-I/Os succeed.  Losing
 * redundancy is tolerated; losing the data is not, so a fan-out fails
 * only once every dispatched sub-I/O has failed.
 */
pub const WRITE_SUCCESS_MIN: usize = 1;

/// Identifies one logical submission, for log correlation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job {}", self.0)
    }
}

/// Monotonic JobId source, one per array.
#[derive(Debug, Default)]
pub(crate) struct JobIdAllocator(AtomicU64);

impl JobIdAllocator {
    pub fn next(&self) -> JobId {
        JobId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/*
 * Read chain
 */

/// What the read engine must do next.
#[derive(Debug)]
pub(crate) enum ReadAction {
    /// The logical read is satisfied.
    Complete,

    /// Issue the same read to this slot.
    Retry(SlotId),

    /// The retry read on `source` succeeded; write the data back over the
    /// stale range on `original`.
    Heal { original: SlotId, source: SlotId },

    /// Every candidate was tried or skipped; fail the logical read.
    Fail(DoppelError),
}

/// Externally visible phase of a read chain, mostly for tests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReadPhase {
    Dispatched,
    Retrying,
    Healing,
    Done,
}

enum ReadState {
    /// The balanced dispatch is in flight on `target`.
    Dispatched { target: SlotId },

    /// A retry is in flight on `current`; `untried` holds the candidates
    /// not yet attempted, in wrap order from the original target.
    Retrying {
        original: SlotId,
        current: SlotId,
        untried: VecDeque<SlotId>,
    },

    Healing,

    Done,
}

/**
 * One logical read as a chain of sub-reads.  Feed each sub-read completion
 * to `on_read_result` along with a view of which slots are currently
 * eligible; the machine answers with the next action.  Every candidate
 * slot is attempted at most once per chain.
 */
pub(crate) struct ReadFlow {
    slot_count: u8,
    state: ReadState,
}

impl ReadFlow {
    pub fn new(target: SlotId, slot_count: u8) -> Self {
        assert!(target.get() < slot_count);
        ReadFlow { slot_count, state: ReadState::Dispatched { target } }
    }

    pub fn phase(&self) -> ReadPhase {
        match self.state {
            ReadState::Dispatched { .. } => ReadPhase::Dispatched,
            ReadState::Retrying { .. } => ReadPhase::Retrying,
            ReadState::Healing => ReadPhase::Healing,
            ReadState::Done => ReadPhase::Done,
        }
    }

    /**
     * Consume the completion of the sub-read most recently issued.
     * `operational` is consulted as each retry candidate comes up, so a
     * slot that failed while this chain was in flight is skipped rather
     * than tried.
     */
    pub fn on_read_result<F: Fn(SlotId) -> bool>(
        &mut self,
        result: Result<(), DoppelError>,
        operational: F,
    ) -> ReadAction {
        match std::mem::replace(&mut self.state, ReadState::Done) {
            ReadState::Dispatched { target } => match result {
                Ok(()) => ReadAction::Complete,
                Err(e) => {
                    /*
                     * Candidates are every other slot, in index order
                     * wrapping from just past the failed target.
                     */
                    let untried = (1..self.slot_count)
                        .map(|i| {
                            SlotId::new(
                                (target.get() + i) % self.slot_count,
                            )
                        })
                        .collect();
                    self.advance(target, untried, e, operational)
                }
            },
            ReadState::Retrying { original, current, untried } => {
                match result {
                    Ok(()) => {
                        self.state = ReadState::Healing;
                        ReadAction::Heal { original, source: current }
                    }
                    Err(e) => self.advance(original, untried, e, operational),
                }
            }
            ReadState::Healing | ReadState::Done => {
                panic!("read result fed to a finished chain")
            }
        }
    }

    /// Note the outcome of the heal write.  The chain is complete either
    /// way; heal failure affects the slot, never the logical read.
    pub fn on_heal_result(
        &mut self,
        _result: &Result<(), DoppelError>,
    ) -> ReadAction {
        assert_eq!(self.phase(), ReadPhase::Healing);
        self.state = ReadState::Done;
        ReadAction::Complete
    }

    /// The heal was not attempted (the slot is no longer attached).
    pub fn on_heal_skipped(&mut self) -> ReadAction {
        assert_eq!(self.phase(), ReadPhase::Healing);
        self.state = ReadState::Done;
        ReadAction::Complete
    }

    fn advance<F: Fn(SlotId) -> bool>(
        &mut self,
        original: SlotId,
        mut untried: VecDeque<SlotId>,
        last_error: DoppelError,
        operational: F,
    ) -> ReadAction {
        while let Some(candidate) = untried.pop_front() {
            if !operational(candidate) {
                continue;
            }
            self.state =
                ReadState::Retrying { original, current: candidate, untried };
            return ReadAction::Retry(candidate);
        }

        // Exhausted: the logical read fails with the last device error.
        self.state = ReadState::Done;
        ReadAction::Fail(last_error)
    }
}

/*
 * Fan-out
 */

/// Status of one sub-I/O within a fan-out job.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SubIoState {
    /// Dispatched, completion not yet seen.
    InFlight,

    Done,

    /// Never dispatched: the slot was not operational at snapshot time.
    Skipped,

    Error(DoppelError),
}

/**
 * Tracks the sub-I/Os of one fanned-out write, unmap, or flush.  The
 * target set is snapshotted at dispatch; slots failing afterwards do not
 * change how many completions are expected.  The aggregate result is
 * produced exactly once, when the last outstanding sub-I/O completes.
 */
pub(crate) struct FanoutJob {
    state: SlotData<SubIoState>,
    remaining: usize,
    done: usize,
    first_error: Option<DoppelError>,
}

impl FanoutJob {
    pub fn new(slot_count: u8, targets: &[SlotId]) -> Self {
        assert!(!targets.is_empty());
        let mut state = SlotData::new(slot_count, SubIoState::Skipped);
        for &t in targets {
            state[t] = SubIoState::InFlight;
        }
        FanoutJob {
            state,
            remaining: targets.len(),
            done: 0,
            first_error: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn state(&self, slot: SlotId) -> &SubIoState {
        &self.state[slot]
    }

    /**
     * Record one sub-I/O completion.  Returns the aggregate result when
     * this was the last outstanding sub-I/O, None while others remain.
     * The first error seen (in completion order) is the one a failing
     * aggregate reports.
     */
    pub fn on_sub_completion(
        &mut self,
        slot: SlotId,
        result: Result<(), DoppelError>,
    ) -> Option<Result<(), DoppelError>> {
        assert!(matches!(self.state[slot], SubIoState::InFlight));
        match result {
            Ok(()) => {
                self.state[slot] = SubIoState::Done;
                self.done += 1;
            }
            Err(e) => {
                if self.first_error.is_none() {
                    self.first_error = Some(e.clone());
                }
                self.state[slot] = SubIoState::Error(e);
            }
        }

        self.remaining -= 1;
        if self.remaining > 0 {
            return None;
        }

        Some(if self.done >= WRITE_SUCCESS_MIN {
            Ok(())
        } else {
            Err(self
                .first_error
                .clone()
                .unwrap_or(DoppelError::ArrayFailed))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn io_err(s: &str) -> DoppelError {
        DoppelError::IoError(s.to_string())
    }

    #[test]
    fn job_ids_are_monotonic() {
        let alloc = JobIdAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        assert!(a < b);
        assert_eq!(format!("{}", a), "job 1");
    }

    #[test]
    fn read_success_completes_directly() {
        let mut flow = ReadFlow::new(SlotId::new(1), 3);
        assert_eq!(flow.phase(), ReadPhase::Dispatched);

        let action = flow.on_read_result(Ok(()), |_| true);
        assert!(matches!(action, ReadAction::Complete));
        assert_eq!(flow.phase(), ReadPhase::Done);
    }

    #[test]
    fn retry_walk_wraps_from_failed_slot() {
        // dispatch on slot 1 of 4: candidates must come up 2, 3, 0
        let mut flow = ReadFlow::new(SlotId::new(1), 4);

        let action = flow.on_read_result(Err(io_err("a")), |_| true);
        assert!(matches!(action, ReadAction::Retry(s) if s.get() == 2));
        assert_eq!(flow.phase(), ReadPhase::Retrying);

        let action = flow.on_read_result(Err(io_err("b")), |_| true);
        assert!(matches!(action, ReadAction::Retry(s) if s.get() == 3));

        let action = flow.on_read_result(Err(io_err("c")), |_| true);
        assert!(matches!(action, ReadAction::Retry(s) if s.get() == 0));
    }

    #[test]
    fn retry_skips_slots_no_longer_operational() {
        let mut flow = ReadFlow::new(SlotId::new(0), 4);

        // slots 1 and 2 went down while the dispatch was in flight
        let up = |s: SlotId| s.get() == 3;
        let action = flow.on_read_result(Err(io_err("a")), up);
        assert!(matches!(action, ReadAction::Retry(s) if s.get() == 3));
    }

    #[test]
    fn exhaustion_keeps_the_last_error() {
        let mut flow = ReadFlow::new(SlotId::new(0), 3);

        let action = flow.on_read_result(Err(io_err("first")), |_| true);
        assert!(matches!(action, ReadAction::Retry(_)));
        let action = flow.on_read_result(Err(io_err("second")), |_| true);
        assert!(matches!(action, ReadAction::Retry(_)));
        let action = flow.on_read_result(Err(io_err("last")), |_| true);
        match action {
            ReadAction::Fail(e) => assert_eq!(e, io_err("last")),
            other => panic!("expected Fail, got {:?}", other),
        }
        assert_eq!(flow.phase(), ReadPhase::Done);
    }

    #[test]
    fn no_eligible_candidates_fails_immediately() {
        let mut flow = ReadFlow::new(SlotId::new(2), 3);

        let action = flow.on_read_result(Err(io_err("a")), |_| false);
        assert!(matches!(action, ReadAction::Fail(_)));
        assert_eq!(flow.phase(), ReadPhase::Done);
    }

    #[test]
    fn retry_success_asks_for_heal() {
        let mut flow = ReadFlow::new(SlotId::new(2), 3);

        // wrap: candidates from slot 2 of 3 are 0 then 1
        let action = flow.on_read_result(Err(io_err("a")), |_| true);
        assert!(matches!(action, ReadAction::Retry(s) if s.get() == 0));

        let action = flow.on_read_result(Ok(()), |_| true);
        match action {
            ReadAction::Heal { original, source } => {
                assert_eq!(original.get(), 2);
                assert_eq!(source.get(), 0);
            }
            other => panic!("expected Heal, got {:?}", other),
        }
        assert_eq!(flow.phase(), ReadPhase::Healing);

        // heal failure still completes the chain
        let action = flow.on_heal_result(&Err(io_err("heal")));
        assert!(matches!(action, ReadAction::Complete));
        assert_eq!(flow.phase(), ReadPhase::Done);
    }

    #[test]
    fn heal_skip_completes_the_chain() {
        let mut flow = ReadFlow::new(SlotId::new(0), 2);
        flow.on_read_result(Err(io_err("a")), |_| true);
        flow.on_read_result(Ok(()), |_| true);
        assert_eq!(flow.phase(), ReadPhase::Healing);

        assert!(matches!(flow.on_heal_skipped(), ReadAction::Complete));
        assert_eq!(flow.phase(), ReadPhase::Done);
    }

    #[test]
    fn fanout_tolerates_all_but_one_failure() {
        let targets: Vec<SlotId> = (0..3).map(SlotId::new).collect();
        let mut job = FanoutJob::new(3, &targets);
        assert_eq!(job.remaining(), 3);

        assert!(job
            .on_sub_completion(SlotId::new(1), Err(io_err("a")))
            .is_none());
        assert!(job
            .on_sub_completion(SlotId::new(0), Err(io_err("b")))
            .is_none());
        let agg = job.on_sub_completion(SlotId::new(2), Ok(())).unwrap();
        assert_eq!(agg, Ok(()));
        assert_eq!(*job.state(SlotId::new(0)), SubIoState::Error(io_err("b")));
        assert_eq!(*job.state(SlotId::new(2)), SubIoState::Done);
    }

    #[test]
    fn fanout_total_failure_reports_first_error() {
        let targets: Vec<SlotId> = (0..3).map(SlotId::new).collect();
        let mut job = FanoutJob::new(3, &targets);

        // completions arrive out of slot order; "first" means arrival order
        assert!(job
            .on_sub_completion(SlotId::new(2), Err(io_err("first")))
            .is_none());
        assert!(job
            .on_sub_completion(SlotId::new(0), Err(io_err("mid")))
            .is_none());
        let agg = job
            .on_sub_completion(SlotId::new(1), Err(io_err("last")))
            .unwrap();
        assert_eq!(agg, Err(io_err("first")));
    }

    #[test]
    fn fanout_skips_slots_outside_the_snapshot() {
        // slot 1 was already failed when the job was built
        let targets = vec![SlotId::new(0), SlotId::new(2)];
        let mut job = FanoutJob::new(3, &targets);
        assert_eq!(job.remaining(), 2);
        assert_eq!(*job.state(SlotId::new(1)), SubIoState::Skipped);

        assert!(job.on_sub_completion(SlotId::new(0), Ok(())).is_none());
        let agg = job.on_sub_completion(SlotId::new(2), Ok(())).unwrap();
        assert_eq!(agg, Ok(()));
    }
}
