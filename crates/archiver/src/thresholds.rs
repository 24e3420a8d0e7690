//! The threshold ladder and the session trigger decision.
//!
//! Up to nine configured usage thresholds map backlog size to a desired
//! session count: when total `out/` usage exceeds rung `i`, the archiver
//! wants `i` concurrent tape sessions. The decision is deliberately sticky:
//! `last_trigger` remembers the session count most recently spawned up to,
//! because tapes that are already mounted should keep streaming even as the
//! backlog shrinks.
//!
//! All decision state lives here, free of I/O, so the scheduling behaviour
//! is testable tick by tick.

use std::time::{Duration, Instant};

/// Sparse threshold ladder, rungs 1..=9, in bytes.
///
/// Rung 0 is always zero: once a session count is sticky, any nonzero
/// backlog samples at least level 0 and ramp-down can walk all the way to
/// the floor without special cases.
#[derive(Clone, Debug)]
pub struct ThresholdLadder {
    rungs: [Option<u64>; 10],
}

impl ThresholdLadder {
    /// Builds a ladder; index 0 of `rungs` is ignored and forced to zero.
    #[must_use]
    pub fn new(mut rungs: [Option<u64>; 10]) -> Self {
        rungs[0] = Some(0);
        Self { rungs }
    }

    /// The threshold for `level`, when configured.
    #[must_use]
    pub fn rung(&self, level: usize) -> Option<u64> {
        self.rungs.get(level).copied().flatten()
    }

    /// Rung 1, the "worthwhile chunk" floor.
    #[must_use]
    pub fn first(&self) -> u64 {
        self.rung(1).unwrap_or(0)
    }

    /// Highest configured level: the most sessions this ladder can ask for.
    #[must_use]
    pub fn max_level(&self) -> usize {
        (1..=9).rev().find(|&i| self.rungs[i].is_some()).unwrap_or(0)
    }
}

/// Inputs sampled for one decision tick.
#[derive(Clone, Copy, Debug)]
pub struct TickInput {
    /// Total bytes in `out/`.
    pub all_usage: u64,
    /// Bytes in `out/` not owned by a running worker.
    pub pending_usage: u64,
    /// Running worker count.
    pub workers: usize,
    /// USR1 consumed this pass: bypass the inactivity wait.
    pub skip_delays: bool,
}

/// Outcome of one decision tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Desired session count; spawn `trigger_level - workers` when positive.
    pub trigger_level: usize,
    /// The sampled usage level, for state-transition logging.
    pub usage_level: usize,
    /// Whether the inactivity timer is running (no threshold fired but work
    /// is waiting).
    pub timer_running: bool,
}

/// Sticky trigger state carried across ticks.
#[derive(Debug)]
pub struct TriggerState {
    last_trigger: usize,
    prev_level: usize,
    idle_since: Option<Instant>,
}

impl Default for TriggerState {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerState {
    /// Fresh state: nothing sticky, no timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_trigger: 0,
            prev_level: 0,
            idle_since: None,
        }
    }

    /// The session count most recently spawned up to.
    #[must_use]
    pub fn last_trigger(&self) -> usize {
        self.last_trigger
    }

    /// Clears everything sticky. Called when `out/` is empty and no workers
    /// remain.
    pub fn reset(&mut self) {
        self.last_trigger = 0;
        self.prev_level = 0;
        self.idle_since = None;
    }

    /// Runs one decision tick.
    ///
    /// `timeout` is the effective inactivity timeout for this tick (the
    /// caller takes `min(archiver_timeout, archiver_retrytimeout)` while
    /// retry candidates exist).
    pub fn assess(
        &mut self,
        ladder: &ThresholdLadder,
        input: TickInput,
        timeout: Duration,
        now: Instant,
    ) -> Decision {
        if input.all_usage == 0 {
            if input.workers == 0 {
                self.reset();
            }
            return Decision {
                trigger_level: 0,
                usage_level: 0,
                timer_running: false,
            };
        }

        // Sample the ladder from the top. While a trigger is sticky the walk
        // may land on rung 0, keeping the decision in "reuse mounted tapes"
        // territory.
        let min_level = usize::from(self.last_trigger == 0);
        let mut usage_level = 0;
        for level in (min_level..=9).rev() {
            if let Some(threshold) = ladder.rung(level) {
                if input.all_usage > threshold {
                    usage_level = level;
                    break;
                }
            }
        }

        let mut trigger_level = 0;
        let ramp_boundary =
            self.prev_level == self.last_trigger && self.last_trigger > input.workers;
        if usage_level > input.workers || ramp_boundary {
            // A new session must either have a worthwhile chunk to itself or
            // reuse tapes that are mounted anyway.
            if input.pending_usage > ladder.first() || self.last_trigger >= usage_level {
                trigger_level = usage_level.max(self.last_trigger);
            }
        }

        let mut timer_running = false;
        if trigger_level == 0 {
            let idle_since = *self.idle_since.get_or_insert(now);
            timer_running = true;
            let expired = now.duration_since(idle_since) >= timeout;
            if input.workers == 0 && (expired || (input.skip_delays && input.pending_usage > 0)) {
                trigger_level = 1;
            }
        }

        if trigger_level > 0 {
            self.last_trigger = trigger_level;
            self.idle_since = None;
            timer_running = false;
        } else if self.last_trigger > usage_level && self.prev_level != self.last_trigger {
            // Ramp down one level per tick toward the sampled usage.
            self.last_trigger -= 1;
        }

        self.prev_level = usage_level;

        Decision {
            trigger_level,
            usage_level,
            timer_running,
        }
    }
}

/// Bytes to pack into one new session's request list.
///
/// The `+ 4096` absorbs rounding on tiny runs so a single worker always
/// receives the whole backlog. Known wart: chunks may split temporally
/// adjacent files across tapes.
#[must_use]
pub fn spawn_size(all_usage: u64, trigger_level: usize) -> u64 {
    all_usage / trigger_level.max(1) as u64 + 4096
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn ladder_500_2000() -> ThresholdLadder {
        let mut rungs = [None; 10];
        rungs[1] = Some(500 * GIB);
        rungs[2] = Some(2000 * GIB);
        ThresholdLadder::new(rungs)
    }

    fn input(all: u64, pending: u64, workers: usize) -> TickInput {
        TickInput {
            all_usage: all,
            pending_usage: pending,
            workers,
            skip_delays: false,
        }
    }

    #[test]
    fn ladder_forces_rung_zero() {
        let ladder = ladder_500_2000();
        assert_eq!(ladder.rung(0), Some(0));
        assert_eq!(ladder.rung(3), None);
        assert_eq!(ladder.max_level(), 2);
        assert_eq!(ladder.first(), 500 * GIB);
    }

    #[test]
    fn large_backlog_fires_top_threshold() {
        // Scenario S2: 3 TiB against [500, 2000] GiB fires level 2.
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let d = state.assess(
            &ladder,
            input(3 * 1024 * GIB, 3 * 1024 * GIB, 0),
            Duration::from_secs(21600),
            Instant::now(),
        );
        assert_eq!(d.usage_level, 2);
        assert_eq!(d.trigger_level, 2);
        assert_eq!(state.last_trigger(), 2);
    }

    #[test]
    fn small_backlog_waits_for_timer() {
        // Scenario S1: 10 MiB against [500, 2000] GiB; nothing fires until
        // the inactivity timeout expires.
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);

        let d = state.assess(&ladder, input(10 << 20, 10 << 20, 0), timeout, t0);
        assert_eq!(d.trigger_level, 0);
        assert!(d.timer_running);

        let d = state.assess(
            &ladder,
            input(10 << 20, 10 << 20, 0),
            timeout,
            t0 + Duration::from_secs(11),
        );
        assert_eq!(d.trigger_level, 1);
        assert!(!d.timer_running);
        assert_eq!(state.last_trigger(), 1);
    }

    #[test]
    fn usr1_bypasses_timer_when_pending() {
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let mut i = input(10 << 20, 10 << 20, 0);
        i.skip_delays = true;
        let d = state.assess(&ladder, i, Duration::from_secs(21600), Instant::now());
        assert_eq!(d.trigger_level, 1);
    }

    #[test]
    fn usr1_without_pending_does_nothing() {
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let mut i = input(10 << 20, 0, 1);
        i.skip_delays = true;
        let d = state.assess(&ladder, i, Duration::from_secs(21600), Instant::now());
        assert_eq!(d.trigger_level, 0);
    }

    #[test]
    fn no_spawn_without_pending_work() {
        // Property 2: pending == 0 and no workers, empty out/ → no trigger.
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let d = state.assess(
            &ladder,
            input(0, 0, 0),
            Duration::from_secs(1),
            Instant::now(),
        );
        assert_eq!(d.trigger_level, 0);
    }

    #[test]
    fn trigger_never_below_sticky_floor() {
        // Property 3: a fired trigger level is >= last_trigger.
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(21600);

        // Fire at level 2.
        state.assess(&ladder, input(3 * 1024 * GIB, 3 * 1024 * GIB, 0), timeout, now);
        assert_eq!(state.last_trigger(), 2);

        // Backlog shrinks below rung 2 but workers finished: the sticky
        // floor keeps any re-trigger at 2.
        let d = state.assess(&ladder, input(600 * GIB, 600 * GIB, 0), timeout, now);
        if d.trigger_level > 0 {
            assert!(d.trigger_level >= 2);
        }
    }

    #[test]
    fn empty_queue_resets_state() {
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(21600);
        state.assess(&ladder, input(3 * 1024 * GIB, 3 * 1024 * GIB, 0), timeout, now);
        assert_eq!(state.last_trigger(), 2);

        let d = state.assess(&ladder, input(0, 0, 0), timeout, now);
        assert_eq!(d.trigger_level, 0);
        assert_eq!(state.last_trigger(), 0);
    }

    #[test]
    fn workers_block_reset_until_they_finish() {
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(21600);
        state.assess(&ladder, input(3 * 1024 * GIB, 3 * 1024 * GIB, 0), timeout, now);

        // out/ drained but workers still running: keep the sticky state.
        state.assess(&ladder, input(0, 0, 2), timeout, now);
        assert_eq!(state.last_trigger(), 2);
    }

    #[test]
    fn ramp_down_steps_one_level_per_tick() {
        let ladder = ladder_500_2000();
        let mut state = TriggerState::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(21600);
        state.assess(&ladder, input(3 * 1024 * GIB, 3 * 1024 * GIB, 0), timeout, now);
        assert_eq!(state.last_trigger(), 2);

        // Workers running at the sticky level, pending fully assigned and
        // small: no trigger, usage samples at 0, last_trigger steps down.
        state.assess(&ladder, input(100 * GIB, 0, 2), timeout, now);
        state.assess(&ladder, input(100 * GIB, 0, 2), timeout, now);
        assert!(state.last_trigger() <= 1);
    }

    #[test]
    fn spawn_size_splits_backlog_evenly() {
        assert_eq!(spawn_size(3 * 1024 * GIB, 2), 1536 * GIB + 4096);
        assert_eq!(spawn_size(10 << 20, 1), (10 << 20) + 4096);
        // Degenerate trigger level never divides by zero.
        assert_eq!(spawn_size(100, 0), 100 + 4096);
    }
}
