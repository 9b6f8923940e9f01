//! Per-iteration timing, idle budgeting and loop statistics.
//!
//! The controller brackets every iteration with [`LoopTimer::start`] and
//! [`LoopTimer::finish`]. `finish` measures the iteration duration, derives
//! the remaining idle budget, decides whether the iteration counts as idle
//! (deadline-based when an interval is set, probabilistic when the loop is
//! free-running), counts overruns, and occasionally samples the iteration
//! into a bounded statistics ring.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Margin subtracted from the iteration deadline by the idle predicate, in
/// seconds. An iteration that lands within this margin of its deadline is
/// not worth dispatching idle work for.
pub const IDLE_EPSILON: f64 = 0.01;

/// Probability that a completed iteration is sampled into the ring.
const SAMPLE_PROBABILITY: f64 = 0.001;

/// Upper bound kept by [`LoopTimer::stats_trim`].
const STATS_CAPACITY: usize = 200;

/// One sampled iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSample {
    /// Seconds the iteration body took.
    pub duration: f64,
    /// Seconds of budget left (negative on overrun).
    pub idle: f64,
}

/// Idle predicate handed to idle listeners, so long-running idle work can
/// abort before it eats into the next iteration.
#[derive(Debug, Clone)]
pub struct IdleProbe {
    kind: ProbeKind,
}

#[derive(Debug, Clone)]
enum ProbeKind {
    /// Idle until the iteration deadline (minus the epsilon margin).
    Deadline(Instant),
    /// Free-running loop: each poll re-rolls the idle probability.
    Chance(f64),
    /// Never idle.
    Never,
}

impl IdleProbe {
    /// Whether the loop is still within its idle budget.
    #[must_use]
    pub fn still_idle(&self) -> bool {
        match self.kind {
            ProbeKind::Deadline(deadline) => Instant::now() < deadline,
            ProbeKind::Chance(p) => fastrand::f64() < p,
            ProbeKind::Never => false,
        }
    }

    /// The hard idle deadline, when one exists.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.kind {
            ProbeKind::Deadline(deadline) => Some(deadline),
            _ => None,
        }
    }
}

/// Outcome of one timed iteration.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Seconds the iteration body took.
    pub duration: f64,
    /// Seconds of budget left; negative when the body overran.
    pub idle: f64,
    /// Whether the idle predicate held (idle listeners should fire).
    pub was_idle: bool,
    /// Whether this iteration overran a non-zero interval.
    pub overrun: bool,
    /// Predicate for idle listeners.
    pub probe: IdleProbe,
    /// Absolute end of this iteration's budget; `None` when free-running.
    pub budget_until: Option<Instant>,
}

/// Measures iterations of the parent event loop.
#[derive(Debug)]
pub struct LoopTimer {
    interval: f64,
    idle_probability: f64,
    started_at: Option<Instant>,
    stats: VecDeque<LoopSample>,
    overruns: u64,
}

impl LoopTimer {
    /// Create a timer for the given interval (seconds; 0 = free-running)
    /// and free-running idle probability.
    #[must_use]
    pub fn new(interval: f64, idle_probability: f64) -> Self {
        Self {
            interval,
            idle_probability,
            started_at: None,
            stats: VecDeque::with_capacity(STATS_CAPACITY),
            overruns: 0,
        }
    }

    /// The committed loop interval in seconds.
    #[must_use]
    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Mark the beginning of an iteration.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Mark the end of an iteration and derive its outcome.
    pub fn finish(&mut self) -> TickOutcome {
        let started = self.started_at.take().unwrap_or_else(Instant::now);
        let duration = started.elapsed().as_secs_f64();
        let idle = self.interval - duration;

        let (was_idle, probe, budget_until) = if self.interval > 0.0 {
            let margin = (self.interval - IDLE_EPSILON).max(0.0);
            let deadline = started + Duration::from_secs_f64(margin);
            let budget = started + Duration::from_secs_f64(self.interval);
            (
                Instant::now() < deadline,
                IdleProbe {
                    kind: ProbeKind::Deadline(deadline),
                },
                Some(budget),
            )
        } else if self.idle_probability > 0.0 && fastrand::f64() < self.idle_probability {
            (
                true,
                IdleProbe {
                    kind: ProbeKind::Chance(self.idle_probability),
                },
                None,
            )
        } else {
            (false, IdleProbe { kind: ProbeKind::Never }, None)
        };

        let overrun = self.interval > 0.0 && idle <= 0.0;
        if overrun {
            self.overruns += 1;
            error!(
                duration_secs = duration,
                interval_secs = self.interval,
                "iteration overran its loop interval"
            );
        }

        if fastrand::f64() < SAMPLE_PROBABILITY {
            self.record(LoopSample { duration, idle });
        }

        TickOutcome {
            duration,
            idle,
            was_idle,
            overrun,
            probe,
            budget_until,
        }
    }

    /// Number of overruns observed since construction.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Number of samples currently in the ring.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.stats.len()
    }

    /// Trimmed mean over the most recent `last` samples: the top and bottom
    /// 5% by duration are dropped, and the mean of what remains is returned
    /// on both axes. `None` when the ring is empty.
    #[must_use]
    pub fn stats_mean(&self, last: usize) -> Option<LoopSample> {
        if self.stats.is_empty() || last == 0 {
            return None;
        }
        let skip = self.stats.len().saturating_sub(last);
        let mut window: Vec<LoopSample> = self.stats.iter().skip(skip).copied().collect();
        window.sort_by(|a, b| a.duration.total_cmp(&b.duration));

        let trim = window.len() / 20;
        let kept = &window[trim..window.len() - trim];
        let n = kept.len() as f64;
        Some(LoopSample {
            duration: kept.iter().map(|s| s.duration).sum::<f64>() / n,
            idle: kept.iter().map(|s| s.idle).sum::<f64>() / n,
        })
    }

    /// Bound the ring to its capacity, discarding the oldest samples.
    pub fn stats_trim(&mut self) {
        while self.stats.len() > STATS_CAPACITY {
            self.stats.pop_front();
        }
    }

    fn record(&mut self, sample: LoopSample) {
        self.stats.push_back(sample);
    }
}

/// Nice-value nudge for a given loop interval: tighter loops ask for more
/// scheduling priority, capped at −5.
#[must_use]
pub fn priority_hint(interval: f64) -> i32 {
    if interval >= 5.0 || interval <= 0.0 {
        0
    } else if interval > 2.0 {
        -1
    } else if interval > 1.0 {
        -2
    } else if interval > 0.5 {
        -3
    } else if interval > 0.1 {
        -4
    } else {
        -5
    }
}

/// Apply the nice-value hint for `interval` to the current process. Lack of
/// privilege is logged, never fatal. No-op off Unix and for a zero hint.
pub(crate) fn apply_priority_hint(interval: f64) {
    let hint = priority_hint(interval);
    if hint == 0 {
        return;
    }
    #[cfg(unix)]
    {
        if let Err(errno) = set_own_priority(hint) {
            warn!(hint, errno, "unable to adjust process priority");
        }
    }
    #[cfg(not(unix))]
    {
        warn!(hint, "process priority hints are not supported on this platform");
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn set_own_priority(prio: i32) -> std::result::Result<(), i32> {
    // SAFETY: setpriority on the current process with no pointers involved.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, prio) };
    if rc == -1 {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_plus_idle_matches_interval() {
        let mut timer = LoopTimer::new(0.2, 0.0);
        timer.start();
        std::thread::sleep(Duration::from_millis(50));
        let outcome = timer.finish();

        assert!((outcome.duration + outcome.idle - 0.2).abs() < 1e-9);
        assert!(outcome.duration >= 0.05);
        assert!(outcome.was_idle);
        assert!(!outcome.overrun);
        assert!(outcome.budget_until.is_some());
    }

    #[test]
    fn test_overrun_is_counted_and_idle_goes_negative() {
        let mut timer = LoopTimer::new(0.02, 0.0);
        for _ in 0..5 {
            timer.start();
            std::thread::sleep(Duration::from_millis(40));
            let outcome = timer.finish();
            assert!(outcome.overrun);
            assert!(outcome.idle < 0.0);
            assert!(!outcome.was_idle);
        }
        assert_eq!(timer.overruns(), 5);
    }

    #[test]
    fn test_free_running_loop_never_overruns() {
        let mut timer = LoopTimer::new(0.0, 0.0);
        timer.start();
        std::thread::sleep(Duration::from_millis(5));
        let outcome = timer.finish();
        assert!(!outcome.overrun);
        assert!(!outcome.was_idle);
        assert!(outcome.budget_until.is_none());
        assert_eq!(timer.overruns(), 0);
    }

    #[test]
    fn test_free_running_idle_follows_probability() {
        let mut always = LoopTimer::new(0.0, 1.0);
        always.start();
        assert!(always.finish().was_idle);

        let mut never = LoopTimer::new(0.0, 0.0);
        never.start();
        assert!(!never.finish().was_idle);
    }

    #[test]
    fn test_stats_mean_identical_samples() {
        let mut timer = LoopTimer::new(1.0, 0.0);
        for _ in 0..40 {
            timer.record(LoopSample {
                duration: 0.25,
                idle: 0.75,
            });
        }
        let mean = timer.stats_mean(100).unwrap();
        assert!((mean.duration - 0.25).abs() < 1e-9);
        assert!((mean.idle - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_stats_mean_trims_outliers() {
        let mut timer = LoopTimer::new(1.0, 0.0);
        for _ in 0..98 {
            timer.record(LoopSample {
                duration: 0.1,
                idle: 0.9,
            });
        }
        // Extremes on both ends; a 5% trim on 100 samples drops them.
        timer.record(LoopSample {
            duration: 10.0,
            idle: -9.0,
        });
        timer.record(LoopSample {
            duration: 0.0001,
            idle: 0.9999,
        });

        let mean = timer.stats_mean(100).unwrap();
        assert!((mean.duration - 0.1).abs() < 0.005);
    }

    #[test]
    fn test_stats_mean_respects_window() {
        let mut timer = LoopTimer::new(1.0, 0.0);
        for _ in 0..10 {
            timer.record(LoopSample {
                duration: 1.0,
                idle: 0.0,
            });
        }
        for _ in 0..10 {
            timer.record(LoopSample {
                duration: 3.0,
                idle: -2.0,
            });
        }
        let mean = timer.stats_mean(10).unwrap();
        assert!((mean.duration - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_trim_bounds_the_ring() {
        let mut timer = LoopTimer::new(1.0, 0.0);
        for _ in 0..500 {
            timer.record(LoopSample {
                duration: 0.1,
                idle: 0.9,
            });
        }
        timer.stats_trim();
        assert_eq!(timer.sample_count(), 200);
    }

    #[test]
    fn test_priority_hint_table() {
        assert_eq!(priority_hint(0.0), 0);
        assert_eq!(priority_hint(5.0), 0);
        assert_eq!(priority_hint(7.5), 0);
        assert_eq!(priority_hint(3.0), -1);
        assert_eq!(priority_hint(1.5), -2);
        assert_eq!(priority_hint(0.75), -3);
        assert_eq!(priority_hint(0.2), -4);
        assert_eq!(priority_hint(0.05), -5);
    }

    #[test]
    fn test_probe_deadline_expires() {
        let mut timer = LoopTimer::new(0.05, 0.0);
        timer.start();
        let outcome = timer.finish();
        assert!(outcome.probe.still_idle());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!outcome.probe.still_idle());
    }
}
