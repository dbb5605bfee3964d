use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use tokio::time::Instant;

/// Configured sub-windows of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub baseline: Duration,
    pub prompt_phase: Duration,
    pub tail: Duration,
}

impl RunWindow {
    pub fn total(&self) -> Duration {
        self.baseline + self.prompt_phase + self.tail
    }
}

/// Run phases in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    Baseline,
    PromptPhase,
    Tail,
    Finalizing,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Baseline => "baseline",
            Phase::PromptPhase => "prompt_phase",
            Phase::Tail => "tail",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
        }
    }

    /// Whether `self -> to` is a legal transition. Any live phase may jump
    /// straight to `Finalizing` on cancellation.
    pub fn can_transition(&self, to: Phase) -> bool {
        match (self, to) {
            (Phase::Idle, Phase::Baseline)
            | (Phase::Baseline, Phase::PromptPhase)
            | (Phase::PromptPhase, Phase::Tail)
            | (Phase::Tail, Phase::Finalizing)
            | (Phase::Finalizing, Phase::Done) => true,
            (Phase::Idle | Phase::Baseline | Phase::PromptPhase, Phase::Finalizing) => true,
            _ => false,
        }
    }
}

/// Immutable timing context shared by every task of one run.
///
/// Holds the monotonic start instant together with the wall-clock time
/// captured at the same moment, so every sample can carry an absolute
/// timestamp derived from the monotonic clock.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    label: String,
    started: Instant,
    started_unix_ns: u64,
    window: RunWindow,
}

impl RunContext {
    /// Start the run clock now.
    pub fn start(run_id: impl Into<String>, label: impl Into<String>, window: RunWindow) -> Self {
        Self {
            run_id: run_id.into(),
            label: label.into(),
            started: Instant::now(),
            started_unix_ns: unix_now_ns(),
            window,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn window(&self) -> RunWindow {
        self.window
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn started_unix_ns(&self) -> u64 {
        self.started_unix_ns
    }

    /// Hard stop: start + baseline + prompt phase + tail.
    pub fn deadline(&self) -> Instant {
        self.started + self.window.total()
    }

    pub fn baseline_end(&self) -> Instant {
        self.started + self.window.baseline
    }

    /// Absolute Unix timestamp of a monotonic instant within this run.
    pub fn timestamp_ns(&self, at: Instant) -> u64 {
        let offset = at.saturating_duration_since(self.started).as_nanos();
        self.started_unix_ns
            .saturating_add(u64::try_from(offset).unwrap_or(u64::MAX))
    }

    pub fn now_ns(&self) -> u64 {
        self.timestamp_ns(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left until the hard deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }
}

/// Fixed wake-up schedule: tick `k` is due at `origin + k * interval`,
/// independent of how long earlier iterations took.
#[derive(Debug, Clone)]
pub struct Schedule {
    origin: Instant,
    interval_ns: u128,
    next: u64,
}

impl Schedule {
    pub fn new(origin: Instant, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            bail!("schedule interval must be > 0");
        }

        Ok(Self {
            origin,
            interval_ns: interval.as_nanos(),
            next: 0,
        })
    }

    /// Index of the next tick to run.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// When tick `index` is due.
    pub fn tick_at(&self, index: u64) -> Instant {
        let offset = self.interval_ns.saturating_mul(u128::from(index));
        self.origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
    }

    /// Due time of the next tick.
    pub fn next_due(&self) -> Instant {
        self.tick_at(self.next)
    }

    /// Mark the current tick done at `now` and move to the first tick due
    /// at or after `now`. Returns the indices of ticks whose wake-ups passed
    /// while the current one was being handled.
    pub fn advance(&mut self, now: Instant) -> std::ops::Range<u64> {
        let current = self.next;
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let first_due = u64::try_from(elapsed.div_ceil(self.interval_ns)).unwrap_or(u64::MAX);
        let next = first_due.max(current + 1);

        self.next = next;
        (current + 1)..next
    }
}

/// Current wall-clock time in Unix nanoseconds.
pub fn unix_now_ns() -> u64 {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    u64::try_from(since.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> RunWindow {
        RunWindow {
            baseline: Duration::from_secs(2),
            prompt_phase: Duration::from_secs(60),
            tail: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_window_total() {
        assert_eq!(window().total(), Duration::from_secs(64));
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Idle.can_transition(Phase::Baseline));
        assert!(Phase::Baseline.can_transition(Phase::PromptPhase));
        assert!(Phase::PromptPhase.can_transition(Phase::Tail));
        assert!(Phase::Tail.can_transition(Phase::Finalizing));
        assert!(Phase::Finalizing.can_transition(Phase::Done));

        // Cancellation shortcut.
        assert!(Phase::Baseline.can_transition(Phase::Finalizing));
        assert!(Phase::PromptPhase.can_transition(Phase::Finalizing));

        assert!(!Phase::Baseline.can_transition(Phase::Tail));
        assert!(!Phase::Done.can_transition(Phase::Baseline));
        assert!(!Phase::Tail.can_transition(Phase::PromptPhase));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_context_deadlines() {
        let ctx = RunContext::start("r1", "neutral", window());
        assert_eq!(ctx.deadline() - ctx.started(), Duration::from_secs(64));
        assert_eq!(ctx.baseline_end() - ctx.started(), Duration::from_secs(2));
        assert_eq!(ctx.run_id(), "r1");
        assert_eq!(ctx.label(), "neutral");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ctx.remaining(), Duration::from_secs(54));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_follow_monotonic_clock() {
        let ctx = RunContext::start("r1", "neutral", window());
        let t0 = ctx.timestamp_ns(ctx.started());
        assert_eq!(t0, ctx.started_unix_ns());

        tokio::time::advance(Duration::from_millis(1500)).await;
        let t1 = ctx.now_ns();
        assert_eq!(t1 - t0, 1_500_000_000);

        // Instants before start clamp to the anchor.
        assert_eq!(ctx.timestamp_ns(ctx.started() - Duration::from_secs(1)), t0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_on_time() {
        let origin = Instant::now();
        let mut sched = Schedule::new(origin, Duration::from_millis(10)).expect("valid");
        assert_eq!(sched.next_due(), origin);

        let skipped = sched.advance(origin + Duration::from_millis(3));
        assert!(skipped.is_empty());
        assert_eq!(sched.next_index(), 1);
        assert_eq!(sched.next_due(), origin + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_skips_late_ticks_without_drift() {
        let origin = Instant::now();
        let mut sched = Schedule::new(origin, Duration::from_millis(10)).expect("valid");

        // Tick 0 took 35ms: ticks 1, 2 and 3 were due meanwhile.
        let skipped = sched.advance(origin + Duration::from_millis(35));
        assert_eq!(skipped, 1..4);
        assert_eq!(sched.next_index(), 4);
        assert_eq!(sched.next_due(), origin + Duration::from_millis(40));

        // Finishing exactly on a boundary leaves that tick runnable.
        let skipped = sched.advance(origin + Duration::from_millis(50));
        assert!(skipped.is_empty());
        assert_eq!(sched.next_index(), 5);
        assert_eq!(sched.next_due(), origin + Duration::from_millis(50));
    }

    #[test]
    fn test_schedule_rejects_zero_interval() {
        let result = Schedule::new(Instant::now(), Duration::ZERO);
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("interval"));
    }
}
