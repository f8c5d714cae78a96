//! Per-run bookkeeping and completion detection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobflow_conveyor::ChannelCounts;
use tokio::time::Instant;

/// What one MONITOR poll concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Some channel still has unconsumed messages.
    Running,
    /// Every channel, in pipeline order, has `consumed >= produced`.
    Drained,
    /// Counters have not moved for longer than the idle threshold.
    Stalled { idle: Duration },
}

/// State of the run started by the last SETUP.
#[derive(Debug, Clone)]
pub struct RunState {
    pub process_seq: String,
    pub task_start: DateTime<Utc>,
    pub task_finish: Option<DateTime<Utc>>,
    /// Channels before this index are confirmed drained and never rechecked.
    pub topic_check_index: usize,
    pub last_counts: Option<Vec<ChannelCounts>>,
    pub idle_since: Option<Instant>,
    finished_at: Option<Instant>,
}

impl RunState {
    pub fn new(process_seq: impl Into<String>) -> Self {
        Self {
            process_seq: process_seq.into(),
            task_start: Utc::now(),
            task_finish: None,
            topic_check_index: 0,
            last_counts: None,
            idle_since: None,
            finished_at: None,
        }
    }

    /// Fold one snapshot of every channel's counters (in pipeline order).
    ///
    /// The stall check runs first: an unchanged snapshot starts or continues
    /// the idle timer, any change clears it. Then the drain scan walks
    /// forward from `topic_check_index` and stops at the first channel with
    /// `consumed < produced`.
    pub fn observe(
        &mut self,
        snapshot: &[ChannelCounts],
        now: Instant,
        max_idle: Duration,
    ) -> Observation {
        if self.last_counts.as_deref() == Some(snapshot) {
            let since = *self.idle_since.get_or_insert(now);
            let idle = now.saturating_duration_since(since);
            if idle > max_idle {
                return Observation::Stalled { idle };
            }
        } else {
            self.idle_since = None;
        }
        self.last_counts = Some(snapshot.to_vec());

        while let Some(counts) = snapshot.get(self.topic_check_index) {
            if !counts.is_drained() {
                return Observation::Running;
            }
            self.topic_check_index += 1;
        }
        Observation::Drained
    }

    pub fn mark_finished(&mut self, now: Instant) {
        self.task_finish = Some(Utc::now());
        self.finished_at = Some(now);
    }

    /// Cooldown left before the next SETUP. Zero when the run never finished.
    pub fn cooldown_remaining(&self, rerun_wait: Duration, now: Instant) -> Duration {
        match self.finished_at {
            Some(at) => (at + rerun_wait).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.task_finish.unwrap_or_else(Utc::now) - self.task_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(produced: i64, consumed: i64) -> ChannelCounts {
        ChannelCounts {
            produced,
            consumed,
            cached: 0,
        }
    }

    const IDLE: Duration = Duration::from_secs(600);

    #[test]
    fn drain_pointer_only_moves_forward() {
        let mut run = RunState::new("t");
        let t0 = Instant::now();

        assert_eq!(run.observe(&[c(2, 2), c(5, 3), c(0, 0)], t0, IDLE), Observation::Running);
        assert_eq!(run.topic_check_index, 1);

        assert_eq!(run.observe(&[c(2, 2), c(5, 5), c(4, 1)], t0, IDLE), Observation::Running);
        assert_eq!(run.topic_check_index, 2);

        assert_eq!(run.observe(&[c(2, 2), c(5, 5), c(4, 4)], t0, IDLE), Observation::Drained);
        assert_eq!(run.topic_check_index, 3);
    }

    #[test]
    fn later_drained_channels_do_not_finish_an_earlier_busy_one() {
        let mut run = RunState::new("t");
        let obs = run.observe(&[c(3, 1), c(0, 0), c(0, 0)], Instant::now(), IDLE);
        assert_eq!(obs, Observation::Running);
        assert_eq!(run.topic_check_index, 0);
    }

    #[test]
    fn identical_snapshots_stall_after_threshold() {
        let mut run = RunState::new("t");
        let snapshot = [c(4, 4), c(10, 7)];
        let t0 = Instant::now();

        assert_eq!(run.observe(&snapshot, t0, IDLE), Observation::Running);
        assert!(run.idle_since.is_none());

        let obs = run.observe(&snapshot, t0 + Duration::from_secs(10), IDLE);
        assert_eq!(obs, Observation::Running);
        assert!(run.idle_since.is_some());

        let obs = run.observe(&snapshot, t0 + Duration::from_secs(600), IDLE);
        assert_eq!(obs, Observation::Running);

        let obs = run.observe(&snapshot, t0 + Duration::from_secs(611), IDLE);
        assert_eq!(obs, Observation::Stalled { idle: Duration::from_secs(601) });
    }

    #[test]
    fn any_change_resets_idle_timer() {
        let mut run = RunState::new("t");
        let t0 = Instant::now();
        run.observe(&[c(1, 0)], t0, IDLE);
        run.observe(&[c(1, 0)], t0 + Duration::from_secs(5), IDLE);
        assert!(run.idle_since.is_some());

        run.observe(&[c(2, 0)], t0 + Duration::from_secs(700), IDLE);
        assert!(run.idle_since.is_none());
        let obs = run.observe(&[c(2, 0)], t0 + Duration::from_secs(800), IDLE);
        assert_eq!(obs, Observation::Running);
    }

    #[test]
    fn cooldown_counts_from_finish() {
        let mut run = RunState::new("t");
        let t0 = Instant::now();
        let wait = Duration::from_secs(900);
        assert_eq!(run.cooldown_remaining(wait, t0), Duration::ZERO);

        run.mark_finished(t0);
        assert!(run.task_finish.is_some());
        assert_eq!(
            run.cooldown_remaining(wait, t0 + Duration::from_secs(300)),
            Duration::from_secs(600)
        );
        assert_eq!(run.cooldown_remaining(wait, t0 + Duration::from_secs(1000)), Duration::ZERO);
    }
}
