//! Run progress and ETA.
//!
//! One tracker per run, shared by every worker. All state sits behind a single
//! mutex that is held only while a completion is counted. Observers are called
//! after the lock is released, so updates from concurrent workers may arrive
//! out of order; each percent is still reported at most once.

use anyhow::{anyhow, ensure, Result};
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info};

// =============================================================================
// Observers
// =============================================================================

/// Progress snapshot emitted when the integer percent moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u32,
    pub completed: usize,
    pub total: usize,
    pub elapsed: Duration,
    /// Estimated time left until the whole run completes.
    pub remaining: Duration,
}

impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.remaining.as_secs();
        write!(
            f,
            "{}% - {:02}:{:02}:{:02} remaining",
            self.percent,
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

/// Receives progress and error notifications from a conversion run.
///
/// Called from worker threads.
pub trait ConvertObserver: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);

    /// Full diagnostic text for a failed file or a tracker error.
    fn on_error(&self, message: &str);
}

/// Forwards notifications to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ConvertObserver for TracingObserver {
    fn on_progress(&self, update: &ProgressUpdate) {
        info!(
            completed = update.completed,
            total = update.total,
            "{}",
            update
        );
    }

    fn on_error(&self, message: &str) {
        error!("{}", message);
    }
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug)]
struct ProgressState {
    total: usize,
    completed: usize,
    last_percent: u32,
    started: Instant,
}

/// Thread-safe completion counter for a run.
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                total: 0,
                completed: 0,
                last_percent: 0,
                started: Instant::now(),
            }),
        }
    }

    /// Reset for a new run of `total` files, starting the clock now.
    pub fn start(&self, total: usize) {
        self.start_at(total, Instant::now());
    }

    pub fn start_at(&self, total: usize, started: Instant) {
        let mut state = self.state.lock();
        *state = ProgressState {
            total,
            completed: 0,
            last_percent: 0,
            started,
        };
    }

    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    pub fn completed(&self) -> usize {
        self.state.lock().completed
    }

    /// Count one finished file (successful or not) and report to `observer`.
    ///
    /// Tracker errors go to the observer's error channel; they never reach the
    /// caller.
    pub fn record_completion(&self, observer: &dyn ConvertObserver) {
        self.record_completion_at(Instant::now(), observer);
    }

    pub fn record_completion_at(&self, now: Instant, observer: &dyn ConvertObserver) {
        let outcome = {
            let mut state = self.state.lock();
            Self::advance(&mut state, now)
        };

        match outcome {
            Ok(Some(update)) => observer.on_progress(&update),
            Ok(None) => {}
            Err(e) => observer.on_error(&format!("Progress tracking failed: {:#}", e)),
        }
    }

    /// Increment and, if the percent moved forward, build the update.
    fn advance(state: &mut ProgressState, now: Instant) -> Result<Option<ProgressUpdate>> {
        ensure!(state.total > 0, "progress total is zero");
        ensure!(
            state.completed < state.total,
            "completion count would exceed total of {}",
            state.total
        );

        state.completed += 1;

        let percent = state
            .completed
            .checked_mul(100)
            .and_then(|v| v.checked_div(state.total))
            .ok_or_else(|| anyhow!("percent overflow at {} of {}", state.completed, state.total))?;
        let percent = u32::try_from(percent)?;

        if percent == 0 || percent <= state.last_percent {
            return Ok(None);
        }
        state.last_percent = percent;

        let elapsed = now.saturating_duration_since(state.started);
        let projected = elapsed
            .checked_mul(100)
            .and_then(|d| d.checked_div(percent))
            .ok_or_else(|| anyhow!("ETA overflow after {:?}", elapsed))?;

        Ok(Some(ProgressUpdate {
            percent,
            completed: state.completed,
            total: state.total,
            elapsed,
            remaining: projected.saturating_sub(elapsed),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        updates: Mutex<Vec<ProgressUpdate>>,
        errors: Mutex<Vec<String>>,
    }

    impl ConvertObserver for Collect {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.updates.lock().push(*update);
        }

        fn on_error(&self, message: &str) {
            self.errors.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_percent_reported_once_per_value() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        tracker.start(3);

        for _ in 0..3 {
            tracker.record_completion(&observer);
        }

        let percents: Vec<u32> = observer.updates.lock().iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![33, 66, 100]);
        assert!(observer.errors.lock().is_empty());
    }

    #[test]
    fn test_percent_non_decreasing_without_duplicates() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        tracker.start(250);

        for _ in 0..250 {
            tracker.record_completion(&observer);
        }

        let percents: Vec<u32> = observer.updates.lock().iter().map(|u| u.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents.first(), Some(&1)); // 3 * 100 / 250
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(percents.len(), 100);
        assert_eq!(tracker.completed(), 250);
    }

    #[test]
    fn test_zero_percent_not_reported() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        tracker.start(1000);

        for _ in 0..9 {
            tracker.record_completion(&observer);
        }
        assert!(observer.updates.lock().is_empty());

        tracker.record_completion(&observer);
        assert_eq!(observer.updates.lock()[0].percent, 1);
    }

    #[test]
    fn test_eta_projection() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        let t0 = Instant::now();
        tracker.start_at(4, t0);

        tracker.record_completion_at(t0 + Duration::from_secs(30), &observer);

        let update = observer.updates.lock()[0];
        assert_eq!(update.percent, 25);
        assert_eq!(update.elapsed, Duration::from_secs(30));
        assert_eq!(update.remaining, Duration::from_secs(90));
        assert_eq!(update.to_string(), "25% - 00:01:30 remaining");
    }

    #[test]
    fn test_display_hours() {
        let update = ProgressUpdate {
            percent: 7,
            completed: 7,
            total: 100,
            elapsed: Duration::from_secs(10),
            remaining: Duration::from_secs(3 * 3600 + 5 * 60 + 9),
        };
        assert_eq!(update.to_string(), "7% - 03:05:09 remaining");
    }

    #[test]
    fn test_zero_total_reports_tracker_error() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        tracker.start(0);

        tracker.record_completion(&observer);

        assert!(observer.updates.lock().is_empty());
        let errors = observer.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("total is zero"));
        assert_eq!(tracker.completed(), 0);
    }

    #[test]
    fn test_completed_never_exceeds_total() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        tracker.start(2);

        for _ in 0..3 {
            tracker.record_completion(&observer);
        }

        assert_eq!(tracker.completed(), 2);
        assert_eq!(observer.errors.lock().len(), 1);
    }

    #[test]
    fn test_concurrent_completions() {
        let tracker = ProgressTracker::new();
        let observer = Collect::default();
        tracker.start(400);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        tracker.record_completion(&observer);
                    }
                });
            }
        });

        assert_eq!(tracker.completed(), 400);
        let mut percents: Vec<u32> = observer.updates.lock().iter().map(|u| u.percent).collect();
        percents.sort_unstable();
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents.len(), 100);
        assert_eq!(percents.last(), Some(&100));
    }

    /// Reads the tracker back from inside its callbacks.
    struct Reentrant<'a> {
        tracker: &'a ProgressTracker,
        seen: Mutex<Vec<usize>>,
    }

    impl ConvertObserver for Reentrant<'_> {
        fn on_progress(&self, _update: &ProgressUpdate) {
            self.seen.lock().push(self.tracker.completed());
        }

        fn on_error(&self, _message: &str) {
            self.seen.lock().push(self.tracker.total());
        }
    }

    #[test]
    fn test_observer_called_outside_lock() {
        let tracker = ProgressTracker::new();
        let observer = Reentrant {
            tracker: &tracker,
            seen: Mutex::new(Vec::new()),
        };
        tracker.start(2);

        for _ in 0..3 {
            tracker.record_completion(&observer);
        }

        // Two progress reports, then the over-count error.
        assert_eq!(*observer.seen.lock(), vec![1, 2, 2]);
    }
}
