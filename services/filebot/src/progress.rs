//! Transfer progress bookkeeping.
//!
//! [`ProgressTracker`] turns cumulative byte counts reported by the storage
//! gateway into percentage, speed and ETA figures, emitting at most one
//! notification every [`EMIT_INTERVAL`] plus a final one on completion.
//! [`ProgressNotifier`] owns the background task that forwards those
//! notifications to a [`StatusSink`] without blocking the transfer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Minimum spacing between two progress notifications
pub const EMIT_INTERVAL: Duration = Duration::from_secs(2);

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Cumulative bytes transferred
    pub transferred: u64,
    /// Declared total size
    pub total: u64,
    /// Completion percentage, 0.0 to 100.0
    pub percentage: f64,
    /// Average speed since start in MB/s
    pub speed_mbps: f64,
    /// Estimated seconds remaining, `None` while unknown
    pub eta_secs: Option<f64>,
}

impl ProgressSnapshot {
    /// ETA rendered for display, `--:--` while unknown
    pub fn eta_text(&self) -> String {
        self.eta_secs
            .map(format_eta)
            .unwrap_or_else(|| "--:--".to_string())
    }
}

/// Format an ETA in seconds as `45s` or `2m 5s`, truncating fractions
pub fn format_eta(eta_secs: f64) -> String {
    let secs = if eta_secs.is_finite() && eta_secs > 0.0 {
        eta_secs as u64
    } else {
        0
    };

    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

type NotifyFn = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

struct TrackerState {
    transferred: u64,
    last_emit: Option<Instant>,
    completed: bool,
    latest: ProgressSnapshot,
}

/// Progress tracker for one in-flight upload
///
/// The notify callback runs while the tracker's lock is held so that
/// notifications keep their order; it must not call back into the tracker.
pub struct ProgressTracker {
    total: u64,
    started: Instant,
    notify: NotifyFn,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Create a tracker for a transfer of `total` bytes starting now
    pub fn new<F>(total: u64, notify: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + Sync + 'static,
    {
        Self::starting_at(total, Instant::now(), notify)
    }

    /// Create a tracker with an explicit start instant
    pub fn starting_at<F>(total: u64, started: Instant, notify: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + Sync + 'static,
    {
        let latest = compute(total, 0, Duration::ZERO);

        Self {
            total,
            started,
            notify: Box::new(notify),
            state: Mutex::new(TrackerState {
                transferred: 0,
                last_emit: None,
                completed: false,
                latest,
            }),
        }
    }

    /// Record the cumulative number of bytes transferred so far
    pub fn on_bytes(&self, transferred: u64) {
        self.on_bytes_at(transferred, Instant::now());
    }

    /// Record a cumulative byte count observed at `now`
    pub fn on_bytes_at(&self, transferred: u64, now: Instant) {
        let mut state = self.state.lock();

        // Concurrent part uploads may report slightly stale totals
        if transferred < state.transferred {
            trace!(
                transferred = transferred,
                last = state.transferred,
                "Ignoring regressed progress value"
            );
            return;
        }

        state.transferred = transferred;
        let snapshot = compute(
            self.total,
            transferred,
            now.saturating_duration_since(self.started),
        );
        state.latest = snapshot.clone();

        if transferred >= self.total {
            if state.completed {
                return;
            }
            state.completed = true;
        } else {
            let due = state
                .last_emit
                .map_or(true, |last| now.saturating_duration_since(last) >= EMIT_INTERVAL);
            if !due {
                return;
            }
        }

        state.last_emit = Some(now);
        (self.notify)(snapshot);
    }

    /// Latest computed progress, whether or not it was emitted
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().latest.clone()
    }
}

fn compute(total: u64, transferred: u64, elapsed: Duration) -> ProgressSnapshot {
    let elapsed = elapsed.as_secs_f64();

    let percentage = if total == 0 {
        0.0
    } else {
        (transferred as f64 / total as f64 * 100.0).min(100.0)
    };

    let (speed_mbps, eta_secs) = if elapsed > 0.0 {
        let bytes_per_sec = transferred as f64 / elapsed;
        let eta = if transferred > 0 {
            Some(total.saturating_sub(transferred) as f64 / bytes_per_sec)
        } else {
            None
        };
        (bytes_per_sec / BYTES_PER_MB, eta)
    } else {
        (0.0, None)
    };

    ProgressSnapshot {
        transferred,
        total,
        percentage,
        speed_mbps,
        eta_secs,
    }
}

/// Destination for user-facing status text
///
/// Delivery is best-effort: implementations swallow their own errors, since
/// the originating chat may be gone by the time an update is sent.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update(&self, text: String);
}

/// Background task forwarding status text to a [`StatusSink`]
///
/// Sends never block; when updates queue up faster than the sink accepts
/// them only the newest is delivered.
pub struct ProgressNotifier {
    tx: mpsc::UnboundedSender<String>,
    done: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressNotifier {
    /// Spawn the forwarding task for `sink`
    pub fn spawn(sink: Arc<dyn StatusSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let done = CancellationToken::new();

        let task_done = done.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_done.cancelled() => {
                        let mut last = None;
                        while let Ok(text) = rx.try_recv() {
                            last = Some(text);
                        }
                        if let Some(text) = last {
                            sink.update(text).await;
                        }
                        break;
                    }
                    next = rx.recv() => {
                        let Some(mut text) = next else { break };
                        while let Ok(newer) = rx.try_recv() {
                            text = newer;
                        }
                        sink.update(text).await;
                    }
                }
            }
            trace!("Progress notifier stopped");
        });

        Self { tx, done, handle }
    }

    /// Handle for producers such as a tracker callback
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.tx.clone()
    }

    /// Deliver the newest pending update, waiting at most `grace` for the sink
    ///
    /// A sink that is still busy when `grace` runs out is abandoned.
    pub async fn finish(mut self, grace: Duration) {
        self.done.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Progress notifier task failed"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Status sink did not drain in time, dropping pending update"
                );
                self.handle.abort();
            }
        }
    }

    /// Stop the task, dropping pending updates
    pub async fn cancel(mut self) {
        self.handle.abort();
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                debug!(error = %e, "Progress notifier task failed");
            }
        }
    }
}

impl Drop for ProgressNotifier {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_tracker(
        total: u64,
        start: Instant,
    ) -> (ProgressTracker, Arc<Mutex<Vec<ProgressSnapshot>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let tracker = ProgressTracker::starting_at(total, start, move |s| sink.lock().push(s));
        (tracker, emitted)
    }

    fn secs(start: Instant, s: f64) -> Instant {
        start + Duration::from_secs_f64(s)
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(45.0), "45s");
        assert_eq!(format_eta(125.0), "2m 5s");
        assert_eq!(format_eta(59.9), "59s");
        assert_eq!(format_eta(60.0), "1m 0s");
        assert_eq!(format_eta(3599.99), "59m 59s");
        assert_eq!(format_eta(0.4), "0s");
    }

    #[test]
    fn test_final_emission_is_exactly_one_hundred_percent() {
        let start = Instant::now();
        let (tracker, emitted) = recording_tracker(1000, start);

        for (i, transferred) in (0..=1000).step_by(100).enumerate() {
            tracker.on_bytes_at(transferred, secs(start, 0.5 * (i + 1) as f64));
        }

        let emitted = emitted.lock();
        let last = emitted.last().unwrap();
        assert_eq!(last.percentage, 100.0);
        assert_eq!(last.transferred, 1000);
        assert_eq!(last.eta_secs, Some(0.0));
    }

    #[test]
    fn test_zero_total_reports_zero_percent() {
        let start = Instant::now();
        let (tracker, emitted) = recording_tracker(0, start);

        tracker.on_bytes_at(0, start);

        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].percentage, 0.0);
        assert_eq!(emitted[0].speed_mbps, 0.0);
        assert_eq!(emitted[0].eta_secs, None);
    }

    #[test]
    fn test_emissions_are_throttled() {
        let start = Instant::now();
        let (tracker, emitted) = recording_tracker(10_000, start);

        tracker.on_bytes_at(100, secs(start, 0.1));
        tracker.on_bytes_at(200, secs(start, 1.0));
        tracker.on_bytes_at(300, secs(start, 2.0));
        tracker.on_bytes_at(400, secs(start, 2.1));
        tracker.on_bytes_at(500, secs(start, 3.0));

        let transferred: Vec<u64> = emitted.lock().iter().map(|s| s.transferred).collect();
        assert_eq!(transferred, vec![100, 400]);
    }

    #[test]
    fn test_completion_bypasses_throttle_once() {
        let start = Instant::now();
        let (tracker, emitted) = recording_tracker(1000, start);

        tracker.on_bytes_at(500, secs(start, 0.5));
        tracker.on_bytes_at(1000, secs(start, 0.6));
        tracker.on_bytes_at(1000, secs(start, 5.0));

        let transferred: Vec<u64> = emitted.lock().iter().map(|s| s.transferred).collect();
        assert_eq!(transferred, vec![500, 1000]);
    }

    #[test]
    fn test_regressed_values_are_ignored() {
        let start = Instant::now();
        let (tracker, _emitted) = recording_tracker(1000, start);

        tracker.on_bytes_at(600, secs(start, 1.0));
        tracker.on_bytes_at(300, secs(start, 1.1));

        assert_eq!(tracker.snapshot().transferred, 600);
    }

    #[test]
    fn test_speed_and_eta() {
        let start = Instant::now();
        let mb = 1024 * 1024;
        let (tracker, emitted) = recording_tracker(10 * mb, start);

        tracker.on_bytes_at(5 * mb, secs(start, 5.0));

        let emitted = emitted.lock();
        assert_eq!(emitted[0].percentage, 50.0);
        assert!((emitted[0].speed_mbps - 1.0).abs() < 1e-9);
        assert_eq!(emitted[0].eta_text(), "5s");
    }

    #[test]
    fn test_unknown_eta_without_bytes() {
        let start = Instant::now();
        let (tracker, emitted) = recording_tracker(1000, start);

        tracker.on_bytes_at(0, secs(start, 3.0));

        let emitted = emitted.lock();
        assert_eq!(emitted[0].eta_secs, None);
        assert_eq!(emitted[0].eta_text(), "--:--");
    }

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn update(&self, text: String) {
            self.updates.lock().push(text);
        }
    }

    #[tokio::test]
    async fn test_notifier_delivers_newest_update_on_finish() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone());

        let updates = notifier.sender();
        for text in ["a", "b", "c"] {
            updates.send(text.to_string()).unwrap();
        }
        notifier.finish(Duration::from_secs(5)).await;

        assert_eq!(*sink.updates.lock(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_notifier_cancel_drops_pending_updates() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone());

        notifier.sender().send("a".to_string()).unwrap();
        notifier.cancel().await;

        assert!(sink.updates.lock().is_empty());
    }

    /// Sink whose delivery never completes
    struct StuckSink;

    #[async_trait]
    impl StatusSink for StuckSink {
        async fn update(&self, _text: String) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_finish_gives_up_on_stuck_sink() {
        let notifier = ProgressNotifier::spawn(Arc::new(StuckSink));
        notifier.sender().send("50%".to_string()).unwrap();

        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            notifier.finish(Duration::from_millis(50)),
        )
        .await;

        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_stuck_sink() {
        let notifier = ProgressNotifier::spawn(Arc::new(StuckSink));
        notifier.sender().send("50%".to_string()).unwrap();
        tokio::task::yield_now().await;

        let cancelled = tokio::time::timeout(Duration::from_secs(5), notifier.cancel()).await;

        assert!(cancelled.is_ok());
    }
}
