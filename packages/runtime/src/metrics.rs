//! Request and event counters.
//!
//! Counters are atomics so every task can record without locking. Each
//! mutation is mirrored to the `metrics` facade under the same `fs_*` name,
//! which is a no-op unless the embedding process installs a recorder.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Process-wide request/event counters shared by all tasks.
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    active_requests: AtomicI64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    /// `f64` seconds, stored as bits.
    request_latency: AtomicU64,
    /// `f64` seconds since the Unix epoch, stored as bits.
    last_request_time: AtomicU64,
    total_events: AtomicU64,
    successful_events: AtomicU64,
    failed_events: AtomicU64,
}

/// Point-in-time copy of [`Metrics`], serialized as the `/metrics` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub fs_total_requests: u64,
    pub fs_active_requests: i64,
    pub fs_successful_requests: u64,
    pub fs_failed_requests: u64,
    pub fs_request_latency_seconds: f64,
    pub fs_last_request_timestamp: f64,
    pub fs_total_events: u64,
    pub fs_successful_events: u64,
    pub fs_failed_events: u64,
    pub fs_request_success_rate: f64,
    pub fs_event_success_rate: f64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a new request as started and active.
    pub fn record_request_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.last_request_time.store(now.to_bits(), Ordering::Relaxed);

        ::metrics::counter!("fs_total_requests").increment(1);
        ::metrics::gauge!("fs_active_requests").increment(1.0);
    }

    /// Counts a request as finished and remembers its latency.
    pub fn record_request_end(&self, success: bool, latency: Duration) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("fs_successful_requests").increment(1);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("fs_failed_requests").increment(1);
        }
        let secs = latency.as_secs_f64();
        self.request_latency.store(secs.to_bits(), Ordering::Relaxed);

        ::metrics::gauge!("fs_active_requests").decrement(1.0);
        ::metrics::histogram!("fs_request_latency_seconds").record(secs);
    }

    /// Counts one processed event.
    pub fn record_event(&self, success: bool) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_events.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("fs_successful_events").increment(1);
        } else {
            self.failed_events.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("fs_failed_events").increment(1);
        }
        ::metrics::counter!("fs_total_events").increment(1);
    }

    /// Starts timing a request. See [`RequestScope`].
    #[must_use]
    pub fn begin_request(self: &Arc<Self>) -> RequestScope {
        self.record_request_start();
        RequestScope {
            metrics: Arc::clone(self),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Copies the counters and derives the success ratios.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let successful_requests = self.successful_requests.load(Ordering::Relaxed);
        let total_events = self.total_events.load(Ordering::Relaxed);
        let successful_events = self.successful_events.load(Ordering::Relaxed);

        MetricsSnapshot {
            fs_total_requests: total_requests,
            fs_active_requests: self.active_requests.load(Ordering::Relaxed),
            fs_successful_requests: successful_requests,
            fs_failed_requests: self.failed_requests.load(Ordering::Relaxed),
            fs_request_latency_seconds: f64::from_bits(
                self.request_latency.load(Ordering::Relaxed),
            ),
            fs_last_request_timestamp: f64::from_bits(
                self.last_request_time.load(Ordering::Relaxed),
            ),
            fs_total_events: total_events,
            fs_successful_events: successful_events,
            fs_failed_events: self.failed_events.load(Ordering::Relaxed),
            fs_request_success_rate: ratio(successful_requests, total_requests),
            fs_event_success_rate: ratio(successful_events, total_events),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

// ---------------------------------------------------------------------------
// RequestScope
// ---------------------------------------------------------------------------

/// RAII timer for one request.
///
/// Created by [`Metrics::begin_request`]. `finish` records the outcome; if
/// the scope is dropped unfinished (the task was abandoned or aborted) it
/// records a failed end, so `active = total - (succeeded + failed)` holds
/// once every task has exited.
#[derive(Debug)]
pub struct RequestScope {
    metrics: Arc<Metrics>,
    started: Instant,
    finished: bool,
}

impl RequestScope {
    /// Time since the request started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records the request end and returns its latency.
    pub fn finish(mut self, success: bool) -> Duration {
        let latency = self.started.elapsed();
        self.metrics.record_request_end(success, latency);
        self.finished = true;
        latency
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics
                .record_request_end(false, self.started.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fresh_snapshot_is_zeroed() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.fs_total_requests, 0);
        assert_eq!(snap.fs_active_requests, 0);
        assert!((snap.fs_request_success_rate - 0.0).abs() < f64::EPSILON);
        assert!((snap.fs_event_success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn start_and_end_move_counters() {
        let metrics = Metrics::new();
        metrics.record_request_start();
        metrics.record_request_start();
        assert_eq!(metrics.snapshot().fs_active_requests, 2);
        assert!(metrics.snapshot().fs_last_request_timestamp > 0.0);

        metrics.record_request_end(true, Duration::from_millis(250));
        metrics.record_request_end(false, Duration::from_millis(10));

        let snap = metrics.snapshot();
        assert_eq!(snap.fs_total_requests, 2);
        assert_eq!(snap.fs_active_requests, 0);
        assert_eq!(snap.fs_successful_requests, 1);
        assert_eq!(snap.fs_failed_requests, 1);
        assert!((snap.fs_request_latency_seconds - 0.01).abs() < 1e-9);
        assert!((snap.fs_request_success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn events_and_rate() {
        let metrics = Metrics::new();
        metrics.record_event(true);
        metrics.record_event(true);
        metrics.record_event(true);
        metrics.record_event(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.fs_total_events, 4);
        assert_eq!(snap.fs_successful_events, 3);
        assert_eq!(snap.fs_failed_events, 1);
        assert!((snap.fs_event_success_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn dropped_scope_counts_as_failure() {
        let metrics = Arc::new(Metrics::new());
        let scope = metrics.begin_request();
        assert_eq!(metrics.snapshot().fs_active_requests, 1);
        drop(scope);

        let snap = metrics.snapshot();
        assert_eq!(snap.fs_active_requests, 0);
        assert_eq!(snap.fs_failed_requests, 1);
    }

    #[test]
    fn finished_scope_records_once() {
        let metrics = Arc::new(Metrics::new());
        metrics.begin_request().finish(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.fs_successful_requests, 1);
        assert_eq!(snap.fs_failed_requests, 0);
        assert_eq!(snap.fs_active_requests, 0);
    }

    #[test]
    fn snapshot_serializes_with_fs_names() {
        let metrics = Metrics::new();
        metrics.record_event(true);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["fs_total_events"], 1);
        assert_eq!(json.as_object().unwrap().len(), 11);
    }

    proptest! {
        #[test]
        fn active_is_total_minus_finished(outcomes in proptest::collection::vec(any::<Option<bool>>(), 0..64)) {
            // None = still running, Some(ok) = finished with that outcome.
            let metrics = Arc::new(Metrics::new());
            let mut running = Vec::new();
            for outcome in &outcomes {
                let scope = metrics.begin_request();
                match outcome {
                    Some(ok) => { scope.finish(*ok); }
                    None => running.push(scope),
                }
            }

            let snap = metrics.snapshot();
            let finished = snap.fs_successful_requests + snap.fs_failed_requests;
            prop_assert_eq!(snap.fs_total_requests, outcomes.len() as u64);
            prop_assert_eq!(snap.fs_active_requests, (snap.fs_total_requests - finished) as i64);

            drop(running);
            let snap = metrics.snapshot();
            prop_assert_eq!(snap.fs_active_requests, 0);
        }
    }
}
