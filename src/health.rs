//! Source liveness and data-rate tracking.
//!
//! Keeps a short sliding window of receive instants for the rate estimate
//! and a coarse status that the session surfaces as telemetry.  The
//! monitor never drives itself: the session records sentences into it and
//! calls `tick` on a timer, so all transitions happen on the session's
//! tasks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate-estimate window.
const RATE_WINDOW: Duration = Duration::from_secs(2);
/// Silence on the source after which a healthy stream is marked stale.
const STALE_AFTER: Duration = Duration::from_secs(3);
/// Cadence at which the session should call [`HealthMonitor::tick`].
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Stale,
    Error,
}

#[derive(Debug)]
struct Inner {
    last_received: Option<Instant>,
    timestamps:    VecDeque<Instant>,
    status:        HealthStatus,
}

#[derive(Debug)]
pub struct HealthMonitor {
    inner: Mutex<Inner>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        HealthMonitor {
            inner: Mutex::new(Inner {
                last_received: None,
                timestamps:    VecDeque::new(),
                status:        HealthStatus::Unknown,
            }),
        }
    }

    /// Note one received sentence.  Returns the status transition this
    /// caused, if any.
    pub fn record(&self) -> Option<(HealthStatus, HealthStatus)> {
        self.record_at(Instant::now())
    }

    fn record_at(&self, now: Instant) -> Option<(HealthStatus, HealthStatus)> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_received = Some(now);
        inner.timestamps.push_back(now);
        while inner
            .timestamps
            .front()
            .is_some_and(|&t| now.duration_since(t) > RATE_WINDOW)
        {
            inner.timestamps.pop_front();
        }
        Self::transition(&mut inner, HealthStatus::Healthy)
    }

    /// Periodic staleness check; call every [`TICK_INTERVAL`].
    pub fn tick(&self) -> Option<(HealthStatus, HealthStatus)> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&self, now: Instant) -> Option<(HealthStatus, HealthStatus)> {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.status, HealthStatus::Healthy | HealthStatus::Stale) {
            return None;
        }
        let silent = inner
            .last_received
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::MAX);
        if silent > STALE_AFTER {
            Self::transition(&mut inner, HealthStatus::Stale)
        } else {
            None
        }
    }

    /// Session-driven escalation; the monitor never enters `Error` on its
    /// own.
    pub fn set_error(&self) -> Option<(HealthStatus, HealthStatus)> {
        let mut inner = self.inner.lock().unwrap();
        Self::transition(&mut inner, HealthStatus::Error)
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().unwrap().status
    }

    /// Sentences per second over the rate window, 0.0 until two samples
    /// have landed.
    pub fn data_rate_hz(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let (first, last) = match (inner.timestamps.front(), inner.timestamps.back()) {
            (Some(&f), Some(&l)) if inner.timestamps.len() >= 2 => (f, l),
            _ => return 0.0,
        };
        let span = last.duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (inner.timestamps.len() - 1) as f64 / span
    }

    /// Drop the window and return to `Unknown`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_received = None;
        inner.timestamps.clear();
        inner.status = HealthStatus::Unknown;
    }

    fn transition(
        inner: &mut Inner,
        to: HealthStatus,
    ) -> Option<(HealthStatus, HealthStatus)> {
        if inner.status == to {
            return None;
        }
        let old = inner.status;
        inner.status = to;
        Some((old, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_marks_healthy_once() {
        let m = HealthMonitor::new();
        assert_eq!(m.status(), HealthStatus::Unknown);
        let t0 = Instant::now();
        assert_eq!(
            m.record_at(t0),
            Some((HealthStatus::Unknown, HealthStatus::Healthy))
        );
        // Second record is not a transition.
        assert_eq!(m.record_at(t0 + Duration::from_millis(100)), None);
        assert_eq!(m.status(), HealthStatus::Healthy);
    }

    #[test]
    fn rate_over_window() {
        let m = HealthMonitor::new();
        let t0 = Instant::now();
        // 5 samples spaced 100 ms: 4 intervals over 0.4 s = 10 Hz.
        for i in 0..5 {
            m.record_at(t0 + Duration::from_millis(100 * i));
        }
        let rate = m.data_rate_hz();
        assert!((rate - 10.0).abs() < 0.01, "rate={rate}");
    }

    #[test]
    fn rate_needs_two_samples() {
        let m = HealthMonitor::new();
        assert_eq!(m.data_rate_hz(), 0.0);
        m.record_at(Instant::now());
        assert_eq!(m.data_rate_hz(), 0.0);
    }

    #[test]
    fn old_samples_age_out_of_window() {
        let m = HealthMonitor::new();
        let t0 = Instant::now();
        m.record_at(t0);
        m.record_at(t0 + Duration::from_secs(5));
        m.record_at(t0 + Duration::from_secs(5) + Duration::from_millis(500));
        // The t0 sample is gone: 1 interval over 0.5 s.
        let rate = m.data_rate_hz();
        assert!((rate - 2.0).abs() < 0.01, "rate={rate}");
    }

    #[test]
    fn goes_stale_after_silence() {
        let m = HealthMonitor::new();
        let t0 = Instant::now();
        m.record_at(t0);
        assert_eq!(m.tick_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(
            m.tick_at(t0 + Duration::from_secs(4)),
            Some((HealthStatus::Healthy, HealthStatus::Stale))
        );
        // Stays stale without re-announcing.
        assert_eq!(m.tick_at(t0 + Duration::from_secs(5)), None);
        // Fresh data recovers.
        assert_eq!(
            m.record_at(t0 + Duration::from_secs(6)),
            Some((HealthStatus::Stale, HealthStatus::Healthy))
        );
    }

    #[test]
    fn error_is_session_driven_and_sticky_for_tick() {
        let m = HealthMonitor::new();
        m.record_at(Instant::now());
        assert!(m.set_error().is_some());
        assert_eq!(m.tick(), None);
        assert_eq!(m.status(), HealthStatus::Error);
    }

    #[test]
    fn reset_returns_to_unknown() {
        let m = HealthMonitor::new();
        m.record_at(Instant::now());
        m.reset();
        assert_eq!(m.status(), HealthStatus::Unknown);
        assert_eq!(m.data_rate_hz(), 0.0);
    }
}
