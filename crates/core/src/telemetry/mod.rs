mod window;

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use window::LatencyWindow;

const DEFAULT_WINDOW: usize = 32;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub count: u64,
    pub avg_ms: f64,
}

/// Extended view including the recent-latency window.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub avg_ms: f64,
    pub recent_avg_ms: Option<f64>,
    pub recent_max_ms: Option<f64>,
    pub last_ms: Option<f64>,
}

struct TelemetryState {
    metrics: PerformanceMetrics,
    recent: LatencyWindow,
}

/// Extraction latency for one modality: a streaming mean over every
/// delivered result plus a window over the most recent ones.
pub struct PerformanceTelemetry {
    state: Mutex<TelemetryState>,
}

impl Default for PerformanceTelemetry {
    fn default() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }
}

impl PerformanceTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TelemetryState {
                metrics: PerformanceMetrics::default(),
                recent: LatencyWindow::new(capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TelemetryState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut state = self.lock();
        let m = &mut state.metrics;
        m.count += 1;
        m.avg_ms += (ms - m.avg_ms) / m.count as f64;
        state.recent.push(ms);
    }

    pub fn snapshot(&self) -> PerformanceMetrics {
        self.lock().metrics
    }

    pub fn summary(&self) -> LatencySummary {
        let state = self.lock();
        LatencySummary {
            count: state.metrics.count,
            avg_ms: state.metrics.avg_ms,
            recent_avg_ms: state.recent.mean(),
            recent_max_ms: state.recent.max(),
            last_ms: state.recent.latest(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_mean_matches_arithmetic_mean() {
        let t = PerformanceTelemetry::new();
        assert_eq!(t.snapshot(), PerformanceMetrics::default());

        for ms in [10u64, 20, 30, 40] {
            t.record(Duration::from_millis(ms));
        }
        let m = t.snapshot();
        assert_eq!(m.count, 4);
        assert!((m.avg_ms - 25.0).abs() < 1e-9);
    }

    #[test]
    fn summary_tracks_recent_window() {
        let t = PerformanceTelemetry::with_window(2);
        t.record(Duration::from_millis(100));
        t.record(Duration::from_millis(10));
        t.record(Duration::from_millis(30));

        let s = t.summary();
        assert_eq!(s.count, 3);
        assert_eq!(s.recent_max_ms, Some(30.0));
        assert_eq!(s.recent_avg_ms, Some(20.0));
        assert_eq!(s.last_ms, Some(30.0));
    }
}
