//! Rolling throughput metrics used by the adaptive throttle.

use std::collections::VecDeque;

/// Smoothing factor for the error-rate EWMA: roughly the last 20 outcomes.
const ERROR_RATE_ALPHA: f64 = 1.0 / 20.0;

/// Smoothing factor for the latency EWMA.
const LATENCY_ALPHA: f64 = 0.1;

/// Most recent queue wait times retained.
const WAIT_HISTORY_CAP: usize = 100;

/// Exponentially weighted request metrics for one gate.
///
/// Updated under the gate lock on every request completion; cheap enough
/// that holding the lock through an update is fine.
#[derive(Debug, Default)]
pub(crate) struct PerformanceMetrics {
    completed: u64,
    failed: u64,
    error_rate: f64,
    avg_latency_ms: Option<f64>,
    wait_history: VecDeque<u64>,
}

/// Read-only view of the gate's metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Total requests that ran to completion, successful or not.
    pub completed: u64,
    /// Requests whose work returned an error.
    pub failed: u64,
    /// EWMA of the failure rate, 0.0 to 1.0.
    pub error_rate: f64,
    /// EWMA of work latency in milliseconds; `None` until the first sample.
    pub avg_latency_ms: Option<f64>,
    /// Mean queue wait over the retained history, in milliseconds.
    pub avg_wait_ms: f64,
}

impl PerformanceMetrics {
    pub(crate) fn record_success(&mut self, latency_ms: u64, wait_ms: u64) {
        self.completed += 1;
        self.error_rate *= 1.0 - ERROR_RATE_ALPHA;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            None => latency_ms as f64,
            Some(avg) => avg * (1.0 - LATENCY_ALPHA) + latency_ms as f64 * LATENCY_ALPHA,
        });
        self.push_wait(wait_ms);
    }

    pub(crate) fn record_failure(&mut self, wait_ms: u64) {
        self.completed += 1;
        self.failed += 1;
        self.error_rate = self.error_rate * (1.0 - ERROR_RATE_ALPHA) + ERROR_RATE_ALPHA;
        self.push_wait(wait_ms);
    }

    fn push_wait(&mut self, wait_ms: u64) {
        if self.wait_history.len() == WAIT_HISTORY_CAP {
            self.wait_history.pop_front();
        }
        self.wait_history.push_back(wait_ms);
    }

    pub(crate) fn error_rate(&self) -> f64 {
        self.error_rate
    }

    pub(crate) fn avg_latency_ms(&self) -> Option<f64> {
        self.avg_latency_ms
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let avg_wait_ms = if self.wait_history.is_empty() {
            0.0
        } else {
            self.wait_history.iter().sum::<u64>() as f64 / self.wait_history.len() as f64
        };
        MetricsSnapshot {
            completed: self.completed,
            failed: self.failed,
            error_rate: self.error_rate,
            avg_latency_ms: self.avg_latency_ms,
            avg_wait_ms,
        }
    }
}
