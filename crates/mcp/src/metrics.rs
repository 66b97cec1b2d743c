//! Per-transport call metrics.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;

/// Counters and timings for one transport.
///
/// All values are monotonic except via [`TransportMetrics::reset`]. Times are
/// seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Cumulative time spent in `tools/call` round trips.
    pub total_time: f64,
    pub avg_response_time: f64,
    /// Round trip of the most recent successful ping.
    pub last_ping_time: Option<f64>,
    /// How long the initialize handshake took.
    pub initialization_time: Option<f64>,
    pub connection_resets: u64,
    pub stream_errors: u64,
    pub connection_errors: u64,
    pub recovery_attempts: u64,
    pub session_discoveries: u64,
}

impl TransportMetrics {
    pub(crate) fn record_call(&mut self, elapsed: Duration, ok: bool) {
        self.total_calls += 1;
        if ok {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.total_time += elapsed.as_secs_f64();
        if self.total_calls > 0 {
            self.avg_response_time = self.total_time / self.total_calls as f64;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Handle to the metrics record shared between a client and its wire
/// transport.
#[derive(Clone, Default)]
pub struct SharedMetrics(Arc<Mutex<TransportMetrics>>);

impl SharedMetrics {
    pub(crate) fn lock(&self) -> MutexGuard<'_, TransportMetrics> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current values, detached from the live record.
    pub fn snapshot(&self) -> TransportMetrics {
        self.lock().clone()
    }

    pub fn reset(&self) {
        self.lock().reset();
    }
}
