//! Plot sinks.
//!
//! The ingestion loop does not draw anything. After each accepted sample it
//! hands the full accumulated series to a [`PlotSink`], and the front end
//! decides what to do with it:
//!
//! - [`SeriesRecorder`] keeps a shared copy that a UI thread can read each
//!   frame without touching the session lock;
//! - [`TracingSink`] logs the newest sample (CLI, headless runs);
//! - [`NullSink`] discards everything.

use std::sync::{Arc, Mutex};
use tracing::info;

/// Receiver of live telemetry series.
///
/// Called from the ingestion task, so implementations must be cheap and must
/// not block.
pub trait PlotSink: Send + Sync {
    /// Replace the displayed series. The three slices have equal length.
    fn update_series(&self, time_ms: &[i64], millivolts: &[i64], milliamps: &[i64]);

    /// Forget everything shown so far (called when a new test starts).
    fn clear(&self);
}

/// Latest series seen by a [`SeriesRecorder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesSnapshot {
    /// Timestamps (ms).
    pub time_ms: Vec<i64>,
    /// Voltages (mV).
    pub millivolts: Vec<i64>,
    /// Currents (mA).
    pub milliamps: Vec<i64>,
    /// Number of `update_series` calls since the last clear.
    pub updates: u64,
}

impl SeriesSnapshot {
    /// Voltage as plot points (`[t, mV]`).
    pub fn voltage_points(&self) -> Vec<[f64; 2]> {
        zip_points(&self.time_ms, &self.millivolts)
    }

    /// Current as plot points (`[t, mA]`).
    pub fn current_points(&self) -> Vec<[f64; 2]> {
        zip_points(&self.time_ms, &self.milliamps)
    }
}

fn zip_points(x: &[i64], y: &[i64]) -> Vec<[f64; 2]> {
    x.iter()
        .zip(y)
        .map(|(&x, &y)| [x as f64, y as f64])
        .collect()
}

/// Keeps the most recent series in shared memory.
#[derive(Debug, Clone, Default)]
pub struct SeriesRecorder {
    latest: Arc<Mutex<SeriesSnapshot>>,
}

impl SeriesRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the latest series.
    pub fn snapshot(&self) -> SeriesSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SeriesSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PlotSink for SeriesRecorder {
    fn update_series(&self, time_ms: &[i64], millivolts: &[i64], milliamps: &[i64]) {
        let mut latest = self.lock();
        latest.time_ms.clear();
        latest.time_ms.extend_from_slice(time_ms);
        latest.millivolts.clear();
        latest.millivolts.extend_from_slice(millivolts);
        latest.milliamps.clear();
        latest.milliamps.extend_from_slice(milliamps);
        latest.updates += 1;
    }

    fn clear(&self) {
        *self.lock() = SeriesSnapshot::default();
    }
}

/// Logs the newest point of every update at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl PlotSink for TracingSink {
    fn update_series(&self, time_ms: &[i64], millivolts: &[i64], milliamps: &[i64]) {
        if let (Some(t), Some(mv), Some(ma)) = (time_ms.last(), millivolts.last(), milliamps.last())
        {
            info!(
                time_ms = t,
                millivolts = mv,
                milliamps = ma,
                samples = time_ms.len(),
                "Telemetry"
            );
        }
    }

    fn clear(&self) {}
}

/// Discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PlotSink for NullSink {
    fn update_series(&self, _time_ms: &[i64], _millivolts: &[i64], _milliamps: &[i64]) {}

    fn clear(&self) {}
}
