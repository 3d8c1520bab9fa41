//! Test session model.
//!
//! A [`TestSession`] lives from an accepted start command until it ends. It is
//! created by the [`TestController`](crate::controller::TestController), filled
//! by the [`TelemetryIngestor`](crate::telemetry::TelemetryIngestor) and read
//! by front ends, so it is shared through a [`SessionHandle`].
//!
//! ## Lifecycle
//!
//! ```text
//! Running --stop command------------> Idle (end = Stopped)
//!         --device STATE=IDLE-------> Idle (end = DeviceIdle)
//!         --no telemetry for idle---> Idle (end = TelemetryCeased)
//!         --new test started--------> Idle (end = Replaced, then discarded)
//! ```
//!
//! Only the first transition out of `Running` is recorded.

use crate::discovery::Device;
use crate::error::AppResult;
use crate::protocol::TelemetryFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Controller-visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No test is running.
    Idle,
    /// A start command was sent and telemetry is being ingested.
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Running => write!(f, "Running"),
        }
    }
}

/// How a session left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEnd {
    /// The operator sent a stop command.
    Stopped,
    /// The device reported `STATE=IDLE`.
    DeviceIdle,
    /// No telemetry arrived within the idle timeout.
    TelemetryCeased,
    /// A new test was started while this one was running.
    Replaced,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionEnd::Stopped => "stopped by operator",
            SessionEnd::DeviceIdle => "device reported idle",
            SessionEnd::TelemetryCeased => "telemetry ceased",
            SessionEnd::Replaced => "replaced by a new test",
        };
        f.write_str(text)
    }
}

/// One accepted telemetry observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Device-relative timestamp (ms).
    pub time_ms: i64,
    /// Voltage (mV).
    pub millivolts: i64,
    /// Current (mA).
    pub milliamps: i64,
}

impl From<TelemetryFrame> for TelemetrySample {
    fn from(frame: TelemetryFrame) -> Self {
        Self {
            time_ms: frame.time_ms,
            millivolts: frame.millivolts,
            milliamps: frame.milliamps,
        }
    }
}

/// Column-oriented copy of the samples, in the shape plot sinks consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesColumns {
    /// Timestamps (ms).
    pub time_ms: Vec<i64>,
    /// Voltages (mV).
    pub millivolts: Vec<i64>,
    /// Currents (mA).
    pub milliamps: Vec<i64>,
}

impl SeriesColumns {
    fn push(&mut self, sample: &TelemetrySample) {
        self.time_ms.push(sample.time_ms);
        self.millivolts.push(sample.millivolts);
        self.milliamps.push(sample.milliamps);
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.time_ms.len()
    }

    /// Whether there are no points.
    pub fn is_empty(&self) -> bool {
        self.time_ms.is_empty()
    }
}

/// One start-to-stop test against one device.
#[derive(Debug, Clone)]
pub struct TestSession {
    /// Unique id, used in logs.
    pub id: Uuid,
    /// Device under test.
    pub device: Device,
    /// Requested duration (s).
    pub duration_seconds: u32,
    /// Current state.
    pub state: SessionState,
    /// Why the session left `Running`, once it has.
    pub end: Option<SessionEnd>,
    /// Accepted samples in arrival order.
    pub samples: Vec<TelemetrySample>,
    /// Wall-clock time the start command was sent.
    pub started_at: DateTime<Utc>,
    /// Error replies reported by the device.
    pub warnings: Vec<String>,
    series: SeriesColumns,
}

impl TestSession {
    /// A new running session with no samples.
    pub fn new(device: Device, duration_seconds: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            duration_seconds,
            state: SessionState::Running,
            end: None,
            samples: Vec::new(),
            started_at: Utc::now(),
            warnings: Vec::new(),
            series: SeriesColumns::default(),
        }
    }

    /// Whether the session is still `Running`.
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Append one sample.
    pub fn push_sample(&mut self, sample: TelemetrySample) {
        self.series.push(&sample);
        self.samples.push(sample);
    }

    /// Leave `Running` for `end`. Returns `false` if the session had already
    /// ended, in which case nothing changes.
    pub fn finish(&mut self, end: SessionEnd) -> bool {
        if !self.is_running() {
            return false;
        }
        self.state = SessionState::Idle;
        self.end = Some(end);
        true
    }

    /// The samples as parallel columns.
    pub fn series(&self) -> &SeriesColumns {
        &self.series
    }

    /// Write the samples as CSV (`time_ms,millivolts,milliamps`).
    pub fn write_csv<W: Write>(&self, writer: W) -> AppResult<()> {
        let mut csv = csv::Writer::from_writer(writer);
        if self.samples.is_empty() {
            csv.write_record(["time_ms", "millivolts", "milliamps"])?;
        }
        for sample in &self.samples {
            csv.serialize(sample)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Write the samples to a CSV file at `path`.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let file = std::fs::File::create(path.as_ref())?;
        self.write_csv(file)?;
        tracing::info!(
            session = %self.id,
            samples = self.samples.len(),
            path = %path.as_ref().display(),
            "Session exported"
        );
        Ok(())
    }
}

/// Shared, lockable reference to a [`TestSession`].
///
/// Locks are only held for the duration of a closure and never across an
/// `.await`, so a plain `RwLock` serves both the async ingestor and
/// synchronous front ends.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<TestSession>>,
}

impl SessionHandle {
    /// Share `session`.
    pub fn new(session: TestSession) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    /// Run `f` with shared access.
    pub fn read<R>(&self, f: impl FnOnce(&TestSession) -> R) -> R {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Run `f` with exclusive access.
    pub fn update<R>(&self, f: impl FnOnce(&mut TestSession) -> R) -> R {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Clone of the current session.
    pub fn snapshot(&self) -> TestSession {
        self.read(TestSession::clone)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.read(|s| s.state)
    }

    /// Whether the session is still `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// See [`TestSession::finish`].
    pub fn finish(&self, end: SessionEnd) -> bool {
        self.update(|s| s.finish(end))
    }
}
