//! Telemetry ingestion.
//!
//! While a test is running, one background task owns the channel's
//! [`ReceiverLease`] and drains it:
//!
//! ```text
//! loop {
//!     select! {
//!         cancel          => exit, session untouched
//!         receive(poll)   => timeout:   check idle timeout
//!                            datagram:  filter by device IP, then
//!                                       STATE=IDLE     -> end session
//!                                       RESULT=error   -> session warning
//!                                       TIME/MV/MA     -> append, update sink
//!                                       anything else  -> drop
//!     }
//! }
//! ```
//!
//! Per-frame problems are logged and never end the loop. The lease is released
//! when the task exits, which makes the channel available to discovery again.

use crate::channel::{ReceiverLease, Reception};
use crate::error::PactError;
use crate::plot::PlotSink;
use crate::protocol::{decode, DeviceEvent, TelemetryFrame};
use crate::session::{SessionEnd, SessionHandle};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};

/// Default receive poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ingestion timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestorConfig {
    /// Longest single receive wait; bounds cancellation latency.
    pub poll_interval: Duration,
    /// End the session after this long without an accepted sample.
    pub idle_timeout: Option<Duration>,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Why an ingestion task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Cancelled by the controller.
    Cancelled,
    /// The task ended the session itself.
    Ended(SessionEnd),
    /// Something else ended the session first.
    SessionInactive,
    /// The channel was closed underneath the task.
    ChannelClosed,
    /// The task panicked or was aborted.
    Aborted,
}

enum Step {
    Continue,
    Exit(IngestOutcome),
}

/// Telemetry receive loop for one session.
pub struct TelemetryIngestor {
    lease: ReceiverLease,
    session: SessionHandle,
    sink: Arc<dyn PlotSink>,
    config: IngestorConfig,
    device_ip: IpAddr,
    last_sample: Instant,
}

impl TelemetryIngestor {
    /// Prepare a loop for `session`. Only datagrams from the session device's
    /// IP address are considered.
    pub fn new(
        lease: ReceiverLease,
        session: SessionHandle,
        sink: Arc<dyn PlotSink>,
        config: IngestorConfig,
    ) -> Self {
        let device_ip = session.read(|s| s.device.address.ip());
        Self {
            lease,
            session,
            sink,
            config,
            device_ip,
            last_sample: Instant::now(),
        }
    }

    /// Run the loop on a new Tokio task.
    pub fn spawn(self) -> IngestorHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let span = tracing::info_span!(
            "telemetry",
            session = %self.session.read(|s| s.id),
            device = %self.device_ip
        );
        let task = tokio::spawn(self.run(cancel_rx).instrument(span));
        IngestorHandle { cancel_tx, task }
    }

    /// Run until cancelled or until the session leaves `Running`.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> IngestOutcome {
        self.last_sample = Instant::now();
        debug!("Telemetry ingestion started");

        let outcome = loop {
            if *cancel.borrow_and_update() {
                break IngestOutcome::Cancelled;
            }
            if !self.session.is_running() {
                break IngestOutcome::SessionInactive;
            }

            let reception = tokio::select! {
                biased;
                changed = cancel.changed() => {
                    // A dropped sender also means nobody wants more samples.
                    if changed.is_err() || *cancel.borrow() {
                        break IngestOutcome::Cancelled;
                    }
                    continue;
                }
                reception = self.lease.receive(self.config.poll_interval) => reception,
            };

            let step = match reception {
                Ok(Reception::Timeout) => self.check_idle(),
                Ok(Reception::Datagram { payload, source }) => {
                    if source.ip() == self.device_ip {
                        self.handle_datagram(&payload)
                    } else {
                        debug!(%source, "Ignoring datagram from another host");
                        Step::Continue
                    }
                }
                Err(PactError::ChannelClosed) => {
                    warn!("Channel closed during telemetry ingestion");
                    Step::Exit(IngestOutcome::ChannelClosed)
                }
                Err(e) => {
                    warn!(error = %e, "Telemetry receive failed");
                    Step::Continue
                }
            };

            if let Step::Exit(outcome) = step {
                break outcome;
            }
        };

        info!(?outcome, "Telemetry ingestion finished");
        outcome
    }

    fn check_idle(&self) -> Step {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return Step::Continue;
        };
        if self.last_sample.elapsed() < idle_timeout {
            return Step::Continue;
        }
        warn!(?idle_timeout, "No telemetry within idle timeout, ending session");
        self.end_session(SessionEnd::TelemetryCeased)
    }

    fn handle_datagram(&mut self, payload: &[u8]) -> Step {
        let message = decode(payload);

        match DeviceEvent::from_message(&message) {
            Some(DeviceEvent::Idle) => {
                info!("Device reported idle");
                return self.end_session(SessionEnd::DeviceIdle);
            }
            Some(DeviceEvent::Error(msg)) => {
                warn!(message = %msg, "Device reported an error");
                self.session.update(|s| s.warnings.push(msg));
                return Step::Continue;
            }
            None => {}
        }

        let frame = match TelemetryFrame::from_message(&message) {
            Ok(frame) => frame,
            Err(reason) => {
                debug!(%reason, "Dropping telemetry frame");
                return Step::Continue;
            }
        };

        let sink = &self.sink;
        let accepted = self.session.update(|s| {
            if !s.is_running() {
                return false;
            }
            s.push_sample(frame.into());
            let series = s.series();
            sink.update_series(&series.time_ms, &series.millivolts, &series.milliamps);
            true
        });
        if !accepted {
            return Step::Exit(IngestOutcome::SessionInactive);
        }

        trace!(
            time_ms = frame.time_ms,
            millivolts = frame.millivolts,
            milliamps = frame.milliamps,
            "Sample accepted"
        );
        self.last_sample = Instant::now();
        Step::Continue
    }

    fn end_session(&self, end: SessionEnd) -> Step {
        if self.session.finish(end) {
            Step::Exit(IngestOutcome::Ended(end))
        } else {
            Step::Exit(IngestOutcome::SessionInactive)
        }
    }
}

/// Control handle for a spawned [`TelemetryIngestor`].
#[derive(Debug)]
pub struct IngestorHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<IngestOutcome>,
}

impl IngestorHandle {
    /// Ask the task to exit at its next poll.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Cancel and wait for the task, releasing the receive lease.
    pub async fn stop(self) -> IngestOutcome {
        self.cancel();
        self.join().await
    }

    /// Wait for the task to exit on its own.
    pub async fn join(self) -> IngestOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Telemetry task did not complete");
                IngestOutcome::Aborted
            }
        }
    }
}
