//! Test control.
//!
//! [`TestController`] turns operator actions into start/stop datagrams and
//! owns the lifecycle of the current [`TestSession`]:
//!
//! ```text
//! Idle --start_test--> Running --stop_test------------------> Idle
//!                              --device idle / no telemetry--> Idle  (ingestor)
//!                              --start_test-----------------> Running (new session)
//! ```
//!
//! Commands are fire-and-forget. A start is considered running as soon as the
//! datagram leaves the socket; a stop makes the session idle whether or not
//! the device hears it.

use crate::channel::SharedChannel;
use crate::discovery::Device;
use crate::error::{AppResult, ValidationError};
use crate::plot::PlotSink;
use crate::protocol::{Command, ProtocolVersion, DEFAULT_RATE_MS};
use crate::session::{SessionEnd, SessionHandle, SessionState, TelemetrySample, TestSession};
use crate::telemetry::{IngestorConfig, IngestorHandle, TelemetryIngestor, DEFAULT_POLL_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Test control settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Sample interval requested in the start command (ms).
    pub rate_ms: u32,
    /// Telemetry receive poll interval.
    pub poll_interval: Duration,
    /// End a session after this long without telemetry (`None` = never).
    pub idle_timeout: Option<Duration>,
    /// Start command wire format.
    pub protocol: ProtocolVersion,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rate_ms: DEFAULT_RATE_MS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: Some(Duration::from_secs(5)),
            protocol: ProtocolVersion::default(),
        }
    }
}

impl ControllerConfig {
    fn ingestor_config(&self) -> IngestorConfig {
        IngestorConfig {
            poll_interval: self.poll_interval,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Parse operator duration text: a positive whole number of seconds.
pub fn parse_duration(text: &str) -> Result<u32, ValidationError> {
    match text.trim().parse::<u32>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ValidationError::InvalidDuration(text.trim().to_string())),
    }
}

struct ActiveTest {
    session: SessionHandle,
    ingestor: Option<IngestorHandle>,
}

/// Start/stop state machine for one device at a time.
pub struct TestController {
    channel: SharedChannel,
    config: ControllerConfig,
    sink: Arc<dyn PlotSink>,
    current: Option<ActiveTest>,
}

impl std::fmt::Debug for TestController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestController")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl TestController {
    /// Controller sending over `channel` and plotting into `sink`.
    pub fn new(channel: SharedChannel, config: ControllerConfig, sink: Arc<dyn PlotSink>) -> Self {
        Self {
            channel,
            config,
            sink,
            current: None,
        }
    }

    /// Active settings.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Start a test on `device`.
    ///
    /// Input is validated before anything is sent: a bad duration or a missing
    /// device returns [`ValidationError`] and leaves all state untouched. A
    /// running test is stopped and discarded first.
    pub async fn start_test(
        &mut self,
        device: Option<&Device>,
        duration_text: &str,
    ) -> AppResult<()> {
        let duration_secs = parse_duration(duration_text)?;
        let device = device.ok_or(ValidationError::NoDeviceSelected)?;

        self.replace_running().await;

        let lease = self.channel.try_acquire_receiver("telemetry")?;
        let command = Command::StartTest {
            duration_secs,
            rate_ms: self.config.rate_ms,
        }
        .encode(self.config.protocol);
        self.channel.send_to(command.as_bytes(), device.address).await?;

        let session = SessionHandle::new(TestSession::new(device.clone(), duration_secs));
        self.sink.clear();
        let ingestor = TelemetryIngestor::new(
            lease,
            session.clone(),
            self.sink.clone(),
            self.config.ingestor_config(),
        )
        .spawn();

        info!(
            session = %session.read(|s| s.id),
            device = %device.address,
            model = %device.model,
            duration_secs,
            "Test started"
        );
        self.current = Some(ActiveTest {
            session,
            ingestor: Some(ingestor),
        });
        Ok(())
    }

    /// Send stop to `device` and end the current session locally.
    ///
    /// A running session is stopped on the device it was started on, even if
    /// the operator has since selected another one; the selected device is
    /// then sent a stop as well. The session becomes idle even if a send
    /// fails; the first send error is still returned.
    pub async fn stop_test(&mut self, device: Option<&Device>) -> AppResult<()> {
        let device = device.ok_or(ValidationError::NoDeviceSelected)?;
        let command = Command::StopTest.encode(self.config.protocol);

        let running_on = self
            .current
            .as_ref()
            .filter(|active| active.session.is_running())
            .map(|active| active.session.read(|s| s.device.address))
            .filter(|address| *address != device.address);

        let mut sent = Ok(());
        if let Some(address) = running_on {
            warn!(%address, selected = %device.address, "Stopping test on its own device");
            sent = self.channel.send_to(command.as_bytes(), address).await;
        }
        let selected = self.channel.send_to(command.as_bytes(), device.address).await;
        sent = sent.and(selected);

        if let Some(active) = self.current.as_mut() {
            if let Some(ingestor) = active.ingestor.take() {
                ingestor.stop().await;
            }
            if active.session.finish(SessionEnd::Stopped) {
                info!(
                    session = %active.session.read(|s| s.id),
                    samples = active.session.read(|s| s.samples.len()),
                    "Test stopped"
                );
            }
        }

        sent
    }

    /// Current state; `Idle` before the first test.
    pub fn state(&self) -> SessionState {
        self.current
            .as_ref()
            .map_or(SessionState::Idle, |active| active.session.state())
    }

    /// Snapshot of the current (or most recent) session.
    pub fn session(&self) -> Option<TestSession> {
        self.current.as_ref().map(|active| active.session.snapshot())
    }

    /// Samples of the current session.
    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.current
            .as_ref()
            .map(|active| active.session.read(|s| s.samples.clone()))
            .unwrap_or_default()
    }

    /// Cancel ingestion without sending anything. The session keeps its
    /// state; use before closing the channel.
    pub async fn shutdown(&mut self) {
        if let Some(ingestor) = self.current.as_mut().and_then(|a| a.ingestor.take()) {
            ingestor.stop().await;
        }
    }

    async fn replace_running(&mut self) {
        let Some(mut previous) = self.current.take() else {
            return;
        };
        if let Some(ingestor) = previous.ingestor.take() {
            ingestor.stop().await;
        }
        if !previous.session.is_running() {
            return;
        }

        let (id, address) = previous.session.read(|s| (s.id, s.device.address));
        let stop = Command::StopTest.encode(self.config.protocol);
        if let Err(e) = self.channel.send_to(stop.as_bytes(), address).await {
            warn!(session = %id, error = %e, "Failed to stop replaced test");
        }
        previous.session.finish(SessionEnd::Replaced);
        info!(session = %id, "Running test replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PactError;
    use crate::mock::MockTransport;
    use crate::plot::SeriesRecorder;
    use std::net::SocketAddr;

    fn device(addr: &str) -> Device {
        Device::new(addr.parse().unwrap(), "Acme-100")
    }

    fn controller() -> (Arc<MockTransport>, TestController, SeriesRecorder) {
        let mock = Arc::new(MockTransport::new());
        let recorder = SeriesRecorder::new();
        let controller = TestController::new(
            SharedChannel::new(mock.clone()),
            ControllerConfig {
                poll_interval: Duration::from_millis(10),
                idle_timeout: None,
                ..Default::default()
            },
            Arc::new(recorder.clone()),
        );
        (mock, controller, recorder)
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("5"), Ok(5));
        assert_eq!(parse_duration(" 30 "), Ok(30));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("-3").is_err());
        assert!(parse_duration("2.5").is_err());
        assert!(parse_duration("").is_err());
    }

    #[tokio::test]
    async fn invalid_duration_sends_nothing() {
        let (mock, mut controller, _) = controller();
        let err = controller
            .start_test(Some(&device("10.0.0.5:31115")), "abc")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(mock.sent().is_empty());
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.session().is_none());
    }

    #[tokio::test]
    async fn missing_device_sends_nothing() {
        let (mock, mut controller, _) = controller();
        let err = controller.start_test(None, "5").await.unwrap_err();
        assert!(matches!(
            err,
            PactError::Validation(ValidationError::NoDeviceSelected)
        ));
        assert!(mock.sent().is_empty());

        let err = controller.stop_test(None).await.unwrap_err();
        assert!(err.is_validation());
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn start_sends_legacy_command_and_runs() {
        let (mock, mut controller, _) = controller();
        let target = device("10.0.0.5:31115");

        controller.start_test(Some(&target), "5").await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, "TEST;CMD=START;DURATION=5RATE=1000");
        assert_eq!(sent[0].dest, target.address);
        assert_eq!(controller.state(), SessionState::Running);
        assert_eq!(controller.session().unwrap().duration_seconds, 5);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn delimited_protocol_is_opt_in() {
        let mock = Arc::new(MockTransport::new());
        let mut controller = TestController::new(
            SharedChannel::new(mock.clone()),
            ControllerConfig {
                protocol: ProtocolVersion::Delimited,
                rate_ms: 250,
                idle_timeout: None,
                ..Default::default()
            },
            Arc::new(SeriesRecorder::new()),
        );

        controller
            .start_test(Some(&device("10.0.0.5:31115")), "5")
            .await
            .unwrap();
        assert_eq!(
            mock.sent_payloads(),
            vec!["TEST;CMD=START;DURATION=5;RATE=250;"]
        );
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn stop_sends_stop_and_goes_idle_without_ack() {
        let (mock, mut controller, _) = controller();
        let target = device("10.0.0.5:31115");
        controller.start_test(Some(&target), "5").await.unwrap();
        mock.clear_sent();

        controller.stop_test(Some(&target)).await.unwrap();

        assert_eq!(mock.sent_payloads(), vec!["TEST;CMD=STOP;"]);
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(controller.session().unwrap().end, Some(SessionEnd::Stopped));
    }

    #[tokio::test]
    async fn stop_reaches_running_device_after_selection_changes() {
        let (mock, mut controller, _) = controller();
        let running = device("10.0.0.5:31115");
        let selected = device("10.0.0.6:31115");
        controller.start_test(Some(&running), "5").await.unwrap();
        mock.clear_sent();

        controller.stop_test(Some(&selected)).await.unwrap();

        let stops: Vec<_> = mock
            .sent()
            .into_iter()
            .map(|d| (d.payload, d.dest))
            .collect();
        assert_eq!(
            stops,
            vec![
                ("TEST;CMD=STOP;".to_string(), running.address),
                ("TEST;CMD=STOP;".to_string(), selected.address),
            ]
        );
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(controller.session().unwrap().end, Some(SessionEnd::Stopped));
    }

    #[tokio::test]
    async fn stop_after_test_ended_only_targets_selection() {
        let (mock, mut controller, _) = controller();
        let running = device("10.0.0.5:31115");
        let selected = device("10.0.0.6:31115");
        controller.start_test(Some(&running), "5").await.unwrap();
        controller.stop_test(Some(&running)).await.unwrap();
        mock.clear_sent();

        controller.stop_test(Some(&selected)).await.unwrap();

        assert_eq!(mock.sent().len(), 1);
        assert_eq!(mock.sent()[0].dest, selected.address);
    }

    #[tokio::test]
    async fn stop_without_session_still_sends() {
        let (mock, mut controller, _) = controller();
        controller
            .stop_test(Some(&device("10.0.0.5:31115")))
            .await
            .unwrap();
        assert_eq!(mock.sent_payloads(), vec!["TEST;CMD=STOP;"]);
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_stop_send_still_goes_idle() {
        let (mock, mut controller, _) = controller();
        let target = device("10.0.0.5:31115");
        controller.start_test(Some(&target), "5").await.unwrap();

        mock.fail_sends(Some(std::io::ErrorKind::ConnectionRefused));
        let err = controller.stop_test(Some(&target)).await.unwrap_err();
        assert!(matches!(err, PactError::Socket { .. }));
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_start_send_leaves_no_session() {
        let (mock, mut controller, _) = controller();
        mock.fail_sends(Some(std::io::ErrorKind::ConnectionRefused));

        let err = controller
            .start_test(Some(&device("10.0.0.5:31115")), "5")
            .await
            .unwrap_err();
        assert!(matches!(err, PactError::Socket { .. }));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.session().is_none());
    }

    #[tokio::test]
    async fn second_start_replaces_first() {
        let (mock, mut controller, recorder) = controller();
        let first = device("10.0.0.5:31115");
        let second = device("10.0.0.6:31115");
        let first_source: SocketAddr = "10.0.0.5:40000".parse().unwrap();

        controller.start_test(Some(&first), "5").await.unwrap();
        mock.inject("TIME=1;MV=1;MA=1;", first_source);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.samples().len(), 1);
        assert_eq!(recorder.snapshot().time_ms, vec![1]);

        controller.start_test(Some(&second), "3").await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].payload, "TEST;CMD=STOP;");
        assert_eq!(sent[1].dest, first.address);
        assert_eq!(sent[2].dest, second.address);

        let session = controller.session().unwrap();
        assert_eq!(session.device, second);
        assert!(session.samples.is_empty());
        assert_eq!(controller.state(), SessionState::Running);
        assert!(recorder.snapshot().time_ms.is_empty());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn start_after_device_idle_does_not_send_stop() {
        let (mock, mut controller, _) = controller();
        let target = device("10.0.0.5:31115");
        controller.start_test(Some(&target), "1").await.unwrap();

        mock.inject("STATUS;STATE=IDLE;", target.address);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(controller.session().unwrap().end, Some(SessionEnd::DeviceIdle));

        mock.clear_sent();
        controller.start_test(Some(&target), "1").await.unwrap();
        assert_eq!(
            mock.sent_payloads(),
            vec!["TEST;CMD=START;DURATION=1RATE=1000"]
        );
        controller.shutdown().await;
    }
}
