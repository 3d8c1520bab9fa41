//! Simulated instrument.
//!
//! Behaves like a field device so the host side can be exercised without
//! hardware:
//!
//! - answers `ID;` with `ID;MODEL=<model>;SERIAL=<n>;`
//! - on `TEST;CMD=START;DURATION=<s>...RATE=<ms>` streams
//!   `STATUS;TIME=<elapsed>;MV=<n>;MA=<n>;` every `RATE` ms, then sends
//!   `STATUS;STATE=IDLE;` once `DURATION` has elapsed
//! - rejects start parameters it cannot read with
//!   `TEST;RESULT=error;MSG=Invalid parameters;`
//! - ends a running test on `TEST;CMD=STOP;`
//!
//! [`DeviceSimulator`] is the protocol state machine and does no I/O;
//! [`run_simulator`] drives it from two sockets. Replies leave from a separate
//! device socket, so the simulated device shows up at its own port.

use crate::channel::{bind_multicast, MulticastConfig, MAX_DATAGRAM_SIZE};
use crate::error::{AppResult, PactError};
use crate::protocol::{codec, decode, DeviceEvent, TelemetryFrame};
use rand::Rng;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often the running test is checked for due telemetry.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

const INVALID_PARAMETERS: &str = "Invalid parameters";

/// Simulator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Model reported in discovery replies.
    pub model: String,
    /// Port of the device socket (0 = ephemeral).
    pub device_port: u16,
    /// Group the simulator listens on.
    pub multicast: MulticastConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            model: "PACT-SIM".to_string(),
            device_port: 0,
            multicast: MulticastConfig::default(),
        }
    }
}

/// A datagram the simulator wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Encoded message.
    pub payload: String,
    /// Recipient.
    pub dest: SocketAddr,
}

#[derive(Debug)]
struct RunningTest {
    client: SocketAddr,
    duration: Duration,
    rate: Duration,
    started: Instant,
    last_status: Duration,
}

/// Protocol state machine of one simulated device.
#[derive(Debug)]
pub struct DeviceSimulator {
    model: String,
    serial: u32,
    test: Option<RunningTest>,
}

impl DeviceSimulator {
    /// A device reporting `model` and a random serial number.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            serial: rand::thread_rng().gen_range(100_000..1_000_000),
            test: None,
        }
    }

    /// Serial number reported in discovery replies.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Whether a test is in progress.
    pub fn is_running(&self) -> bool {
        self.test.is_some()
    }

    /// React to one datagram from `source`.
    pub fn handle(&mut self, payload: &[u8], source: SocketAddr, now: Instant) -> Vec<Reply> {
        let message = decode(payload);
        let text: String = payload.iter().map(|&b| b as char).collect();

        if message.has_word("ID") && message.is_empty() {
            debug!(%source, "Identify request");
            let serial = self.serial.to_string();
            return vec![Reply {
                payload: codec::encode(
                    "ID",
                    &[("MODEL", self.model.as_str()), ("SERIAL", serial.as_str())],
                ),
                dest: source,
            }];
        }

        if !message.has_word("TEST") {
            debug!(%source, message = %text, "Ignoring unrecognised datagram");
            return Vec::new();
        }

        match message.get("CMD") {
            Some("STOP") => self.stop(source),
            Some(cmd) if cmd.starts_with("START") => self.start(&text, source, now),
            _ => Vec::new(),
        }
    }

    /// Emit whatever the running test has due at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Reply> {
        let Some(test) = self.test.as_mut() else {
            return Vec::new();
        };

        let elapsed = now.saturating_duration_since(test.started);
        if elapsed >= test.duration {
            let client = test.client;
            self.test = None;
            info!(%client, "Test complete");
            return vec![Reply {
                payload: DeviceEvent::Idle.encode(),
                dest: client,
            }];
        }

        if elapsed.saturating_sub(test.last_status) < test.rate {
            return Vec::new();
        }
        test.last_status = elapsed;

        let mut rng = rand::thread_rng();
        let frame = TelemetryFrame {
            time_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            millivolts: rng.gen_range(0..1000),
            milliamps: rng.gen_range(0..1000),
        };
        vec![Reply {
            payload: frame.encode(),
            dest: test.client,
        }]
    }

    fn start(&mut self, text: &str, source: SocketAddr, now: Instant) -> Vec<Reply> {
        if self.test.is_some() {
            warn!(%source, "Start rejected: test already running");
            return Vec::new();
        }

        let params = leading_number(text, "DURATION=").zip(leading_number(text, "RATE="));
        let Some((duration_secs, rate_ms)) = params.filter(|&(_, rate)| rate > 0) else {
            warn!(%source, command = %text, "Start rejected: invalid parameters");
            return vec![Reply {
                payload: DeviceEvent::Error(INVALID_PARAMETERS.to_string()).encode(),
                dest: source,
            }];
        };

        info!(%source, duration_secs, rate_ms, "Starting test");
        self.test = Some(RunningTest {
            client: source,
            duration: Duration::from_secs(duration_secs),
            rate: Duration::from_millis(rate_ms),
            started: now,
            last_status: Duration::ZERO,
        });
        Vec::new()
    }

    fn stop(&mut self, source: SocketAddr) -> Vec<Reply> {
        match self.test.take() {
            Some(test) => {
                info!(%source, "Test stopped");
                vec![Reply {
                    payload: DeviceEvent::Idle.encode(),
                    dest: test.client,
                }]
            }
            None => Vec::new(),
        }
    }
}

/// Digits immediately following `key` in `text`.
fn leading_number(text: &str, key: &str) -> Option<u64> {
    let start = text.find(key)? + key.len();
    let digits: String = text[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Serve as a simulated device until `shutdown` resolves.
///
/// Listens on the multicast group and on a device socket; replies are sent
/// from the device socket.
pub async fn run_simulator<F>(config: &SimulatorConfig, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    // Bound to the group so unicast traffic for a host application sharing
    // the port is never delivered here.
    let listen_ip = if cfg!(unix) {
        config.multicast.group
    } else {
        Ipv4Addr::UNSPECIFIED
    };
    let listener = bind_multicast(&config.multicast, listen_ip)?;
    let device = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.device_port))
        .await
        .map_err(|e| PactError::socket(format!("bind device port {}", config.device_port), e))?;
    let device_addr = device
        .local_addr()
        .map_err(|e| PactError::socket("query device address", e))?;

    let mut simulator = DeviceSimulator::new(config.model.clone());
    info!(
        model = %config.model,
        serial = simulator.serial(),
        group = %config.multicast.group_addr(),
        device = %device_addr,
        "Simulator running"
    );

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut group_buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut device_buf = [0u8; MAX_DATAGRAM_SIZE];
    tokio::pin!(shutdown);

    loop {
        let replies = tokio::select! {
            _ = &mut shutdown => break,
            received = listener.recv_from(&mut group_buf) => match received {
                Ok((len, source)) => simulator.handle(&group_buf[..len], source, Instant::now()),
                Err(e) => {
                    warn!(error = %e, "Group receive failed");
                    Vec::new()
                }
            },
            received = device.recv_from(&mut device_buf) => match received {
                Ok((len, source)) => simulator.handle(&device_buf[..len], source, Instant::now()),
                Err(e) => {
                    warn!(error = %e, "Device receive failed");
                    Vec::new()
                }
            },
            _ = ticker.tick() => simulator.tick(Instant::now()),
        };

        for reply in replies {
            debug!(dest = %reply.dest, payload = %reply.payload, "Simulator reply");
            if let Err(e) = device.send_to(reply.payload.as_bytes(), reply.dest).await {
                warn!(dest = %reply.dest, error = %e, "Simulator send failed");
            }
        }
    }

    info!("Simulator stopped");
    Ok(())
}
