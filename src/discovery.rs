//! Instrument discovery.
//!
//! Discovery sends `ID;` to the multicast group and collects replies until the
//! group goes quiet for `reply_timeout`. Every reply carrying `MODEL=` becomes
//! a [`Device`]; anything else (including our own looped-back request) is
//! ignored. The result is a fresh [`DiscoverySession`] each time, so stale
//! devices never linger in the list.

use crate::channel::{Reception, SharedChannel};
use crate::config::MAX_DISCOVERY_WINDOW_MS;
use crate::error::AppResult;
use crate::protocol::{decode, Command, IdentifyReply, ProtocolVersion};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// A discovered instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Address the reply came from; commands are sent here.
    pub address: SocketAddr,
    /// Model string from the `MODEL` key.
    pub model: String,
    /// Remaining reply keys, in arrival order.
    pub capabilities: Vec<(String, String)>,
}

impl Device {
    /// A device with no extra capabilities.
    pub fn new(address: SocketAddr, model: impl Into<String>) -> Self {
        Self {
            address,
            model: model.into(),
            capabilities: Vec::new(),
        }
    }

    fn from_reply(address: SocketAddr, reply: IdentifyReply) -> Self {
        Self {
            address,
            model: reply.model,
            capabilities: reply.extra,
        }
    }

    /// Value of an extra reply key, e.g. `SERIAL`.
    pub fn capability(&self, key: &str) -> Option<&str> {
        self.capabilities
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, port={}", self.model, self.address.port())
    }
}

/// Devices found by one discovery request, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySession {
    devices: Vec<Device>,
}

impl DiscoverySession {
    /// Wrap an already collected list.
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Device at `index`.
    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    /// All devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether nothing answered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// `"<model>, port=<port>"` for each device, in list order.
    pub fn display_lines(&self) -> Vec<String> {
        self.devices.iter().map(Device::to_string).collect()
    }
}

/// Discovery window timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Silence that closes the window.
    pub reply_timeout: Duration,
    /// Upper bound on the whole window.
    pub max_window: Duration,
    /// Keep only the first reply per source address.
    pub dedupe: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(1),
            max_window: Duration::from_secs(5),
            dedupe: false,
        }
    }
}

/// Runs discovery requests over a shared channel.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
}

impl DiscoveryService {
    /// Service with the given timing.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Active timing.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Broadcast `ID;` and collect replies.
    ///
    /// Fails with [`ReceiverBusy`](crate::error::PactError::ReceiverBusy) while
    /// a test is ingesting telemetry, and with `Socket` if the request cannot
    /// be sent. Zero replies is an empty session, not an error.
    #[instrument(skip_all, fields(group = %channel.group_addr()))]
    pub async fn discover(&self, channel: &SharedChannel) -> AppResult<DiscoverySession> {
        let lease = channel.try_acquire_receiver("discovery")?;

        let request = Command::Identify.encode(ProtocolVersion::default());
        channel.send_to_group(request.as_bytes()).await?;
        debug!("Discovery request sent");

        let window = self
            .config
            .max_window
            .min(Duration::from_millis(MAX_DISCOVERY_WINDOW_MS));
        let deadline = Instant::now() + window;
        let mut devices: Vec<Device> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Discovery window reached its upper bound");
                break;
            }

            let (payload, source) = match lease
                .receive(self.config.reply_timeout.min(remaining))
                .await?
            {
                Reception::Timeout => break,
                Reception::Datagram { payload, source } => (payload, source),
            };

            let reply = match IdentifyReply::from_message(&decode(&payload)) {
                Ok(reply) => reply,
                Err(reason) => {
                    debug!(%source, %reason, "Ignoring non-discovery datagram");
                    continue;
                }
            };

            if self.config.dedupe && devices.iter().any(|d| d.address == source) {
                debug!(%source, "Ignoring repeated discovery reply");
                continue;
            }

            let device = Device::from_reply(source, reply);
            debug!(%source, model = %device.model, "Device replied");
            devices.push(device);
        }

        info!(count = devices.len(), "Discovery complete");
        Ok(DiscoverySession::new(devices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DatagramTransport;
    use crate::error::PactError;
    use crate::mock::MockTransport;
    use std::sync::Arc;

    fn fast() -> DiscoveryService {
        DiscoveryService::new(DiscoveryConfig {
            reply_timeout: Duration::from_millis(30),
            max_window: Duration::from_secs(2),
            dedupe: false,
        })
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn device_display_uses_model_and_port() {
        let device = Device::new(addr("10.0.0.5:31115"), "Acme-100");
        assert_eq!(device.to_string(), "Acme-100, port=31115");
    }

    #[tokio::test]
    async fn no_replies_is_empty_session() {
        let mock = Arc::new(MockTransport::new());
        let channel = SharedChannel::new(mock.clone());

        let session = fast().discover(&channel).await.unwrap();
        assert!(session.is_empty());
        assert_eq!(mock.sent_payloads(), vec!["ID;"]);
        assert_eq!(mock.sent()[0].dest, mock.group_addr());
    }

    #[tokio::test]
    async fn collects_replies_in_arrival_order() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_with(|payload, _| {
            if payload != b"ID;" {
                return vec![];
            }
            vec![
                (b"ID;".to_vec(), "10.0.0.1:31115".parse().unwrap()),
                (b"MODEL=B;".to_vec(), "10.0.0.2:40001".parse().unwrap()),
                (b"ID;MODEL=A;SERIAL=77;".to_vec(), "10.0.0.3:40002".parse().unwrap()),
                (b"garbage".to_vec(), "10.0.0.4:40003".parse().unwrap()),
            ]
        });
        let channel = SharedChannel::new(mock.clone());

        let session = fast().discover(&channel).await.unwrap();
        assert_eq!(session.display_lines(), vec!["B, port=40001", "A, port=40002"]);
        assert_eq!(session.get(1).unwrap().capability("SERIAL"), Some("77"));
        assert_eq!(session.get(0).unwrap().capability("SERIAL"), None);
    }

    fn twice_from_one_source(payload: &[u8], _dest: SocketAddr) -> Vec<(Vec<u8>, SocketAddr)> {
        if payload != b"ID;" {
            return vec![];
        }
        let source = addr("10.0.0.2:40001");
        vec![
            (b"MODEL=First;".to_vec(), source),
            (b"MODEL=Second;".to_vec(), source),
        ]
    }

    #[tokio::test]
    async fn duplicates_kept_unless_deduped() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_with(twice_from_one_source);
        let session = fast()
            .discover(&SharedChannel::new(mock))
            .await
            .unwrap();
        assert_eq!(session.len(), 2);

        let mock = Arc::new(MockTransport::new());
        mock.respond_with(twice_from_one_source);
        let deduping = DiscoveryService::new(DiscoveryConfig {
            dedupe: true,
            ..fast().config().clone()
        });
        let session = deduping.discover(&SharedChannel::new(mock)).await.unwrap();
        assert_eq!(session.display_lines(), vec!["First, port=40001"]);
    }

    #[tokio::test]
    async fn window_is_bounded_under_continuous_traffic() {
        let mock = Arc::new(MockTransport::new());
        let channel = SharedChannel::new(mock.clone());
        let chatter = {
            let mock = mock.clone();
            tokio::spawn(async move {
                loop {
                    mock.inject(b"MODEL=Chatty;", "10.0.0.9:31115".parse().unwrap());
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let service = DiscoveryService::new(DiscoveryConfig {
            reply_timeout: Duration::from_millis(100),
            max_window: Duration::from_millis(150),
            dedupe: false,
        });
        let started = std::time::Instant::now();
        let session = service.discover(&channel).await.unwrap();
        chatter.abort();

        assert!(!session.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn busy_receiver_is_reported() {
        let mock = Arc::new(MockTransport::new());
        let channel = SharedChannel::new(mock.clone());
        let _lease = channel.try_acquire_receiver("telemetry").unwrap();

        let err = fast().discover(&channel).await.unwrap_err();
        assert!(matches!(err, PactError::ReceiverBusy(_)));
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failure_is_socket_error() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_sends(Some(std::io::ErrorKind::PermissionDenied));
        let err = fast()
            .discover(&SharedChannel::new(mock))
            .await
            .unwrap_err();
        assert!(matches!(err, PactError::Socket { .. }));
    }
}
