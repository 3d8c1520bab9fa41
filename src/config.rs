//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/pact.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `PACT_`, nested with `__`
//!    (e.g. `PACT_DISCOVERY__REPLY_TIMEOUT_MS=500`)
//!
//! Every section has defaults, so an empty or missing file yields a working
//! configuration for the standard `224.3.11.15:31115` group.
//!
//! # Example
//! ```no_run
//! use pact_daq::config::PactConfig;
//!
//! let config = PactConfig::load()?;
//! config.validate()?;
//! println!("Multicast group: {}:{}", config.multicast.group, config.multicast.port);
//! # Ok::<(), pact_daq::error::PactError>(())
//! ```

use crate::channel::MulticastConfig;
use crate::controller::ControllerConfig;
use crate::discovery::DiscoveryConfig;
use crate::error::{AppResult, PactError};
use crate::protocol::ProtocolVersion;
use crate::simulator::SimulatorConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/pact.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PACT_";

/// Upper bound for `discovery.max_window_ms` (one minute).
pub const MAX_DISCOVERY_WINDOW_MS: u64 = 60_000;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PactConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Multicast group and socket options
    #[serde(default)]
    pub multicast: MulticastSettings,
    /// Discovery window timing
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Test control and telemetry ingestion
    #[serde(default)]
    pub test: TestSettings,
    /// Device simulator
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Log span open/close events (ingestion and discovery spans)
    #[serde(default)]
    pub log_span_events: bool,
}

/// Multicast socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastSettings {
    /// IPv4 multicast group
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    /// UDP port (bound locally and used as the group destination port)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local interface used to join the group (0.0.0.0 = let the OS choose)
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    /// Multicast TTL for outgoing datagrams
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Receive our own multicast datagrams
    #[serde(default = "default_loopback")]
    pub loopback: bool,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Silence after which the discovery window closes (ms)
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Hard upper bound on the discovery window (ms)
    #[serde(default = "default_max_window_ms")]
    pub max_window_ms: u64,
    /// Drop repeated replies from an address already seen
    #[serde(default)]
    pub dedupe: bool,
}

/// Test control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    /// Sample interval requested from the device (ms)
    #[serde(default = "default_rate_ms")]
    pub rate_ms: u32,
    /// Telemetry receive poll interval (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// End the session after this long without telemetry (ms, 0 = never)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Start command wire format
    #[serde(default)]
    pub protocol: ProtocolVersion,
}

/// Device simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// Model string reported in discovery replies
    #[serde(default = "default_sim_model")]
    pub model: String,
    /// Local port of the device reply socket (0 = ephemeral)
    #[serde(default)]
    pub device_port: u16,
}

// Default value functions
fn default_name() -> String {
    "PACT".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_group() -> Ipv4Addr {
    Ipv4Addr::new(224, 3, 11, 15)
}

fn default_port() -> u16 {
    31115
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_ttl() -> u32 {
    1
}

fn default_loopback() -> bool {
    true
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_max_window_ms() -> u64 {
    5000
}

fn default_rate_ms() -> u32 {
    crate::protocol::DEFAULT_RATE_MS
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_idle_timeout_ms() -> u64 {
    5000
}

fn default_sim_model() -> String {
    "PACT-SIM".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_span_events: false,
        }
    }
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            interface: default_interface(),
            ttl: default_ttl(),
            loopback: default_loopback(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            max_window_ms: default_max_window_ms(),
            dedupe: false,
        }
    }
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            rate_ms: default_rate_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            protocol: ProtocolVersion::default(),
        }
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            model: default_sim_model(),
            device_port: 0,
        }
    }
}

impl PactConfig {
    /// Load configuration from `config/pact.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(PactError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        crate::tracing_init::parse_log_level(&self.application.log_level)
            .map_err(PactError::Configuration)?;
        crate::tracing_init::parse_output_format(&self.application.log_format)
            .map_err(PactError::Configuration)?;

        if !self.multicast.group.is_multicast() {
            return Err(PactError::Configuration(format!(
                "multicast.group {} is not a multicast address",
                self.multicast.group
            )));
        }
        if self.multicast.port == 0 {
            return Err(PactError::Configuration(
                "multicast.port must be non-zero".to_string(),
            ));
        }
        if self.discovery.reply_timeout_ms == 0 {
            return Err(PactError::Configuration(
                "discovery.reply_timeout_ms must be positive".to_string(),
            ));
        }
        if self.discovery.max_window_ms < self.discovery.reply_timeout_ms {
            return Err(PactError::Configuration(format!(
                "discovery.max_window_ms ({}) must be at least reply_timeout_ms ({})",
                self.discovery.max_window_ms, self.discovery.reply_timeout_ms
            )));
        }
        if self.discovery.max_window_ms > MAX_DISCOVERY_WINDOW_MS {
            return Err(PactError::Configuration(format!(
                "discovery.max_window_ms ({}) must not exceed {MAX_DISCOVERY_WINDOW_MS}",
                self.discovery.max_window_ms
            )));
        }
        if self.test.rate_ms == 0 {
            return Err(PactError::Configuration(
                "test.rate_ms must be positive".to_string(),
            ));
        }
        if self.test.poll_interval_ms == 0 {
            return Err(PactError::Configuration(
                "test.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.test.idle_timeout_ms != 0 && self.test.idle_timeout_ms <= self.test.poll_interval_ms
        {
            return Err(PactError::Configuration(format!(
                "test.idle_timeout_ms ({}) must exceed poll_interval_ms ({})",
                self.test.idle_timeout_ms, self.test.poll_interval_ms
            )));
        }
        let rate_ms = u64::from(self.test.rate_ms);
        if self.test.idle_timeout_ms != 0 && self.test.idle_timeout_ms <= rate_ms {
            return Err(PactError::Configuration(format!(
                "test.idle_timeout_ms ({}) must exceed rate_ms ({rate_ms})",
                self.test.idle_timeout_ms
            )));
        }
        if self.simulator.model.is_empty() || self.simulator.model.contains([';', '=']) {
            return Err(PactError::Configuration(format!(
                "simulator.model {:?} must be non-empty and free of ';' and '='",
                self.simulator.model
            )));
        }

        Ok(())
    }

    /// Socket options for [`MulticastChannel`](crate::channel::MulticastChannel).
    pub fn multicast_config(&self) -> MulticastConfig {
        MulticastConfig {
            group: self.multicast.group,
            port: self.multicast.port,
            interface: self.multicast.interface,
            ttl: self.multicast.ttl,
            loopback: self.multicast.loopback,
        }
    }

    /// Timing for [`DiscoveryService`](crate::discovery::DiscoveryService).
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            reply_timeout: Duration::from_millis(self.discovery.reply_timeout_ms),
            max_window: Duration::from_millis(self.discovery.max_window_ms),
            dedupe: self.discovery.dedupe,
        }
    }

    /// Settings for [`TestController`](crate::controller::TestController).
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            rate_ms: self.test.rate_ms,
            poll_interval: Duration::from_millis(self.test.poll_interval_ms),
            idle_timeout: (self.test.idle_timeout_ms > 0)
                .then(|| Duration::from_millis(self.test.idle_timeout_ms)),
            protocol: self.test.protocol,
        }
    }

    /// Settings for the device simulator.
    pub fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            model: self.simulator.model.clone(),
            device_port: self.simulator.device_port,
            multicast: self.multicast_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_standard_group() {
        let config = PactConfig::default();
        assert_eq!(config.multicast.group, Ipv4Addr::new(224, 3, 11, 15));
        assert_eq!(config.multicast.port, 31115);
        assert_eq!(config.test.rate_ms, 1000);
        assert_eq!(config.test.protocol, ProtocolVersion::Legacy);
        assert!(!config.discovery.dedupe);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[discovery]
reply_timeout_ms = 250
dedupe = true

[test]
protocol = "delimited"
"#
        )
        .unwrap();

        let config = PactConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.discovery.reply_timeout_ms, 250);
        assert_eq!(config.discovery.max_window_ms, 5000);
        assert!(config.discovery.dedupe);
        assert_eq!(config.test.protocol, ProtocolVersion::Delimited);
        assert_eq!(config.multicast.port, 31115);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = PactConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.application.name, "PACT");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[multicast]\nport = \"not a number\"").unwrap();

        let err = PactConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, PactError::Config(_)));
    }

    #[test]
    fn rejects_unicast_group() {
        let mut config = PactConfig::default();
        config.multicast.group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(
            config.validate(),
            Err(PactError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = PactConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_idle_timeout_shorter_than_poll() {
        let mut config = PactConfig::default();
        config.test.poll_interval_ms = 100;
        config.test.idle_timeout_ms = 50;
        assert!(config.validate().is_err());

        config.test.idle_timeout_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_idle_timeout_not_longer_than_rate() {
        let mut config = PactConfig::default();
        config.test.rate_ms = 10_000;
        assert!(matches!(
            config.validate(),
            Err(PactError::Configuration(_))
        ));

        config.test.idle_timeout_ms = 15_000;
        assert!(config.validate().is_ok());

        config.test.idle_timeout_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unbounded_discovery_window() {
        let mut config = PactConfig::default();
        config.discovery.max_window_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(PactError::Configuration(_))
        ));

        config.discovery.max_window_ms = MAX_DISCOVERY_WINDOW_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_model_with_separators() {
        let mut config = PactConfig::default();
        config.simulator.model = "bad;model".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn converts_into_component_configs() {
        let mut config = PactConfig::default();
        config.test.idle_timeout_ms = 0;

        let controller = config.controller_config();
        assert_eq!(controller.poll_interval, Duration::from_millis(50));
        assert_eq!(controller.idle_timeout, None);

        let discovery = config.discovery_config();
        assert_eq!(discovery.reply_timeout, Duration::from_secs(1));
        assert_eq!(discovery.max_window, Duration::from_secs(5));

        let multicast = config.multicast_config();
        assert_eq!(multicast.group_addr().port(), 31115);
    }
}
