//! Typed commands and device frames.
//!
//! Everything on the wire goes through [`codec`](super::codec); this module
//! gives the individual messages names and validates inbound frames.

use super::codec::{self, WireMessage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default test sample interval requested from devices (ms).
pub const DEFAULT_RATE_MS: u32 = 1000;

pub(crate) const KEY_MODEL: &str = "MODEL";
pub(crate) const KEY_TIME: &str = "TIME";
pub(crate) const KEY_MILLIVOLTS: &str = "MV";
pub(crate) const KEY_MILLIAMPS: &str = "MA";
pub(crate) const KEY_STATE: &str = "STATE";
pub(crate) const KEY_RESULT: &str = "RESULT";
pub(crate) const KEY_MSG: &str = "MSG";

/// Wire format revision used for the start command.
///
/// Devices in the field parse `DURATION=<n>RATE=<r>` (no separator between the
/// duration value and the `RATE` key). `Delimited` is the corrected form and
/// must only be selected for devices known to accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// `TEST;CMD=START;DURATION=<n>RATE=<r>`
    #[default]
    Legacy,
    /// `TEST;CMD=START;DURATION=<n>;RATE=<r>;`
    Delimited,
}

/// Commands the host sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Discovery request, sent to the multicast group.
    Identify,
    /// Start a test of `duration_secs` seconds, sampling every `rate_ms`.
    StartTest {
        /// Test length in seconds.
        duration_secs: u32,
        /// Sample interval in milliseconds.
        rate_ms: u32,
    },
    /// Abort the running test.
    StopTest,
}

impl Command {
    /// Render the command for the given protocol version.
    pub fn encode(&self, version: ProtocolVersion) -> String {
        match *self {
            Command::Identify => codec::encode::<&str, &str>("ID", &[]),
            Command::StartTest {
                duration_secs,
                rate_ms,
            } => match version {
                ProtocolVersion::Legacy => {
                    format!("TEST;CMD=START;DURATION={duration_secs}RATE={rate_ms}")
                }
                ProtocolVersion::Delimited => codec::encode(
                    "TEST",
                    &[
                        ("CMD", "START".to_string()),
                        ("DURATION", duration_secs.to_string()),
                        ("RATE", rate_ms.to_string()),
                    ],
                ),
            },
            Command::StopTest => codec::encode("TEST", &[("CMD", "STOP")]),
        }
    }
}

/// Why an inbound frame was discarded. Not an error: logged at most.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDrop {
    /// A required key was absent.
    MissingField(&'static str),
    /// A field was present but not an integer.
    NotAnInteger {
        /// Offending key.
        key: &'static str,
        /// Raw value.
        value: String,
    },
}

impl fmt::Display for FrameDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDrop::MissingField(key) => write!(f, "missing field {key}"),
            FrameDrop::NotAnInteger { key, value } => {
                write!(f, "field {key} is not an integer: {value:?}")
            }
        }
    }
}

/// A discovery reply: `MODEL=<name>;` plus arbitrary extra keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyReply {
    /// Model string reported by the device.
    pub model: String,
    /// Every other key the device sent, in order.
    pub extra: Vec<(String, String)>,
}

impl IdentifyReply {
    /// Extract a reply from a decoded message.
    pub fn from_message(message: &WireMessage) -> Result<Self, FrameDrop> {
        let model = message
            .get(KEY_MODEL)
            .ok_or(FrameDrop::MissingField(KEY_MODEL))?
            .to_string();
        let extra = message
            .pairs()
            .iter()
            .filter(|(k, _)| k != KEY_MODEL)
            .cloned()
            .collect();
        Ok(Self { model, extra })
    }
}

/// One telemetry observation: `TIME=<ms>;MV=<int>;MA=<int>;`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Device-relative timestamp (ms).
    pub time_ms: i64,
    /// Voltage (mV).
    pub millivolts: i64,
    /// Current (mA).
    pub milliamps: i64,
}

impl TelemetryFrame {
    /// Extract a frame. All three fields must be present and integral.
    pub fn from_message(message: &WireMessage) -> Result<Self, FrameDrop> {
        Ok(Self {
            time_ms: int_field(message, KEY_TIME)?,
            millivolts: int_field(message, KEY_MILLIVOLTS)?,
            milliamps: int_field(message, KEY_MILLIAMPS)?,
        })
    }

    /// Encode as a device would (`STATUS;TIME=..;MV=..;MA=..;`).
    pub fn encode(&self) -> String {
        codec::encode(
            "STATUS",
            &[
                (KEY_TIME, self.time_ms.to_string()),
                (KEY_MILLIVOLTS, self.millivolts.to_string()),
                (KEY_MILLIAMPS, self.milliamps.to_string()),
            ],
        )
    }
}

fn int_field(message: &WireMessage, key: &'static str) -> Result<i64, FrameDrop> {
    let raw = message.get(key).ok_or(FrameDrop::MissingField(key))?;
    raw.trim().parse().map_err(|_| FrameDrop::NotAnInteger {
        key,
        value: raw.to_string(),
    })
}

/// Non-telemetry frames a device may send during a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// `STATE=IDLE`: the device finished (or aborted) its test.
    Idle,
    /// `RESULT=error;MSG=...`: the device rejected a command.
    Error(String),
}

impl DeviceEvent {
    /// Classify a decoded message, if it is a status or error frame.
    pub fn from_message(message: &WireMessage) -> Option<Self> {
        if message
            .get(KEY_STATE)
            .is_some_and(|s| s.eq_ignore_ascii_case("IDLE"))
        {
            return Some(DeviceEvent::Idle);
        }
        if message
            .get(KEY_RESULT)
            .is_some_and(|r| r.eq_ignore_ascii_case("error"))
        {
            let msg = message.get(KEY_MSG).unwrap_or("unspecified error");
            return Some(DeviceEvent::Error(msg.to_string()));
        }
        None
    }

    /// Encode as a device would.
    pub fn encode(&self) -> String {
        match self {
            DeviceEvent::Idle => codec::encode("STATUS", &[(KEY_STATE, "IDLE")]),
            DeviceEvent::Error(msg) => {
                codec::encode("TEST", &[(KEY_RESULT, "error"), (KEY_MSG, msg.as_str())])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::decode;

    #[test]
    fn identify_is_bare_id() {
        assert_eq!(Command::Identify.encode(ProtocolVersion::Legacy), "ID;");
    }

    #[test]
    fn legacy_start_keeps_missing_separator() {
        let cmd = Command::StartTest {
            duration_secs: 5,
            rate_ms: DEFAULT_RATE_MS,
        };
        assert_eq!(
            cmd.encode(ProtocolVersion::Legacy),
            "TEST;CMD=START;DURATION=5RATE=1000"
        );
    }

    #[test]
    fn delimited_start_separates_rate() {
        let cmd = Command::StartTest {
            duration_secs: 5,
            rate_ms: 250,
        };
        assert_eq!(
            cmd.encode(ProtocolVersion::Delimited),
            "TEST;CMD=START;DURATION=5;RATE=250;"
        );
    }

    #[test]
    fn stop_command() {
        assert_eq!(
            Command::StopTest.encode(ProtocolVersion::Delimited),
            "TEST;CMD=STOP;"
        );
    }

    #[test]
    fn identify_reply_keeps_extra_keys() {
        let reply =
            IdentifyReply::from_message(&decode(b"ID;MODEL=Acme-100;SERIAL=1234;")).unwrap();
        assert_eq!(reply.model, "Acme-100");
        assert_eq!(reply.extra, vec![("SERIAL".to_string(), "1234".to_string())]);
    }

    #[test]
    fn identify_reply_requires_model() {
        assert_eq!(
            IdentifyReply::from_message(&decode(b"ID;")),
            Err(FrameDrop::MissingField("MODEL"))
        );
    }

    #[test]
    fn telemetry_frame_with_all_fields() {
        let frame = TelemetryFrame::from_message(&decode(b"TIME=10;MV=5;MA=2;")).unwrap();
        assert_eq!(
            frame,
            TelemetryFrame {
                time_ms: 10,
                millivolts: 5,
                milliamps: 2
            }
        );
    }

    #[test]
    fn telemetry_frame_missing_field_is_dropped() {
        assert_eq!(
            TelemetryFrame::from_message(&decode(b"TIME=10;MV=5;")),
            Err(FrameDrop::MissingField("MA"))
        );
    }

    #[test]
    fn telemetry_frame_with_garbage_value_is_dropped() {
        let err = TelemetryFrame::from_message(&decode(b"TIME=10;MV=five;MA=2;")).unwrap_err();
        assert!(matches!(err, FrameDrop::NotAnInteger { key: "MV", .. }));
    }

    #[test]
    fn simulator_style_frame_round_trips() {
        let frame = TelemetryFrame {
            time_ms: 2001,
            millivolts: -12,
            milliamps: 999,
        };
        let decoded = decode(frame.encode().as_bytes());
        assert_eq!(TelemetryFrame::from_message(&decoded), Ok(frame));
    }

    #[test]
    fn classifies_status_and_error_frames() {
        assert_eq!(
            DeviceEvent::from_message(&decode(b"STATUS;STATE=IDLE;")),
            Some(DeviceEvent::Idle)
        );
        assert_eq!(
            DeviceEvent::from_message(&decode(b"TEST;RESULT=error;MSG=Invalid parameters;")),
            Some(DeviceEvent::Error("Invalid parameters".to_string()))
        );
        assert_eq!(DeviceEvent::from_message(&decode(b"TIME=1;MV=1;MA=1;")), None);
    }

    #[test]
    fn protocol_version_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Holder {
            protocol: ProtocolVersion,
        }
        use figment::providers::{Format, Toml};
        let holder: Holder = figment::Figment::new()
            .merge(Toml::string("protocol = \"delimited\""))
            .extract()
            .unwrap();
        assert_eq!(holder.protocol, ProtocolVersion::Delimited);
    }
}
