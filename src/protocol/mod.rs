//! Instrument wire protocol.
//!
//! - [`codec`]: the `KEY=VAL;` text encoding shared by every message.
//! - [`messages`]: typed commands (`ID;`, start, stop) and inbound frames
//!   (discovery replies, telemetry, status and error frames).

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, WireMessage};
pub use messages::{
    Command, DeviceEvent, FrameDrop, IdentifyReply, ProtocolVersion, TelemetryFrame,
    DEFAULT_RATE_MS,
};
