//! Custom error types for the application.
//!
//! `PactError` is the error type shared by every component. It follows the
//! taxonomy the protocol engine needs:
//!
//! - **`Socket`**: socket creation, bind, group join or send failed. Fatal to
//!   the current operation; the caller may reopen the channel and retry.
//! - **`Validation`**: operator input was rejected before anything was sent
//!   (non-numeric duration, no device selected). No state changed.
//! - **`ChannelClosed`** / **`ReceiverBusy`**: lifecycle misuse of the shared
//!   channel.
//! - **`Config`** / **`Configuration`**: configuration could not be loaded, or
//!   loaded but failed semantic validation.
//!
//! Malformed or incomplete wire messages are not errors at all; see
//! [`FrameDrop`](crate::protocol::FrameDrop).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PactError>;

/// Application error.
#[derive(Error, Debug)]
pub enum PactError {
    /// Socket-level failure.
    #[error("Socket error: {context}: {source}")]
    Socket {
        /// What was being attempted.
        context: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Operator input rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The channel was closed before or during the operation.
    #[error("Channel is closed")]
    ChannelClosed,

    /// Another component currently owns the receive side of the channel.
    #[error("Channel receiver busy: {0}")]
    ReceiverBusy(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV export error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PactError {
    /// Wrap an I/O error from a socket operation.
    pub fn socket(context: impl Into<String>, source: std::io::Error) -> Self {
        PactError::Socket {
            context: context.into(),
            source,
        }
    }

    /// Whether the error came from operator input and should be shown as a
    /// plain message rather than a failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, PactError::Validation(_))
    }
}

impl From<figment::Error> for PactError {
    fn from(value: figment::Error) -> Self {
        PactError::Config(Box::new(value))
    }
}

/// Operator input errors. The `Display` text is the user-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Duration was not a positive whole number of seconds.
    #[error("Duration must be a positive whole number of seconds, got '{0}'")]
    InvalidDuration(String),

    /// An operation needed a selected device and none was selected.
    #[error("No device selected")]
    NoDeviceSelected,

    /// Selection index outside the current device list.
    #[error("Device index {index} is out of range ({count} devices discovered)")]
    DeviceIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of devices available.
        count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_convert_and_display() {
        let err: PactError = ValidationError::InvalidDuration("abc".into()).into();
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Validation error: Duration must be a positive whole number of seconds, got 'abc'"
        );
    }

    #[test]
    fn socket_error_keeps_context_and_source() {
        let err = PactError::socket(
            "join multicast group 224.3.11.15",
            std::io::Error::from(std::io::ErrorKind::AddrNotAvailable),
        );
        assert!(!err.is_validation());
        assert!(err.to_string().starts_with("Socket error: join multicast group 224.3.11.15"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn out_of_range_message_names_both_numbers() {
        let err = ValidationError::DeviceIndexOutOfRange { index: 3, count: 2 };
        assert_eq!(
            err.to_string(),
            "Device index 3 is out of range (2 devices discovered)"
        );
    }
}
