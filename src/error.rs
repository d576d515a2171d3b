//! Error types and result definitions for the tuya-lan crate.
//! Includes tinytuya-compatible numeric codes and conversion from IO/JSON errors.

use thiserror::Error;

/// Every failure the protocol core can report.
///
/// Errors are `Clone` so they can travel inside [`ClientEvent`](crate::event::ClientEvent)s.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// Standard IO error (socket reset, refused write, ...)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Malformed or truncated frame, bad magic, CRC mismatch
    #[error("Parse error: {0}")]
    Parse(String),

    /// AEAD tag failure, bad padding or cipher misconfiguration
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// v3.5 session key negotiation failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Device advertises a protocol version this crate does not implement
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Invalid device descriptor or client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Connect, read or write timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// The outbound command queue is full
    #[error("Send queue overflow")]
    QueueOverflow,

    /// Device is currently unreachable or the client has not been started
    #[error("Device offline")]
    Offline,

    /// The client has been stopped
    #[error("Client stopped")]
    Stopped,

    /// Device ID already exists in manager
    #[error("Device ID '{0}' already exists")]
    DuplicateDevice(String),

    /// Device ID not found in manager
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TuyaError::Timeout,
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::Parse(_) => ERR_PAYLOAD,
            TuyaError::Crypto(_) => ERR_KEY_OR_VER,
            TuyaError::Handshake(_) => ERR_KEY_OR_VER,
            TuyaError::UnsupportedVersion(_) => ERR_VERSION,
            TuyaError::Config(_) => ERR_PARAMS,
            TuyaError::ConnectionFailed => ERR_CONNECT,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::QueueOverflow => ERR_QUEUE,
            TuyaError::Offline => ERR_OFFLINE,
            TuyaError::Stopped => ERR_OFFLINE,
            TuyaError::DuplicateDevice(_) => ERR_DUPLICATE,
            TuyaError::DeviceNotFound(_) => ERR_PARAMS,
        }
    }

    /// True for failures the connection manager recovers from by reconnecting.
    ///
    /// Configuration errors and unsupported versions are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TuyaError::Io(_)
                | TuyaError::ConnectionFailed
                | TuyaError::Timeout
                | TuyaError::Offline
                | TuyaError::Handshake(_)
                | TuyaError::Parse(_)
                | TuyaError::Crypto(_)
        )
    }
}

// TinyTuya Error Response Codes, extended with queue and version failures
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_DUPLICATE = 915 => "Device ID already exists",
    ERR_QUEUE = 916 => "Send Queue Overflow",
    ERR_VERSION = 917 => "Unsupported Protocol Version",
}
