//! Device descriptors and client tunables.

use crate::client::Client;
use crate::crypto::KEY_LEN;
use crate::error::{Result, TuyaError};
use crate::event::DEFAULT_EVENT_CAPACITY;
use crate::negotiator::HandshakeTimings;
use crate::protocol::Version;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6668;

/// Identity and addressing of one device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    #[serde(alias = "address")]
    pub ip: String,
    pub version: Version,
    #[serde(alias = "key")]
    pub local_key: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl DeviceDescriptor {
    pub fn new<I, A, K>(id: I, ip: A, local_key: K, version: Version) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<String>,
    {
        Self {
            id: id.into(),
            ip: ip.into(),
            version,
            local_key: local_key.into(),
            port: None,
        }
    }

    /// Parse and validate a descriptor such as
    /// `{"id": "...", "ip": "192.168.1.20", "version": "3.3", "local_key": "..."}`.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        // Surface an unknown version as such rather than as a generic JSON error.
        if let Some(version) = value.get("version").and_then(Value::as_str) {
            version.parse::<Version>()?;
        }
        let descriptor: Self = serde_json::from_value(value)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TuyaError::Config("device id is empty".into()));
        }
        if self.ip.trim().is_empty() {
            return Err(TuyaError::Config(format!("device {} has no address", self.id)));
        }
        if self.local_key.len() != KEY_LEN {
            return Err(TuyaError::Config(format!(
                "local key for {} must be {} bytes, got {}",
                self.id,
                KEY_LEN,
                self.local_key.len()
            )));
        }
        Ok(())
    }
}

/// Timeouts, limits and retry policy for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Used when the descriptor has no port
    pub port: u16,
    pub connect_timeout: Duration,
    /// Bound on writing a frame and on reading the rest of a started frame
    pub io_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeats tolerated before the link is declared dead
    pub heartbeat_limit: u32,
    /// Consecutive failures before the head command is dropped
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub queue_capacity: usize,
    pub event_capacity: usize,
    pub handshake: HandshakeTimings,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_limit: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            handshake: HandshakeTimings::default(),
            reconnect_min: Duration::from_secs(30),
            reconnect_max: Duration::from_secs(600),
        }
    }
}

impl ClientConfig {
    /// Wait before the next idle reconnect after `failures` failed attempts.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.pow((failures - 1).min(6));
        self.reconnect_min
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }
}

/// Builder for a [`Client`].
///
/// ```rust,no_run
/// use tuya_lan::{ClientBuilder, Version};
///
/// let client = ClientBuilder::new("DEVICE_ID", "0123456789abcdef")
///     .address("192.168.1.20")
///     .version(Version::V3_5)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    descriptor: DeviceDescriptor,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new<I: Into<String>, K: Into<String>>(id: I, local_key: K) -> Self {
        Self {
            descriptor: DeviceDescriptor::new(id, "", local_key, Version::V3_3),
            config: ClientConfig::default(),
        }
    }

    pub fn address<A: Into<String>>(mut self, ip: A) -> Self {
        self.descriptor.ip = ip.into();
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.descriptor.version = version;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.descriptor.port = Some(port);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Client> {
        Client::new(self.descriptor, self.config)
    }
}
