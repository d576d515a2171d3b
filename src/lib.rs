//! # tuya-lan
//!
//! Asynchronous client for the Tuya LAN protocol, versions 3.3 and 3.5.
//! Frames and encrypts commands, negotiates v3.5 session keys, and keeps a
//! device connection alive with heartbeats and bounded retries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_lan::{Client, ClientConfig, DeviceDescriptor, Version};
//!
//! # async fn run() -> tuya_lan::error::Result<()> {
//! let descriptor = DeviceDescriptor::new("DEVICE_ID", "192.168.1.20", "0123456789abcdef", Version::V3_3);
//! let client = Client::new(descriptor, ClientConfig::default())?;
//! client.start()?;
//! client.set_value(1, true).await?;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod manager;
pub mod negotiator;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod state;
pub mod transport;

pub use client::{Client, ConnectionStatus};
pub use config::{ClientBuilder, ClientConfig, DeviceDescriptor};
pub use error::TuyaError;
pub use event::{ClientEvent, EventKind, SubscriptionId};
pub use manager::Manager;
pub use protocol::{CommandKind, Frame, FrameCodec, Version};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
