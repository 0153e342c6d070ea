//! Client and server configuration.
//!
//! Every struct deserializes with per-field defaults, so a TOML file only needs
//! the knobs it changes:
//!
//! ```
//! use cmdwire::config::ClientConfig;
//!
//! let config = ClientConfig::from_toml_str(r#"
//!     call_timeout_ms = 5000
//!     codec = "msgpack"
//!
//!     [streaming.reconnect]
//!     max_attempts = 10
//! "#).unwrap();
//!
//! assert_eq!(config.call_timeout_ms, 5000);
//! assert_eq!(config.streaming.reconnect.max_attempts, 10);
//! assert!(config.streaming.auto_reconnect);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_MAX_CONCURRENCY;
use crate::codec::WireCodec;
use crate::error::{Result, WireError};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::stream::DEFAULT_MAX_REORDER_BUFFER;
use crate::transport::ReconnectPolicy;
use crate::writer::WriterConfig;

/// Default per-call timeout for the remote transports.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on concurrently running handlers per server connection.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

fn from_toml<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}

fn from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| WireError::Config(format!("{}: {}", path.display(), e)))?;
    from_toml(&text)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Used when a call does not pass its own timeout.
    pub call_timeout_ms: u64,
    /// Codec for outgoing requests.
    pub codec: WireCodec,
    pub streaming: StreamingConfig,
    pub batch: BatchDefaults,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            codec: WireCodec::default(),
            streaming: StreamingConfig::default(),
            batch: BatchDefaults::default(),
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        from_toml(text)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        from_path(path.as_ref())
    }
}

/// Persistent-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Connect on the first call instead of failing it.
    pub auto_connect: bool,
    /// Reconnect with backoff after the connection drops.
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
    /// Budget for connecting plus the hello/welcome exchange.
    pub handshake_timeout_ms: u64,
    /// How often expired calls are swept.
    pub sweep_interval_ms: u64,
    /// Out-of-order chunks held per streaming call.
    pub max_reorder_buffer: usize,
    pub max_payload_size: u32,
    /// Sent in the hello.
    pub client_name: Option<String>,
    pub writer: WriterConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            handshake_timeout_ms: 5000,
            sweep_interval_ms: 100,
            max_reorder_buffer: DEFAULT_MAX_REORDER_BUFFER,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            client_name: None,
            writer: WriterConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Applied to batches that leave the matching option unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchDefaults {
    pub max_concurrency: usize,
    pub fail_fast: bool,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests beyond this many running handlers get a `SERVER_BUSY` fault.
    pub max_concurrent_handlers: usize,
    /// Codec for replies, chunks and events.
    pub codec: WireCodec,
    pub max_payload_size: u32,
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            codec: WireCodec::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        from_toml(text)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        from_path(path.as_ref())
    }
}
