//! Application state shared across handlers.
//!
//! # Signal Broadcast Behavior
//!
//! WebSocket clients receive headset signals from the gateway's broadcast
//! channel, reached through [`ReactorHandle::subscribe`].
//!
//! - **Buffer size**: Configurable via `server.signal_buffer` (default: 100)
//! - **Message loss**: A subscriber that falls behind loses the oldest signals
//! - **No blocking**: The reactor never waits for slow subscribers
//!
//! ## Example Configuration
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8094"
//! signal_buffer = 200  # Larger buffer for slow clients
//! ```

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use headset_core::SignalEvent;

use crate::config::Config;
use crate::reactor::ReactorHandle;

/// Shared application state.
pub struct AppState {
    /// Access to the gateway reactor.
    pub gateway: ReactorHandle,
    /// Configuration the daemon was started with.
    pub config: Config,
    /// When the daemon started.
    pub started_at: OffsetDateTime,
}

impl AppState {
    pub fn new(gateway: ReactorHandle, config: Config) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            config,
            started_at: OffsetDateTime::now_utc(),
        })
    }

    /// Configured alias of `address`, if any.
    pub fn alias(&self, address: &str) -> Option<&str> {
        self.config
            .devices
            .iter()
            .find(|d| d.address.eq_ignore_ascii_case(address))
            .and_then(|d| d.alias.as_deref())
    }
}

/// A signal as pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct SignalMessage {
    #[serde(flatten)]
    pub event: SignalEvent,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<SignalEvent> for SignalMessage {
    fn from(event: SignalEvent) -> Self {
        Self {
            event,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
