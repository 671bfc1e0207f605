//! Audio gateway daemon with an HTTP control API for Bluetooth headsets.
//!
//! This crate provides a service that:
//! - Hosts one [`headset_core::Gateway`] on a single reactor task
//! - Reaches each configured headset through TCP endpoints standing in for
//!   its RFCOMM control channel and SCO audio link
//! - Simulates the telephony side with a dummy backend
//! - Exposes the gateway's control surface as a REST API
//! - Streams headset signals to WebSocket clients
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/devices` - All configured headsets and their sessions
//! - `GET /api/devices/{address}` - One session
//! - `POST /api/devices/{address}/connect` - Connect, waiting for the control channel
//! - `POST /api/devices/{address}/disconnect`
//! - `POST /api/devices/{address}/play` - Open audio, waiting until it plays
//! - `POST /api/devices/{address}/stop`
//! - `POST /api/devices/{address}/ring` - Start ringing the headset
//! - `POST /api/devices/{address}/cancel-call`
//! - `GET|PUT /api/devices/{address}/gain/{speaker|microphone}`
//! - `POST /api/telephony/incoming` - Simulate an incoming call
//! - `POST /api/telephony/hangup` - Simulate the network hanging up
//! - `WS /api/ws` - Real-time signal stream
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/headset-gateway/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8094"
//!
//! [gateway]
//! sco_routing = "pcm"
//! disconnect_timeout_ms = 3000
//!
//! [telephony]
//! features = 32
//! subscriber_number = "+15551234"
//!
//! [[devices]]
//! address = "00:1A:7D:DA:71:13"
//! alias = "desk"
//! profile = "hfp"
//! channel = 1
//! control = "127.0.0.1:9001"
//! audio = "127.0.0.1:9002"
//! ```

pub mod api;
pub mod config;
pub mod connector;
pub mod reactor;
pub mod state;
pub mod telephony;
pub mod ws;

pub use config::{
    Config, ConfigError, DeviceConfig, GatewaySettings, Profile, ServerConfig, TelephonyConfig,
};
pub use connector::{Connector, ConnectorTransport, StreamChannel, TcpConnector};
pub use reactor::{Reactor, ReactorError, ReactorHandle};
pub use state::AppState;
pub use telephony::DummyTelephony;
