//! Protocol engine for the Bluetooth Headset and Hands-Free audio gateway role.
//!
//! This crate implements the audio gateway side of the Headset Profile (HSP)
//! and Hands-Free Profile (HFP): it frames and interprets the AT commands a
//! remote headset sends over RFCOMM, keeps the call indicators the phone
//! reports, and drives each headset session through discovery, control
//! channel, service level connection and audio setup.
//!
//! # Features
//!
//! - **AT command handling**: BRSF, CIND, CMER, CHLD, VGS/VGM, CKPD, CLIP,
//!   BTRH, VTS, CNUM and the call control commands
//! - **Indicator buffering**: `+CIEV` updates raised by a call control
//!   command always precede its `OK` or `ERROR`
//! - **Request coalescing**: concurrent connect and stream requests share one
//!   sequence of asynchronous stages
//! - **Auto-disconnect**: sessions opened for an audio stream close once unused
//! - **Signals**: state and gain changes are broadcast to subscribers
//!
//! # Architecture
//!
//! The engine is sans-IO and single-threaded. A [`Gateway`] owns every
//! session and is driven by one reactor through `&mut self` calls. It talks
//! to the outside through three collaborator traits:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`Transport`] | Starts discovery, control and audio connects; results come back through [`Gateway::discovery_complete`], [`Gateway::control_connected`] and [`Gateway::audio_connected`] |
//! | [`Telephony`] | Answers, dials and hangs up calls for the AT command handlers |
//! | [`Scheduler`] | Arms timers; expirations come back through [`Gateway::timer_fired`] |
//!
//! # Quick Start
//!
//! ```
//! use headset_core::mock::{MockChannel, mock_gateway};
//! use headset_core::{HeadsetSignal, HeadsetState, ServiceRecord};
//!
//! let mut gw = mock_gateway();
//! let device = "00:11:22:33:44:55".parse().unwrap();
//! gw.add_device(device, Some(ServiceRecord::headset(0x10001, 2)));
//! let mut signals = gw.subscribe();
//!
//! let mut reply = gw.connect(&device).unwrap();
//! let op = gw.transport().last_operation().unwrap();
//! let (channel, probe) = MockChannel::new(1);
//! gw.control_connected(&device, op, Ok(Box::new(channel)));
//!
//! assert!(matches!(reply.try_recv(), Ok(Ok(()))));
//! assert_eq!(gw.state(&device).unwrap(), HeadsetState::Connected);
//! assert_eq!(signals.try_recv().unwrap().signal, HeadsetSignal::Connected);
//!
//! gw.control_data(&device, probe.id(), b"AT+VGS=7\r").unwrap();
//! assert_eq!(probe.take_written(), "\r\nOK\r\n");
//! ```

pub mod ag;
pub mod commands;
mod connection;
mod control;
pub mod error;
pub mod event_buffer;
pub mod events;
pub mod framer;
pub mod gateway;
mod interpreter;
pub mod mock;
pub mod pending;
pub mod scheduler;
pub mod session;
pub mod telephony;
pub mod transport;

// Core exports
pub use ag::AgState;
pub use error::{Error, Result, Stage, TelephonyError, TelephonyResult, TransportError};
pub use gateway::{Gateway, GatewayConfig};
pub use session::{Session, SessionInfo};

// Collaborators
pub use scheduler::{Scheduler, TimerId, TimerKind};
pub use telephony::{IndicatorSink, Telephony};
pub use transport::{Channel, ChannelId, OperationId, ServiceRecord, Transport};

pub use commands::AtCommand;
pub use event_buffer::{EventBuffer, IndicatorEvent};
pub use events::{HeadsetSignal, SignalDispatcher, SignalEvent, SignalReceiver, SignalSender};
pub use framer::LineFramer;
pub use pending::{PendingReply, StreamCallback, WaiterId};

// Re-export from headset-types
pub use headset_types::uuid as uuids;
pub use headset_types::{
    AgFeatures, DeviceAddress, GainKind, HeadsetState, HfFeatures, Indicator, IndicatorTable,
    LockMask, Response, ScoRouting,
};
