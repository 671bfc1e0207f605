//! Platform-agnostic types for the Bluetooth headset audio gateway.
//!
//! This crate provides the value types shared by the protocol engine
//! (headset-core) and the gateway daemon (headset-service).
//!
//! # Features
//!
//! - Device addresses and the headset session state
//! - HFP supported-feature bitmasks for both roles
//! - The telephony indicator table
//! - Encoding of AT result codes and unsolicited responses
//! - Service class UUID constants
//!
//! # Example
//!
//! ```
//! use headset_types::{IndicatorTable, Response};
//!
//! let table = IndicatorTable::standard();
//! let line = Response::Indicators(table.values()).encode();
//! assert_eq!(line, "\r\n+CIND:1,0,0,0,5,0,5\r\n");
//! ```

pub mod error;
pub mod features;
pub mod indicator;
pub mod response;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use features::{AgFeatures, HfFeatures};
pub use indicator::{Indicator, IndicatorTable};
pub use response::Response;
pub use types::{DeviceAddress, GainKind, HeadsetState, LockMask, MAX_GAIN, ScoRouting};
pub use uuid as uuids;
