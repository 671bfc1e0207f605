//! Transport collaborator interface.
//!
//! Service discovery and the RFCOMM/SCO connect primitives live outside the
//! protocol engine. The gateway starts an operation through [`Transport`]
//! under an [`OperationId`] it allocates, and the reactor reports the result
//! back through [`Gateway::discovery_complete`](crate::Gateway::discovery_complete),
//! [`Gateway::control_connected`](crate::Gateway::control_connected) or
//! [`Gateway::audio_connected`](crate::Gateway::audio_connected).

use std::fmt;
use std::io;

use uuid::Uuid;

use headset_types::DeviceAddress;
use headset_types::uuids;

use crate::error::TransportError;

/// Handle of one asynchronous transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Identity of an open channel, used to match readiness events to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// A headset service record found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Record handle on the remote device.
    pub handle: u32,
    /// Service class of the record.
    pub class: Uuid,
    /// RFCOMM server channel from the protocol descriptor list.
    pub channel: Option<u8>,
}

impl ServiceRecord {
    /// A Headset Profile record.
    pub fn headset(handle: u32, channel: u8) -> Self {
        Self {
            handle,
            class: uuids::HEADSET,
            channel: Some(channel),
        }
    }

    /// A Hands-Free Profile record.
    pub fn handsfree(handle: u32, channel: u8) -> Self {
        Self {
            handle,
            class: uuids::HANDSFREE,
            channel: Some(channel),
        }
    }

    #[must_use]
    pub fn is_handsfree(&self) -> bool {
        self.class == uuids::HANDSFREE
    }

    #[must_use]
    pub fn is_headset(&self) -> bool {
        self.class == uuids::HEADSET
    }
}

/// An open RFCOMM or SCO stream.
pub trait Channel {
    fn id(&self) -> ChannelId;

    /// Write bytes without blocking.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Start reporting closure and errors of this channel to the reactor.
    fn watch(&mut self) {}

    /// Shut the stream down. Further sends fail.
    fn close(&mut self);
}

/// Starts asynchronous discovery and connect operations.
///
/// Each method either starts the operation and returns, or fails
/// immediately. A started operation must eventually be reported back to
/// the gateway exactly once, unless it is cancelled.
pub trait Transport {
    /// Look up the `service` record on `remote`.
    fn discover(
        &mut self,
        op: OperationId,
        local: DeviceAddress,
        remote: DeviceAddress,
        service: Uuid,
    ) -> Result<(), TransportError>;

    /// Open the RFCOMM control channel.
    fn connect_control(
        &mut self,
        op: OperationId,
        local: DeviceAddress,
        remote: DeviceAddress,
        channel: u8,
    ) -> Result<(), TransportError>;

    /// Open the SCO audio channel.
    fn connect_audio(
        &mut self,
        op: OperationId,
        local: DeviceAddress,
        remote: DeviceAddress,
    ) -> Result<(), TransportError>;

    /// Abandon an operation. Its result may still be reported.
    fn cancel(&mut self, op: OperationId);
}
