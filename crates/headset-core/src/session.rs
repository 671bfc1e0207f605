//! Per-device session data.

use serde::Serialize;
use tracing::{debug, trace, warn};

use headset_types::{DeviceAddress, GainKind, HeadsetState, HfFeatures, LockMask, Response};

use crate::error::{Error, Result, Stage};
use crate::framer::LineFramer;
use crate::pending::PendingConnect;
use crate::scheduler::TimerId;
use crate::transport::{Channel, ChannelId, OperationId, ServiceRecord};

/// One remote headset known to the gateway.
pub struct Session {
    pub(crate) local: DeviceAddress,
    pub(crate) remote: DeviceAddress,
    pub(crate) state: HeadsetState,
    pub(crate) hsp_handle: Option<u32>,
    pub(crate) hfp_handle: Option<u32>,
    pub(crate) rfcomm_channel: Option<u8>,
    pub(crate) control: Option<Box<dyn Channel>>,
    /// Incoming control channel awaiting authorization.
    pub(crate) incoming: Option<Box<dyn Channel>>,
    pub(crate) audio: Option<Box<dyn Channel>>,
    pub(crate) framer: LineFramer,
    pub(crate) hfp_active: bool,
    pub(crate) search_hfp: bool,
    pub(crate) hf_features: HfFeatures,
    pub(crate) speaker_gain: Option<u8>,
    pub(crate) microphone_gain: Option<u8>,
    pub(crate) auto_disconnect: bool,
    pub(crate) caller_id_active: bool,
    pub(crate) caller_number: Option<String>,
    pub(crate) ring_timer: Option<TimerId>,
    pub(crate) disconnect_timer: Option<TimerId>,
    pub(crate) lock: LockMask,
    pub(crate) pending: Option<PendingConnect>,
    /// Stage released by a finalized pending operation, still running.
    pub(crate) detached: Option<(Stage, OperationId)>,
}

impl Session {
    pub(crate) fn new(
        local: DeviceAddress,
        remote: DeviceAddress,
        search_hfp: bool,
        input_capacity: usize,
    ) -> Self {
        Self {
            local,
            remote,
            state: HeadsetState::Disconnected,
            hsp_handle: None,
            hfp_handle: None,
            rfcomm_channel: None,
            control: None,
            incoming: None,
            audio: None,
            framer: LineFramer::with_capacity(input_capacity),
            hfp_active: false,
            search_hfp,
            hf_features: HfFeatures::default(),
            speaker_gain: None,
            microphone_gain: None,
            auto_disconnect: false,
            caller_id_active: false,
            caller_number: None,
            ring_timer: None,
            disconnect_timer: None,
            lock: LockMask::NONE,
            pending: None,
            detached: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.remote
    }

    #[must_use]
    pub fn state(&self) -> HeadsetState {
        self.state
    }

    #[must_use]
    pub fn pending(&self) -> Option<&PendingConnect> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn is_ringing(&self) -> bool {
        self.ring_timer.is_some()
    }

    #[must_use]
    pub fn gain(&self, kind: GainKind) -> Option<u8> {
        match kind {
            GainKind::Speaker => self.speaker_gain,
            GainKind::Microphone => self.microphone_gain,
        }
    }

    /// Store a gain value, returning whether it changed.
    pub(crate) fn set_gain(&mut self, kind: GainKind, value: u8) -> bool {
        let slot = match kind {
            GainKind::Speaker => &mut self.speaker_gain,
            GainKind::Microphone => &mut self.microphone_gain,
        };
        let changed = *slot != Some(value);
        *slot = Some(value);
        changed
    }

    #[must_use]
    pub fn control_id(&self) -> Option<ChannelId> {
        self.control.as_ref().map(|c| c.id())
    }

    #[must_use]
    pub fn audio_id(&self) -> Option<ChannelId> {
        self.audio.as_ref().map(|c| c.id())
    }

    /// Write a response line on the control channel.
    pub fn send(&mut self, response: &Response) -> Result<()> {
        let Some(control) = self.control.as_mut() else {
            return Err(Error::NotConnected);
        };
        trace!("{}: sending {response}", self.remote);
        control.send(response.encode().as_bytes())?;
        Ok(())
    }

    /// Apply a service record, returning whether it was taken.
    ///
    /// A second record of a profile with a different handle is refused.
    /// An HSP record is remembered but does not set the channel once HFP is
    /// known.
    pub(crate) fn update_record(&mut self, record: &ServiceRecord) -> bool {
        if record.is_handsfree() {
            if let Some(known) = self.hfp_handle
                && known != record.handle
            {
                warn!(
                    "{}: more than one HFP record found (0x{known:x}, 0x{:x})",
                    self.remote, record.handle
                );
                return false;
            }
            self.hfp_handle = Some(record.handle);
        } else if record.is_headset() {
            if let Some(known) = self.hsp_handle
                && known != record.handle
            {
                warn!(
                    "{}: more than one HSP record found (0x{known:x}, 0x{:x})",
                    self.remote, record.handle
                );
                return false;
            }
            self.hsp_handle = Some(record.handle);
            if self.hfp_handle.is_some() {
                debug!("{}: HFP is known, keeping its channel", self.remote);
                return false;
            }
        } else {
            debug!("{}: ignoring record of class {}", self.remote, record.class);
            return false;
        }

        if record.channel.is_some() {
            self.rfcomm_channel = record.channel;
        }
        true
    }

    pub(crate) fn close_audio(&mut self) {
        if let Some(mut audio) = self.audio.take() {
            audio.close();
        }
    }

    /// Close the control channels and reset line framing and call state.
    /// Returns the ring timer to cancel.
    pub(crate) fn close_control(&mut self) -> Option<TimerId> {
        for mut channel in [self.control.take(), self.incoming.take()]
            .into_iter()
            .flatten()
        {
            channel.close();
        }
        self.framer.clear();
        self.caller_number = None;
        self.ring_timer.take()
    }

    /// Profile in use, or the one a connection would use.
    #[must_use]
    pub fn profile(&self) -> &'static str {
        if self.hfp_active {
            "hfp"
        } else if self.control.is_some() || self.hsp_handle.is_some() {
            "hsp"
        } else if self.hfp_handle.is_some() {
            "hfp"
        } else {
            "unknown"
        }
    }

    /// A serializable snapshot.
    #[must_use]
    pub fn info(&self, active: bool) -> SessionInfo {
        SessionInfo {
            address: self.remote,
            state: self.state,
            channel: self.rfcomm_channel,
            profile: self.profile(),
            hf_features: self.hf_features.bits(),
            speaker_gain: self.speaker_gain,
            microphone_gain: self.microphone_gain,
            ringing: self.is_ringing(),
            auto_disconnect: self.auto_disconnect,
            active,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("rfcomm_channel", &self.rfcomm_channel)
            .field("control", &self.control_id())
            .field("audio", &self.audio_id())
            .field("hfp_active", &self.hfp_active)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub address: DeviceAddress,
    pub state: HeadsetState,
    pub channel: Option<u8>,
    pub profile: &'static str,
    pub hf_features: u32,
    pub speaker_gain: Option<u8>,
    pub microphone_gain: Option<u8>,
    pub ringing: bool,
    pub auto_disconnect: bool,
    pub active: bool,
}
