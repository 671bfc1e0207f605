//! The audio gateway: session registry and connection state machine.
//!
//! [`Gateway`] owns every [`Session`], the shared [`AgState`] and the three
//! collaborators. It is driven from a single reactor thread: control
//! requests, transport completions, channel data and timer expirations all
//! arrive as `&mut self` calls, so no locking is needed.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use headset_types::{DeviceAddress, GainKind, HeadsetState, HfFeatures, Response, ScoRouting};

use crate::ag::AgState;
use crate::error::{Error, Result};
use crate::event_buffer;
use crate::events::{HeadsetSignal, SignalDispatcher, SignalEvent, SignalReceiver};
use crate::framer;
use crate::scheduler::{Scheduler, TimerId, TimerKind, Timers};
use crate::session::{Session, SessionInfo};
use crate::telephony::Telephony;
use crate::transport::{ChannelId, OperationId, ServiceRecord, Transport};

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Local adapter address used for outgoing connections.
    pub adapter: DeviceAddress,
    /// How SCO audio is routed; HCI routing refuses explicit play requests.
    pub sco_routing: ScoRouting,
    /// Whether the Hands-Free profile is served.
    pub hfp_enabled: bool,
    /// Whether the Headset profile is served.
    pub hsp_enabled: bool,
    /// Idle time before an auto-opened connection is torn down.
    pub disconnect_timeout: Duration,
    /// Interval between repeated `RING` notifications.
    pub ring_interval: Duration,
    /// Capacity of each session's AT input buffer.
    pub input_buffer_size: usize,
    /// Number of indicator events that can be held back.
    pub event_buffer_capacity: usize,
    /// Signal broadcast channel capacity.
    pub signal_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            adapter: DeviceAddress::ANY,
            sco_routing: ScoRouting::Hci,
            hfp_enabled: true,
            hsp_enabled: true,
            disconnect_timeout: Duration::from_secs(3),
            ring_interval: Duration::from_secs(3),
            input_buffer_size: framer::DEFAULT_CAPACITY,
            event_buffer_capacity: event_buffer::DEFAULT_CAPACITY,
            signal_capacity: 100,
        }
    }
}

/// The Headset/Hands-Free audio gateway.
pub struct Gateway<T, P, S> {
    pub(crate) config: GatewayConfig,
    pub(crate) ag: AgState,
    pub(crate) sessions: HashMap<DeviceAddress, Session>,
    pub(crate) transport: T,
    pub(crate) telephony: P,
    pub(crate) timers: Timers<S>,
    pub(crate) signals: SignalDispatcher,
    next_operation: u64,
    next_waiter: u32,
}

impl<T, P, S> Gateway<T, P, S>
where
    T: Transport,
    P: Telephony,
    S: Scheduler,
{
    pub fn new(config: GatewayConfig, transport: T, telephony: P, scheduler: S) -> Self {
        Self {
            ag: AgState::new(config.event_buffer_capacity),
            signals: SignalDispatcher::new(config.signal_capacity),
            config,
            sessions: HashMap::new(),
            transport,
            telephony,
            timers: Timers::new(scheduler),
            next_operation: 1,
            next_waiter: 1,
        }
    }

    // --- Accessors ---

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn ag(&self) -> &AgState {
        &self.ag
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn telephony(&self) -> &P {
        &self.telephony
    }

    pub fn telephony_mut(&mut self) -> &mut P {
        &mut self.telephony
    }

    pub fn scheduler(&self) -> &S {
        self.timers.scheduler()
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        self.timers.scheduler_mut()
    }

    /// Number of timers currently armed.
    pub fn armed_timers(&self) -> usize {
        self.timers.armed()
    }

    /// Subscribe to headset signals.
    pub fn subscribe(&self) -> SignalReceiver {
        self.signals.subscribe()
    }

    pub fn signals(&self) -> &SignalDispatcher {
        &self.signals
    }

    // --- Session registry ---

    /// Register a remote headset, or update the record of a known one.
    pub fn add_device(&mut self, remote: DeviceAddress, record: Option<ServiceRecord>) {
        let session = self.sessions.entry(remote).or_insert_with(|| {
            info!("Registered headset {remote}");
            Session::new(
                self.config.adapter,
                remote,
                self.config.hfp_enabled,
                self.config.input_buffer_size,
            )
        });

        if let Some(record) = record {
            session.update_record(&record);
        }
    }

    /// Apply a newly found service record to a known headset.
    pub fn update_record(&mut self, remote: &DeviceAddress, record: &ServiceRecord) -> Result<()> {
        let hs = self.session_mut(remote)?;
        if hs.update_record(record) {
            debug!("{remote}: record 0x{:x} applied", record.handle);
        }
        Ok(())
    }

    /// Forget a headset, tearing down anything it has open.
    pub fn remove_device(&mut self, remote: &DeviceAddress) -> Result<()> {
        let hs = self.session_mut(remote)?;
        if let Some(mut pending) = hs.pending.take() {
            if let Some((_, op)) = pending.take_operation() {
                self.transport.cancel(op);
            }
            pending.finish(*remote, Err(Error::Cancelled));
        }
        self.set_state(remote, HeadsetState::Disconnected);

        let mut hs = self
            .sessions
            .remove(remote)
            .ok_or(Error::DeviceNotFound(*remote))?;
        for timer in [hs.disconnect_timer.take(), hs.close_control()]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(timer);
        }
        if let Some((_, op)) = hs.detached.take() {
            self.transport.cancel(op);
        }
        hs.close_audio();

        info!("Removed headset {remote}");
        Ok(())
    }

    /// Addresses of all registered headsets, sorted.
    pub fn devices(&self) -> Vec<DeviceAddress> {
        let mut devices: Vec<_> = self.sessions.keys().copied().collect();
        devices.sort();
        devices
    }

    pub fn session(&self, remote: &DeviceAddress) -> Result<&Session> {
        self.sessions
            .get(remote)
            .ok_or(Error::DeviceNotFound(*remote))
    }

    pub(crate) fn session_mut(&mut self, remote: &DeviceAddress) -> Result<&mut Session> {
        self.sessions
            .get_mut(remote)
            .ok_or(Error::DeviceNotFound(*remote))
    }

    pub fn session_info(&self, remote: &DeviceAddress) -> Result<SessionInfo> {
        let active = self.ag.active_device() == Some(*remote);
        Ok(self.session(remote)?.info(active))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.devices()
            .iter()
            .filter_map(|d| self.session_info(d).ok())
            .collect()
    }

    // --- Queries ---

    pub fn state(&self, remote: &DeviceAddress) -> Result<HeadsetState> {
        Ok(self.session(remote)?.state)
    }

    /// RFCOMM channel of the headset, if known.
    pub fn channel(&self, remote: &DeviceAddress) -> Result<Option<u8>> {
        Ok(self.session(remote)?.rfcomm_channel)
    }

    /// Whether the session is anything but Disconnected.
    pub fn is_active(&self, remote: &DeviceAddress) -> Result<bool> {
        Ok(self.session(remote)?.state != HeadsetState::Disconnected)
    }

    /// The open audio channel, for handing to an audio consumer.
    pub fn audio_channel(&self, remote: &DeviceAddress) -> Result<Option<ChannelId>> {
        Ok(self.session(remote)?.audio_id())
    }

    pub fn hf_features(&self, remote: &DeviceAddress) -> Result<HfFeatures> {
        Ok(self.session(remote)?.hf_features)
    }

    pub fn active_device(&self) -> Option<DeviceAddress> {
        self.ag.active_device()
    }

    // --- Internal helpers ---

    pub(crate) fn next_operation(&mut self) -> OperationId {
        let id = OperationId(self.next_operation);
        self.next_operation += 1;
        id
    }

    pub(crate) fn next_waiter(&mut self) -> crate::pending::WaiterId {
        let id = crate::pending::WaiterId(self.next_waiter);
        self.next_waiter += 1;
        id
    }

    pub(crate) fn emit(&self, device: DeviceAddress, signal: HeadsetSignal) {
        self.signals.send(SignalEvent::new(device, signal));
    }

    /// Send on a session's control channel, logging failures.
    pub(crate) fn send(&mut self, device: &DeviceAddress, response: &Response) -> Result<()> {
        self.session_mut(device)?.send(response).inspect_err(|err| {
            warn!("{device}: failed to send {response}: {err}");
        })
    }

    // --- State machine ---

    /// Move a session to `state`, running the entry actions of the new state.
    ///
    /// Setting the current state again does nothing.
    pub(crate) fn set_state(&mut self, device: &DeviceAddress, state: HeadsetState) {
        let Some(hs) = self.sessions.get_mut(device) else {
            return;
        };
        let old = hs.state;
        if old == state {
            return;
        }

        match state {
            HeadsetState::Disconnected => {
                hs.close_audio();
                for timer in [hs.close_control(), hs.disconnect_timer.take()]
                    .into_iter()
                    .flatten()
                {
                    self.timers.cancel(timer);
                }
                if let Some(mut pending) = hs.pending.take() {
                    if let Some((_, op)) = pending.take_operation() {
                        self.transport.cancel(op);
                    }
                    pending.finish(*device, Err(Error::NotConnected));
                }
                if let Some((_, op)) = hs.detached.take() {
                    self.transport.cancel(op);
                }
                hs.hfp_active = false;

                self.signals
                    .send(SignalEvent::new(*device, HeadsetSignal::Disconnected));
                if let Err(err) = self.telephony.event_reporting(false) {
                    debug!("Telephony refused to disable event reporting: {err}");
                }
                // Indicator events only reach the active device, so the
                // AG-wide CMER mode is the active device's to reset.
                if self.ag.active_device() == Some(*device) {
                    self.ag.set_active(None);
                    self.ag.reset_event_reporting();
                }
            }
            HeadsetState::Connected => {
                hs.close_audio();
                if old < state {
                    self.signals
                        .send(SignalEvent::new(*device, HeadsetSignal::Connected));
                    if self.ag.active_device().is_none() {
                        self.ag.set_active(Some(*device));
                    }
                } else if old == HeadsetState::Playing {
                    self.signals
                        .send(SignalEvent::new(*device, HeadsetSignal::Stopped));
                }
            }
            HeadsetState::Playing => {
                if let Some(audio) = hs.audio.as_mut() {
                    audio.watch();
                }
                self.signals
                    .send(SignalEvent::new(*device, HeadsetSignal::Playing));

                for kind in [GainKind::Speaker, GainKind::Microphone] {
                    if let Some(value) = hs.gain(kind)
                        && let Err(err) = hs.send(&Response::Gain { kind, value })
                    {
                        warn!("{device}: failed to sync {kind} gain: {err}");
                    }
                }
            }
            HeadsetState::ConnectInProgress | HeadsetState::PlayInProgress => {}
        }

        info!("{device}: {old} -> {state}");
        hs.state = state;
    }

    // --- Timers ---

    pub(crate) fn arm_timer(
        &mut self,
        device: &DeviceAddress,
        kind: TimerKind,
        after: Duration,
    ) -> TimerId {
        self.timers.arm(*device, kind, after)
    }

    /// Arm the auto-disconnect timer of an idle auto-opened session.
    pub(crate) fn arm_disconnect_timer(&mut self, device: &DeviceAddress) {
        let after = self.config.disconnect_timeout;
        let id = self.timers.arm(*device, TimerKind::AutoDisconnect, after);
        if let Some(hs) = self.sessions.get_mut(device)
            && let Some(old) = hs.disconnect_timer.replace(id)
        {
            self.timers.cancel(old);
        }
        debug!("{device}: disconnecting in {after:?} unless used");
    }

    /// Handle an expired timer.
    pub fn timer_fired(&mut self, id: TimerId) {
        let Some((device, kind)) = self.timers.fire(id) else {
            debug!("Ignoring stale {id}");
            return;
        };

        match kind {
            TimerKind::Ring => {
                let interval = self.config.ring_interval;
                let Some(hs) = self.sessions.get_mut(&device) else {
                    return;
                };
                if hs.ring_timer != Some(id) {
                    return;
                }
                hs.ring_timer = None;
                if let Err(err) = self.send_ring(&device) {
                    warn!("{device}: stopping ring: {err}");
                    return;
                }
                let next = self.arm_timer(&device, TimerKind::Ring, interval);
                if let Some(hs) = self.sessions.get_mut(&device) {
                    hs.ring_timer = Some(next);
                }
            }
            TimerKind::AutoDisconnect => {
                let Some(hs) = self.sessions.get_mut(&device) else {
                    return;
                };
                if hs.disconnect_timer != Some(id) {
                    return;
                }
                hs.disconnect_timer = None;
                info!("{device}: idle, disconnecting");
                self.set_state(&device, HeadsetState::Disconnected);
            }
            TimerKind::Complete => self.advance(&device),
        }
    }
}

impl<T, P, S> std::fmt::Debug for Gateway<T, P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("ag", &self.ag)
            .field("sessions", &self.sessions.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
