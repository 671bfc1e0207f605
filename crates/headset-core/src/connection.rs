//! Pending-operation coordinator.
//!
//! Requests to bring a session up coalesce into the session's single
//! [`PendingConnect`]. The coordinator starts at most one asynchronous
//! stage at a time (discovery, control connect, audio connect) and, as each
//! completes, either issues the next one or finalizes the pending operation.
//!
//! Every stage is started under a fresh [`OperationId`]. A completion is
//! matched against the operation the pending connect is waiting for, or
//! against the operation released when the pending connect was finalized
//! early. Anything else is stale and discarded.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use headset_types::{DeviceAddress, HeadsetState, LockMask, uuids};

use crate::error::{Error, Result, Stage, TransportError};
use crate::gateway::Gateway;
use crate::pending::{PendingConnect, StreamCallback, WaiterId};
use crate::scheduler::{Scheduler, TimerKind};
use crate::telephony::Telephony;
use crate::transport::{Channel, ChannelId, OperationId, ServiceRecord, Transport};

/// Who a stage completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// The operation the pending connect waits for.
    Pending,
    /// An operation left running after its pending connect was finalized.
    Detached,
    Stale,
}

impl<T, P, S> Gateway<T, P, S>
where
    T: Transport,
    P: Telephony,
    S: Scheduler,
{
    /// Drive `device` towards `target`, which must be Connected or Playing.
    ///
    /// Starts the first stage needed, or joins the connection attempt
    /// already in progress. `callback`, if given, is invoked once with the
    /// outcome. The returned id can be passed to
    /// [`cancel_stream`](Self::cancel_stream).
    pub fn request(
        &mut self,
        device: &DeviceAddress,
        target: HeadsetState,
        callback: Option<StreamCallback>,
    ) -> Result<WaiterId> {
        if !matches!(target, HeadsetState::Connected | HeadsetState::Playing) {
            return Err(Error::InvalidArgument(format!("cannot request state {target}")));
        }
        let hs = self.session(device)?;
        let state = hs.state;
        let has_pending = hs.pending.is_some();

        if !has_pending {
            if state >= target {
                // Already there; complete from the reactor rather than inline.
                let id = self.next_waiter();
                if let Some(callback) = callback {
                    let mut pending = PendingConnect::new(target);
                    pending.add_waiter(id, callback);
                    self.session_mut(device)?.pending = Some(pending);
                    self.arm_timer(device, TimerKind::Complete, Duration::ZERO);
                }
                return Ok(id);
            }

            match state {
                HeadsetState::Disconnected => self.start_control(device, target)?,
                HeadsetState::Connected => self.start_audio(device)?,
                _ => {
                    // A stage released by an earlier attempt is still running.
                    let hs = self.session_mut(device)?;
                    let mut pending = PendingConnect::new(target);
                    if let Some((stage, op)) = hs.detached.take() {
                        debug!("{device}: adopting {stage} {op}");
                        pending.set_operation(stage, op);
                    }
                    hs.pending = Some(pending);
                }
            }
        }

        let id = self.next_waiter();
        if let Some(pending) = self.session_mut(device)?.pending.as_mut() {
            pending.raise_target(target);
            if let Some(callback) = callback {
                pending.add_waiter(id, callback);
            }
        }
        Ok(id)
    }

    /// Request audio for `device`, opening the control channel first if needed.
    ///
    /// A session opened this way disconnects on its own once nobody uses it.
    pub fn request_stream(
        &mut self,
        device: &DeviceAddress,
        callback: StreamCallback,
    ) -> Result<WaiterId> {
        let hs = self
            .sessions
            .get_mut(device)
            .ok_or(Error::DeviceNotFound(*device))?;
        if let Some(timer) = hs.disconnect_timer.take() {
            self.timers.cancel(timer);
        }
        let opens_control = hs.state == HeadsetState::Disconnected;

        let id = self.request(device, HeadsetState::Playing, Some(callback))?;
        if opens_control {
            self.session_mut(device)?.auto_disconnect = true;
        }
        debug!("{device}: stream requested, waiter {id}");
        Ok(id)
    }

    /// Withdraw a stream request. Returns whether `id` was registered.
    ///
    /// The stage in flight keeps running. Once nobody is waiting any more the
    /// pending operation is finalized, and an auto-opened session schedules
    /// its disconnect.
    pub fn cancel_stream(&mut self, device: &DeviceAddress, id: WaiterId) -> bool {
        let Some(pending) = self
            .sessions
            .get_mut(device)
            .and_then(|hs| hs.pending.as_mut())
        else {
            return false;
        };
        if !pending.remove_waiter(id) {
            return false;
        }
        if pending.has_interest() {
            return true;
        }

        debug!("{device}: last waiter {id} cancelled");
        self.finalize(device, Ok(()));

        let (auto_disconnect, has_control) = self
            .sessions
            .get(device)
            .map_or((false, false), |hs| (hs.auto_disconnect, hs.control.is_some()));
        if auto_disconnect {
            if has_control {
                self.arm_disconnect_timer(device);
            } else {
                self.set_state(device, HeadsetState::Disconnected);
            }
        }
        true
    }

    // --- Locks ---

    /// Take `lock` on behalf of an audio consumer.
    pub fn lock(&mut self, device: &DeviceAddress, lock: LockMask) -> Result<()> {
        let hs = self.session_mut(device)?;
        if hs.lock.intersects(lock) {
            return Err(Error::Busy);
        }
        hs.lock.insert(lock);
        Ok(())
    }

    /// Release `lock`. Releasing the last lock stops audio.
    pub fn unlock(&mut self, device: &DeviceAddress, lock: LockMask) -> Result<()> {
        let hs = self.session_mut(device)?;
        if !hs.lock.intersects(lock) {
            return Err(Error::InvalidArgument(format!(
                "lock 0x{:x} is not held",
                lock.bits()
            )));
        }
        hs.lock.remove(lock);
        if !hs.lock.is_empty() {
            return Ok(());
        }

        if hs.state == HeadsetState::Playing {
            self.set_state(device, HeadsetState::Connected);
        }
        let hs = self.session(device)?;
        if hs.auto_disconnect {
            if hs.state == HeadsetState::Connected {
                self.arm_disconnect_timer(device);
            } else {
                self.set_state(device, HeadsetState::Disconnected);
            }
        }
        Ok(())
    }

    // --- Stage starts ---

    fn begin_stage(&mut self, device: &DeviceAddress, target: HeadsetState, stage: Stage, op: OperationId) {
        if let Some(hs) = self.sessions.get_mut(device) {
            let pending = hs.pending.get_or_insert_with(|| PendingConnect::new(target));
            pending.raise_target(target);
            pending.set_operation(stage, op);
        }
    }

    /// Discover the service record, or connect right away if the channel is known.
    fn start_control(&mut self, device: &DeviceAddress, target: HeadsetState) -> Result<()> {
        let hs = self.session(device)?;
        let (local, remote) = (hs.local, hs.remote);
        let channel = hs.rfcomm_channel;
        let search_hfp = hs.search_hfp;
        let op = self.next_operation();

        let stage = match channel {
            Some(channel) => {
                self.transport
                    .connect_control(op, local, remote, channel)
                    .map_err(|e| Error::transport(Stage::Control, e))?;
                debug!("{device}: connecting to channel {channel} ({op})");
                Stage::Control
            }
            None => {
                let service = if search_hfp {
                    uuids::HANDSFREE
                } else {
                    uuids::HEADSET
                };
                self.transport
                    .discover(op, local, remote, service)
                    .map_err(|e| Error::transport(Stage::Discovery, e))?;
                debug!("{device}: searching for {service} ({op})");
                Stage::Discovery
            }
        };

        self.begin_stage(device, target, stage, op);
        self.set_state(device, HeadsetState::ConnectInProgress);
        Ok(())
    }

    /// Open the audio channel of a Connected session.
    pub(crate) fn start_audio(&mut self, device: &DeviceAddress) -> Result<()> {
        let hs = self.session(device)?;
        if hs.state != HeadsetState::Connected {
            return Err(Error::NotConnected);
        }
        let (local, remote) = (hs.local, hs.remote);
        let op = self.next_operation();

        self.transport
            .connect_audio(op, local, remote)
            .map_err(|e| Error::transport(Stage::Audio, e))?;
        debug!("{device}: connecting audio ({op})");

        self.begin_stage(device, HeadsetState::Playing, Stage::Audio, op);
        self.set_state(device, HeadsetState::PlayInProgress);
        Ok(())
    }

    // --- Completion plumbing ---

    fn claim(&mut self, device: &DeviceAddress, stage: Stage, op: OperationId) -> Claim {
        let Some(hs) = self.sessions.get_mut(device) else {
            return Claim::Stale;
        };
        if let Some(pending) = hs.pending.as_mut()
            && pending.operation() == Some((stage, op))
        {
            pending.take_operation();
            return Claim::Pending;
        }
        if hs.detached == Some((stage, op)) {
            hs.detached = None;
            return Claim::Detached;
        }
        Claim::Stale
    }

    /// Consume the pending operation and notify everyone waiting on it.
    ///
    /// A stage still in flight is released and settles the session without
    /// notifying anyone when it completes.
    pub(crate) fn finalize(&mut self, device: &DeviceAddress, result: Result<()>) {
        let Some(hs) = self.sessions.get_mut(device) else {
            return;
        };
        let Some(mut pending) = hs.pending.take() else {
            return;
        };
        if let Some(operation) = pending.take_operation() {
            hs.detached = Some(operation);
        }
        pending.finish(*device, result);
    }

    /// Report `err` to everyone waiting and fall back to the highest valid state.
    pub(crate) fn fail(&mut self, device: &DeviceAddress, err: Error) {
        error!("{device}: {err}");
        self.finalize(device, Err(err));
        self.regress(device);
    }

    fn regress(&mut self, device: &DeviceAddress) {
        let Some(hs) = self.sessions.get(device) else {
            return;
        };
        if hs.control.is_some() {
            self.set_state(device, HeadsetState::Connected);
            self.idle(device);
        } else {
            self.set_state(device, HeadsetState::Disconnected);
        }
    }

    /// Settle a session whose released stage has just completed.
    fn settle(&mut self, device: &DeviceAddress) {
        let in_progress = self.sessions.get(device).is_some_and(|hs| {
            matches!(
                hs.state,
                HeadsetState::ConnectInProgress | HeadsetState::PlayInProgress
            ) && hs.pending.is_none()
        });
        if in_progress {
            self.regress(device);
        }
    }

    /// Arm the disconnect timer of an unused auto-opened session.
    fn idle(&mut self, device: &DeviceAddress) {
        let unused = self.sessions.get(device).is_some_and(|hs| {
            hs.auto_disconnect
                && hs.lock.is_empty()
                && hs.pending.is_none()
                && hs.state == HeadsetState::Connected
        });
        if unused {
            self.arm_disconnect_timer(device);
        }
    }

    /// Finish a request that was already satisfied when it was made, or
    /// start the stage a raised target now needs.
    pub(crate) fn advance(&mut self, device: &DeviceAddress) {
        let Some(hs) = self.sessions.get(device) else {
            return;
        };
        let Some(pending) = hs.pending.as_ref() else {
            return;
        };
        if pending.operation().is_some() {
            return;
        }

        if hs.state >= pending.target() {
            self.finalize(device, Ok(()));
        } else if hs.state == HeadsetState::Connected
            && let Err(err) = self.start_audio(device)
        {
            self.fail(device, err);
        }
    }

    // --- Stage completions ---

    /// Service discovery finished.
    pub fn discovery_complete(
        &mut self,
        device: &DeviceAddress,
        op: OperationId,
        result: std::result::Result<Vec<ServiceRecord>, TransportError>,
    ) {
        let claim = self.claim(device, Stage::Discovery, op);
        if claim == Claim::Stale {
            warn!("{device}: ignoring stale discovery result ({op})");
            return;
        }

        let record = match result {
            Ok(records) => self.select_record(device, records),
            Err(e) => Err(Error::transport(Stage::Discovery, e)),
        };

        match (claim, record) {
            (Claim::Pending, Ok(())) => {
                let target = self
                    .sessions
                    .get(device)
                    .and_then(|hs| hs.pending.as_ref())
                    .map_or(HeadsetState::Connected, PendingConnect::target);
                if let Err(err) = self.start_control(device, target) {
                    self.fail(device, err);
                }
            }
            (Claim::Pending, Err(err)) => self.fail(device, err),
            (_, result) => {
                if let Err(err) = result {
                    debug!("{device}: released discovery failed: {err}");
                }
                self.settle(device);
            }
        }
    }

    /// Apply the first discovered record, which must be the profile searched for.
    fn select_record(&mut self, device: &DeviceAddress, records: Vec<ServiceRecord>) -> Result<()> {
        let hs = self.session_mut(device)?;
        let Some(record) = records.into_iter().next() else {
            return Err(Error::NotSupported("no service records found".into()));
        };

        let searched = if hs.search_hfp {
            uuids::HANDSFREE
        } else {
            uuids::HEADSET
        };
        if record.class != searched {
            return Err(Error::NotSupported(format!(
                "record does not contain the {} UUID",
                if hs.search_hfp { "HFP" } else { "HSP" }
            )));
        }
        let Some(channel) = record.channel else {
            return Err(Error::NotSupported(
                "record has no RFCOMM channel".into(),
            ));
        };

        if hs.search_hfp {
            hs.hfp_handle = Some(record.handle);
        } else {
            hs.hsp_handle = Some(record.handle);
        }
        hs.rfcomm_channel = Some(channel);
        debug!("{device}: record 0x{:x}, channel {channel}", record.handle);
        Ok(())
    }

    /// The control channel connect finished.
    pub fn control_connected(
        &mut self,
        device: &DeviceAddress,
        op: OperationId,
        result: std::result::Result<Box<dyn Channel>, TransportError>,
    ) {
        let claim = self.claim(device, Stage::Control, op);
        let mut channel = match (claim, result) {
            (Claim::Stale, Ok(mut channel)) => {
                warn!("{device}: closing stale control channel ({op})");
                channel.close();
                return;
            }
            (Claim::Stale, Err(e)) => {
                debug!("{device}: ignoring stale control failure ({op}): {e}");
                return;
            }
            (Claim::Pending, Err(e)) => {
                self.fail(device, Error::transport(Stage::Control, e));
                return;
            }
            (Claim::Detached, Err(e)) => {
                debug!("{device}: released control connect failed: {e}");
                self.settle(device);
                return;
            }
            (_, Ok(channel)) => channel,
        };

        let hfp_enabled = self.config.hfp_enabled;
        let Some(hs) = self.sessions.get_mut(device) else {
            channel.close();
            return;
        };
        channel.watch();
        hs.control = Some(channel);
        hs.framer.clear();
        hs.hfp_active = hfp_enabled && hs.hfp_handle.is_some();
        info!("{device}: control channel open ({})", hs.profile());

        if hs.hfp_active {
            debug!("{device}: waiting for service level connection");
            return;
        }
        self.control_established(device);
    }

    /// The control channel is usable: either it opened in HSP mode or the
    /// HFP service level connection completed.
    pub(crate) fn control_established(&mut self, device: &DeviceAddress) {
        self.set_state(device, HeadsetState::Connected);

        let Some(pending) = self
            .sessions
            .get_mut(device)
            .and_then(|hs| hs.pending.as_mut())
        else {
            self.idle(device);
            return;
        };
        pending.reply_if_reached(HeadsetState::Connected);

        if pending.target() == HeadsetState::Playing {
            if let Err(err) = self.start_audio(device) {
                self.fail(device, err);
            }
        } else {
            self.finalize(device, Ok(()));
        }
    }

    /// The audio channel connect finished.
    pub fn audio_connected(
        &mut self,
        device: &DeviceAddress,
        op: OperationId,
        result: std::result::Result<Box<dyn Channel>, TransportError>,
    ) {
        match (self.claim(device, Stage::Audio, op), result) {
            (Claim::Pending, Ok(channel)) => {
                if let Some(hs) = self.sessions.get_mut(device) {
                    hs.audio = Some(channel);
                }
                info!("{device}: audio channel open");
                self.set_state(device, HeadsetState::Playing);
                self.finalize(device, Ok(()));
            }
            (Claim::Pending, Err(e)) => self.fail(device, Error::transport(Stage::Audio, e)),
            (Claim::Detached, result) => {
                match result {
                    Ok(mut channel) => {
                        debug!("{device}: nobody wants audio any more, closing");
                        channel.close();
                    }
                    Err(e) => debug!("{device}: released audio connect failed: {e}"),
                }
                self.settle(device);
            }
            (Claim::Stale, Ok(mut channel)) => {
                warn!("{device}: closing stale audio channel ({op})");
                channel.close();
            }
            (Claim::Stale, Err(e)) => {
                debug!("{device}: ignoring stale audio failure ({op}): {e}");
            }
        }
    }

    // --- Channel events ---

    /// The remote closed a control channel, or it failed.
    pub fn control_closed(&mut self, device: &DeviceAddress, channel: ChannelId) {
        let Some(hs) = self.sessions.get(device) else {
            return;
        };
        let incoming = hs.incoming.as_ref().map(|c| c.id());
        if hs.control_id() != Some(channel) && incoming != Some(channel) {
            debug!("{device}: ignoring closure of {channel}");
            return;
        }

        info!("{device}: control channel closed");
        self.finalize(
            device,
            Err(Error::transport(
                Stage::Control,
                TransportError::Other("connection closed".into()),
            )),
        );
        self.set_state(device, HeadsetState::Disconnected);
    }

    /// The audio channel closed or failed.
    pub fn audio_closed(&mut self, device: &DeviceAddress, channel: ChannelId) {
        let Some(hs) = self.sessions.get_mut(device) else {
            return;
        };
        if hs.audio_id() != Some(channel) {
            debug!("{device}: ignoring closure of {channel}");
            return;
        }

        info!("{device}: audio channel closed");
        if hs.state == HeadsetState::Playing {
            self.set_state(device, HeadsetState::Connected);
        } else {
            hs.close_audio();
        }
    }

    // --- Incoming connections ---

    /// A headset opened the control channel. It stays unauthorized until
    /// [`authorize_incoming`](Self::authorize_incoming).
    pub fn incoming_control(
        &mut self,
        device: &DeviceAddress,
        mut channel: Box<dyn Channel>,
        hfp: bool,
    ) -> Result<()> {
        let served = if hfp {
            self.config.hfp_enabled
        } else {
            self.config.hsp_enabled
        };
        if !served {
            warn!(
                "{device}: refusing {} connection, profile disabled",
                if hfp { "HFP" } else { "HSP" }
            );
            channel.close();
            return Err(Error::NotAvailable);
        }

        let hs = match self.session_mut(device) {
            Ok(hs) => hs,
            Err(err) => {
                channel.close();
                return Err(err);
            }
        };
        if hs.control.is_some() || hs.incoming.is_some() {
            channel.close();
            return Err(Error::AlreadyConnected);
        }
        if hs.state != HeadsetState::Disconnected {
            channel.close();
            return Err(Error::AlreadyInProgress);
        }

        hs.incoming = Some(channel);
        hs.hfp_active = hfp;
        info!(
            "{device}: incoming {} connection",
            if hfp { "HFP" } else { "HSP" }
        );
        self.set_state(device, HeadsetState::ConnectInProgress);
        Ok(())
    }

    /// Accept the incoming control channel.
    pub fn authorize_incoming(&mut self, device: &DeviceAddress) -> Result<()> {
        let telephony_ready = self.ag.is_ready();
        let hs = self.session_mut(device)?;
        if hs.incoming.is_none() {
            return Err(Error::NotConnected);
        }
        if hs.hfp_active && !telephony_ready {
            error!("{device}: refusing HFP connection, telephony is not initialized");
            self.set_state(device, HeadsetState::Disconnected);
            return Err(Error::NotReady);
        }

        if let Some(mut channel) = hs.incoming.take() {
            channel.watch();
            hs.control = Some(channel);
        }
        hs.framer.clear();
        hs.auto_disconnect = false;

        if !hs.hfp_active {
            self.control_established(device);
        }
        Ok(())
    }

    /// Refuse the incoming control channel.
    pub fn reject_incoming(&mut self, device: &DeviceAddress) -> Result<()> {
        if self.session(device)?.incoming.is_none() {
            return Err(Error::NotConnected);
        }
        info!("{device}: incoming connection rejected");
        self.set_state(device, HeadsetState::Disconnected);
        Ok(())
    }

    /// A headset opened the audio channel.
    pub fn incoming_audio(&mut self, device: &DeviceAddress, mut channel: Box<dyn Channel>) -> Result<()> {
        let check = self.session(device).and_then(|hs| {
            if hs.audio.is_some() {
                Err(Error::AlreadyConnected)
            } else if hs.state == HeadsetState::PlayInProgress {
                Err(Error::AlreadyInProgress)
            } else if hs.state != HeadsetState::Connected {
                Err(Error::NotConnected)
            } else {
                Ok(())
            }
        });
        if let Err(err) = check {
            channel.close();
            return Err(err);
        }

        self.session_mut(device)?.audio = Some(channel);
        info!("{device}: incoming audio connection");
        self.set_state(device, HeadsetState::Playing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::mock::{ChannelProbe, MockChannel, MockGateway, TransportCall, mock_gateway};
    use crate::transport::ServiceRecord;

    type Outcomes = Rc<RefCell<Vec<Option<DeviceAddress>>>>;

    fn device() -> DeviceAddress {
        DeviceAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
    }

    fn recorder() -> (Outcomes, impl Fn() -> StreamCallback) {
        let log: Outcomes = Rc::default();
        let shared = Rc::clone(&log);
        (log, move || {
            let log = Rc::clone(&shared);
            Box::new(move |result| log.borrow_mut().push(result))
        })
    }

    fn hsp_gateway() -> MockGateway {
        let mut gw = mock_gateway();
        gw.add_device(device(), Some(ServiceRecord::headset(0x10001, 2)));
        gw
    }

    fn open_control(gw: &mut MockGateway, id: u64) -> ChannelProbe {
        let op = gw.transport().last_operation().unwrap();
        let (channel, probe) = MockChannel::new(id);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));
        probe
    }

    fn open_audio(gw: &mut MockGateway, id: u64) -> ChannelProbe {
        let op = gw.transport().last_operation().unwrap();
        let (channel, probe) = MockChannel::new(id);
        gw.audio_connected(&device(), op, Ok(Box::new(channel)));
        probe
    }

    #[test]
    fn test_request_rejects_in_progress_targets() {
        let mut gw = hsp_gateway();
        assert!(matches!(
            gw.request(&device(), HeadsetState::PlayInProgress, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stream_over_known_channel() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();

        let id = gw.request_stream(&device(), make()).unwrap();
        assert_eq!(id.get(), 1);
        assert!(matches!(
            gw.transport().calls()[0],
            TransportCall::ConnectControl { channel: 2, .. }
        ));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::ConnectInProgress);

        let _control = open_control(&mut gw, 1);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::PlayInProgress);
        assert!(log.borrow().is_empty());

        let _audio = open_audio(&mut gw, 2);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Playing);
        assert_eq!(*log.borrow(), vec![Some(device())]);
        assert!(gw.session(&device()).unwrap().pending().is_none());
        assert!(gw.session(&device()).unwrap().auto_disconnect);
    }

    #[test]
    fn test_requests_coalesce() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();

        let first = gw.request(&device(), HeadsetState::Connected, Some(make())).unwrap();
        let second = gw.request_stream(&device(), make()).unwrap();
        assert_ne!(first, second);
        assert_eq!(gw.transport().calls().len(), 1);

        let pending = gw.session(&device()).unwrap().pending().unwrap();
        assert_eq!(pending.target(), HeadsetState::Playing);
        assert_eq!(pending.waiter_count(), 2);

        let _control = open_control(&mut gw, 1);
        let _audio = open_audio(&mut gw, 2);
        assert_eq!(*log.borrow(), vec![Some(device()), Some(device())]);
    }

    #[test]
    fn test_immediate_transport_failure_leaves_state() {
        let mut gw = hsp_gateway();
        gw.transport_mut().fail_next(TransportError::HostDown);
        let (log, make) = recorder();

        let err = gw.request_stream(&device(), make()).unwrap_err();
        assert!(matches!(
            err,
            Error::TransportFailure {
                stage: Stage::Control,
                ..
            }
        ));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
        assert!(gw.session(&device()).unwrap().pending().is_none());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_audio_failure_regresses_to_connected() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();
        let control = open_control(&mut gw, 1);

        let op = gw.transport().last_operation().unwrap();
        gw.audio_connected(&device(), op, Err(TransportError::Refused));

        assert_eq!(*log.borrow(), vec![None]);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
        assert!(!control.is_closed());
        // Auto-opened and now unused.
        assert!(gw.session(&device()).unwrap().disconnect_timer.is_some());
    }

    #[test]
    fn test_control_failure_disconnects() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();

        let op = gw.transport().last_operation().unwrap();
        gw.control_connected(&device(), op, Err(TransportError::Timeout(Duration::from_secs(5))));

        assert_eq!(*log.borrow(), vec![None]);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_stale_completion_is_discarded() {
        let mut gw = hsp_gateway();
        let (_log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();

        let (channel, probe) = MockChannel::new(9);
        gw.control_connected(&device(), OperationId(999), Ok(Box::new(channel)));

        assert!(probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::ConnectInProgress);
        assert!(gw.session(&device()).unwrap().control.is_none());
    }

    #[test]
    fn test_cancel_last_waiter_without_control_disconnects() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();
        let id = gw.request_stream(&device(), make()).unwrap();
        let op = gw.transport().last_operation().unwrap();

        assert!(gw.cancel_stream(&device(), id));
        assert!(!gw.cancel_stream(&device(), id));
        assert!(log.borrow().is_empty());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
        assert_eq!(gw.transport().cancelled(), vec![op]);

        // The released connect completes later and is discarded.
        let (channel, probe) = MockChannel::new(1);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));
        assert!(probe.is_closed());
    }

    #[test]
    fn test_cancel_during_audio_detaches_stage() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();
        let id = gw.request_stream(&device(), make()).unwrap();
        let _control = open_control(&mut gw, 1);

        assert!(gw.cancel_stream(&device(), id));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::PlayInProgress);
        let timer = gw.session(&device()).unwrap().disconnect_timer.unwrap();
        assert_eq!(gw.scheduler().delay(timer), Some(Duration::from_secs(3)));

        let audio = open_audio(&mut gw, 2);
        assert!(audio.is_closed());
        assert!(log.borrow().is_empty());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);

        let timer = gw.session(&device()).unwrap().disconnect_timer.unwrap();
        gw.expire(timer);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_request_when_already_playing_completes_later() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();
        let _control = open_control(&mut gw, 1);
        let _audio = open_audio(&mut gw, 2);
        log.borrow_mut().clear();

        gw.request_stream(&device(), make()).unwrap();
        assert!(log.borrow().is_empty());
        gw.expire_all();
        assert_eq!(*log.borrow(), vec![Some(device())]);
    }

    #[test]
    fn test_discovery_without_records_is_not_supported() {
        let mut gw = mock_gateway();
        gw.add_device(device(), None);
        let (log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();

        let op = gw.transport().last_operation().unwrap();
        assert!(matches!(
            gw.transport().calls()[0],
            TransportCall::Discover { service, .. } if service == uuids::HANDSFREE
        ));
        gw.discovery_complete(&device(), op, Ok(vec![]));

        assert_eq!(*log.borrow(), vec![None]);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_discovery_wrong_class_is_not_supported() {
        let mut gw = mock_gateway();
        gw.add_device(device(), None);
        let reply = gw.request(&device(), HeadsetState::Connected, None);
        assert!(reply.is_ok());

        let op = gw.transport().last_operation().unwrap();
        gw.discovery_complete(&device(), op, Ok(vec![ServiceRecord::headset(1, 2)]));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
        assert_eq!(gw.channel(&device()).unwrap(), None);
    }

    #[test]
    fn test_discovery_then_hfp_waits_for_slc() {
        let mut gw = mock_gateway();
        gw.add_device(device(), None);
        gw.request(&device(), HeadsetState::Connected, None).unwrap();

        let op = gw.transport().last_operation().unwrap();
        gw.discovery_complete(&device(), op, Ok(vec![ServiceRecord::handsfree(0x10, 7)]));
        assert!(matches!(
            gw.transport().calls()[1],
            TransportCall::ConnectControl { channel: 7, .. }
        ));

        let _control = open_control(&mut gw, 1);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::ConnectInProgress);
        assert!(gw.session(&device()).unwrap().hfp_active);
    }

    #[test]
    fn test_control_closed_fails_pending() {
        let mut gw = hsp_gateway();
        let (log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();
        let control = open_control(&mut gw, 1);

        gw.control_closed(&device(), ChannelId(42));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::PlayInProgress);

        gw.control_closed(&device(), control.id());
        assert_eq!(*log.borrow(), vec![None]);
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_lock_and_unlock() {
        let mut gw = hsp_gateway();
        let (_log, make) = recorder();
        gw.request_stream(&device(), make()).unwrap();
        let _control = open_control(&mut gw, 1);
        let _audio = open_audio(&mut gw, 2);

        gw.lock(&device(), LockMask::READ).unwrap();
        assert!(matches!(gw.lock(&device(), LockMask::READ), Err(Error::Busy)));
        gw.lock(&device(), LockMask::WRITE).unwrap();
        assert!(matches!(
            gw.unlock(&device(), LockMask::NONE),
            Err(Error::InvalidArgument(_))
        ));

        gw.unlock(&device(), LockMask::READ).unwrap();
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Playing);

        gw.unlock(&device(), LockMask::WRITE).unwrap();
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
        assert!(gw.session(&device()).unwrap().disconnect_timer.is_some());
    }

    #[test]
    fn test_incoming_hsp_connection() {
        let mut gw = hsp_gateway();
        let (channel, probe) = MockChannel::new(5);
        gw.incoming_control(&device(), Box::new(channel), false).unwrap();
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::ConnectInProgress);

        let (again, again_probe) = MockChannel::new(6);
        assert!(matches!(
            gw.incoming_control(&device(), Box::new(again), false),
            Err(Error::AlreadyConnected)
        ));
        assert!(again_probe.is_closed());

        gw.authorize_incoming(&device()).unwrap();
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
        assert!(probe.is_watched());
        assert_eq!(gw.active_device(), Some(device()));

        let (audio, _audio_probe) = MockChannel::new(7);
        gw.incoming_audio(&device(), Box::new(audio)).unwrap();
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Playing);
        let (audio, audio_probe) = MockChannel::new(8);
        assert!(matches!(
            gw.incoming_audio(&device(), Box::new(audio)),
            Err(Error::AlreadyConnected)
        ));
        assert!(audio_probe.is_closed());
    }

    #[test]
    fn test_incoming_hfp_requires_telephony() {
        let mut gw = hsp_gateway();
        let (channel, probe) = MockChannel::new(5);
        gw.incoming_control(&device(), Box::new(channel), true).unwrap();

        assert!(matches!(gw.authorize_incoming(&device()), Err(Error::NotReady)));
        assert!(probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_reject_incoming() {
        let mut gw = hsp_gateway();
        assert!(matches!(gw.reject_incoming(&device()), Err(Error::NotConnected)));

        let (channel, probe) = MockChannel::new(5);
        gw.incoming_control(&device(), Box::new(channel), false).unwrap();
        gw.reject_incoming(&device()).unwrap();
        assert!(probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_incoming_on_disabled_profile() {
        let mut gw = crate::mock::mock_gateway_with(crate::GatewayConfig {
            hsp_enabled: false,
            ..Default::default()
        });
        gw.add_device(device(), None);

        let (channel, probe) = MockChannel::new(5);
        assert!(matches!(
            gw.incoming_control(&device(), Box::new(channel), false),
            Err(Error::NotAvailable)
        ));
        assert!(probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }
}
