//! Control surface.
//!
//! The per-device methods a management client calls. Validation failures
//! are returned synchronously and never change state. Requests that need
//! an asynchronous stage return a [`PendingReply`] that resolves once the
//! requested state is reached or the attempt fails.

use tokio::sync::oneshot;
use tracing::{debug, info};

use headset_types::{DeviceAddress, GainKind, HeadsetState, MAX_GAIN, Response, ScoRouting};

use crate::error::{Error, Result};
use crate::events::HeadsetSignal;
use crate::gateway::Gateway;
use crate::pending::PendingReply;
use crate::scheduler::Scheduler;
use crate::telephony::Telephony;
use crate::transport::Transport;

impl<T, P, S> Gateway<T, P, S>
where
    T: Transport,
    P: Telephony,
    S: Scheduler,
{
    /// Open the control channel of `device`.
    ///
    /// The reply resolves when the session is Connected, which for HFP
    /// means after service level connection setup.
    pub fn connect(&mut self, device: &DeviceAddress) -> Result<PendingReply> {
        let hs = self.session(device)?;
        match hs.state {
            HeadsetState::ConnectInProgress => return Err(Error::AlreadyInProgress),
            state if state > HeadsetState::ConnectInProgress => {
                return Err(Error::AlreadyConnected);
            }
            _ => {}
        }
        if hs.hfp_handle.is_some() && !self.ag.is_ready() {
            return Err(Error::NotReady);
        }

        self.request(device, HeadsetState::Connected, None)?;

        let (tx, rx) = oneshot::channel();
        let hs = self.session_mut(device)?;
        hs.auto_disconnect = false;
        if let Some(pending) = hs.pending.as_mut() {
            pending.set_reply(HeadsetState::Connected, tx);
        }
        info!("{device}: connect requested");
        Ok(rx)
    }

    /// Tear the session down.
    pub fn disconnect(&mut self, device: &DeviceAddress) -> Result<()> {
        if self.session(device)?.state == HeadsetState::Disconnected {
            return Err(Error::NotConnected);
        }
        self.finalize(device, Err(Error::Cancelled));
        self.set_state(device, HeadsetState::Disconnected);
        Ok(())
    }

    /// Whether the control channel is up.
    pub fn is_connected(&self, device: &DeviceAddress) -> Result<bool> {
        Ok(self.session(device)?.state >= HeadsetState::Connected)
    }

    /// Start alerting the headset about an incoming call.
    pub fn indicate_call(&mut self, device: &DeviceAddress) -> Result<()> {
        let hs = self.session(device)?;
        if hs.state < HeadsetState::Connected {
            return Err(Error::NotConnected);
        }
        if hs.is_ringing() {
            debug!("{device}: already ringing");
            return Ok(());
        }
        self.start_ringing(device)
    }

    /// Stop alerting the headset.
    pub fn cancel_call(&mut self, device: &DeviceAddress) -> Result<()> {
        if self.session(device)?.state < HeadsetState::Connected {
            return Err(Error::NotConnected);
        }
        if !self.stop_ringing(device) {
            debug!("{device}: cancel_call with no ring active");
        }
        Ok(())
    }

    /// Open the audio channel of a Connected session.
    ///
    /// Refused while audio is routed over HCI, since an audio consumer is
    /// then expected to open the channel through a stream request.
    pub fn play(&mut self, device: &DeviceAddress) -> Result<PendingReply> {
        if self.config.sco_routing == ScoRouting::Hci {
            return Err(Error::NotAvailable);
        }
        match self.session(device)?.state {
            HeadsetState::Disconnected | HeadsetState::ConnectInProgress => {
                return Err(Error::NotConnected);
            }
            HeadsetState::PlayInProgress => return Err(Error::AlreadyInProgress),
            HeadsetState::Playing => return Err(Error::AlreadyConnected),
            HeadsetState::Connected => {}
        }

        self.request(device, HeadsetState::Playing, None)?;

        let (tx, rx) = oneshot::channel();
        if let Some(pending) = self.session_mut(device)?.pending.as_mut() {
            pending.set_reply(HeadsetState::Playing, tx);
        }
        Ok(rx)
    }

    /// Close the audio channel, keeping the control channel.
    pub fn stop(&mut self, device: &DeviceAddress) -> Result<()> {
        if self.session(device)?.state < HeadsetState::PlayInProgress {
            return Err(Error::NotConnected);
        }
        self.finalize(device, Err(Error::Cancelled));
        self.set_state(device, HeadsetState::Connected);
        Ok(())
    }

    pub fn is_playing(&self, device: &DeviceAddress) -> Result<bool> {
        Ok(self.session(device)?.state == HeadsetState::Playing)
    }

    pub fn speaker_gain(&self, device: &DeviceAddress) -> Result<u8> {
        self.gain(device, GainKind::Speaker)
    }

    pub fn microphone_gain(&self, device: &DeviceAddress) -> Result<u8> {
        self.gain(device, GainKind::Microphone)
    }

    /// Last gain reported by or sent to the headset. Only available while
    /// connected.
    pub fn gain(&self, device: &DeviceAddress, kind: GainKind) -> Result<u8> {
        let hs = self.session(device)?;
        if hs.state < HeadsetState::Connected {
            return Err(Error::NotAvailable);
        }
        hs.gain(kind).ok_or(Error::NotAvailable)
    }

    pub fn set_speaker_gain(&mut self, device: &DeviceAddress, gain: u32) -> Result<()> {
        self.set_gain(device, GainKind::Speaker, gain)
    }

    pub fn set_microphone_gain(&mut self, device: &DeviceAddress, gain: u32) -> Result<()> {
        self.set_gain(device, GainKind::Microphone, gain)
    }

    /// Store a new gain. While Playing it is sent to the headset at once,
    /// otherwise on the next transition to Playing.
    pub fn set_gain(&mut self, device: &DeviceAddress, kind: GainKind, gain: u32) -> Result<()> {
        let hs = self.session(device)?;
        if hs.state < HeadsetState::Connected {
            return Err(Error::NotConnected);
        }
        let value = u8::try_from(gain)
            .ok()
            .filter(|g| *g <= MAX_GAIN)
            .ok_or_else(|| Error::InvalidArgument(format!("{kind} gain {gain} exceeds {MAX_GAIN}")))?;

        if hs.state == HeadsetState::Playing {
            self.send(device, &Response::Gain { kind, value })?;
        }
        if self.session_mut(device)?.set_gain(kind, value) {
            self.emit(*device, HeadsetSignal::gain_changed(kind, value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayConfig;
    use crate::error::{Stage, TransportError};
    use crate::mock::{ChannelProbe, MockChannel, MockGateway, mock_gateway, mock_gateway_with};
    use crate::transport::ServiceRecord;

    fn device() -> DeviceAddress {
        DeviceAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60])
    }

    fn pcm_gateway() -> MockGateway {
        mock_gateway_with(GatewayConfig {
            sco_routing: ScoRouting::Pcm,
            ..GatewayConfig::default()
        })
    }

    /// Bring an HSP session to Connected through `connect`.
    fn connected(gw: &mut MockGateway) -> ChannelProbe {
        gw.add_device(device(), Some(ServiceRecord::headset(0x10002, 3)));
        let mut reply = gw.connect(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();
        let (channel, probe) = MockChannel::new(1);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));
        assert!(matches!(reply.try_recv(), Ok(Ok(()))));
        probe
    }

    #[test]
    fn test_connect_validation() {
        let mut gw = mock_gateway();
        assert!(matches!(
            gw.connect(&device()),
            Err(Error::DeviceNotFound(_))
        ));

        gw.add_device(device(), Some(ServiceRecord::handsfree(0x10001, 1)));
        assert!(matches!(gw.connect(&device()), Err(Error::NotReady)));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
        assert!(gw.transport().calls().is_empty());
    }

    #[test]
    fn test_connect_twice() {
        let mut gw = mock_gateway();
        gw.add_device(device(), Some(ServiceRecord::headset(0x10002, 3)));
        let _reply = gw.connect(&device()).unwrap();
        assert!(matches!(
            gw.connect(&device()),
            Err(Error::AlreadyInProgress)
        ));

        let op = gw.transport().last_operation().unwrap();
        let (channel, _probe) = MockChannel::new(1);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));
        assert!(matches!(
            gw.connect(&device()),
            Err(Error::AlreadyConnected)
        ));
    }

    #[test]
    fn test_connect_failure_reaches_caller() {
        let mut gw = mock_gateway();
        gw.add_device(device(), Some(ServiceRecord::headset(0x10002, 3)));
        let mut reply = gw.connect(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();

        gw.control_connected(&device(), op, Err(TransportError::Refused));
        assert!(matches!(
            reply.try_recv(),
            Ok(Err(Error::TransportFailure {
                stage: Stage::Control,
                ..
            }))
        ));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_disconnect() {
        let mut gw = mock_gateway();
        let probe = connected(&mut gw);
        assert!(gw.is_connected(&device()).unwrap());

        gw.disconnect(&device()).unwrap();
        assert!(probe.is_closed());
        assert!(!gw.is_connected(&device()).unwrap());
        assert!(matches!(
            gw.disconnect(&device()),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_during_connect_notifies_caller() {
        let mut gw = mock_gateway();
        gw.add_device(device(), Some(ServiceRecord::headset(0x10002, 3)));
        let mut reply = gw.connect(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();

        gw.disconnect(&device()).unwrap();
        assert!(matches!(reply.try_recv(), Ok(Err(Error::Cancelled))));
        assert!(gw.transport().cancelled().contains(&op));
    }

    #[test]
    fn test_indicate_and_cancel_call() {
        let mut gw = mock_gateway();
        gw.add_device(device(), None);
        assert!(matches!(
            gw.indicate_call(&device()),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            gw.cancel_call(&device()),
            Err(Error::NotConnected)
        ));

        let probe = connected(&mut gw);
        gw.indicate_call(&device()).unwrap();
        gw.indicate_call(&device()).unwrap();
        assert_eq!(probe.take_written(), "\r\nRING\r\n");
        assert_eq!(gw.armed_timers(), 1);

        gw.expire_all();
        assert_eq!(probe.take_written(), "\r\nRING\r\n");

        gw.cancel_call(&device()).unwrap();
        assert_eq!(gw.armed_timers(), 0);
        gw.cancel_call(&device()).unwrap();
    }

    #[test]
    fn test_play_refused_over_hci() {
        let mut gw = mock_gateway();
        assert!(matches!(gw.play(&device()), Err(Error::NotAvailable)));
        connected(&mut gw);
        assert!(matches!(gw.play(&device()), Err(Error::NotAvailable)));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
    }

    #[test]
    fn test_play_and_stop() {
        let mut gw = pcm_gateway();
        gw.add_device(device(), None);
        assert!(matches!(gw.play(&device()), Err(Error::NotConnected)));

        let _probe = connected(&mut gw);
        let mut reply = gw.play(&device()).unwrap();
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::PlayInProgress);
        assert!(matches!(
            gw.play(&device()),
            Err(Error::AlreadyInProgress)
        ));

        let op = gw.transport().last_operation().unwrap();
        let (audio, audio_probe) = MockChannel::new(2);
        gw.audio_connected(&device(), op, Ok(Box::new(audio)));
        assert!(matches!(reply.try_recv(), Ok(Ok(()))));
        assert!(gw.is_playing(&device()).unwrap());
        assert!(audio_probe.is_watched());
        assert!(matches!(
            gw.play(&device()),
            Err(Error::AlreadyConnected)
        ));

        gw.stop(&device()).unwrap();
        assert!(audio_probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
        assert!(matches!(gw.stop(&device()), Err(Error::NotConnected)));
    }

    #[test]
    fn test_stop_while_audio_connecting() {
        let mut gw = pcm_gateway();
        connected(&mut gw);
        let mut reply = gw.play(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();

        gw.stop(&device()).unwrap();
        assert!(matches!(reply.try_recv(), Ok(Err(Error::Cancelled))));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);

        // The released connect still completes; its channel is dropped.
        let (audio, audio_probe) = MockChannel::new(2);
        gw.audio_connected(&device(), op, Ok(Box::new(audio)));
        assert!(audio_probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
    }

    #[test]
    fn test_gain_round_trip() {
        let mut gw = mock_gateway();
        gw.add_device(device(), None);
        assert!(matches!(
            gw.set_speaker_gain(&device(), 7),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            gw.speaker_gain(&device()),
            Err(Error::NotAvailable)
        ));

        let probe = connected(&mut gw);
        assert!(matches!(
            gw.speaker_gain(&device()),
            Err(Error::NotAvailable)
        ));

        let mut signals = gw.subscribe();
        gw.set_speaker_gain(&device(), 7).unwrap();
        gw.set_microphone_gain(&device(), 12).unwrap();
        assert_eq!(gw.speaker_gain(&device()).unwrap(), 7);
        assert_eq!(gw.microphone_gain(&device()).unwrap(), 12);
        // Not sent until audio is up.
        assert_eq!(probe.take_written(), "");

        assert!(matches!(
            gw.set_speaker_gain(&device(), 16),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(gw.speaker_gain(&device()).unwrap(), 7);

        assert_eq!(
            signals.try_recv().unwrap().signal,
            HeadsetSignal::SpeakerGainChanged { gain: 7 }
        );
        assert_eq!(
            signals.try_recv().unwrap().signal,
            HeadsetSignal::MicrophoneGainChanged { gain: 12 }
        );
    }

    #[test]
    fn test_gains_synced_when_playing() {
        let mut gw = pcm_gateway();
        let probe = connected(&mut gw);
        gw.set_speaker_gain(&device(), 5).unwrap();

        let _reply = gw.play(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();
        let (audio, _audio_probe) = MockChannel::new(2);
        gw.audio_connected(&device(), op, Ok(Box::new(audio)));
        assert_eq!(probe.take_written(), "\r\n+VGS=5\r\n");

        gw.set_microphone_gain(&device(), 9).unwrap();
        assert_eq!(probe.take_written(), "\r\n+VGM=9\r\n");
    }
}
