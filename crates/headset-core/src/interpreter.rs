//! AT command interpreter.
//!
//! Bytes from the control channel go through the session's
//! [`LineFramer`](crate::framer::LineFramer); each complete line is parsed
//! into an [`AtCommand`] and executed against the session and the AG state.
//! Commands that are malformed or rejected are answered with `ERROR` and
//! leave the session as it was.

use tracing::{debug, error, warn};

use headset_types::{AgFeatures, DeviceAddress, HeadsetState, MAX_GAIN, Response};
use headset_types::response::number_type;

use crate::error::{Error, Result, TelephonyResult};
use crate::event_buffer::IndicatorEvent;
use crate::events::HeadsetSignal;
use crate::gateway::Gateway;
use crate::commands::AtCommand;
use crate::scheduler::Scheduler;
use crate::telephony::{IndicatorSink, Telephony};
use crate::transport::{ChannelId, Transport};

impl<T, P, S> Gateway<T, P, S>
where
    T: Transport,
    P: Telephony,
    S: Scheduler,
{
    /// Bytes arrived on a control channel.
    ///
    /// Every complete line is executed before this returns. Input that
    /// overflows the line buffer disconnects the session.
    pub fn control_data(
        &mut self,
        device: &DeviceAddress,
        channel: ChannelId,
        data: &[u8],
    ) -> Result<()> {
        let hs = self
            .sessions
            .get_mut(device)
            .ok_or(Error::DeviceNotFound(*device))?;
        if hs.control_id() != Some(channel) {
            debug!("{device}: ignoring {} bytes on {channel}", data.len());
            return Ok(());
        }

        if let Err(err) = hs.framer.push(data) {
            let capacity = hs.framer.capacity();
            error!("{device}: {err}, disconnecting");
            self.finalize(device, Err(Error::ProtocolOverflow { capacity }));
            self.set_state(device, HeadsetState::Disconnected);
            return Err(err);
        }

        // A handler may tear the session down part way through.
        while let Some(hs) = self.sessions.get_mut(device)
            && hs.control.is_some()
            && let Some(line) = hs.framer.next_line()
        {
            self.handle_line(device, &line);
        }
        Ok(())
    }

    fn handle_line(&mut self, device: &DeviceAddress, line: &str) {
        debug!("{device}: received {line:?}");

        let result = AtCommand::parse(line).and_then(|command| self.execute(device, command));
        match result {
            Ok(()) => {}
            Err(err) if err.is_wire_error() => {
                warn!("{device}: {line:?} rejected: {err}");
                // Failure is logged by send.
                let _ = self.send(device, &Response::Error);
            }
            Err(err) => warn!("{device}: error handling {line:?}: {err}"),
        }
    }

    fn execute(&mut self, device: &DeviceAddress, command: AtCommand) -> Result<()> {
        match command {
            AtCommand::Answer => {
                self.buffered(|telephony, sink| telephony.answer_call(sink))?;
                self.stop_ringing(device);
                self.session_mut(device)?.caller_number = None;
            }
            AtCommand::HangUp => {
                self.buffered(|telephony, sink| telephony.terminate_call(sink))?;
                self.emit(*device, HeadsetSignal::CallTerminated);
                self.session_mut(device)?.caller_number = None;
                self.stop_ringing(device);
            }
            AtCommand::Redial => {
                self.buffered(|telephony, sink| telephony.redial(sink))?;
            }
            AtCommand::Dial(number) => {
                self.buffered(|telephony, sink| telephony.dial(&number, sink))?;
            }
            AtCommand::Gain { kind, value } => {
                let gain = u8::try_from(value)
                    .ok()
                    .filter(|g| *g <= MAX_GAIN)
                    .ok_or_else(|| Error::InvalidArgument(format!("{kind} gain {value}")))?;
                if self.session_mut(device)?.set_gain(kind, gain) {
                    self.emit(*device, HeadsetSignal::gain_changed(kind, gain));
                }
            }
            AtCommand::SupportedFeatures(features) => {
                self.session_mut(device)?.hf_features = features;
                debug!("{device}: HF features {features}");
                let ag_features = self.ag.features();
                self.send(device, &Response::SupportedFeatures(ag_features))?;
            }
            AtCommand::IndicatorRanges => {
                let ranges = self.ag.indicators().ranges();
                self.send(device, &Response::Indicators(ranges))?;
            }
            AtCommand::IndicatorValues => {
                let values = self.ag.indicators().values();
                self.send(device, &Response::Indicators(values))?;
            }
            AtCommand::EventReporting { mode, indicators } => {
                let enabled = match indicators {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "indicator reporting {other}"
                        )));
                    }
                };
                self.ag.set_event_reporting(mode, enabled);
                debug!("{device}: event reporting mode={mode}, ind={indicators}");
                if let Err(err) = self.telephony.event_reporting(enabled) {
                    warn!("Telephony refused event reporting change: {err}");
                }
                self.send(device, &Response::Ok)?;

                if self.in_slc_setup(device)
                    && !self.ag.features().contains(AgFeatures::THREE_WAY_CALLING)
                {
                    self.slc_complete(device);
                }
                return Ok(());
            }
            AtCommand::CallHold => {
                self.send(device, &Response::CallHoldOptions)?;
                self.send(device, &Response::Ok)?;
                if self.in_slc_setup(device) {
                    self.slc_complete(device);
                }
                return Ok(());
            }
            AtCommand::KeyPress => {
                self.emit(*device, HeadsetSignal::AnswerRequested);
                self.stop_ringing(device);
            }
            AtCommand::CallerId(enabled) => {
                self.session_mut(device)?.caller_id_active = enabled;
            }
            AtCommand::ResponseAndHoldQuery => {
                if let Some(value) = self.ag.response_and_hold() {
                    self.send(device, &Response::ResponseAndHold(value))?;
                }
            }
            AtCommand::ResponseAndHold(value) => {
                self.telephony.response_and_hold(value)?;
            }
            AtCommand::Dtmf(tone) => {
                self.telephony.transmit_dtmf(tone)?;
            }
            AtCommand::SubscriberNumber => {
                if let Some(number) = self.telephony.subscriber_number()? {
                    let number_type = number_type(&number);
                    self.send(
                        device,
                        &Response::SubscriberNumber {
                            number,
                            number_type,
                        },
                    )?;
                }
            }
        }

        self.send(device, &Response::Ok)
    }

    fn in_slc_setup(&self, device: &DeviceAddress) -> bool {
        self.sessions
            .get(device)
            .is_some_and(|hs| hs.state == HeadsetState::ConnectInProgress)
    }

    fn slc_complete(&mut self, device: &DeviceAddress) {
        debug!("{device}: HFP service level connection established");
        self.control_established(device);
    }

    /// Run a telephony operation with indicator events held back, then
    /// report them ahead of the operation's own result.
    fn buffered<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut P, &mut IndicatorSink<'_>) -> TelephonyResult<()>,
    {
        let reporting = self.indicator_reporting();
        self.ag.begin_buffering();
        let result = {
            let mut sink = IndicatorSink::new(&mut self.ag, reporting);
            op(&mut self.telephony, &mut sink)
        };
        let events = self.ag.end_buffering();
        self.flush_events(events);
        result.map_err(Error::from)
    }

    fn flush_events(&mut self, events: Vec<IndicatorEvent>) {
        if events.is_empty() {
            return;
        }
        let Some(active) = self.ag.active_device() else {
            warn!("Dropping {} indicator events, no active headset", events.len());
            return;
        };
        for IndicatorEvent { index, value } in events {
            if self
                .send(&active, &Response::IndicatorEvent { index, value })
                .is_err()
            {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelephonyError;
    use crate::mock::{ChannelProbe, MockChannel, MockGateway, TelephonyCall, mock_gateway};
    use crate::transport::ServiceRecord;
    use headset_types::{GainKind, IndicatorTable};

    fn device() -> DeviceAddress {
        DeviceAddress::new([0x00, 0x0D, 0x3C, 0x11, 0x22, 0x33])
    }

    /// An HFP session with the control channel open, before SLC.
    fn hfp_session(features: AgFeatures) -> (MockGateway, ChannelProbe) {
        let mut gw = mock_gateway();
        gw.telephony_ready(features, IndicatorTable::standard(), None);
        gw.add_device(device(), Some(ServiceRecord::handsfree(0x10001, 1)));
        let _reply = gw.connect(&device()).unwrap();

        let op = gw.transport().last_operation().unwrap();
        let (channel, probe) = MockChannel::new(1);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));
        (gw, probe)
    }

    fn feed(gw: &mut MockGateway, probe: &ChannelProbe, data: &str) -> String {
        gw.control_data(&device(), probe.id(), data.as_bytes()).unwrap();
        probe.take_written()
    }

    fn slc(gw: &mut MockGateway, probe: &ChannelProbe) {
        feed(gw, probe, "AT+BRSF=0\rAT+CIND=?\rAT+CIND?\rAT+CMER=3,0,0,1\r");
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
    }

    #[test]
    fn test_brsf_exchange() {
        let (mut gw, probe) = hfp_session(AgFeatures::from_bits(0x20));
        let out = feed(&mut gw, &probe, "AT+BRSF=20\r");
        assert_eq!(out, "\r\n+BRSF=32\r\n\r\nOK\r\n");
        assert_eq!(gw.hf_features(&device()).unwrap().bits(), 20);
    }

    #[test]
    fn test_indicator_queries() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        let out = feed(&mut gw, &probe, "AT+CIND=?\r");
        assert!(out.starts_with("\r\n+CIND:(\"service\",(0,1)),(\"call\",(0,1))"));
        assert!(out.ends_with("\r\nOK\r\n"));

        let out = feed(&mut gw, &probe, "AT+CIND?\r");
        assert_eq!(out, "\r\n+CIND:1,0,0,0,5,0,5\r\n\r\nOK\r\n");
    }

    #[test]
    fn test_cmer_completes_slc_without_three_way() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        let mut signals = gw.subscribe();

        let out = feed(&mut gw, &probe, "AT+CMER=3,0,0,1\r");
        assert_eq!(out, "\r\nOK\r\n");
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
        assert_eq!(gw.ag().event_reporting(), (3, true));
        assert_eq!(gw.telephony().event_reporting_calls(), vec![true]);
        assert_eq!(signals.try_recv().unwrap().signal, HeadsetSignal::Connected);
    }

    #[test]
    fn test_three_way_waits_for_chld() {
        let (mut gw, probe) = hfp_session(AgFeatures::THREE_WAY_CALLING);
        feed(&mut gw, &probe, "AT+CMER=3,0,0,1\r");
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::ConnectInProgress);

        let out = feed(&mut gw, &probe, "AT+CHLD=?\r");
        assert_eq!(out, "\r\n+CHLD:(0,1,1x,2,2x,3,4)\r\n\r\nOK\r\n");
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
    }

    #[test]
    fn test_cmer_rejects_bad_indicator_flag() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        let out = feed(&mut gw, &probe, "AT+CMER=3,0,0,2\r");
        assert_eq!(out, "\r\nERROR\r\n");
        assert_eq!(gw.ag().event_reporting(), (3, false));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::ConnectInProgress);
    }

    #[test]
    fn test_unknown_and_malformed_lines() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        assert_eq!(feed(&mut gw, &probe, "AT+FOO\r"), "\r\nERROR\r\n");
        assert_eq!(feed(&mut gw, &probe, "AT+VGS=x\r"), "\r\nERROR\r\n");
        assert_eq!(feed(&mut gw, &probe, "AT+VGS=16\r"), "\r\nERROR\r\n");
        assert_eq!(gw.session(&device()).unwrap().gain(GainKind::Speaker), None);
        assert!(gw.is_active(&device()).unwrap());
    }

    #[test]
    fn test_gain_notification_signals_change_once() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        let mut signals = gw.subscribe();

        assert_eq!(feed(&mut gw, &probe, "AT+VGS=9\r"), "\r\nOK\r\n");
        assert_eq!(feed(&mut gw, &probe, "AT+VGS=9\r"), "\r\nOK\r\n");
        assert_eq!(feed(&mut gw, &probe, "AT+VGM=3\r"), "\r\nOK\r\n");

        assert_eq!(
            signals.try_recv().unwrap().signal,
            HeadsetSignal::SpeakerGainChanged { gain: 9 }
        );
        assert_eq!(
            signals.try_recv().unwrap().signal,
            HeadsetSignal::MicrophoneGainChanged { gain: 3 }
        );
        assert!(signals.try_recv().is_err());
    }

    #[test]
    fn test_partial_lines_are_buffered() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        assert_eq!(feed(&mut gw, &probe, "AT+BR"), "");
        assert_eq!(feed(&mut gw, &probe, "SF=0\rAT+CI"), "\r\n+BRSF=0\r\n\r\nOK\r\n");
        assert_eq!(feed(&mut gw, &probe, "ND?\r"), "\r\n+CIND:1,0,0,0,5,0,5\r\n\r\nOK\r\n");
    }

    #[test]
    fn test_overflow_disconnects() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        let junk = vec![b'A'; 1100];
        let err = gw.control_data(&device(), probe.id(), &junk).unwrap_err();

        assert!(matches!(err, Error::ProtocolOverflow { capacity: 1024 }));
        assert!(probe.is_closed());
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Disconnected);
    }

    #[test]
    fn test_answer_flushes_events_before_ok() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        gw.telephony_mut().set_updates(vec![(1, 1), (2, 0)]);

        let out = feed(&mut gw, &probe, "ATA\r");
        assert_eq!(out, "\r\n+CIEV:2,1\r\n\r\n+CIEV:3,0\r\n\r\nOK\r\n");
        assert!(!gw.ag().is_buffering());
        assert_eq!(gw.telephony().calls().last(), Some(&TelephonyCall::AnswerCall));
    }

    #[test]
    fn test_failed_dial_flushes_then_errors() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        gw.telephony_mut().set_updates(vec![(2, 2)]);
        gw.telephony_mut().set_failure(Some(TelephonyError::Rejected));

        let out = feed(&mut gw, &probe, "ATD5551234;\r");
        assert_eq!(out, "\r\n+CIEV:3,2\r\n\r\nERROR\r\n");
        assert!(!gw.ag().is_buffering());
        assert_eq!(gw.ag().buffered_events(), 0);
        assert_eq!(
            gw.telephony().calls().last(),
            Some(&TelephonyCall::Dial("5551234".into()))
        );
    }

    #[test]
    fn test_event_buffer_overflow_is_not_fatal() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        gw.telephony_mut()
            .set_updates(vec![(1, 1), (2, 1), (2, 2), (2, 3), (1, 0)]);

        let out = feed(&mut gw, &probe, "AT+BLDN\r");
        // The fifth update fails inside the backend, which reports an error.
        assert!(out.starts_with("\r\n+CIEV:2,1\r\n\r\n+CIEV:3,1\r\n\r\n+CIEV:3,2\r\n\r\n+CIEV:3,3\r\n"));
        assert!(out.ends_with("\r\nERROR\r\n"));
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
    }

    #[test]
    fn test_hangup_signals_and_stops_ring() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        gw.calling_started(Some("5551234")).unwrap();
        probe.take_written();
        let mut signals = gw.subscribe();

        assert_eq!(feed(&mut gw, &probe, "AT+CHUP\r"), "\r\nOK\r\n");
        assert_eq!(
            signals.try_recv().unwrap().signal,
            HeadsetSignal::CallTerminated
        );
        assert!(!gw.session(&device()).unwrap().is_ringing());
        assert_eq!(gw.armed_timers(), 0);
    }

    #[test]
    fn test_button_press_requests_answer() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        let mut signals = gw.subscribe();

        assert_eq!(feed(&mut gw, &probe, "AT+CKPD=200\r"), "\r\nOK\r\n");
        assert_eq!(
            signals.try_recv().unwrap().signal,
            HeadsetSignal::AnswerRequested
        );
    }

    #[test]
    fn test_caller_id_toggle() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        feed(&mut gw, &probe, "AT+CLIP=1\r");
        gw.calling_started(Some("5551234")).unwrap();
        assert_eq!(probe.take_written(), "\r\nRING\r\n\r\n+CLIP:\"5551234\",129\r\n");
    }

    #[test]
    fn test_response_and_hold() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);
        assert_eq!(feed(&mut gw, &probe, "AT+BTRH?\r"), "\r\nOK\r\n");

        gw.response_and_hold_changed(Some(0)).unwrap();
        probe.take_written();
        assert_eq!(feed(&mut gw, &probe, "AT+BTRH?\r"), "\r\n+BTRH:0\r\n\r\nOK\r\n");

        assert_eq!(feed(&mut gw, &probe, "AT+BTRH=1\r"), "\r\nOK\r\n");
        assert_eq!(
            gw.telephony().calls().last(),
            Some(&TelephonyCall::ResponseAndHold(1))
        );
    }

    #[test]
    fn test_dtmf_and_subscriber_number() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        slc(&mut gw, &probe);

        assert_eq!(feed(&mut gw, &probe, "AT+VTS=5\r"), "\r\nOK\r\n");
        assert_eq!(feed(&mut gw, &probe, "AT+VTS=x\r"), "\r\nERROR\r\n");
        assert_eq!(gw.telephony().calls().last(), Some(&TelephonyCall::Dtmf('5')));

        assert_eq!(feed(&mut gw, &probe, "AT+CNUM\r"), "\r\nOK\r\n");
        gw.telephony_mut().set_subscriber_number(Some("+4912345"));
        assert_eq!(
            feed(&mut gw, &probe, "AT+CNUM\r"),
            "\r\n+CNUM: ,\"+4912345\",145,,4\r\n\r\nOK\r\n"
        );
    }

    #[test]
    fn test_data_on_other_channel_is_ignored() {
        let (mut gw, probe) = hfp_session(AgFeatures::default());
        gw.control_data(&device(), ChannelId(77), b"AT+CIND?\r").unwrap();
        assert_eq!(probe.take_written(), "");
    }
}
