//! Dummy telephony backend.
//!
//! There is no modem behind the daemon. Calls exist only as indicator
//! values: answering, dialing and hanging up move `call` and `callsetup`,
//! and the HTTP API can simulate a network-side incoming call or hangup.

use tracing::{debug, info, warn};

use headset_core::{
    Error, Gateway, IndicatorSink, Result, Scheduler, Telephony, TelephonyError, TelephonyResult,
    Transport,
};
use headset_types::{AgFeatures, IndicatorTable};

use crate::config::TelephonyConfig;

/// `callsetup` value of an incoming call.
pub const CALLSETUP_INCOMING: i32 = 1;
/// `callsetup` value of an outgoing call being dialed.
pub const CALLSETUP_OUTGOING: i32 = 2;

/// Telephony backend that only tracks call indicators.
#[derive(Debug, Clone, Default)]
pub struct DummyTelephony {
    features: AgFeatures,
    response_and_hold: Option<u8>,
    subscriber_number: Option<String>,
    last_dialed: Option<String>,
    event_reporting: bool,
}

impl DummyTelephony {
    pub fn new(config: &TelephonyConfig) -> Self {
        Self {
            features: config.features(),
            response_and_hold: config.response_and_hold,
            subscriber_number: config.subscriber_number.clone(),
            last_dialed: config.last_dialed.clone(),
            event_reporting: false,
        }
    }

    /// Features to advertise once the gateway is told telephony is ready.
    pub fn features(&self) -> AgFeatures {
        self.features
    }

    /// Initial response-and-hold state.
    pub fn initial_response_and_hold(&self) -> Option<u8> {
        self.response_and_hold
    }

    /// Indicator table of a freshly started backend.
    pub fn indicators() -> IndicatorTable {
        IndicatorTable::standard()
    }

    pub fn last_dialed(&self) -> Option<&str> {
        self.last_dialed.as_deref()
    }

    pub fn event_reporting_enabled(&self) -> bool {
        self.event_reporting
    }

    fn set_call(
        sink: &mut IndicatorSink<'_>,
        call: i32,
        callsetup: i32,
    ) -> TelephonyResult<()> {
        for (name, target) in [("call", call), ("callsetup", callsetup)] {
            if value(sink.indicators(), name) == target {
                continue;
            }
            match sink.update_named(name, target) {
                Ok(()) => {}
                // The value is applied; only its +CIEV is lost.
                Err(err @ Error::ResourceExhausted { .. }) => {
                    warn!("'{name}' changed to {target} without notification: {err}");
                }
                Err(err) => return Err(TelephonyError::Other(err.to_string())),
            }
        }
        Ok(())
    }
}

impl Telephony for DummyTelephony {
    fn answer_call(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        if value(sink.indicators(), "callsetup") != CALLSETUP_INCOMING {
            return Err(TelephonyError::NoCall);
        }
        info!("Answering incoming call");
        Self::set_call(sink, 1, 0)
    }

    fn terminate_call(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        if value(sink.indicators(), "call") == 0 && value(sink.indicators(), "callsetup") == 0 {
            return Err(TelephonyError::NoCall);
        }
        info!("Terminating call");
        Self::set_call(sink, 0, 0)
    }

    fn redial(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        let number = self.last_dialed.clone().ok_or(TelephonyError::NoCall)?;
        self.dial(&number, sink)
    }

    fn dial(&mut self, number: &str, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        if value(sink.indicators(), "call") != 0 {
            return Err(TelephonyError::Rejected);
        }
        info!("Dialing {number}");
        self.last_dialed = Some(number.to_owned());
        Self::set_call(sink, 0, CALLSETUP_OUTGOING)
    }

    fn transmit_dtmf(&mut self, digit: char) -> TelephonyResult<()> {
        debug!("DTMF {digit}");
        Ok(())
    }

    fn subscriber_number(&mut self) -> TelephonyResult<Option<String>> {
        Ok(self.subscriber_number.clone())
    }

    fn response_and_hold(&mut self, value: i32) -> TelephonyResult<()> {
        let value = u8::try_from(value)
            .ok()
            .filter(|v| *v <= 2)
            .ok_or(TelephonyError::NotSupported)?;
        debug!("Response and hold set to {value}");
        self.response_and_hold = Some(value);
        Ok(())
    }

    fn event_reporting(&mut self, enabled: bool) -> TelephonyResult<()> {
        debug!("Event reporting {}", if enabled { "enabled" } else { "disabled" });
        self.event_reporting = enabled;
        Ok(())
    }
}

fn value(indicators: &IndicatorTable, name: &str) -> i32 {
    indicators
        .position(name)
        .and_then(|i| indicators.get(i))
        .map_or(0, |ind| ind.value)
}

/// Report an indicator change unless the value is already current.
/// An active HSP headset takes no indicator events, which is not an error.
fn report<T, S>(gw: &mut Gateway<T, DummyTelephony, S>, name: &str, new: i32) -> Result<()>
where
    T: Transport,
    S: Scheduler,
{
    let indicators = gw.ag().indicators();
    let index = indicators
        .position(name)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown indicator '{name}'")))?;
    if value(indicators, name) == new {
        return Ok(());
    }
    match gw.indicator_event(index, new) {
        Ok(()) | Err(Error::NotAvailable) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Simulate a call arriving from the network.
pub fn incoming_call<T, S>(gw: &mut Gateway<T, DummyTelephony, S>, number: Option<&str>) -> Result<()>
where
    T: Transport,
    S: Scheduler,
{
    if gw.active_device().is_none() {
        return Err(Error::NoActiveDevice);
    }
    info!("Incoming call from {}", number.unwrap_or("unknown number"));
    report(gw, "callsetup", CALLSETUP_INCOMING)?;
    gw.calling_started(number)
}

/// Simulate the network side hanging up.
pub fn remote_hangup<T, S>(gw: &mut Gateway<T, DummyTelephony, S>) -> Result<()>
where
    T: Transport,
    S: Scheduler,
{
    if gw.active_device().is_none() {
        return Err(Error::NoActiveDevice);
    }
    info!("Call ended by the network");
    report(gw, "call", 0)?;
    report(gw, "callsetup", 0)?;
    match gw.calling_stopped() {
        Ok(()) | Err(Error::InvalidArgument(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headset_core::mock::{ChannelProbe, MockChannel, MockScheduler, MockTransport};
    use headset_core::{DeviceAddress, GatewayConfig, HeadsetState, ServiceRecord};

    type TestGateway = Gateway<MockTransport, DummyTelephony, MockScheduler>;

    fn device() -> DeviceAddress {
        DeviceAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
    }

    fn gateway(config: TelephonyConfig) -> TestGateway {
        gateway_with(GatewayConfig::default(), config)
    }

    fn gateway_with(gateway: GatewayConfig, config: TelephonyConfig) -> TestGateway {
        let telephony = DummyTelephony::new(&config);
        let features = telephony.features();
        let mut gw = Gateway::new(
            gateway,
            MockTransport::default(),
            telephony,
            MockScheduler::new(),
        );
        gw.telephony_ready(features, DummyTelephony::indicators(), None);
        gw
    }

    /// An HFP headset past service level negotiation.
    fn handsfree(config: TelephonyConfig) -> (TestGateway, ChannelProbe) {
        connect_handsfree(gateway(config))
    }

    fn connect_handsfree(mut gw: TestGateway) -> (TestGateway, ChannelProbe) {
        gw.add_device(device(), Some(ServiceRecord::handsfree(0x10001, 1)));
        let _reply = gw.connect(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();
        let (channel, probe) = MockChannel::new(1);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));
        send(
            &mut gw,
            &probe,
            "AT+BRSF=0\rAT+CIND=?\rAT+CIND?\rAT+CMER=3,0,0,1\r",
        );
        assert_eq!(gw.state(&device()).unwrap(), HeadsetState::Connected);
        (gw, probe)
    }

    fn send(gw: &mut TestGateway, probe: &ChannelProbe, data: &str) -> String {
        gw.control_data(&device(), probe.id(), data.as_bytes())
            .unwrap();
        probe.take_written()
    }

    #[test]
    fn test_incoming_call_answered() {
        let (mut gw, probe) = handsfree(TelephonyConfig::default());

        incoming_call(&mut gw, Some("+15551234")).unwrap();
        let out = probe.take_written();
        assert!(out.starts_with("\r\n+CIEV:3,1\r\n\r\nRING\r\n"));
        assert!(gw.session_info(&device()).unwrap().ringing);

        let out = send(&mut gw, &probe, "ATA\r");
        assert_eq!(out, "\r\n+CIEV:2,1\r\n\r\n+CIEV:3,0\r\n\r\nOK\r\n");
        assert!(gw.telephony().event_reporting_enabled());
    }

    #[test]
    fn test_answer_survives_full_event_buffer() {
        let config = GatewayConfig {
            event_buffer_capacity: 1,
            ..Default::default()
        };
        let (mut gw, probe) =
            connect_handsfree(gateway_with(config, TelephonyConfig::default()));
        incoming_call(&mut gw, None).unwrap();
        probe.take_written();

        // callsetup=0 does not fit in the buffer but the answer stands.
        let out = send(&mut gw, &probe, "ATA\r");
        assert_eq!(out, "\r\n+CIEV:2,1\r\n\r\nOK\r\n");
        let indicators = gw.ag().indicators();
        assert_eq!(value(indicators, "call"), 1);
        assert_eq!(value(indicators, "callsetup"), 0);
    }

    #[test]
    fn test_answer_without_call() {
        let (mut gw, probe) = handsfree(TelephonyConfig::default());
        assert_eq!(send(&mut gw, &probe, "ATA\r"), "\r\nERROR\r\n");
    }

    #[test]
    fn test_dial_and_redial() {
        let (mut gw, probe) = handsfree(TelephonyConfig::default());

        assert_eq!(send(&mut gw, &probe, "AT+BLDN\r"), "\r\nERROR\r\n");

        let out = send(&mut gw, &probe, "ATD5551234;\r");
        assert_eq!(out, "\r\n+CIEV:3,2\r\n\r\nOK\r\n");
        assert_eq!(gw.telephony().last_dialed(), Some("5551234"));

        let out = send(&mut gw, &probe, "AT+CHUP\r");
        assert_eq!(out, "\r\n+CIEV:3,0\r\n\r\nOK\r\n");

        let out = send(&mut gw, &probe, "AT+BLDN\r");
        assert_eq!(out, "\r\n+CIEV:3,2\r\n\r\nOK\r\n");
    }

    #[test]
    fn test_configured_last_dialed() {
        let (mut gw, probe) = handsfree(TelephonyConfig {
            last_dialed: Some("5550000".to_string()),
            ..TelephonyConfig::default()
        });
        let out = send(&mut gw, &probe, "AT+BLDN\r");
        assert_eq!(out, "\r\n+CIEV:3,2\r\n\r\nOK\r\n");
        assert_eq!(gw.telephony().last_dialed(), Some("5550000"));
    }

    #[test]
    fn test_subscriber_number() {
        let (mut gw, probe) = handsfree(TelephonyConfig {
            subscriber_number: Some("+15559876".to_string()),
            ..TelephonyConfig::default()
        });
        let out = send(&mut gw, &probe, "AT+CNUM\r");
        assert_eq!(out, "\r\n+CNUM: ,\"+15559876\",145,,4\r\n\r\nOK\r\n");
    }

    #[test]
    fn test_remote_hangup_stops_ringing() {
        let (mut gw, probe) = handsfree(TelephonyConfig::default());
        incoming_call(&mut gw, None).unwrap();
        probe.take_written();

        remote_hangup(&mut gw).unwrap();
        assert_eq!(probe.take_written(), "\r\n+CIEV:3,0\r\n");
        assert!(!gw.session_info(&device()).unwrap().ringing);

        // Nothing ringing any more; hanging up again is harmless.
        remote_hangup(&mut gw).unwrap();
    }

    #[test]
    fn test_incoming_call_on_headset_profile() {
        let mut gw = gateway(TelephonyConfig::default());
        gw.add_device(device(), Some(ServiceRecord::headset(0x10002, 2)));
        let _reply = gw.connect(&device()).unwrap();
        let op = gw.transport().last_operation().unwrap();
        let (channel, probe) = MockChannel::new(1);
        gw.control_connected(&device(), op, Ok(Box::new(channel)));

        incoming_call(&mut gw, None).unwrap();
        assert_eq!(probe.take_written(), "\r\nRING\r\n");
    }

    #[test]
    fn test_incoming_call_without_headset() {
        let mut gw = gateway(TelephonyConfig::default());
        assert!(matches!(
            incoming_call(&mut gw, None),
            Err(Error::NoActiveDevice)
        ));
    }

    #[test]
    fn test_response_and_hold_range() {
        let mut telephony = DummyTelephony::default();
        assert!(telephony.response_and_hold(1).is_ok());
        assert_eq!(
            telephony.response_and_hold(3),
            Err(TelephonyError::NotSupported)
        );
    }
}
