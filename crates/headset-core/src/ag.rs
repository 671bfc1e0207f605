//! Process-wide audio gateway context.

use tracing::{debug, error};

use headset_types::{AgFeatures, DeviceAddress, IndicatorTable};

use crate::error::Result;
use crate::event_buffer::{EventBuffer, IndicatorEvent};

/// `AT+CMER` mode in effect before the remote configures event reporting.
pub const DEFAULT_EVENT_REPORTING_MODE: i32 = 3;

/// State shared by every session: what telephony supplied at readiness,
/// the remote's event reporting configuration and the active device.
#[derive(Debug)]
pub struct AgState {
    telephony_ready: bool,
    features: AgFeatures,
    indicators: IndicatorTable,
    event_reporting_mode: i32,
    indicator_reporting: bool,
    response_and_hold: Option<u8>,
    buffering: bool,
    events: EventBuffer,
    active: Option<DeviceAddress>,
}

impl AgState {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            telephony_ready: false,
            features: AgFeatures::default(),
            indicators: IndicatorTable::default(),
            event_reporting_mode: DEFAULT_EVENT_REPORTING_MODE,
            indicator_reporting: false,
            response_and_hold: None,
            buffering: false,
            events: EventBuffer::new(event_capacity),
            active: None,
        }
    }

    /// Install what the telephony backend supplies once it is initialized.
    pub fn ready(
        &mut self,
        features: AgFeatures,
        indicators: IndicatorTable,
        response_and_hold: Option<u8>,
    ) {
        self.telephony_ready = true;
        self.features = features;
        self.indicators = indicators;
        self.response_and_hold = response_and_hold;
        debug!("Telephony initialized, AG features: {features}");
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.telephony_ready
    }

    #[must_use]
    pub fn features(&self) -> AgFeatures {
        self.features
    }

    #[must_use]
    pub fn indicators(&self) -> &IndicatorTable {
        &self.indicators
    }

    /// The session telephony notifications are delivered to.
    #[must_use]
    pub fn active_device(&self) -> Option<DeviceAddress> {
        self.active
    }

    #[must_use]
    pub fn response_and_hold(&self) -> Option<u8> {
        self.response_and_hold
    }

    /// `(mode, indicator reporting enabled)` as last set by `AT+CMER`.
    #[must_use]
    pub fn event_reporting(&self) -> (i32, bool) {
        (self.event_reporting_mode, self.indicator_reporting)
    }

    #[must_use]
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    #[must_use]
    pub fn buffered_events(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn indicators_mut(&mut self) -> &mut IndicatorTable {
        &mut self.indicators
    }

    pub(crate) fn set_active(&mut self, device: Option<DeviceAddress>) {
        self.active = device;
    }

    pub(crate) fn set_response_and_hold(&mut self, value: Option<u8>) {
        self.response_and_hold = value;
    }

    pub(crate) fn set_event_reporting(&mut self, mode: i32, indicators: bool) {
        self.event_reporting_mode = mode;
        self.indicator_reporting = indicators;
    }

    pub(crate) fn reset_event_reporting(&mut self) {
        self.set_event_reporting(DEFAULT_EVENT_REPORTING_MODE, false);
    }

    pub(crate) fn begin_buffering(&mut self) {
        self.buffering = true;
    }

    /// Leave buffering mode, returning the queued events oldest first.
    pub(crate) fn end_buffering(&mut self) -> Vec<IndicatorEvent> {
        self.buffering = false;
        self.events.drain().collect()
    }

    /// Queue the current value of indicator `index`.
    pub(crate) fn queue_event(&mut self, index: usize) -> Result<()> {
        let Some(indicator) = self.indicators.get(index) else {
            return Ok(());
        };
        let event = IndicatorEvent {
            index,
            value: indicator.value,
        };
        self.events.push(event).inspect_err(|err| {
            error!("Dropping +CIEV for '{}': {err}", indicator.name);
        })
    }
}

impl Default for AgState {
    fn default() -> Self {
        Self::new(crate::event_buffer::DEFAULT_CAPACITY)
    }
}
