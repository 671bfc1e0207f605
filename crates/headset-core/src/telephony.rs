//! Telephony collaborator interface.
//!
//! The gateway drives the backend through [`Telephony`] when the hands-free
//! unit issues a call control command, and the backend drives the gateway
//! through the indication methods on [`Gateway`] (`telephony_ready`,
//! `indicator_event`, `calling_started` and so on).
//!
//! Operations that can change call state receive an [`IndicatorSink`].
//! Indicator updates made through it are held back until the operation
//! returns, so the remote sees every `+CIEV` before the command's `OK` or
//! `ERROR`.

use tracing::{debug, info};

use headset_types::{AgFeatures, DeviceAddress, IndicatorTable, Response};

use crate::ag::AgState;
use crate::error::{Error, Result, TelephonyResult};
use crate::gateway::Gateway;
use crate::scheduler::{Scheduler, TimerKind};
use crate::transport::Transport;

/// A telephony backend.
pub trait Telephony {
    /// Answer the incoming call (`ATA`).
    fn answer_call(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()>;

    /// Hang up or reject the current call (`AT+CHUP`).
    fn terminate_call(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()>;

    /// Dial the last dialed number (`AT+BLDN`).
    fn redial(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()>;

    /// Dial `number` (`ATD<number>;`).
    fn dial(&mut self, number: &str, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()>;

    /// Send a DTMF tone (`AT+VTS`).
    fn transmit_dtmf(&mut self, digit: char) -> TelephonyResult<()>;

    /// The subscriber's own number, if the backend knows it (`AT+CNUM`).
    fn subscriber_number(&mut self) -> TelephonyResult<Option<String>>;

    /// Apply a response-and-hold request (`AT+BTRH=<n>`).
    fn response_and_hold(&mut self, value: i32) -> TelephonyResult<()>;

    /// Enable or disable indicator event reporting.
    fn event_reporting(&mut self, enabled: bool) -> TelephonyResult<()>;
}

/// Indicator updates raised while a telephony operation runs.
pub struct IndicatorSink<'a> {
    ag: &'a mut AgState,
    reporting: bool,
}

impl<'a> IndicatorSink<'a> {
    pub(crate) fn new(ag: &'a mut AgState, reporting: bool) -> Self {
        Self { ag, reporting }
    }

    /// Current indicator table.
    pub fn indicators(&self) -> &IndicatorTable {
        self.ag.indicators()
    }

    /// Set indicator `index` to `value` and queue a `+CIEV` for it.
    ///
    /// Fails if the index or value is out of range. A full event queue
    /// drops the event but keeps the new value.
    pub fn update(&mut self, index: usize, value: i32) -> Result<()> {
        self.ag.indicators_mut().set(index, value)?;
        if self.reporting {
            self.ag.queue_event(index)?;
        }
        Ok(())
    }

    /// Like [`update`](Self::update), addressing the indicator by name.
    pub fn update_named(&mut self, name: &str, value: i32) -> Result<()> {
        let index = self
            .ag
            .indicators()
            .position(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown indicator '{name}'")))?;
        self.update(index, value)
    }
}

impl<T, P, S> Gateway<T, P, S>
where
    T: Transport,
    P: Telephony,
    S: Scheduler,
{
    /// The telephony backend finished initializing.
    pub fn telephony_ready(
        &mut self,
        features: AgFeatures,
        indicators: IndicatorTable,
        response_and_hold: Option<u8>,
    ) {
        self.ag.ready(features, indicators, response_and_hold);
    }

    /// Whether indicator events for the active device go out at all.
    pub(crate) fn indicator_reporting(&self) -> bool {
        let (_, enabled) = self.ag.event_reporting();
        enabled
            && self
                .ag
                .active_device()
                .and_then(|d| self.sessions.get(&d))
                .is_some_and(|hs| hs.hfp_active)
    }

    /// An indicator changed value.
    pub fn indicator_event(&mut self, index: usize, value: i32) -> Result<()> {
        self.ag.indicators_mut().set(index, value)?;

        let device = self.ag.active_device().ok_or(Error::NoActiveDevice)?;
        if !self.session(&device)?.hfp_active {
            return Err(Error::NotAvailable);
        }
        if !self.indicator_reporting() {
            debug!("Indicator {index} changed but event reporting is disabled");
            return Ok(());
        }
        if self.ag.is_buffering() {
            return self.ag.queue_event(index);
        }
        self.send(&device, &Response::IndicatorEvent { index, value })
    }

    /// Response-and-hold state changed. `None` means inactive.
    pub fn response_and_hold_changed(&mut self, value: Option<u8>) -> Result<()> {
        let device = self.ag.active_device().ok_or(Error::NoActiveDevice)?;
        if !self.session(&device)?.hfp_active {
            return Err(Error::NotAvailable);
        }
        self.ag.set_response_and_hold(value);
        match value {
            Some(value) => self.send(&device, &Response::ResponseAndHold(value)),
            None => Ok(()),
        }
    }

    /// An incoming call started ringing.
    pub fn calling_started(&mut self, number: Option<&str>) -> Result<()> {
        let device = self.ag.active_device().ok_or(Error::NoActiveDevice)?;
        if self.session(&device)?.is_ringing() {
            debug!("{device}: already ringing");
            return Err(Error::Busy);
        }
        self.session_mut(&device)?.caller_number = number.map(str::to_owned);
        self.start_ringing(&device)
    }

    /// The incoming call stopped ringing.
    pub fn calling_stopped(&mut self) -> Result<()> {
        let device = self.ag.active_device().ok_or(Error::NoActiveDevice)?;
        if !self.stop_ringing(&device) {
            return Err(Error::InvalidArgument("no call is ringing".into()));
        }
        Ok(())
    }

    /// Send the first ring and arm the repeat timer.
    pub(crate) fn start_ringing(&mut self, device: &DeviceAddress) -> Result<()> {
        self.send_ring(device)?;
        let interval = self.config.ring_interval;
        let timer = self.arm_timer(device, TimerKind::Ring, interval);
        let old = self.session_mut(device)?.ring_timer.replace(timer);
        if let Some(old) = old {
            self.timers.cancel(old);
        }
        info!("{device}: ringing");
        Ok(())
    }

    /// `RING`, followed by the caller id when presentation is enabled.
    pub(crate) fn send_ring(&mut self, device: &DeviceAddress) -> Result<()> {
        self.send(device, &Response::Ring)?;
        let hs = self.session(device)?;
        if hs.caller_id_active
            && let Some(number) = hs.caller_number.clone()
        {
            self.send(device, &Response::caller_id(number))?;
        }
        Ok(())
    }

    /// Cancel the ring timer, returning whether one was armed.
    pub(crate) fn stop_ringing(&mut self, device: &DeviceAddress) -> bool {
        let Some(timer) = self
            .sessions
            .get_mut(device)
            .and_then(|hs| hs.ring_timer.take())
        else {
            return false;
        };
        self.timers.cancel(timer);
        debug!("{device}: ring stopped");
        true
    }
}
