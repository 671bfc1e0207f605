//! Mock collaborators for testing.
//!
//! This module provides in-memory implementations of [`Transport`],
//! [`Channel`], [`Telephony`] and [`Scheduler`] so a [`Gateway`] can be
//! driven without sockets, timers or a telephony stack.
//!
//! # Features
//!
//! - **Call recording**: every collaborator call is logged for assertions
//! - **Failure injection**: make the next transport operation, channel write
//!   or telephony request fail
//! - **Indicator scripting**: have telephony operations raise indicator
//!   changes while they run
//!
//! # Example
//!
//! ```
//! use headset_core::mock::{MockChannel, mock_gateway};
//! use headset_core::{ServiceRecord, HeadsetState};
//! use headset_types::DeviceAddress;
//!
//! let mut gw = mock_gateway();
//! let device: DeviceAddress = "00:11:22:33:44:55".parse().unwrap();
//! gw.add_device(device, Some(ServiceRecord::headset(0x10001, 2)));
//!
//! let reply = gw.connect(&device).unwrap();
//! let op = gw.transport().last_operation().unwrap();
//! let (channel, _probe) = MockChannel::new(1);
//! gw.control_connected(&device, op, Ok(Box::new(channel)));
//!
//! assert_eq!(gw.state(&device).unwrap(), HeadsetState::Connected);
//! drop(reply);
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use uuid::Uuid;

use headset_types::DeviceAddress;

use crate::error::{TelephonyError, TelephonyResult, TransportError};
use crate::gateway::{Gateway, GatewayConfig};
use crate::scheduler::{Scheduler, TimerId};
use crate::telephony::{IndicatorSink, Telephony};
use crate::transport::{Channel, ChannelId, OperationId, Transport};

/// A gateway wired to mock collaborators.
pub type MockGateway = Gateway<MockTransport, MockTelephony, MockScheduler>;

/// A [`MockGateway`] with the default configuration.
pub fn mock_gateway() -> MockGateway {
    mock_gateway_with(GatewayConfig::default())
}

/// A [`MockGateway`] with `config`.
pub fn mock_gateway_with(config: GatewayConfig) -> MockGateway {
    Gateway::new(
        config,
        MockTransport::default(),
        MockTelephony::default(),
        MockScheduler::new(),
    )
}

impl Gateway<MockTransport, MockTelephony, MockScheduler> {
    /// Expire a timer the way the reactor would.
    pub fn expire(&mut self, id: TimerId) {
        self.scheduler_mut().armed.remove(&id);
        self.timer_fired(id);
    }

    /// Expire every timer that is currently armed, oldest first.
    pub fn expire_all(&mut self) {
        let ids: Vec<_> = self.scheduler().armed().into_iter().map(|(id, _)| id).collect();
        for id in ids {
            self.expire(id);
        }
    }
}

// --- Transport ---

/// A transport call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Discover {
        op: OperationId,
        remote: DeviceAddress,
        service: Uuid,
    },
    ConnectControl {
        op: OperationId,
        remote: DeviceAddress,
        channel: u8,
    },
    ConnectAudio {
        op: OperationId,
        remote: DeviceAddress,
    },
    Cancel(OperationId),
}

impl TransportCall {
    /// The operation the call concerns.
    pub fn operation(&self) -> OperationId {
        match self {
            TransportCall::Discover { op, .. }
            | TransportCall::ConnectControl { op, .. }
            | TransportCall::ConnectAudio { op, .. }
            | TransportCall::Cancel(op) => *op,
        }
    }
}

/// Records transport operations and never completes them on its own.
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Vec<TransportCall>,
    fail_next: Option<TransportError>,
}

impl MockTransport {
    /// Every call made so far.
    pub fn calls(&self) -> &[TransportCall] {
        &self.calls
    }

    /// Operation of the most recently started discovery or connect.
    pub fn last_operation(&self) -> Option<OperationId> {
        self.calls
            .iter()
            .rev()
            .find(|c| !matches!(c, TransportCall::Cancel(_)))
            .map(TransportCall::operation)
    }

    /// Operations that were cancelled.
    pub fn cancelled(&self) -> Vec<OperationId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Cancel(op) => Some(*op),
                _ => None,
            })
            .collect()
    }

    /// Make the next discovery or connect fail immediately.
    pub fn fail_next(&mut self, error: TransportError) {
        self.fail_next = Some(error);
    }

    fn start(&mut self, call: TransportCall) -> Result<(), TransportError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        self.calls.push(call);
        Ok(())
    }
}

impl Transport for MockTransport {
    fn discover(
        &mut self,
        op: OperationId,
        _local: DeviceAddress,
        remote: DeviceAddress,
        service: Uuid,
    ) -> Result<(), TransportError> {
        self.start(TransportCall::Discover {
            op,
            remote,
            service,
        })
    }

    fn connect_control(
        &mut self,
        op: OperationId,
        _local: DeviceAddress,
        remote: DeviceAddress,
        channel: u8,
    ) -> Result<(), TransportError> {
        self.start(TransportCall::ConnectControl {
            op,
            remote,
            channel,
        })
    }

    fn connect_audio(
        &mut self,
        op: OperationId,
        _local: DeviceAddress,
        remote: DeviceAddress,
    ) -> Result<(), TransportError> {
        self.start(TransportCall::ConnectAudio { op, remote })
    }

    fn cancel(&mut self, op: OperationId) {
        self.calls.push(TransportCall::Cancel(op));
    }
}

// --- Channel ---

#[derive(Debug, Default)]
struct ChannelState {
    written: Vec<u8>,
    fail_writes: bool,
    closed: bool,
    watched: bool,
}

/// An in-memory channel. Its [`ChannelProbe`] observes what the gateway
/// does with it after ownership has moved into a session.
#[derive(Debug)]
pub struct MockChannel {
    id: ChannelId,
    state: Rc<RefCell<ChannelState>>,
}

impl MockChannel {
    pub fn new(id: u64) -> (MockChannel, ChannelProbe) {
        let state = Rc::new(RefCell::new(ChannelState::default()));
        let probe = ChannelProbe {
            id: ChannelId(id),
            state: Rc::clone(&state),
        };
        (
            MockChannel {
                id: ChannelId(id),
                state,
            },
            probe,
        )
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected failure"));
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn watch(&mut self) {
        self.state.borrow_mut().watched = true;
    }

    fn close(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}

/// Observer half of a [`MockChannel`].
#[derive(Debug, Clone)]
pub struct ChannelProbe {
    id: ChannelId,
    state: Rc<RefCell<ChannelState>>,
}

impl ChannelProbe {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Everything written so far, lossily decoded.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().written).into_owned()
    }

    /// Everything written since the last call, clearing the log.
    pub fn take_written(&self) -> String {
        let bytes = std::mem::take(&mut self.state.borrow_mut().written);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn is_watched(&self) -> bool {
        self.state.borrow().watched
    }
}

// --- Telephony ---

/// A telephony request recorded by [`MockTelephony`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyCall {
    AnswerCall,
    TerminateCall,
    Redial,
    Dial(String),
    Dtmf(char),
    SubscriberNumber,
    ResponseAndHold(i32),
    EventReporting(bool),
}

/// Scripted telephony backend.
#[derive(Debug, Default)]
pub struct MockTelephony {
    calls: Vec<TelephonyCall>,
    failure: Option<TelephonyError>,
    updates: Vec<(usize, i32)>,
    subscriber: Option<String>,
}

impl MockTelephony {
    pub fn calls(&self) -> &[TelephonyCall] {
        &self.calls
    }

    /// Arguments of every `event_reporting` request.
    pub fn event_reporting_calls(&self) -> Vec<bool> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                TelephonyCall::EventReporting(enabled) => Some(*enabled),
                _ => None,
            })
            .collect()
    }

    /// Fail every subsequent request with `error`, or succeed again with `None`.
    pub fn set_failure(&mut self, error: Option<TelephonyError>) {
        self.failure = error;
    }

    /// Indicator changes raised by the next call-control operation.
    pub fn set_updates(&mut self, updates: Vec<(usize, i32)>) {
        self.updates = updates;
    }

    pub fn set_subscriber_number(&mut self, number: Option<&str>) {
        self.subscriber = number.map(str::to_owned);
    }

    fn record(&mut self, call: TelephonyCall) -> TelephonyResult<()> {
        self.calls.push(call);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn call_control(
        &mut self,
        call: TelephonyCall,
        sink: &mut IndicatorSink<'_>,
    ) -> TelephonyResult<()> {
        for (index, value) in std::mem::take(&mut self.updates) {
            sink.update(index, value)
                .map_err(|e| TelephonyError::Other(e.to_string()))?;
        }
        self.record(call)
    }
}

impl Telephony for MockTelephony {
    fn answer_call(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        self.call_control(TelephonyCall::AnswerCall, sink)
    }

    fn terminate_call(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        self.call_control(TelephonyCall::TerminateCall, sink)
    }

    fn redial(&mut self, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        self.call_control(TelephonyCall::Redial, sink)
    }

    fn dial(&mut self, number: &str, sink: &mut IndicatorSink<'_>) -> TelephonyResult<()> {
        self.call_control(TelephonyCall::Dial(number.to_owned()), sink)
    }

    fn transmit_dtmf(&mut self, digit: char) -> TelephonyResult<()> {
        self.record(TelephonyCall::Dtmf(digit))
    }

    fn subscriber_number(&mut self) -> TelephonyResult<Option<String>> {
        self.record(TelephonyCall::SubscriberNumber)?;
        Ok(self.subscriber.clone())
    }

    fn response_and_hold(&mut self, value: i32) -> TelephonyResult<()> {
        self.record(TelephonyCall::ResponseAndHold(value))
    }

    fn event_reporting(&mut self, enabled: bool) -> TelephonyResult<()> {
        self.record(TelephonyCall::EventReporting(enabled))
    }
}

// --- Scheduler ---

/// Records armed timers. Nothing fires until the test expires it.
#[derive(Debug, Default)]
pub struct MockScheduler {
    armed: BTreeMap<TimerId, Duration>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay a still-armed timer was scheduled with.
    pub fn delay(&self, id: TimerId) -> Option<Duration> {
        self.armed.get(&id).copied()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Armed timers in the order they were armed.
    pub fn armed(&self) -> Vec<(TimerId, Duration)> {
        self.armed.iter().map(|(id, d)| (*id, *d)).collect()
    }
}

impl Scheduler for MockScheduler {
    fn schedule(&mut self, id: TimerId, after: Duration) {
        self.armed.insert(id, after);
    }

    fn cancel(&mut self, id: TimerId) {
        self.armed.remove(&id);
    }
}
