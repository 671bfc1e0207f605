//! The gateway reactor.
//!
//! A [`Gateway`] is single-threaded and not `Send`, so exactly one task owns
//! it. That task, the [`Reactor`], runs on a `LocalSet` and is fed by an
//! unbounded channel of [`ReactorEvent`]s: control requests from the HTTP
//! handlers, completions of the connect tasks started by the transport, and
//! data or closure reported by open channels. Gateway timers live in a
//! [`DelayQueue`] polled by the same loop.
//!
//! Everything else talks to the reactor through a cloneable
//! [`ReactorHandle`].

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::{debug, info, warn};

use headset_core::{
    Channel, ChannelId, Error, Gateway, OperationId, PendingReply, Scheduler, ServiceRecord,
    SessionInfo, SignalReceiver, SignalSender, TimerId, TransportError,
};
use headset_types::{DeviceAddress, GainKind, HeadsetState};

use crate::config::Config;
use crate::connector::{ChannelKind, Connector, ConnectorTransport, StreamChannel};
use crate::telephony::{self, DummyTelephony};

/// How long a connect or play request may wait for the session to get there.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// The gateway as wired up by the daemon.
pub type ServiceGateway<C> = Gateway<ConnectorTransport<C>, DummyTelephony, DelayScheduler>;

type Responder<T> = oneshot::Sender<T>;

/// A control request with its reply channel.
#[derive(Debug)]
pub enum Request {
    Devices(Responder<Vec<SessionInfo>>),
    Device(DeviceAddress, Responder<headset_core::Result<SessionInfo>>),
    Connect(DeviceAddress, Responder<headset_core::Result<PendingReply>>),
    Disconnect(DeviceAddress, Responder<headset_core::Result<()>>),
    Play(DeviceAddress, Responder<headset_core::Result<PendingReply>>),
    Stop(DeviceAddress, Responder<headset_core::Result<()>>),
    IndicateCall(DeviceAddress, Responder<headset_core::Result<()>>),
    CancelCall(DeviceAddress, Responder<headset_core::Result<()>>),
    GetGain(DeviceAddress, GainKind, Responder<headset_core::Result<u8>>),
    SetGain(DeviceAddress, GainKind, u32, Responder<headset_core::Result<()>>),
    /// Simulate a call from the network, optionally with a caller number.
    IncomingCall(Option<String>, Responder<headset_core::Result<()>>),
    /// Simulate the network ending the call.
    HangUp(Responder<headset_core::Result<()>>),
}

/// Input to the reactor loop.
#[derive(Debug)]
pub enum ReactorEvent {
    Request(Request),
    Discovered {
        device: DeviceAddress,
        op: OperationId,
        result: Result<Vec<ServiceRecord>, TransportError>,
    },
    ControlConnected {
        device: DeviceAddress,
        op: OperationId,
        result: Result<StreamChannel, TransportError>,
    },
    AudioConnected {
        device: DeviceAddress,
        op: OperationId,
        result: Result<StreamChannel, TransportError>,
    },
    /// Bytes read from a control channel.
    Data {
        device: DeviceAddress,
        channel: ChannelId,
        data: Bytes,
    },
    /// A watched channel hit end of stream or an error.
    Closed {
        device: DeviceAddress,
        channel: ChannelId,
        kind: ChannelKind,
    },
}

/// Errors returned through a [`ReactorHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("Gateway reactor is not running")]
    Stopped,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Gateway(#[from] Error),
}

/// [`Scheduler`] backed by a [`DelayQueue`].
#[derive(Debug, Default)]
pub struct DelayScheduler {
    queue: DelayQueue<TimerId>,
    keys: HashMap<TimerId, Key>,
}

impl DelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Wait for the next timer to expire.
    ///
    /// Resolves to `None` right away when nothing is armed.
    pub async fn next_expired(&mut self) -> Option<TimerId> {
        let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let id = expired.into_inner();
        self.keys.remove(&id);
        Some(id)
    }
}

impl Scheduler for DelayScheduler {
    fn schedule(&mut self, id: TimerId, after: Duration) {
        let key = self.queue.insert(id, after);
        if let Some(old) = self.keys.insert(id, key) {
            self.queue.try_remove(&old);
        }
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(key) = self.keys.remove(&id) {
            self.queue.try_remove(&key);
        }
    }
}

/// Owner of the gateway.
pub struct Reactor<C: Connector> {
    gateway: ServiceGateway<C>,
    events: mpsc::UnboundedReceiver<ReactorEvent>,
    shutdown: CancellationToken,
}

impl<C: Connector> Reactor<C> {
    /// Build the gateway for `config` and register its devices.
    ///
    /// Devices with `cached = true` start out with their service record
    /// known; the others are looked up on first connect.
    pub fn new(config: &Config, connector: C, shutdown: CancellationToken) -> (Self, ReactorHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let transport = ConnectorTransport::new(Arc::new(connector), tx.clone());
        let telephony = DummyTelephony::new(&config.telephony);
        let features = telephony.features();
        let response_and_hold = telephony.initial_response_and_hold();

        let mut gateway = Gateway::new(
            config.gateway_config(),
            transport,
            telephony,
            DelayScheduler::new(),
        );
        gateway.telephony_ready(features, DummyTelephony::indicators(), response_and_hold);

        for (index, device) in config.devices.iter().enumerate() {
            let address = match device.address.parse::<DeviceAddress>() {
                Ok(address) => address,
                Err(e) => {
                    warn!("Skipping device '{}': {e}", device.address);
                    continue;
                }
            };
            let record = device.cached.then(|| device.record(index));
            info!(
                "Serving {address} (alias: {}, profile: {:?})",
                device.alias.as_deref().unwrap_or("-"),
                device.profile
            );
            gateway.add_device(address, record);
        }

        let handle = ReactorHandle {
            events: tx,
            signals: gateway.signals().sender(),
        };
        let reactor = Self {
            gateway,
            events,
            shutdown,
        };
        (reactor, handle)
    }

    pub fn gateway(&self) -> &ServiceGateway<C> {
        &self.gateway
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(mut self) {
        info!(
            "Gateway reactor started with {} device(s)",
            self.gateway.devices().len()
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                Some(id) = self.gateway.scheduler_mut().next_expired(),
                    if !self.gateway.scheduler().is_empty() =>
                {
                    self.gateway.timer_fired(id);
                }
            }
        }

        for device in self.gateway.devices() {
            if self.gateway.disconnect(&device).is_ok() {
                debug!("{device}: disconnected on shutdown");
            }
        }
        info!("Gateway reactor stopped");
    }

    fn handle(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::Request(request) => self.request(request),
            ReactorEvent::Discovered { device, op, result } => {
                self.gateway.discovery_complete(&device, op, result);
            }
            ReactorEvent::ControlConnected { device, op, result } => {
                let result = result.map(|c| Box::new(c) as Box<dyn Channel>);
                self.gateway.control_connected(&device, op, result);
            }
            ReactorEvent::AudioConnected { device, op, result } => {
                let result = result.map(|c| Box::new(c) as Box<dyn Channel>);
                self.gateway.audio_connected(&device, op, result);
            }
            ReactorEvent::Data {
                device,
                channel,
                data,
            } => {
                if let Err(e) = self.gateway.control_data(&device, channel, &data) {
                    warn!("{device}: {e}");
                }
            }
            ReactorEvent::Closed {
                device,
                channel,
                kind,
            } => match kind {
                ChannelKind::Control => self.gateway.control_closed(&device, channel),
                ChannelKind::Audio => self.gateway.audio_closed(&device, channel),
            },
        }
    }

    fn request(&mut self, request: Request) {
        let gw = &mut self.gateway;
        // A dropped responder means the HTTP client went away.
        match request {
            Request::Devices(tx) => {
                let _ = tx.send(gw.sessions());
            }
            Request::Device(device, tx) => {
                let _ = tx.send(gw.session_info(&device));
            }
            Request::Connect(device, tx) => {
                let _ = tx.send(gw.connect(&device));
            }
            Request::Disconnect(device, tx) => {
                let _ = tx.send(gw.disconnect(&device));
            }
            Request::Play(device, tx) => {
                let _ = tx.send(gw.play(&device));
            }
            Request::Stop(device, tx) => {
                let _ = tx.send(gw.stop(&device));
            }
            Request::IndicateCall(device, tx) => {
                let _ = tx.send(gw.indicate_call(&device));
            }
            Request::CancelCall(device, tx) => {
                let _ = tx.send(gw.cancel_call(&device));
            }
            Request::GetGain(device, kind, tx) => {
                let _ = tx.send(gw.gain(&device, kind));
            }
            Request::SetGain(device, kind, gain, tx) => {
                let _ = tx.send(gw.set_gain(&device, kind, gain));
            }
            Request::IncomingCall(number, tx) => {
                let _ = tx.send(telephony::incoming_call(gw, number.as_deref()));
            }
            Request::HangUp(tx) => {
                let _ = tx.send(telephony::remote_hangup(gw));
            }
        }
    }
}

/// Cloneable, `Send` access to a running [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    events: mpsc::UnboundedSender<ReactorEvent>,
    signals: SignalSender,
}

impl ReactorHandle {
    /// Subscribe to headset signals.
    pub fn subscribe(&self) -> SignalReceiver {
        self.signals.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    async fn call<T>(&self, request: impl FnOnce(Responder<T>) -> Request) -> Result<T, ReactorError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(ReactorEvent::Request(request(tx)))
            .map_err(|_| ReactorError::Stopped)?;
        rx.await.map_err(|_| ReactorError::Stopped)
    }

    /// Wait for a pending connect or play to finish.
    async fn wait(reply: PendingReply) -> Result<(), ReactorError> {
        match tokio::time::timeout(REPLY_TIMEOUT, reply).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(Error::Cancelled.into()),
            Err(_) => Err(ReactorError::Timeout(REPLY_TIMEOUT)),
        }
    }

    pub async fn devices(&self) -> Result<Vec<SessionInfo>, ReactorError> {
        self.call(Request::Devices).await
    }

    pub async fn device(&self, device: DeviceAddress) -> Result<SessionInfo, ReactorError> {
        Ok(self.call(|tx| Request::Device(device, tx)).await??)
    }

    pub async fn state(&self, device: DeviceAddress) -> Result<HeadsetState, ReactorError> {
        Ok(self.device(device).await?.state)
    }

    /// Connect and wait until the session is Connected.
    pub async fn connect(&self, device: DeviceAddress) -> Result<(), ReactorError> {
        let reply = self.call(|tx| Request::Connect(device, tx)).await??;
        Self::wait(reply).await
    }

    pub async fn disconnect(&self, device: DeviceAddress) -> Result<(), ReactorError> {
        Ok(self.call(|tx| Request::Disconnect(device, tx)).await??)
    }

    /// Open audio and wait until the session is Playing.
    pub async fn play(&self, device: DeviceAddress) -> Result<(), ReactorError> {
        let reply = self.call(|tx| Request::Play(device, tx)).await??;
        Self::wait(reply).await
    }

    pub async fn stop(&self, device: DeviceAddress) -> Result<(), ReactorError> {
        Ok(self.call(|tx| Request::Stop(device, tx)).await??)
    }

    pub async fn indicate_call(&self, device: DeviceAddress) -> Result<(), ReactorError> {
        Ok(self.call(|tx| Request::IndicateCall(device, tx)).await??)
    }

    pub async fn cancel_call(&self, device: DeviceAddress) -> Result<(), ReactorError> {
        Ok(self.call(|tx| Request::CancelCall(device, tx)).await??)
    }

    pub async fn gain(&self, device: DeviceAddress, kind: GainKind) -> Result<u8, ReactorError> {
        Ok(self.call(|tx| Request::GetGain(device, kind, tx)).await??)
    }

    pub async fn set_gain(
        &self,
        device: DeviceAddress,
        kind: GainKind,
        gain: u32,
    ) -> Result<(), ReactorError> {
        Ok(self.call(|tx| Request::SetGain(device, kind, gain, tx)).await??)
    }

    pub async fn incoming_call(&self, number: Option<String>) -> Result<(), ReactorError> {
        Ok(self.call(|tx| Request::IncomingCall(number, tx)).await??)
    }

    pub async fn hang_up(&self) -> Result<(), ReactorError> {
        Ok(self.call(Request::HangUp).await??)
    }
}
