//! Transport bridge.
//!
//! The gateway starts discovery and connects through its synchronous
//! [`Transport`] trait. [`ConnectorTransport`] turns each of those calls into
//! a tokio task running an async [`Connector`], and reports the result back to
//! the reactor as a [`ReactorEvent`].
//!
//! [`TcpConnector`] stands in for a Bluetooth adapter: every headset is a pair
//! of TCP endpoints, one for the RFCOMM control channel and one for SCO
//! audio, and discovery is answered from the configured service record.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use headset_core::{Channel, ChannelId, OperationId, ServiceRecord, Transport, TransportError};
use headset_types::DeviceAddress;

use crate::config::Config;
use crate::reactor::ReactorEvent;

/// Time allowed for a TCP connect before the stage fails.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 1024;

/// Async backend behind [`ConnectorTransport`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Records of class `service` offered by `remote`.
    async fn discover(
        &self,
        remote: DeviceAddress,
        service: Uuid,
    ) -> Result<Vec<ServiceRecord>, TransportError>;

    async fn connect_control(
        &self,
        local: DeviceAddress,
        remote: DeviceAddress,
        channel: u8,
    ) -> Result<TcpStream, TransportError>;

    async fn connect_audio(
        &self,
        local: DeviceAddress,
        remote: DeviceAddress,
    ) -> Result<TcpStream, TransportError>;
}

/// Where a headset can be reached.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub record: ServiceRecord,
    pub control: SocketAddr,
    pub audio: Option<SocketAddr>,
}

/// [`Connector`] dialing TCP endpoints.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoints: HashMap<DeviceAddress, Endpoint>,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            endpoints: HashMap::new(),
            timeout,
        }
    }

    /// Endpoints of every valid `[[devices]]` entry.
    pub fn from_config(config: &Config) -> Self {
        let mut connector = Self::new(CONNECT_TIMEOUT);
        for (index, device) in config.devices.iter().enumerate() {
            let (Ok(address), Ok(control)) = (
                device.address.parse::<DeviceAddress>(),
                device.control.parse::<SocketAddr>(),
            ) else {
                warn!("Ignoring endpoints of device '{}'", device.address);
                continue;
            };
            let audio = device.audio.as_deref().and_then(|a| a.parse().ok());
            connector.add_endpoint(
                address,
                Endpoint {
                    record: device.record(index),
                    control,
                    audio,
                },
            );
        }
        connector
    }

    pub fn add_endpoint(&mut self, device: DeviceAddress, endpoint: Endpoint) {
        self.endpoints.insert(device, endpoint);
    }

    fn endpoint(&self, device: &DeviceAddress) -> Result<&Endpoint, TransportError> {
        self.endpoints.get(device).ok_or(TransportError::HostDown)
    }

    async fn open(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(transport_error(&e)),
            Err(_) => return Err(TransportError::Timeout(self.timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to disable Nagle on {addr}: {e}");
        }
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn discover(
        &self,
        remote: DeviceAddress,
        service: Uuid,
    ) -> Result<Vec<ServiceRecord>, TransportError> {
        let record = &self.endpoint(&remote)?.record;
        if record.class == service {
            Ok(vec![record.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn connect_control(
        &self,
        _local: DeviceAddress,
        remote: DeviceAddress,
        channel: u8,
    ) -> Result<TcpStream, TransportError> {
        let endpoint = self.endpoint(&remote)?;
        if endpoint.record.channel != Some(channel) {
            return Err(TransportError::Refused);
        }
        self.open(endpoint.control).await
    }

    async fn connect_audio(
        &self,
        _local: DeviceAddress,
        remote: DeviceAddress,
    ) -> Result<TcpStream, TransportError> {
        let addr = self.endpoint(&remote)?.audio.ok_or(TransportError::Refused)?;
        self.open(addr).await
    }
}

fn transport_error(err: &io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => TransportError::Refused,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            TransportError::HostDown
        }
        _ => TransportError::Other(err.to_string()),
    }
}

/// What a [`StreamChannel`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Audio,
}

/// A TCP stream seen by the gateway as a [`Channel`].
///
/// Writes go through an mpsc to a writer task, so `send` never blocks the
/// reactor. Nothing is read until [`watch`](Channel::watch): a control
/// channel then forwards every read to the reactor, an audio channel only
/// reports when the stream ends.
pub struct StreamChannel {
    id: ChannelId,
    device: DeviceAddress,
    kind: ChannelKind,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<OwnedReadHalf>,
    events: mpsc::UnboundedSender<ReactorEvent>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl StreamChannel {
    /// Must be called inside a tokio runtime; spawns the writer task.
    pub fn new(
        id: ChannelId,
        device: DeviceAddress,
        kind: ChannelKind,
        stream: TcpStream,
        events: mpsc::UnboundedSender<ReactorEvent>,
    ) -> Self {
        let (reader, mut write) = stream.into_split();
        let (writer, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let closed = events.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write.write_all(&data).await {
                    warn!("{device}: write to {id} failed: {e}");
                    let _ = closed.send(ReactorEvent::Closed {
                        device,
                        channel: id,
                        kind,
                    });
                    return;
                }
            }
            // Sender dropped: everything queued is written.
            let _ = write.shutdown().await;
        });

        let token = CancellationToken::new();
        Self {
            id,
            device,
            kind,
            writer: Some(writer),
            reader: Some(reader),
            events,
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("open", &self.writer.is_some())
            .field("watched", &self.reader.is_none())
            .finish()
    }
}

impl Channel for StreamChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel closed"))?;
        writer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped"))
    }

    fn watch(&mut self) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let (device, id, kind) = (self.device, self.id, self.kind);
        let events = self.events.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
            loop {
                buf.reserve(READ_BUFFER_SIZE);
                tokio::select! {
                    () = token.cancelled() => return,
                    read = reader.read_buf(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) if kind == ChannelKind::Control => {
                            let data = buf.split().freeze();
                            if events.send(ReactorEvent::Data { device, channel: id, data }).is_err() {
                                return;
                            }
                        }
                        Ok(_) => buf.clear(),
                        Err(e) => {
                            debug!("{device}: read from {id} failed: {e}");
                            break;
                        }
                    },
                }
            }
            let _ = events.send(ReactorEvent::Closed {
                device,
                channel: id,
                kind,
            });
        });
    }

    fn close(&mut self) {
        if self.writer.take().is_some() {
            debug!("{}: closing {} ({:?})", self.device, self.id, self.kind);
        }
        self.reader = None;
        self.token.cancel();
    }
}

/// [`Transport`] running a [`Connector`] on tokio tasks.
pub struct ConnectorTransport<C> {
    connector: Arc<C>,
    events: mpsc::UnboundedSender<ReactorEvent>,
    tasks: HashMap<OperationId, AbortHandle>,
    next_channel: u64,
}

impl<C: Connector> ConnectorTransport<C> {
    pub fn new(connector: Arc<C>, events: mpsc::UnboundedSender<ReactorEvent>) -> Self {
        Self {
            connector,
            events,
            tasks: HashMap::new(),
            next_channel: 1,
        }
    }

    /// Number of operations still running.
    pub fn running(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }

    fn channel_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        id
    }

    fn spawn<F>(&mut self, op: OperationId, task: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.events.is_closed() {
            return Err(TransportError::Other("reactor stopped".into()));
        }
        self.tasks.retain(|_, t| !t.is_finished());
        let handle = tokio::spawn(task).abort_handle();
        self.tasks.insert(op, handle);
        Ok(())
    }
}

impl<C: Connector> Transport for ConnectorTransport<C> {
    fn discover(
        &mut self,
        op: OperationId,
        _local: DeviceAddress,
        remote: DeviceAddress,
        service: Uuid,
    ) -> Result<(), TransportError> {
        debug!("{remote}: discovering {service} ({op})");
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        self.spawn(op, async move {
            let result = connector.discover(remote, service).await;
            let _ = events.send(ReactorEvent::Discovered {
                device: remote,
                op,
                result,
            });
        })
    }

    fn connect_control(
        &mut self,
        op: OperationId,
        local: DeviceAddress,
        remote: DeviceAddress,
        channel: u8,
    ) -> Result<(), TransportError> {
        debug!("{remote}: connecting control channel {channel} ({op})");
        let id = self.channel_id();
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        self.spawn(op, async move {
            let result = connector
                .connect_control(local, remote, channel)
                .await
                .map(|s| StreamChannel::new(id, remote, ChannelKind::Control, s, events.clone()));
            let _ = events.send(ReactorEvent::ControlConnected {
                device: remote,
                op,
                result,
            });
        })
    }

    fn connect_audio(
        &mut self,
        op: OperationId,
        local: DeviceAddress,
        remote: DeviceAddress,
    ) -> Result<(), TransportError> {
        debug!("{remote}: connecting audio ({op})");
        let id = self.channel_id();
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        self.spawn(op, async move {
            let result = connector
                .connect_audio(local, remote)
                .await
                .map(|s| StreamChannel::new(id, remote, ChannelKind::Audio, s, events.clone()));
            let _ = events.send(ReactorEvent::AudioConnected {
                device: remote,
                op,
                result,
            });
        })
    }

    fn cancel(&mut self, op: OperationId) {
        if let Some(task) = self.tasks.remove(&op) {
            debug!("Aborting {op}");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headset_core::uuids;
    use tokio::net::TcpListener;

    fn device() -> DeviceAddress {
        DeviceAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
    }

    async fn connector_with_listener() -> (TcpConnector, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut connector = TcpConnector::new(Duration::from_secs(2));
        connector.add_endpoint(
            device(),
            Endpoint {
                record: ServiceRecord::handsfree(0x10001, 3),
                control: listener.local_addr().unwrap(),
                audio: None,
            },
        );
        (connector, listener)
    }

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ReactorEvent>) -> ReactorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_discovery_answers_from_record() {
        let (connector, _listener) = connector_with_listener().await;

        let records = connector.discover(device(), uuids::HANDSFREE).await.unwrap();
        assert_eq!(records, vec![ServiceRecord::handsfree(0x10001, 3)]);
        assert!(connector.discover(device(), uuids::HEADSET).await.unwrap().is_empty());

        let stranger = DeviceAddress::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(
            connector.discover(stranger, uuids::HANDSFREE).await,
            Err(TransportError::HostDown)
        );
    }

    #[tokio::test]
    async fn test_connect_checks_channel() {
        let (connector, listener) = connector_with_listener().await;

        let wrong = connector.connect_control(DeviceAddress::ANY, device(), 1).await;
        assert!(matches!(wrong, Err(TransportError::Refused)));

        let stream = connector
            .connect_control(DeviceAddress::ANY, device(), 3)
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), accepted.local_addr().unwrap());

        let audio = connector.connect_audio(DeviceAddress::ANY, device()).await;
        assert!(matches!(audio, Err(TransportError::Refused)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (connector, listener) = connector_with_listener().await;
        drop(listener);
        let result = connector.connect_control(DeviceAddress::ANY, device(), 3).await;
        assert!(matches!(result, Err(TransportError::Refused)));
    }

    #[tokio::test]
    async fn test_stream_channel_forwards_control_data() {
        let (client, mut server) = stream_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = StreamChannel::new(ChannelId(4), device(), ChannelKind::Control, client, tx);

        channel.send(b"\r\nOK\r\n").unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\r\nOK\r\n");

        channel.watch();
        server.write_all(b"AT+CKPD=200\r").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 12 {
            match next_event(&mut rx).await {
                ReactorEvent::Data { channel: id, data, .. } => {
                    assert_eq!(id, ChannelId(4));
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received, b"AT+CKPD=200\r");

        drop(server);
        assert!(matches!(
            next_event(&mut rx).await,
            ReactorEvent::Closed {
                channel: ChannelId(4),
                kind: ChannelKind::Control,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_audio_channel_reports_closure_only() {
        let (client, mut server) = stream_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = StreamChannel::new(ChannelId(9), device(), ChannelKind::Audio, client, tx);
        assert_eq!(channel.kind(), ChannelKind::Audio);

        channel.watch();
        server.write_all(&[0u8; 48]).await.unwrap();
        drop(server);

        assert!(matches!(
            next_event(&mut rx).await,
            ReactorEvent::Closed {
                kind: ChannelKind::Audio,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_and_stops_sends() {
        let (client, mut server) = stream_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = StreamChannel::new(ChannelId(2), device(), ChannelKind::Control, client, tx);
        channel.watch();

        channel.send(b"\r\nERROR\r\n").unwrap();
        channel.close();
        assert!(channel.send(b"\r\nOK\r\n").is_err());

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"\r\nERROR\r\n");

        // Closure we asked for is not reported back.
        let quiet = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(quiet.is_err());
    }

    /// Connector whose discovery never finishes.
    struct Stalled;

    #[async_trait]
    impl Connector for Stalled {
        async fn discover(
            &self,
            _remote: DeviceAddress,
            _service: Uuid,
        ) -> Result<Vec<ServiceRecord>, TransportError> {
            std::future::pending().await
        }

        async fn connect_control(
            &self,
            _local: DeviceAddress,
            _remote: DeviceAddress,
            _channel: u8,
        ) -> Result<TcpStream, TransportError> {
            Err(TransportError::HostDown)
        }

        async fn connect_audio(
            &self,
            _local: DeviceAddress,
            _remote: DeviceAddress,
        ) -> Result<TcpStream, TransportError> {
            Err(TransportError::Refused)
        }
    }

    #[tokio::test]
    async fn test_transport_reports_results() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = ConnectorTransport::new(Arc::new(Stalled), tx);

        transport
            .connect_control(OperationId(1), DeviceAddress::ANY, device(), 1)
            .unwrap();
        match next_event(&mut rx).await {
            ReactorEvent::ControlConnected { op, result, .. } => {
                assert_eq!(op, OperationId(1));
                assert!(matches!(result, Err(TransportError::HostDown)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_operation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = ConnectorTransport::new(Arc::new(Stalled), tx);

        transport
            .discover(OperationId(5), DeviceAddress::ANY, device(), uuids::HANDSFREE)
            .unwrap();
        assert_eq!(transport.running(), 1);
        transport.cancel(OperationId(5));
        tokio::task::yield_now().await;
        assert_eq!(transport.running(), 0);

        let quiet = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_spawn_fails_without_reactor() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut transport = ConnectorTransport::new(Arc::new(Stalled), tx);
        assert!(
            transport
                .discover(OperationId(1), DeviceAddress::ANY, device(), uuids::HEADSET)
                .is_err()
        );
    }
}
