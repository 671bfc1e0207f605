//! Headset signals.
//!
//! Signals are the only notification of session state changes. They are
//! fanned out to any number of subscribers over a broadcast channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use headset_types::{DeviceAddress, GainKind};

/// A notification emitted by a headset session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new signals
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
#[non_exhaustive]
pub enum HeadsetSignal {
    /// The control channel is established.
    Connected,
    Disconnected,
    /// The headset button was pressed (`AT+CKPD`).
    AnswerRequested,
    /// Audio stopped; the control channel stays up.
    Stopped,
    Playing,
    SpeakerGainChanged { gain: u8 },
    MicrophoneGainChanged { gain: u8 },
    /// The remote hung up (`AT+CHUP`).
    CallTerminated,
}

impl HeadsetSignal {
    /// The change notification for a gain of `kind`.
    pub fn gain_changed(kind: GainKind, gain: u8) -> Self {
        match kind {
            GainKind::Speaker => HeadsetSignal::SpeakerGainChanged { gain },
            GainKind::Microphone => HeadsetSignal::MicrophoneGainChanged { gain },
        }
    }
}

/// A signal together with the device it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub device: DeviceAddress,
    #[serde(flatten)]
    pub signal: HeadsetSignal,
}

impl SignalEvent {
    pub fn new(device: DeviceAddress, signal: HeadsetSignal) -> Self {
        Self { device, signal }
    }
}

/// Sender for signal events.
pub type SignalSender = broadcast::Sender<SignalEvent>;

/// Receiver for signal events.
pub type SignalReceiver = broadcast::Receiver<SignalEvent>;

/// Signal dispatcher for broadcasting headset signals.
#[derive(Debug, Clone)]
pub struct SignalDispatcher {
    sender: SignalSender,
}

impl SignalDispatcher {
    /// Create a new signal dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to signals.
    pub fn subscribe(&self) -> SignalReceiver {
        self.sender.subscribe()
    }

    /// Send a signal.
    pub fn send(&self, event: SignalEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
