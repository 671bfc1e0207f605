//! The in-flight connection attempt of a session.
//!
//! A [`PendingConnect`] exists while a session is being driven towards a
//! target state. Later requests coalesce into it by raising the target and
//! registering a [`Waiter`]. It is consumed exactly once by
//! [`PendingConnect::finish`], which notifies every waiter and replies to
//! the synchronous caller, if any.

use std::fmt;

use tokio::sync::oneshot;
use tracing::debug;

use headset_types::{DeviceAddress, HeadsetState};

use crate::error::{Result, Stage};
use crate::transport::OperationId;

/// Sender half of a control-surface reply.
pub type Reply = oneshot::Sender<Result<()>>;

/// Receiver a control-surface caller awaits for the definitive outcome.
pub type PendingReply = oneshot::Receiver<Result<()>>;

/// Completion callback of a stream request.
///
/// Invoked with the device address once the target state is reached, or
/// with `None` if the attempt failed.
pub type StreamCallback = Box<dyn FnOnce(Option<DeviceAddress>)>;

/// Identifies a registered waiter for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(pub(crate) u32);

impl WaiterId {
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct Waiter {
    id: WaiterId,
    callback: StreamCallback,
}

/// The furthest-in-progress connection attempt for one session.
pub struct PendingConnect {
    target: HeadsetState,
    reply: Option<(HeadsetState, Reply)>,
    operation: Option<(Stage, OperationId)>,
    waiters: Vec<Waiter>,
}

impl PendingConnect {
    pub(crate) fn new(target: HeadsetState) -> Self {
        Self {
            target,
            reply: None,
            operation: None,
            waiters: Vec::new(),
        }
    }

    /// The highest state any requester asked for.
    #[must_use]
    pub fn target(&self) -> HeadsetState {
        self.target
    }

    /// The asynchronous stage currently outstanding.
    #[must_use]
    pub fn operation(&self) -> Option<(Stage, OperationId)> {
        self.operation
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Whether anyone still wants the outcome.
    #[must_use]
    pub fn has_interest(&self) -> bool {
        !self.waiters.is_empty() || self.reply.is_some()
    }

    /// Raise the target; it is never lowered.
    pub(crate) fn raise_target(&mut self, target: HeadsetState) {
        self.target = self.target.max(target);
    }

    pub(crate) fn set_operation(&mut self, stage: Stage, operation: OperationId) {
        self.operation = Some((stage, operation));
    }

    pub(crate) fn take_operation(&mut self) -> Option<(Stage, OperationId)> {
        self.operation.take()
    }

    pub(crate) fn add_waiter(&mut self, id: WaiterId, callback: StreamCallback) {
        self.waiters.push(Waiter { id, callback });
    }

    /// Remove a waiter without notifying it.
    pub(crate) fn remove_waiter(&mut self, id: WaiterId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Attach the synchronous caller that is answered once `target` is reached.
    pub(crate) fn set_reply(&mut self, target: HeadsetState, reply: Reply) {
        self.raise_target(target);
        self.reply = Some((target, reply));
    }

    /// Answer the synchronous caller early if the state it asked for is reached.
    pub(crate) fn reply_if_reached(&mut self, state: HeadsetState) {
        if let Some((target, _)) = &self.reply
            && *target <= state
            && let Some((_, reply)) = self.reply.take()
        {
            let _ = reply.send(Ok(()));
        }
    }

    /// Notify every waiter and the synchronous caller of the outcome.
    pub(crate) fn finish(self, device: DeviceAddress, result: Result<()>) {
        let success = result.is_ok();
        debug!(
            "{device}: finishing pending connect to {} ({} waiters, success: {success})",
            self.target,
            self.waiters.len()
        );

        for waiter in self.waiters {
            (waiter.callback)(success.then_some(device));
        }

        if let Some((_, reply)) = self.reply {
            // The caller may have stopped listening.
            let _ = reply.send(result);
        }
    }
}

impl fmt::Debug for PendingConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnect")
            .field("target", &self.target)
            .field("reply", &self.reply.as_ref().map(|(t, _)| *t))
            .field("operation", &self.operation)
            .field(
                "waiters",
                &self.waiters.iter().map(|w| w.id).collect::<Vec<_>>(),
            )
            .finish()
    }
}
