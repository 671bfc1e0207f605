//! Timer collaborator interface and the gateway's timer bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use headset_types::DeviceAddress;

/// Handle of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-send the incoming call notification.
    Ring,
    /// Tear down an unused auto-opened connection.
    AutoDisconnect,
    /// Complete a request that was already satisfied when it was made.
    Complete,
}

/// Arms and disarms one-shot timers.
///
/// When a timer expires the reactor calls
/// [`Gateway::timer_fired`](crate::Gateway::timer_fired) with its id.
pub trait Scheduler {
    fn schedule(&mut self, id: TimerId, after: Duration);

    fn cancel(&mut self, id: TimerId);
}

/// Timers armed by the gateway, keyed by id.
#[derive(Debug)]
pub(crate) struct Timers<S> {
    scheduler: S,
    armed: HashMap<TimerId, (DeviceAddress, TimerKind)>,
    next_id: u64,
}

impl<S: Scheduler> Timers<S> {
    pub(crate) fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            armed: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn arm(&mut self, device: DeviceAddress, kind: TimerKind, after: Duration) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.armed.insert(id, (device, kind));
        self.scheduler.schedule(id, after);
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if self.armed.remove(&id).is_some() {
            self.scheduler.cancel(id);
        }
    }

    /// Consume a fired timer. Unknown ids were cancelled and yield `None`.
    pub(crate) fn fire(&mut self, id: TimerId) -> Option<(DeviceAddress, TimerKind)> {
        self.armed.remove(&id)
    }

    pub(crate) fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub(crate) fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub(crate) fn armed(&self) -> usize {
        self.armed.len()
    }
}
