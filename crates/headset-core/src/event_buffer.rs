//! Bounded queue of indicator events held back during telephony operations.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Default number of indicator events that can be queued.
pub const DEFAULT_CAPACITY: usize = 4;

/// An indicator change waiting to be reported as `+CIEV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorEvent {
    /// Zero-based indicator index.
    pub index: usize,
    /// Indicator value at the time the change was raised.
    pub value: i32,
}

/// FIFO of [`IndicatorEvent`]s with a fixed capacity.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<IndicatorEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue an event, failing with [`Error::ResourceExhausted`] when full.
    pub fn push(&mut self, event: IndicatorEvent) -> Result<()> {
        if self.events.len() >= self.capacity {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        self.events.push_back(event);
        Ok(())
    }

    /// Remove and return every queued event, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = IndicatorEvent> + '_ {
        self.events.drain(..)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(index: usize, value: i32) -> IndicatorEvent {
        IndicatorEvent { index, value }
    }

    #[test]
    fn test_fifo_order() {
        let mut buffer = EventBuffer::default();
        buffer.push(event(1, 1)).unwrap();
        buffer.push(event(2, 0)).unwrap();
        buffer.push(event(1, 0)).unwrap();

        let drained: Vec<_> = buffer.drain().collect();
        assert_eq!(drained, vec![event(1, 1), event(2, 0), event(1, 0)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_buffer_rejects() {
        let mut buffer = EventBuffer::default();
        for i in 0..DEFAULT_CAPACITY {
            buffer.push(event(i, 1)).unwrap();
        }
        let err = buffer.push(event(0, 0)).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { capacity: 4 }));
        assert_eq!(buffer.len(), 4);

        // Draining frees the space again.
        assert_eq!(buffer.drain().count(), 4);
        buffer.push(event(0, 0)).unwrap();
    }
}
