use std::collections::BTreeMap;
use tracing::trace;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sequence::SequenceNumber;

/// Called with the remaining capacity whenever the application took an item out of the buffer
pub type DequeueCallback = Box<dyn Fn(u32) + Send + Sync>;

/// Buffers received messages until they can be handed to the application: in ordered mode until
///  every lower number was released, in unordered mode right away.
///
/// Released items still count towards the buffer's occupancy until the application is done with
///  them (see [DeliveryBuffer::complete_delivery]), so the capacity bounds everything the receiver
///  holds on to.
pub struct DeliveryBuffer<T> {
    capacity: u32,
    ordered: bool,
    held: BTreeMap<SequenceNumber, T>,
    next_to_release: SequenceNumber,
    in_application: u32,
    on_dequeue: Option<DequeueCallback>,
    disposed: bool,
}

impl<T> DeliveryBuffer<T> {
    pub fn new(capacity: u32, ordered: bool) -> DeliveryBuffer<T> {
        DeliveryBuffer {
            capacity,
            ordered,
            held: BTreeMap::default(),
            next_to_release: SequenceNumber::FIRST,
            in_application: 0,
            on_dequeue: None,
            disposed: false,
        }
    }

    pub fn set_dequeue_callback(&mut self, callback: DequeueCallback) {
        self.on_dequeue = Some(callback);
    }

    pub fn occupancy(&self) -> u32 {
        let held: u32 = self.held.len().prechecked_cast();
        held + self.in_application
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.occupancy())
    }

    pub fn next_to_release(&self) -> SequenceNumber {
        self.next_to_release
    }

    pub fn can_enqueue(&self, number: SequenceNumber) -> bool {
        if self.disposed || self.occupancy() >= self.capacity {
            return false;
        }
        if self.ordered {
            let upper = self.next_to_release.checked_plus(self.capacity.safe_cast());
            return upper.map(|u| number < u).unwrap_or(true);
        }
        true
    }

    /// Stores an item, returning the items that can be released now. The returned iterator is
    ///  lazy: items are moved to the application's account as they are taken from it, and items
    ///  not taken stay buffered.
    pub fn enqueue(&mut self, item: T, number: SequenceNumber) -> Released<'_, T> {
        debug_assert!(self.can_enqueue(number));
        trace!("buffering #{} for delivery", number);

        self.held.insert(number, item);
        let unordered_item = if self.ordered { None } else { Some(number) };
        Released {
            buffer: self,
            unordered_item,
        }
    }

    /// The application is done with a released item
    pub fn complete_delivery(&mut self) {
        if self.disposed {
            return;
        }
        debug_assert!(self.in_application > 0);
        self.in_application = self.in_application.saturating_sub(1);

        let remaining = self.remaining_capacity();
        if let Some(callback) = &self.on_dequeue {
            callback(remaining);
        }
    }

    /// Discards everything that is buffered. The buffer accepts nothing afterwards.
    pub fn dispose(&mut self) {
        trace!("disposing delivery buffer with {} held items", self.held.len());
        self.held.clear();
        self.in_application = 0;
        self.disposed = true;
    }
}

pub struct Released<'a, T> {
    buffer: &'a mut DeliveryBuffer<T>,
    unordered_item: Option<SequenceNumber>,
}

impl<T> Iterator for Released<'_, T> {
    type Item = (SequenceNumber, T);

    fn next(&mut self) -> Option<Self::Item> {
        let number = if self.buffer.ordered {
            self.buffer.next_to_release
        }
        else {
            self.unordered_item.take()?
        };

        let item = self.buffer.held.remove(&number)?;
        if self.buffer.ordered {
            self.buffer.next_to_release = number.checked_plus(1)
                .unwrap_or(SequenceNumber::ROLLOVER_LIMIT);
        }
        self.buffer.in_application += 1;
        Some((number, item))
    }
}
