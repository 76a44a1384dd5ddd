// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to event queue memory shared with the device.

use efct_defs::EfctEvent;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A read-only view of the event records of an event queue.
///
/// The device writes records into this memory at any time, so every read
/// observes the latest value.
pub trait EventQueueMemory: Send + Sync {
    /// The number of event records backed by the memory.
    fn len(&self) -> usize;

    /// Returns true if the memory backs no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the raw record at `index`.
    ///
    /// Panics if `index` is out of bounds.
    fn read_u64(&self, index: usize) -> u64;

    /// Reads the record at `index`.
    fn read_event(&self, index: usize) -> EfctEvent {
        EfctEvent::from(self.read_u64(index))
    }
}

/// Event queue memory backed by the heap, used by emulated devices.
pub struct HeapEventQueue {
    records: Box<[AtomicU64]>,
}

impl HeapEventQueue {
    /// Allocates zeroed memory for `entries` records.
    pub fn new(entries: usize) -> Self {
        Self {
            records: (0..entries).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Posts `event` at `index`, as the device would.
    pub fn write_event(&self, index: usize, event: EfctEvent) {
        self.records[index].store(event.into(), Ordering::Release);
    }

    /// Zeroes every record.
    pub fn clear(&self) {
        for record in self.records.iter() {
            record.store(0, Ordering::Relaxed);
        }
    }
}

impl EventQueueMemory for HeapEventQueue {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn read_u64(&self, index: usize) -> u64 {
        self.records[index].load(Ordering::Acquire)
    }
}
