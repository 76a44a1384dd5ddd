// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual interface instance allocation.

use parking_lot::Mutex;
use std::ops::Range;

/// Constraints on an allocated virtual interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViConstraints {
    /// The instance needs a transmit queue.
    pub want_txq: bool,
}

/// A LIFO allocator over a range of instances, handing out the lowest
/// instances first.
#[derive(Debug)]
struct StackAllocator {
    free: Vec<u32>,
}

impl StackAllocator {
    fn new(range: Range<u32>) -> Self {
        Self {
            free: range.rev().collect(),
        }
    }

    /// Takes the most recently freed instance that `accept` allows.
    fn alloc(&mut self, accept: impl Fn(u32) -> bool) -> Option<u32> {
        let pos = self.free.iter().rposition(|&instance| accept(instance))?;
        Some(self.free.remove(pos))
    }

    fn free(&mut self, instance: u32) {
        debug_assert!(!self.free.contains(&instance), "double free of vi {instance}");
        self.free.push(instance);
    }
}

/// Instances below the event queue count have hardware event queues and may
/// have transmit queues; those above are receive-only.
pub(crate) struct ViAllocators {
    tx: Mutex<StackAllocator>,
    rx: Mutex<StackAllocator>,
    evq_count: u32,
}

impl ViAllocators {
    pub fn new(evq_count: u32, vi_lim: u32) -> Self {
        assert!(evq_count <= vi_lim);
        Self {
            tx: Mutex::new(StackAllocator::new(0..evq_count)),
            rx: Mutex::new(StackAllocator::new(evq_count..vi_lim)),
            evq_count,
        }
    }

    /// Allocates an instance. `has_txq` reports whether an instance has a
    /// transmit queue.
    pub fn alloc(&self, constraints: ViConstraints, has_txq: impl Fn(u32) -> bool) -> Option<u32> {
        if constraints.want_txq {
            self.tx.lock().alloc(has_txq)
        } else {
            self.rx.lock().alloc(|_| true)
        }
    }

    pub fn free(&self, instance: u32) {
        if instance < self.evq_count {
            self.tx.lock().free(instance);
        } else {
            self.rx.lock().free(instance);
        }
    }
}
