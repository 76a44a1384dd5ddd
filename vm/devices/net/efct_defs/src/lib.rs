// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware definitions for EFCT NICs, whose receive path is a set of
//! software-managed ring buffers backed by hugepages rather than hardware
//! descriptor rings.

pub mod mcdi;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The NIC page size. Event queue memory is described to the driver as one
/// address per NIC page.
pub const NIC_PAGE_SIZE: u64 = 4096;

/// The size of a single event record in bytes.
pub const EVENT_SIZE: usize = 8;

/// The largest number of superbuffers a receive queue can address.
pub const MAX_SUPERBUFS: usize = 512;
pub const SUPERBUFS_PER_PAGE: usize = 2;
/// The largest number of hugepages a NIC may have donated to hardware.
///
/// Donating more would cause the hardware to post superbuffer ids beyond
/// [`MAX_SUPERBUFS`].
pub const MAX_HUGEPAGES: usize = MAX_SUPERBUFS / SUPERBUFS_PER_PAGE;

/// The per-VI limit on shared receive queues.
pub const MAX_EFCT_RXQS: usize = 8;

/// The only CTPIO aperture size consumers know how to use.
pub const CTPIO_REGION_SIZE: u64 = 0x1000;

/// The number of event queue entries reserved for time sync events when
/// transmit timestamps are requested.
pub const TIME_SYNC_EVENT_EVQ_CAPACITY: u32 = 16;

/// Receive buffer lengths are reported in units of this size.
pub const RX_BUFFER_LEN_UNIT: u64 = 4096;

/// The event type field of an event record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EfctEventType(pub u8);

impl EfctEventType {
    pub const RX: Self = Self(0);
    pub const TX: Self = Self(1);
    pub const CONTROL: Self = Self(2);
    pub const DRIVER: Self = Self(5);
}

/// The subtype of a control event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EfctCtrlSubtype(pub u8);

impl EfctCtrlSubtype {
    pub const ERROR: Self = Self(0);
    pub const FLUSH: Self = Self(1);
    pub const TIME_SYNC: Self = Self(2);
    pub const UNSOL_OVERFLOW: Self = Self(3);
}

/// The queue direction of a flush control event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EfctFlushType(pub u8);

impl EfctFlushType {
    pub const TX: Self = Self(0);
    pub const RX: Self = Self(1);
}

/// An event record, as posted by hardware into event queue memory.
///
/// Only the fields used by flush handling are broken out; the low 53 bits are
/// type specific.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct EfctEvent {
    /// The queue a flush event refers to.
    pub flush_queue_id: u16,
    /// The direction of a flush event. See [`EfctFlushType`].
    #[bits(4)]
    pub flush_type: u8,
    #[bits(33)]
    pub reserved: u64,
    /// See [`EfctCtrlSubtype`].
    #[bits(6)]
    pub ctrl_subtype: u8,
    pub phase: bool,
    /// See [`EfctEventType`].
    #[bits(4)]
    pub event_type: u8,
}

impl EfctEvent {
    /// Builds a transmit flush completion for `txq`.
    pub fn tx_flush(txq: u16) -> Self {
        Self::new()
            .with_event_type(EfctEventType::CONTROL.0)
            .with_ctrl_subtype(EfctCtrlSubtype::FLUSH.0)
            .with_flush_type(EfctFlushType::TX.0)
            .with_flush_queue_id(txq)
    }

    pub fn event_type_enum(&self) -> EfctEventType {
        EfctEventType(self.event_type())
    }

    /// Returns the flushed queue if this is a transmit flush completion.
    pub fn tx_flush_queue(&self) -> Option<u16> {
        (self.event_type_enum() == EfctEventType::CONTROL
            && EfctCtrlSubtype(self.ctrl_subtype()) == EfctCtrlSubtype::FLUSH
            && EfctFlushType(self.flush_type()) == EfctFlushType::TX)
            .then(|| self.flush_queue_id())
    }
}

/// The value written to the interrupt prime register to request a wakeup.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct EvqPrimeDoorbell {
    pub evq_id: u16,
    pub read_idx: u16,
}

pub const EVQ_PRIME_EVQ_ID_WIDTH: u32 = 16;
pub const EVQ_PRIME_READ_IDX_WIDTH: u32 = 16;
