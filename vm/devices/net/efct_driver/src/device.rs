// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hardware-ops transport that the control plane drives.

use crate::flow::EthtoolFlowSpec;
use crate::hugepages::HugetlbAllocator;
use bitfield_struct::bitfield;
use thiserror::Error;

/// An error reported by the hardware-ops transport.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The queue has not been bound by this client.
    #[error("queue is not bound by this client")]
    NotBound,
    /// The operation failed with the given status code.
    #[error("device operation failed with status {0}")]
    Status(i32),
}

/// Parameters for binding a hardware event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvqParams {
    /// The event queue id.
    pub qid: u32,
    /// The number of event records.
    pub entries: u32,
    /// Address of the first NIC page of queue memory.
    pub q_page: u64,
    /// Offset of the queue within the first page.
    pub page_offset: u32,
    /// Size of the queue in bytes.
    pub q_size: usize,
    /// Deliver time sync events to this queue.
    pub subscribe_time_sync: bool,
    /// Event credits reserved for unsolicited time sync events.
    pub unsol_credit: u32,
    /// The interrupt to raise for wakeups, if any.
    pub irq: Option<u32>,
}

/// Parameters for binding a hardware transmit queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxqParams {
    /// The event queue that receives completions.
    pub evq: u32,
    /// The hardware transmit queue to bind.
    pub qid: u32,
    /// A label echoed in completion events.
    pub label: u32,
}

/// Parameters for binding hugepages to a receive queue.
pub struct RxqBindParams<'a, S> {
    /// The receive queue id.
    pub qid: u32,
    /// Request hardware receive timestamps.
    pub timestamp_req: bool,
    /// The number of hugepages to bind.
    pub n_hugepages: usize,
    /// State shared with the application.
    pub shm: &'a S,
    /// The VI to wake when packets arrive.
    pub wakeup_instance: u32,
    /// The allocator to draw any new hugepages from.
    pub hugetlb: &'a dyn HugetlbAllocator,
}

/// Called by the transport once a freed receive queue has been released by
/// hardware.
pub type RxqFreeFn = Box<dyn FnOnce() + Send>;

/// The CPUs allowed to receive traffic for a filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CpuMask {
    /// Any CPU.
    #[default]
    All,
    /// Only the listed CPUs.
    Only(Vec<u32>),
}

/// Flags for a hardware filter insertion.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TransportFilterFlags {
    /// Any queue will do, and a looser match is acceptable.
    pub anyqueue_loose: bool,
    /// Prefer the queue the caller asked for.
    pub pref_queue: bool,
    /// The queue must not be shared with any other filter.
    pub exclusive_queue: bool,
    #[bits(29)]
    _reserved: u32,
}

/// A hardware filter insertion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParams {
    /// The traffic to match.
    pub spec: EthtoolFlowSpec,
    /// The CPUs that may receive matching traffic.
    pub mask: CpuMask,
    /// Placement flags.
    pub flags: TransportFilterFlags,
}

/// The result of a successful hardware filter insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterInsertOut {
    /// The receive queue that matching traffic is steered to.
    pub rxq: u32,
    /// The hardware filter id.
    pub filter_id: u32,
    /// An opaque handle for the filter.
    pub filter_handle: u64,
}

/// Design parameters as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwDesignParams {
    /// Receive buffer length in units of [`efct_defs::RX_BUFFER_LEN_UNIT`].
    pub rx_buffer_len: u64,
    /// Offset of packet data within a receive buffer.
    pub frame_offset_fixed: u64,
    /// Stride between receive queue registers.
    pub rx_stride: u64,
    /// The number of shared receive queues.
    pub rx_queues: u64,
    /// Size of a CTPIO aperture in bytes.
    pub tx_aperture_size: u64,
    /// Size of the transmit FIFO in bytes.
    pub tx_fifo_size: u64,
    /// Sub-nanosecond bits in hardware timestamps.
    pub ts_subnano_bit: u64,
    /// Mask applied to unsolicited credit sequence numbers.
    pub unsol_credit_seq_mask: u64,
}

/// The geometry of the per-VI event queue register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvqWindow {
    /// Address of the window of the first VI.
    pub base: u64,
    /// Distance between the windows of consecutive VIs.
    pub stride: u64,
}

/// A CTPIO aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtpioRegion {
    /// Physical address of the aperture.
    pub addr: u64,
    /// Size of the aperture in bytes.
    pub size: u64,
}

/// The hardware-ops transport.
///
/// Every call is a synchronous request/response. The driver never issues a
/// call after the device has been detached.
pub trait EfctDevice: Send + Sync + 'static {
    /// A reference to a hugepage bound to a receive queue. Dropping it
    /// releases the reference.
    type Hugepage: Send;
    /// Receive queue state shared with the application.
    type RxqShm: Send + Sync;
    /// A receive queue bound by [`EfctDevice::rxq_bind`].
    type Rxq: Send;

    /// Binds a hardware event queue.
    fn init_evq(&self, params: &EvqParams) -> Result<(), TransportError>;

    /// Releases a hardware event queue.
    fn free_evq(&self, evq: u32) -> Result<(), TransportError>;

    /// Binds a transmit queue, returning the hardware queue id.
    fn init_txq(&self, params: &TxqParams) -> Result<u32, TransportError>;

    /// Releases a transmit queue. Hardware writes a flush event to the
    /// queue's event queue once the release completes.
    fn free_txq(&self, txq: u32) -> Result<(), TransportError>;

    /// Binds hugepages to a receive queue.
    fn rxq_bind(
        &self,
        params: &RxqBindParams<'_, Self::RxqShm>,
    ) -> Result<Self::Rxq, TransportError>;

    /// Releases a receive queue, calling `freer` once hardware is done with it.
    fn rxq_free(&self, rxq: Self::Rxq, freer: RxqFreeFn);

    /// Returns up to `max` slots describing the hugepages currently bound to
    /// `qid`. Unused slots are `None`.
    fn get_hugepages(
        &self,
        qid: u32,
        max: usize,
    ) -> Result<Vec<Option<Self::Hugepage>>, TransportError>;

    /// Installs a hardware filter.
    fn filter_insert(&self, params: &FilterParams) -> Result<FilterInsertOut, TransportError>;

    /// Removes a hardware filter.
    fn filter_remove(&self, filter_id: u32) -> Result<(), TransportError>;

    /// Returns whether hardware can match `spec` exactly.
    fn is_filter_supported(&self, spec: &EthtoolFlowSpec) -> bool;

    /// Reads the design parameters.
    fn design_params(&self) -> Result<HwDesignParams, TransportError>;

    /// Reads the geometry of the event queue register window.
    fn evq_window(&self) -> Result<EvqWindow, TransportError>;

    /// Issues a firmware command, returning the response length written to
    /// `output`.
    fn fw_rpc(&self, cmd: u32, input: &[u8], output: &mut [u8]) -> Result<usize, TransportError>;

    /// Returns the CTPIO aperture of VI `instance`.
    fn ctpio_addr(&self, instance: u32) -> Result<CtpioRegion, TransportError>;
}
