// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated EFCT device that implements the hardware-ops transport in
//! memory, recording every operation issued to it.

use crate::device::CtpioRegion;
use crate::device::EfctDevice;
use crate::device::EvqParams;
use crate::device::EvqWindow;
use crate::device::FilterInsertOut;
use crate::device::FilterParams;
use crate::device::HwDesignParams;
use crate::device::RxqBindParams;
use crate::device::RxqFreeFn;
use crate::device::TransportError;
use crate::device::TxqParams;
use crate::flow::EthtoolFlowSpec;
use efct_defs::mcdi::FilterMatchFields;
use efct_defs::mcdi::GetParserDispInfoIn;
use efct_defs::mcdi::GetParserDispInfoOutHdr;
use efct_defs::mcdi::GET_PARSER_DISP_INFO_OP_GET_SUPPORTED_RX_MATCHES;
use efct_defs::mcdi::MC_CMD_GET_PARSER_DISP_INFO;
use efct_defs::CTPIO_REGION_SIZE;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const EINVAL: i32 = -22;
const ENOMEM: i32 = -12;
const EBUSY: i32 = -16;

/// An emulated device. Clones share state, so a test can keep a handle to
/// inspect the device after handing it to the driver.
#[derive(Clone)]
pub struct EmulatedEfctDevice {
    state: Arc<Mutex<EmulatedState>>,
    page_refs: Arc<AtomicUsize>,
}

struct EmulatedState {
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, TransportError>,
    evqs: HashMap<u32, EvqParams>,
    txqs: HashMap<u32, TxqParams>,
    freed_txqs: Vec<u32>,
    rxq_pages: HashMap<u32, usize>,
    filters: HashMap<u32, FilterParams>,
    removed_filters: Vec<u32>,
    next_filter_id: u32,
    supported: Vec<FilterMatchFields>,
    design: HwDesignParams,
    evq_window: EvqWindow,
    ctpio_size: u64,
}

/// A reference to a hugepage bound to an emulated receive queue.
pub struct EmulatedHugepage {
    refs: Arc<AtomicUsize>,
}

impl Drop for EmulatedHugepage {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A receive queue bound on the emulated device.
#[derive(Debug)]
pub struct EmulatedRxq {
    /// The receive queue id.
    pub qid: u32,
    /// The number of hugepages the bind added.
    pub n_hugepages: usize,
}

impl EmulatedEfctDevice {
    /// The filter types an EFCT NIC matches natively.
    pub const DEFAULT_MATCHES: [FilterMatchFields; 4] = [
        FilterMatchFields::IP_LOCAL,
        FilterMatchFields::ETH_LOCAL,
        FilterMatchFields::UCAST_MISMATCH,
        FilterMatchFields::MCAST_MISMATCH,
    ];

    /// Creates a device with no queues or filters bound.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EmulatedState {
                calls: HashMap::new(),
                failures: HashMap::new(),
                evqs: HashMap::new(),
                txqs: HashMap::new(),
                freed_txqs: Vec::new(),
                rxq_pages: HashMap::new(),
                filters: HashMap::new(),
                removed_filters: Vec::new(),
                next_filter_id: 100,
                supported: Self::DEFAULT_MATCHES.to_vec(),
                design: HwDesignParams {
                    rx_buffer_len: 256,
                    frame_offset_fixed: 64,
                    rx_stride: 4096,
                    rx_queues: 8,
                    tx_aperture_size: 4096,
                    tx_fifo_size: 32768,
                    ts_subnano_bit: 2,
                    unsol_credit_seq_mask: 0x7f,
                },
                evq_window: EvqWindow {
                    base: 0x8000_0000,
                    stride: 0x1000,
                },
                ctpio_size: CTPIO_REGION_SIZE,
            })),
            page_refs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the filter types hardware matches.
    pub fn set_supported_matches(&self, matches: Vec<FilterMatchFields>) {
        self.state.lock().supported = matches;
    }

    /// Sets the reported design parameters.
    pub fn set_design_params(&self, design: HwDesignParams) {
        self.state.lock().design = design;
    }

    /// Sets the reported event queue register window.
    pub fn set_evq_window(&self, window: EvqWindow) {
        self.state.lock().evq_window = window;
    }

    /// Sets the size reported for every CTPIO aperture.
    pub fn set_ctpio_size(&self, size: u64) {
        self.state.lock().ctpio_size = size;
    }

    /// Makes the next call to `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: TransportError) {
        self.state.lock().failures.insert(op, err);
    }

    /// The number of calls made to `op`, successful or not.
    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// The number of calls made to any operation.
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    /// The parameters event queue `qid` was bound with.
    pub fn evq(&self, qid: u32) -> Option<EvqParams> {
        self.state.lock().evqs.get(&qid).cloned()
    }

    /// The parameters transmit queue `qid` was bound with.
    pub fn txq(&self, qid: u32) -> Option<TxqParams> {
        self.state.lock().txqs.get(&qid).cloned()
    }

    /// Every transmit queue freed, in order.
    pub fn freed_txqs(&self) -> Vec<u32> {
        self.state.lock().freed_txqs.clone()
    }

    /// The number of hugepages bound to `qid`.
    pub fn bound_hugepages(&self, qid: u32) -> usize {
        self.state.lock().rxq_pages.get(&qid).copied().unwrap_or(0)
    }

    /// The number of hugepage references handed out and not yet released.
    pub fn outstanding_page_refs(&self) -> usize {
        self.page_refs.load(Ordering::SeqCst)
    }

    /// The parameters hardware filter `filter_id` was installed with.
    pub fn filter(&self, filter_id: u32) -> Option<FilterParams> {
        self.state.lock().filters.get(&filter_id).cloned()
    }

    /// The number of installed hardware filters.
    pub fn installed_filters(&self) -> usize {
        self.state.lock().filters.len()
    }

    /// Every hardware filter removal requested, in order.
    pub fn removed_filters(&self) -> Vec<u32> {
        self.state.lock().removed_filters.clone()
    }

    fn call(&self, op: &'static str) -> Result<MutexGuard<'_, EmulatedState>, TransportError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.remove(op) {
            Some(err) => {
                tracing::debug!(op, %err, "injected failure");
                Err(err)
            }
            None => Ok(state),
        }
    }
}

impl Default for EmulatedEfctDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EfctDevice for EmulatedEfctDevice {
    type Hugepage = EmulatedHugepage;
    type RxqShm = ();
    type Rxq = EmulatedRxq;

    fn init_evq(&self, params: &EvqParams) -> Result<(), TransportError> {
        let mut state = self.call("init_evq")?;
        if state.evqs.contains_key(&params.qid) {
            return Err(TransportError::Status(EINVAL));
        }
        state.evqs.insert(params.qid, params.clone());
        Ok(())
    }

    fn free_evq(&self, evq: u32) -> Result<(), TransportError> {
        let mut state = self.call("free_evq")?;
        state
            .evqs
            .remove(&evq)
            .map(drop)
            .ok_or(TransportError::NotBound)
    }

    fn init_txq(&self, params: &TxqParams) -> Result<u32, TransportError> {
        let mut state = self.call("init_txq")?;
        if state.txqs.contains_key(&params.qid) {
            return Err(TransportError::Status(EBUSY));
        }
        state.txqs.insert(params.qid, params.clone());
        Ok(params.qid)
    }

    fn free_txq(&self, txq: u32) -> Result<(), TransportError> {
        let mut state = self.call("free_txq")?;
        state.txqs.remove(&txq);
        state.freed_txqs.push(txq);
        Ok(())
    }

    fn rxq_bind(&self, params: &RxqBindParams<'_, ()>) -> Result<EmulatedRxq, TransportError> {
        drop(self.call("rxq_bind")?);
        for _ in 0..params.n_hugepages {
            if let Err(err) = params.hugetlb.alloc_hugepage() {
                tracing::debug!(error = %err, "hugepage allocation failed");
                return Err(TransportError::Status(ENOMEM));
            }
        }
        *self
            .state
            .lock()
            .rxq_pages
            .entry(params.qid)
            .or_default() += params.n_hugepages;
        Ok(EmulatedRxq {
            qid: params.qid,
            n_hugepages: params.n_hugepages,
        })
    }

    fn rxq_free(&self, rxq: EmulatedRxq, freer: RxqFreeFn) {
        {
            let mut state = self.state.lock();
            *state.calls.entry("rxq_free").or_default() += 1;
            if let Some(pages) = state.rxq_pages.get_mut(&rxq.qid) {
                *pages -= rxq.n_hugepages.min(*pages);
                if *pages == 0 {
                    state.rxq_pages.remove(&rxq.qid);
                }
            }
        }
        freer();
    }

    fn get_hugepages(
        &self,
        qid: u32,
        max: usize,
    ) -> Result<Vec<Option<EmulatedHugepage>>, TransportError> {
        let state = self.call("get_hugepages")?;
        let bound = *state.rxq_pages.get(&qid).ok_or(TransportError::NotBound)?;
        Ok((0..max)
            .map(|i| {
                (i < bound).then(|| {
                    self.page_refs.fetch_add(1, Ordering::SeqCst);
                    EmulatedHugepage {
                        refs: self.page_refs.clone(),
                    }
                })
            })
            .collect())
    }

    fn filter_insert(&self, params: &FilterParams) -> Result<FilterInsertOut, TransportError> {
        let mut state = self.call("filter_insert")?;
        let filter_id = state.next_filter_id;
        state.next_filter_id += 1;
        state.filters.insert(filter_id, params.clone());
        Ok(FilterInsertOut {
            rxq: filter_id % 8,
            filter_id,
            filter_handle: 0xf000 + u64::from(filter_id),
        })
    }

    fn filter_remove(&self, filter_id: u32) -> Result<(), TransportError> {
        let mut state = self.call("filter_remove")?;
        state.removed_filters.push(filter_id);
        state
            .filters
            .remove(&filter_id)
            .map(drop)
            .ok_or(TransportError::Status(EINVAL))
    }

    fn is_filter_supported(&self, spec: &EthtoolFlowSpec) -> bool {
        let mut state = self.state.lock();
        *state.calls.entry("is_filter_supported").or_default() += 1;
        state.supported.contains(&spec.match_fields())
    }

    fn design_params(&self) -> Result<HwDesignParams, TransportError> {
        Ok(self.call("design_params")?.design)
    }

    fn evq_window(&self) -> Result<EvqWindow, TransportError> {
        Ok(self.call("evq_window")?.evq_window)
    }

    fn fw_rpc(&self, cmd: u32, input: &[u8], output: &mut [u8]) -> Result<usize, TransportError> {
        let state = self.call("fw_rpc")?;
        let op = GetParserDispInfoIn::read_from_bytes(input)
            .map_err(|_| TransportError::Status(EINVAL))?
            .op;
        if cmd != MC_CMD_GET_PARSER_DISP_INFO || op != GET_PARSER_DISP_INFO_OP_GET_SUPPORTED_RX_MATCHES
        {
            return Err(TransportError::Status(EINVAL));
        }
        let hdr = GetParserDispInfoOutHdr {
            op,
            num_supported_matches: state.supported.len() as u32,
        };
        let mut response = hdr.as_bytes().to_vec();
        for fields in &state.supported {
            response.extend_from_slice(fields.as_bytes());
        }
        if response.len() > output.len() {
            return Err(TransportError::Status(EINVAL));
        }
        output[..response.len()].copy_from_slice(&response);
        Ok(response.len())
    }

    fn ctpio_addr(&self, instance: u32) -> Result<CtpioRegion, TransportError> {
        let state = self.call("ctpio_addr")?;
        Ok(CtpioRegion {
            addr: 0x4000_0000 + u64::from(instance) * CTPIO_REGION_SIZE,
            size: state.ctpio_size,
        })
    }
}
