// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface to an EFCT NIC, as consumed by the NIC layer.

use crate::caps::query_filter_flags;
use crate::caps::NicFilterFlags;
use crate::caps::NicFlags;
use crate::caps::QueueSizes;
use crate::client::DeviceClient;
use crate::design_params::NicDesignParameters;
use crate::device::EfctDevice;
use crate::device::RxqFreeFn;
use crate::device::TxqParams;
use crate::evq::EventQueueTable;
use crate::evq::EvqEnableParams;
use crate::evq::FlushOutcome;
use crate::evq::FlushState;
use crate::evq::HandlerSlot;
use crate::evq::NicEventHandler;
use crate::filter_table::FilterInfo;
use crate::filter_table::FilterInserted;
use crate::filter_table::FilterState;
use crate::filters;
use crate::filters::FilterRequest;
use crate::hugepages::HugepageLedger;
use crate::hugepages::HugetlbAllocator;
use crate::hugepages::RxqBindRequest;
use crate::vi_alloc::ViAllocators;
use crate::vi_alloc::ViConstraints;
use crate::Error;
use efct_defs::EvqPrimeDoorbell;
use efct_defs::CTPIO_REGION_SIZE;
use efct_defs::EVQ_PRIME_EVQ_ID_WIDTH;
use efct_defs::EVQ_PRIME_READ_IDX_WIDTH;
use efct_defs::MAX_EFCT_RXQS;
use efct_defs::MAX_HUGEPAGES;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// The default delay between scans for transmit flush completions.
pub const DEFAULT_FLUSH_RECHECK_DELAY: Duration = Duration::from_millis(100);

/// Construction-time NIC configuration.
#[derive(Debug, Clone)]
pub struct EfctNicConfig {
    /// The transmit queue served by each hardware event queue, if any. Event
    /// queues at or beyond this length are dummies.
    pub evq_txqs: Vec<Option<u32>>,
    /// The first VI instance of the NIC's register window.
    pub vi_min: u32,
    /// One past the last allocatable VI instance.
    pub vi_lim: u32,
    /// The most hugepages one receive queue may hold.
    pub hugepage_cap: usize,
    /// The delay between scans for transmit flush completions.
    pub flush_recheck_delay: Duration,
}

impl EfctNicConfig {
    /// Creates a configuration with `vi_min` of zero and default limits.
    pub fn new(evq_txqs: Vec<Option<u32>>, vi_lim: u32) -> Self {
        Self {
            evq_txqs,
            vi_min: 0,
            vi_lim,
            hugepage_cap: MAX_HUGEPAGES,
            flush_recheck_delay: DEFAULT_FLUSH_RECHECK_DELAY,
        }
    }
}

/// The register through which event queue wakeups are requested.
pub trait WakeupRegister: Send + Sync {
    /// Writes the doorbell register.
    fn write_u32(&self, value: u32);
}

/// Parameters for binding a DMA queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaqParams {
    /// The event queue instance.
    pub evq: u32,
    /// The DMA queue instance requested by the NIC layer.
    pub dmaq: u32,
    /// A label echoed in completion events.
    pub tag: u32,
}

/// An I/O region mapped for a VI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRegion {
    /// Physical address of the region.
    pub addr: u64,
    /// Size of the region in bytes.
    pub size: u64,
}

/// What the NIC reports to the NIC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicCapabilities {
    /// The permanent MAC address.
    pub mac_addr: [u8; 6],
    /// NIC capabilities.
    pub flags: NicFlags,
    /// Supported filter types.
    pub filter_flags: NicFilterFlags,
    /// Supported queue sizes.
    pub q_sizes: QueueSizes,
}

/// An EFCT NIC.
pub struct EfctNic<T: EfctDevice> {
    client: DeviceClient<T>,
    vi_min: u32,
    evqs: EventQueueTable,
    vis: ViAllocators,
    hugepages: HugepageLedger,
    filters: FilterState,
    handler: Arc<HandlerSlot>,
    caps: Mutex<NicCapabilities>,
    wakeup: Arc<dyn WakeupRegister>,
}

impl<T: EfctDevice> EfctNic<T> {
    /// Creates the NIC. No hardware operation is issued until the NIC layer
    /// calls in.
    ///
    /// Panics if the VI range of `config` does not cover its event queues.
    pub fn new(device: T, config: EfctNicConfig, wakeup: Arc<dyn WakeupRegister>) -> Self {
        let evq_count = config.evq_txqs.len() as u32;
        assert!(config.vi_min <= evq_count && evq_count <= config.vi_lim);
        assert!(config.hugepage_cap <= MAX_HUGEPAGES);
        Self {
            client: DeviceClient::new(device),
            vi_min: config.vi_min,
            evqs: EventQueueTable::new(&config.evq_txqs, config.flush_recheck_delay),
            vis: ViAllocators::new(evq_count, config.vi_lim),
            hugepages: HugepageLedger::new(config.hugepage_cap),
            filters: FilterState::new(),
            handler: Arc::new(RwLock::new(None)),
            caps: Mutex::new(NicCapabilities {
                mac_addr: [0; 6],
                flags: NicFlags::new(),
                filter_flags: NicFilterFlags::new(),
                q_sizes: QueueSizes {
                    evq: 0,
                    txq: 0,
                    rxq: 0,
                },
            }),
            wakeup,
        }
    }

    /// The number of hardware event queues.
    pub fn evq_count(&self) -> u32 {
        self.evqs.evq_count()
    }

    /// The capabilities reported so far.
    pub fn capabilities(&self) -> NicCapabilities {
        *self.caps.lock()
    }

    /// Reports the supported queue sizes.
    pub fn sw_ctor(&self) -> QueueSizes {
        let mut caps = self.caps.lock();
        caps.q_sizes = QueueSizes::EFCT;
        caps.q_sizes
    }

    /// Registers the event handler and discovers the capabilities of the
    /// hardware. A failed filter type query leaves only software filtering.
    pub fn init_hardware(&self, handler: Arc<dyn NicEventHandler>, mac_addr: [u8; 6]) {
        *self.handler.write() = Some(handler);

        let mut filter_flags = query_filter_flags(&self.client).with_ipx_vlan_sw(true);
        if filter_flags.rx_type_mcast_mismatch() {
            filter_flags.set_rx_type_mcast_all(true);
        }

        let mut caps = self.caps.lock();
        caps.mac_addr = mac_addr;
        caps.flags = NicFlags::EFCT;
        caps.filter_flags = filter_flags;
        tracing::info!(flags = ?caps.flags, ?filter_flags, "efct hardware initialized");
    }

    /// Reports the event queue requirements that hold after a reset.
    pub fn post_reset(&self) {
        let mut caps = self.caps.lock();
        caps.flags = caps.flags.with_phys_contig_evq(true).with_evq_irq(true);
    }

    /// Unregisters the event handler. Every filter must have been removed.
    pub fn release_hardware(&self) {
        debug_assert!(self.filters.is_empty(), "filters remain at teardown");
        *self.handler.write() = None;
    }

    /// Detaches the device, waiting for in-flight operations to finish. Every
    /// later operation fails with [`Error::DeviceUnavailable`].
    pub fn detach(&self) -> Option<Arc<T>> {
        self.client.detach()
    }

    /// Binds an event queue and arms its flush tracking. Dummy event queues
    /// are accepted without any hardware operation.
    pub fn event_queue_enable(&self, params: EvqEnableParams) -> Result<(), Error> {
        self.evqs.enable(&self.client, &self.handler, params)
    }

    /// Stops flush tracking, waits for a running scan to finish and frees the
    /// event queue. Failures are logged.
    pub fn event_queue_disable(&self, evq: u32) {
        self.evqs.disable(&self.client, evq)
    }

    /// Returns the flush state of `evq`, or `None` for a dummy queue.
    pub fn flush_state(&self, evq: u32) -> Option<FlushState> {
        self.evqs.flush_state(evq)
    }

    /// Returns whether a flush scan of `evq` is scheduled.
    pub fn flush_recheck_pending(&self, evq: u32) -> bool {
        self.evqs.recheck_pending(evq)
    }

    #[cfg(test)]
    pub(crate) fn flush_worker_threads(&self) -> usize {
        self.evqs.worker_threads()
    }

    /// Waits for at least `runs` flush scans on `evq` to complete, returning
    /// the number completed.
    pub fn wait_for_flush_rechecks(&self, evq: u32, runs: u64, timeout: Duration) -> u64 {
        self.evqs.wait_for_rechecks(evq, runs, timeout)
    }

    /// Rings the doorbell for `vi_id`, requesting a wakeup once events beyond
    /// `rptr` arrive.
    pub fn wakeup_request(&self, vi_id: u32, rptr: u32) {
        assert!(vi_id < 1 << EVQ_PRIME_EVQ_ID_WIDTH);
        assert!(rptr < 1 << EVQ_PRIME_READ_IDX_WIDTH);
        let doorbell = EvqPrimeDoorbell::new()
            .with_evq_id(vi_id as u16)
            .with_read_idx(rptr as u16);
        self.wakeup.write_u32(doorbell.into());
    }

    /// Allocates one VI instance satisfying `constraints`. Only `n_vis == 1`
    /// is supported.
    pub fn vi_alloc(&self, constraints: ViConstraints, n_vis: u32) -> Result<u32, Error> {
        if n_vis != 1 {
            return Err(Error::NotSupported("multi-instance vi allocation"));
        }
        let _device = self.client.acquire()?;
        self.vis
            .alloc(constraints, |instance| self.evqs.txq(instance).is_some())
            .ok_or(Error::ViExhausted)
    }

    /// Returns a VI instance to its allocator.
    pub fn vi_free(&self, instance: u32, n_vis: u32) {
        assert_eq!(n_vis, 1);
        match self.client.acquire() {
            Ok(_device) => self.vis.free(instance),
            Err(err) => tracing::warn!(
                instance,
                error = &err as &dyn std::error::Error,
                "not freeing vi"
            ),
        }
    }

    /// Binds the transmit queue of event queue `params.evq`, returning the
    /// hardware queue id.
    ///
    /// Panics if the event queue has no transmit queue.
    pub fn dmaq_tx_q_init(&self, params: &DmaqParams) -> Result<u32, Error> {
        let Some(txq) = self.evqs.txq(params.evq) else {
            panic!("evq {} has no transmit queue", params.evq);
        };
        let txq_params = TxqParams {
            evq: params.evq,
            qid: txq,
            label: params.tag,
        };
        let qid = self
            .client
            .acquire()?
            .init_txq(&txq_params)
            .map_err(Error::Transport)?;
        tracing::debug!(evq = params.evq, dmaq = params.dmaq, qid, "txq initialized");
        Ok(qid)
    }

    /// Receive queues are bound with [`EfctNic::rxq_bind`], so there is
    /// nothing to do here.
    pub fn dmaq_rx_q_init(&self, params: &DmaqParams) -> u32 {
        params.dmaq
    }

    /// Frees transmit queue `dmaq` and schedules a scan of `evq` for its
    /// flush completion.
    pub fn flush_tx_dma_channel(&self, dmaq: u32, evq: u32) -> Result<FlushOutcome, Error> {
        self.evqs.flush_tx(&self.client, dmaq, evq)
    }

    /// Receive queues need no flush.
    pub fn flush_rx_dma_channel(&self, _dmaq: u32) -> FlushOutcome {
        FlushOutcome::AlreadyComplete
    }

    /// DMA addresses are used untranslated.
    pub fn translate_dma_addrs(&self, src: &[u64], dst: &mut [u64]) {
        dst.copy_from_slice(src);
    }

    /// EFCT has no buffer table.
    pub fn buffer_table_orders(&self) -> &'static [u32] {
        &[]
    }

    /// Installs a filter, in hardware where possible.
    pub fn filter_insert(&self, request: &FilterRequest) -> Result<FilterInserted, Error> {
        filters::insert_filter(&self.client, &self.filters, request)
    }

    /// Drops a reference to a filter. Hardware removal failures are logged.
    pub fn filter_remove(&self, filter_id: u32) {
        filters::remove_filter(&self.client, &self.filters, filter_id)
    }

    /// Describes an installed filter.
    pub fn filter_query(&self, filter_id: u32) -> Result<FilterInfo, Error> {
        Ok(self.filters.query(filter_id)?)
    }

    /// Blocks or unblocks multicast traffic no filter matches.
    pub fn multicast_block(&self, block: bool) {
        self.filters.set_multicast_block(block)
    }

    /// Blocks or unblocks unicast traffic no filter matches.
    pub fn unicast_block(&self, block: bool) {
        self.filters.set_unicast_block(block)
    }

    /// Returns whether multicast and unicast mismatch traffic is blocked.
    pub fn mismatch_blocked(&self) -> (bool, bool) {
        self.filters.blocked()
    }

    /// The event queue register region of VI `instance`.
    pub fn vi_io_region(&self, instance: u32) -> Result<IoRegion, Error> {
        assert!(instance >= self.vi_min);
        let window = self
            .client
            .acquire()?
            .evq_window()
            .map_err(Error::Transport)?;
        Ok(IoRegion {
            addr: window.base + u64::from(instance - self.vi_min) * window.stride,
            size: window.stride,
        })
    }

    /// The CTPIO aperture address of VI `instance`.
    pub fn ctpio_addr(&self, instance: u32) -> Result<u64, Error> {
        let region = self
            .client
            .acquire()?
            .ctpio_addr(instance)
            .map_err(Error::Transport)?;
        if region.size != CTPIO_REGION_SIZE {
            tracing::error!(instance, size = region.size, "unexpected ctpio region size");
            return Err(Error::NotSupported("ctpio region size"));
        }
        Ok(region.addr)
    }

    /// Reports the design parameters to a consumer, failing if the consumer
    /// assumes a value that differs from hardware.
    pub fn design_parameters(&self, dp: &mut NicDesignParameters) -> Result<(), Error> {
        let hw = self
            .client
            .acquire()?
            .design_params()
            .map_err(Error::Transport)?;
        dp.apply(&hw)
    }

    /// The most shared receive queues a NIC exposes.
    pub fn max_shared_rxqs(&self) -> usize {
        MAX_EFCT_RXQS
    }

    /// The most hugepages one receive queue may hold.
    pub fn hugepage_cap(&self) -> usize {
        self.hugepages.cap()
    }

    /// Counts the hugepages bound to receive queue `qid`.
    pub fn used_hugepages(&self, qid: u32) -> Result<usize, Error> {
        self.hugepages.used_hugepages(&self.client, qid)
    }

    /// Binds hugepages to a receive queue, drawing new pages from `hugetlb`.
    pub fn rxq_bind(
        &self,
        request: &RxqBindRequest<'_, T::RxqShm>,
        hugetlb: Arc<dyn HugetlbAllocator>,
    ) -> Result<T::Rxq, Error> {
        self.hugepages.bind(&self.client, request, hugetlb)
    }

    /// Releases a receive queue, calling `freer` once hardware is done.
    pub fn rxq_free(&self, rxq: T::Rxq, freer: RxqFreeFn) -> Result<(), Error> {
        self.hugepages.free(&self.client, rxq, freer)
    }

    /// References the hugepages bound to receive queue `qid`.
    pub fn get_hugepages(
        &self,
        qid: u32,
        n_pages: usize,
    ) -> Result<Vec<Option<T::Hugepage>>, Error> {
        self.hugepages.get_hugepages(&self.client, qid, n_pages)
    }

    /// Returns whether a hugetlb allocator is registered by a bind in
    /// progress.
    pub fn hugetlb_provided(&self) -> bool {
        self.hugepages.provider().current().is_some()
    }
}
