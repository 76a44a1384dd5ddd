// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module drives the emulated EFCT device through [`EfctNic`] to test the
//! end-to-end flows.

use crate::design_params::DesignParam;
use crate::design_params::NicDesignParameters;
use crate::device::CpuMask;
use crate::device::EvqWindow;
use crate::device::HwDesignParams;
use crate::device::TransportError;
use crate::emulated::EmulatedEfctDevice;
use crate::emulated::EmulatedRxq;
use crate::filters::FilterInsertFlags;
use crate::filters::FilterRequest;
use crate::flow::Flow;
use crate::flow::FilterSpec;
use crate::flow::MacGroup;
use crate::flow::IPPROTO_TCP;
use crate::flow::IPPROTO_UDP;
use crate::hugepages::HugetlbAllocator;
use crate::hugepages::RxqBindRequest;
use crate::memory::EventQueueMemory;
use crate::memory::HeapEventQueue;
use crate::DmaqParams;
use crate::EfctNic;
use crate::EfctNicConfig;
use crate::Error;
use crate::EvqEnableParams;
use crate::FilterTableError;
use crate::FlushOutcome;
use crate::FlushState;
use crate::NicEventHandler;
use crate::NicFilterFlags;
use crate::NicFlags;
use crate::QueueSizes;
use crate::ViConstraints;
use crate::WakeupRegister;
use efct_defs::EfctEvent;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(10);
const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
const REMOTE: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);

fn init_tracing() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::filter::Targets;
    use tracing_subscriber::prelude::*;

    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));
        tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

#[derive(Default)]
struct RecordingHandler {
    flushed: Mutex<Vec<u32>>,
}

impl NicEventHandler for RecordingHandler {
    fn handle_txdmaq_flushed(&self, txq: u32) {
        self.flushed.lock().push(txq);
    }
}

#[derive(Default)]
struct RecordingDoorbell {
    writes: Mutex<Vec<u32>>,
}

impl WakeupRegister for RecordingDoorbell {
    fn write_u32(&self, value: u32) {
        self.writes.lock().push(value);
    }
}

#[derive(Default)]
struct CountingAllocator {
    allocated: AtomicUsize,
}

impl HugetlbAllocator for CountingAllocator {
    fn alloc_hugepage(&self) -> anyhow::Result<u64> {
        let n = self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(0x4000_0000 + n as u64 * 0x20_0000)
    }
}

struct TestNic {
    nic: EfctNic<EmulatedEfctDevice>,
    device: EmulatedEfctDevice,
    handler: Arc<RecordingHandler>,
    doorbell: Arc<RecordingDoorbell>,
}

fn test_nic_with(config: EfctNicConfig) -> TestNic {
    init_tracing();
    let device = EmulatedEfctDevice::new();
    let doorbell = Arc::new(RecordingDoorbell::default());
    let handler = Arc::new(RecordingHandler::default());
    let nic = EfctNic::new(device.clone(), config, doorbell.clone());
    nic.sw_ctor();
    nic.init_hardware(handler.clone(), [0, 0x0f, 0x53, 0, 0, 1]);
    TestNic {
        nic,
        device,
        handler,
        doorbell,
    }
}

/// Four hardware event queues, the first two with transmit queues, and four
/// receive-only instances.
fn test_nic(flush_recheck_delay: Duration) -> TestNic {
    test_nic_with(EfctNicConfig {
        flush_recheck_delay,
        ..EfctNicConfig::new(vec![Some(0), Some(1), None, None], 8)
    })
}

fn enable_params(evq: u32, mem: &Arc<HeapEventQueue>) -> EvqEnableParams {
    EvqEnableParams {
        evq,
        entries: mem.len() as u32,
        dma_addrs: vec![0x10_0000 + u64::from(evq) * 0x1000],
        mem: mem.clone(),
        wakeup_channel: Some(evq),
        tx_timestamps: false,
    }
}

fn wait_for_flush_state(nic: &EfctNic<EmulatedEfctDevice>, evq: u32, state: FlushState) {
    let deadline = Instant::now() + TIMEOUT;
    while nic.flush_state(evq) != Some(state) {
        assert!(Instant::now() < deadline, "timed out waiting for {state:?}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn filter_request(spec: FilterSpec, flags: FilterInsertFlags) -> FilterRequest {
    FilterRequest {
        spec,
        rxq: None,
        excl_token: 1,
        mask: CpuMask::All,
        flags,
    }
}

fn bind(
    t: &TestNic,
    qid: u32,
    n_hugepages: usize,
    alloc: &Arc<CountingAllocator>,
) -> Result<EmulatedRxq, Error> {
    t.nic.rxq_bind(
        &RxqBindRequest {
            qid,
            timestamp_req: false,
            n_hugepages,
            shm: &(),
            wakeup_instance: qid,
        },
        alloc.clone(),
    )
}

#[test]
fn test_evq_enable_disable() {
    let t = test_nic(Duration::from_millis(10));
    let mem = Arc::new(HeapEventQueue::new(512));
    let params = EvqEnableParams {
        tx_timestamps: true,
        ..enable_params(1, &mem)
    };
    t.nic.event_queue_enable(params).unwrap();

    let evq = t.device.evq(1).unwrap();
    assert_eq!(evq.entries, 512);
    assert_eq!(evq.q_size, 4096);
    assert_eq!(evq.q_page, 0x10_1000);
    assert!(evq.subscribe_time_sync);
    assert_eq!(evq.unsol_credit, 15);
    assert_eq!(evq.irq, Some(1));
    assert_eq!(t.nic.flush_state(1), Some(FlushState::Idle));
    assert!(!t.nic.flush_recheck_pending(1));

    assert!(matches!(
        t.nic.event_queue_enable(enable_params(1, &mem)),
        Err(Error::EvqAlreadyEnabled(1))
    ));

    t.nic.event_queue_disable(1);
    assert!(t.device.evq(1).is_none());
    assert_eq!(t.device.call_count("free_evq"), 1);
    assert_eq!(t.nic.flush_state(1), Some(FlushState::Disabled));
}

#[test]
fn test_evq_without_timestamps_has_no_credit() {
    let t = test_nic(Duration::from_millis(10));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(0, &mem)).unwrap();
    let evq = t.device.evq(0).unwrap();
    assert!(!evq.subscribe_time_sync);
    assert_eq!(evq.unsol_credit, 0);
    t.nic.event_queue_disable(0);
}

#[test]
fn test_evq_enable_failure_retains_nothing() {
    let t = test_nic(Duration::from_millis(10));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.device.fail_next("init_evq", TransportError::Status(-5));
    let err = t.nic.event_queue_enable(enable_params(2, &mem)).unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Status(-5))));
    assert_eq!(t.nic.flush_state(2), Some(FlushState::Disabled));
    assert!(matches!(
        t.nic.flush_tx_dma_channel(2, 2),
        Err(Error::EvqNotEnabled(2))
    ));

    t.nic.event_queue_enable(enable_params(2, &mem)).unwrap();
    assert_eq!(t.nic.flush_state(2), Some(FlushState::Idle));
    t.nic.event_queue_disable(2);
}

#[test]
fn test_dummy_evq_issues_no_transport_calls() {
    let t = test_nic(Duration::from_millis(10));
    let calls = t.device.total_calls();
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(4, &mem)).unwrap();
    t.nic.event_queue_enable(enable_params(100, &mem)).unwrap();
    t.nic.event_queue_disable(100);
    t.nic.event_queue_disable(4);
    assert_eq!(t.device.total_calls(), calls);
    assert_eq!(t.nic.flush_state(4), None);
}

#[test]
fn test_tx_flush_completes() {
    let t = test_nic(Duration::from_millis(5));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(1, &mem)).unwrap();

    let outcome = t.nic.flush_tx_dma_channel(1, 1).unwrap();
    assert_eq!(outcome, FlushOutcome::Pending);
    assert_eq!(t.device.freed_txqs(), [1]);

    assert!(t.nic.wait_for_flush_rechecks(1, 1, TIMEOUT) >= 1);
    assert_eq!(t.nic.flush_state(1), Some(FlushState::Flushing(1)));
    assert!(t.handler.flushed.lock().is_empty());

    mem.write_event(37, EfctEvent::tx_flush(1));
    wait_for_flush_state(&t.nic, 1, FlushState::Idle);
    assert_eq!(*t.handler.flushed.lock(), [1]);

    // Nothing further is reported once the flush is accounted for.
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(*t.handler.flushed.lock(), [1]);
    assert!(!t.nic.flush_recheck_pending(1));

    t.nic.event_queue_disable(1);
}

#[test]
fn test_each_flush_is_reported_once() {
    let t = test_nic(Duration::from_millis(5));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(0, &mem)).unwrap();

    mem.write_event(0, EfctEvent::tx_flush(0));
    t.nic.flush_tx_dma_channel(0, 0).unwrap();
    wait_for_flush_state(&t.nic, 0, FlushState::Idle);
    assert_eq!(*t.handler.flushed.lock(), [0]);

    mem.clear();
    t.nic.flush_tx_dma_channel(0, 0).unwrap();
    assert!(t.nic.wait_for_flush_rechecks(0, 2, TIMEOUT) >= 2);
    assert_eq!(*t.handler.flushed.lock(), [0]);
    mem.write_event(5, EfctEvent::tx_flush(0));
    wait_for_flush_state(&t.nic, 0, FlushState::Idle);
    assert_eq!(*t.handler.flushed.lock(), [0, 0]);

    t.nic.event_queue_disable(0);
}

#[test]
fn test_flush_without_marker_reschedules() {
    let t = test_nic(Duration::from_secs(3600));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(1, &mem)).unwrap();
    // Records of other kinds do not complete the flush.
    mem.write_event(
        3,
        EfctEvent::tx_flush(1).with_flush_type(efct_defs::EfctFlushType::RX.0),
    );

    t.nic.flush_tx_dma_channel(1, 1).unwrap();
    assert_eq!(t.nic.wait_for_flush_rechecks(1, 1, TIMEOUT), 1);
    assert_eq!(t.nic.flush_state(1), Some(FlushState::Flushing(1)));
    assert!(t.nic.flush_recheck_pending(1));
    assert!(t.handler.flushed.lock().is_empty());

    // A second flush while the recheck is pending does not reschedule it.
    t.nic.flush_tx_dma_channel(1, 1).unwrap();
    assert_eq!(t.nic.flush_state(1), Some(FlushState::Flushing(2)));

    t.nic.event_queue_disable(1);
    assert!(!t.nic.flush_recheck_pending(1));
    assert_eq!(t.nic.flush_state(1), Some(FlushState::Disabled));
}

#[test]
fn test_disable_during_flush_stops_rechecks() {
    let t = test_nic(Duration::from_millis(1));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(0, &mem)).unwrap();
    t.nic.flush_tx_dma_channel(0, 0).unwrap();
    assert!(t.nic.wait_for_flush_rechecks(0, 3, TIMEOUT) >= 3);

    t.nic.event_queue_disable(0);
    assert!(!t.nic.flush_recheck_pending(0));
    mem.write_event(0, EfctEvent::tx_flush(0));
    std::thread::sleep(Duration::from_millis(20));
    assert!(t.handler.flushed.lock().is_empty());
    assert_eq!(t.nic.flush_state(0), Some(FlushState::Disabled));
}

#[test]
fn test_flush_rechecks_share_one_thread() {
    let t = test_nic_with(EfctNicConfig {
        flush_recheck_delay: Duration::from_millis(5),
        ..EfctNicConfig::new((0..16).map(Some).collect(), 16)
    });
    assert_eq!(t.nic.flush_worker_threads(), 0);
    let mems: Vec<_> = (0..16)
        .map(|evq| {
            let mem = Arc::new(HeapEventQueue::new(128));
            t.nic.event_queue_enable(enable_params(evq, &mem)).unwrap();
            mem
        })
        .collect();
    assert_eq!(t.nic.flush_worker_threads(), 1);

    for (evq, mem) in (0..16).zip(&mems) {
        t.nic.flush_tx_dma_channel(evq, evq).unwrap();
        mem.write_event(evq as usize, EfctEvent::tx_flush(evq as u16));
    }
    for evq in 0..16 {
        wait_for_flush_state(&t.nic, evq, FlushState::Idle);
    }
    let mut flushed = t.handler.flushed.lock().clone();
    flushed.sort_unstable();
    assert_eq!(flushed, (0..16).collect::<Vec<_>>());
    assert_eq!(t.nic.flush_worker_threads(), 1);

    for evq in 0..16 {
        t.nic.event_queue_disable(evq);
    }
}

#[test]
fn test_flush_errors() {
    let t = test_nic(Duration::from_millis(10));
    assert!(matches!(
        t.nic.flush_tx_dma_channel(0, 0),
        Err(Error::EvqNotEnabled(0))
    ));
    assert_eq!(t.device.call_count("free_txq"), 0);

    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(0, &mem)).unwrap();
    t.device.fail_next("free_txq", TransportError::Status(-16));
    assert!(matches!(
        t.nic.flush_tx_dma_channel(0, 0),
        Err(Error::Transport(TransportError::Status(-16)))
    ));
    assert_eq!(t.nic.flush_state(0), Some(FlushState::Idle));
    t.nic.event_queue_disable(0);

    let calls = t.device.total_calls();
    assert_eq!(t.nic.flush_rx_dma_channel(7), FlushOutcome::AlreadyComplete);
    assert_eq!(t.device.total_calls(), calls);
}

#[test]
fn test_hugepage_budget() {
    let t = test_nic_with(EfctNicConfig {
        hugepage_cap: 8,
        ..EfctNicConfig::new(vec![Some(0)], 4)
    });
    let alloc = Arc::new(CountingAllocator::default());

    // Another binder already holds two pages on the queue.
    let _other = bind(&t, 5, 2, &alloc).unwrap();
    let first = bind(&t, 5, 3, &alloc).unwrap();
    assert_eq!(t.device.bound_hugepages(5), 5);
    assert_eq!(t.nic.used_hugepages(5).unwrap(), 5);

    let binds = t.device.call_count("rxq_bind");
    let err = bind(&t, 5, 4, &alloc).unwrap_err();
    assert!(matches!(
        err,
        Error::HugepageBudget {
            qid: 5,
            requested: 4,
            used: 5,
            limit: 8,
        }
    ));
    assert_eq!(t.device.call_count("rxq_bind"), binds);
    assert_eq!(t.device.bound_hugepages(5), 5);
    assert_eq!(alloc.allocated.load(Ordering::SeqCst), 5);
    assert_eq!(t.device.outstanding_page_refs(), 0);
    assert!(!t.nic.hugetlb_provided());

    // Freeing makes room again.
    let freed = Arc::new(AtomicUsize::new(0));
    t.nic
        .rxq_free(first, {
            let freed = freed.clone();
            Box::new(move || {
                freed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
    assert_eq!(t.device.bound_hugepages(5), 2);
    bind(&t, 5, 4, &alloc).unwrap();
    assert_eq!(t.device.bound_hugepages(5), 6);
}

#[test]
fn test_hugepage_budget_is_per_queue() {
    let t = test_nic_with(EfctNicConfig {
        hugepage_cap: 4,
        ..EfctNicConfig::new(vec![Some(0)], 4)
    });
    let alloc = Arc::new(CountingAllocator::default());
    bind(&t, 0, 4, &alloc).unwrap();
    bind(&t, 1, 4, &alloc).unwrap();
    assert!(matches!(
        bind(&t, 1, 1, &alloc),
        Err(Error::HugepageBudget { .. })
    ));
}

#[test]
fn test_oversized_hugepage_request_is_rejected() {
    let t = test_nic(Duration::from_millis(10));
    let alloc = Arc::new(CountingAllocator::default());
    bind(&t, 0, 1, &alloc).unwrap();
    let binds = t.device.call_count("rxq_bind");
    assert!(matches!(
        bind(&t, 0, usize::MAX, &alloc),
        Err(Error::HugepageBudget {
            qid: 0,
            requested: usize::MAX,
            used: 1,
            ..
        })
    ));
    assert_eq!(t.device.call_count("rxq_bind"), binds);
    assert_eq!(alloc.allocated.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hugepage_query_failure_aborts_bind() {
    let t = test_nic(Duration::from_millis(10));
    let alloc = Arc::new(CountingAllocator::default());
    t.device.fail_next("get_hugepages", TransportError::Status(-5));
    assert!(matches!(
        bind(&t, 0, 1, &alloc),
        Err(Error::Transport(TransportError::Status(-5)))
    ));
    assert_eq!(t.device.call_count("rxq_bind"), 0);
    assert!(!t.nic.hugetlb_provided());

    // An unbound queue has no hugepages in use.
    assert_eq!(t.nic.used_hugepages(0).unwrap(), 0);
    bind(&t, 0, 1, &alloc).unwrap();
    let pages = t.nic.get_hugepages(0, 4).unwrap();
    assert_eq!(pages.iter().flatten().count(), 1);
    assert_eq!(t.device.outstanding_page_refs(), 1);
    drop(pages);
    assert_eq!(t.device.outstanding_page_refs(), 0);
}

#[test]
fn test_exclusive_filter() {
    let t = test_nic(Duration::from_millis(10));
    let excl = FilterInsertFlags::new().with_excl_rxq(true);

    let inserted = t
        .nic
        .filter_insert(&filter_request(
            FilterSpec::ip_local(IPPROTO_TCP, LOCAL.into(), 80),
            excl,
        ))
        .unwrap();
    let info = t.nic.filter_query(inserted.filter_id).unwrap();
    let hw_id = info.hw_id.unwrap();
    assert!(info.flags.use_hw());
    assert!(!info.flags.use_sw());
    assert_eq!(info.rxq, inserted.rxq);
    let params = t.device.filter(hw_id).unwrap();
    assert!(params.flags.exclusive_queue());

    t.nic.filter_remove(inserted.filter_id);
    assert_eq!(t.device.removed_filters(), [hw_id]);
    assert!(matches!(
        t.nic.filter_query(inserted.filter_id),
        Err(Error::FilterTable(FilterTableError::NotFound(_)))
    ));
}

#[test]
fn test_exclusive_filter_requires_exact_support() {
    let t = test_nic(Duration::from_millis(10));
    let err = t
        .nic
        .filter_insert(&filter_request(
            FilterSpec::ip_full(IPPROTO_TCP, LOCAL.into(), 80, REMOTE.into(), 5000),
            FilterInsertFlags::new().with_excl_rxq(true),
        ))
        .unwrap_err();
    assert!(matches!(err, Error::ExclusiveFilterUnsupported));
    assert_eq!(t.device.call_count("filter_insert"), 0);

    // VLAN filters are not widened for exclusive queues either.
    let err = t
        .nic
        .filter_insert(&filter_request(
            FilterSpec::eth_local([2, 0, 0, 0, 0, 1]).with_vlan(10),
            FilterInsertFlags::new().with_excl_rxq(true),
        ))
        .unwrap_err();
    assert!(matches!(err, Error::ExclusiveFilterUnsupported));
    t.nic.release_hardware();
}

#[test]
fn test_shared_filter_falls_back_to_software() {
    let t = test_nic(Duration::from_millis(10));
    let inserted = t
        .nic
        .filter_insert(&FilterRequest {
            rxq: Some(3),
            ..filter_request(
                FilterSpec::ip_full(IPPROTO_TCP, LOCAL.into(), 80, REMOTE.into(), 5000),
                FilterInsertFlags::new(),
            )
        })
        .unwrap();
    assert_eq!(inserted.rxq, Some(3));
    let info = t.nic.filter_query(inserted.filter_id).unwrap();
    assert!(info.flags.use_sw());
    assert!(!info.flags.use_hw());
    assert_eq!(info.hw_id, None);
    assert_eq!(t.device.call_count("filter_insert"), 0);

    t.nic.filter_remove(inserted.filter_id);
    assert_eq!(t.device.call_count("filter_remove"), 0);
    t.nic.release_hardware();
}

#[test]
fn test_shared_filter_is_widened() {
    let t = test_nic(Duration::from_millis(10));
    let group = Ipv4Addr::new(239, 0, 0, 9);
    let inserted = t
        .nic
        .filter_insert(&filter_request(
            FilterSpec::ip_full(IPPROTO_UDP, group.into(), 5000, REMOTE.into(), 6000),
            FilterInsertFlags::new().with_any_rxq(true),
        ))
        .unwrap();
    let info = t.nic.filter_query(inserted.filter_id).unwrap();
    assert!(info.flags.use_sw());
    assert!(info.flags.use_hw());
    let params = t.device.filter(info.hw_id.unwrap()).unwrap();
    assert!(params.flags.anyqueue_loose());
    assert!(!params.flags.exclusive_queue());
    let Flow::Ipv4(flow) = params.spec.flow else {
        panic!("expected an ipv4 filter");
    };
    assert_eq!(flow.dst, group);
    assert_eq!(flow.src, None);

    let vlan = t
        .nic
        .filter_insert(&filter_request(
            FilterSpec::eth_local([2, 0, 0, 0, 0, 1]).with_vlan(10),
            FilterInsertFlags::new(),
        ))
        .unwrap();
    let info = t.nic.filter_query(vlan.filter_id).unwrap();
    let params = t.device.filter(info.hw_id.unwrap()).unwrap();
    assert_eq!(params.spec.vlan, None);

    t.nic.filter_remove(inserted.filter_id);
    t.nic.filter_remove(vlan.filter_id);
    assert_eq!(t.device.installed_filters(), 0);
    t.nic.release_hardware();
}

#[test]
fn test_identical_filters_share_hardware() {
    let t = test_nic(Duration::from_millis(10));
    let request = filter_request(
        FilterSpec::mismatch(MacGroup::Multicast),
        FilterInsertFlags::new(),
    );
    let a = t.nic.filter_insert(&request).unwrap();
    let b = t.nic.filter_insert(&request).unwrap();
    assert_eq!(a, b);
    assert_eq!(t.device.call_count("filter_insert"), 1);

    t.nic.filter_remove(a.filter_id);
    assert_eq!(t.device.call_count("filter_remove"), 0);
    t.nic.filter_remove(b.filter_id);
    assert_eq!(t.device.call_count("filter_remove"), 1);
    t.nic.release_hardware();
}

#[test]
fn test_widened_filters_share_hardware() {
    let t = test_nic(Duration::from_millis(10));
    let group = Ipv4Addr::new(239, 1, 1, 1);
    let request = |rport| {
        filter_request(
            FilterSpec::ip_full(IPPROTO_UDP, group.into(), 5000, REMOTE.into(), rport),
            FilterInsertFlags::new(),
        )
    };
    let a = t.nic.filter_insert(&request(1)).unwrap();
    let b = t.nic.filter_insert(&request(2)).unwrap();
    assert_ne!(a.filter_id, b.filter_id);
    assert_eq!(a.rxq, b.rxq);
    assert_eq!(t.device.installed_filters(), 1);
    let hw_id = t.nic.filter_query(a.filter_id).unwrap().hw_id;
    assert_eq!(t.nic.filter_query(b.filter_id).unwrap().hw_id, hw_id);

    t.nic.filter_remove(a.filter_id);
    assert_eq!(t.device.call_count("filter_remove"), 0);
    assert_eq!(t.device.installed_filters(), 1);
    t.nic.filter_remove(b.filter_id);
    assert_eq!(t.device.removed_filters(), [hw_id.unwrap()]);
    assert_eq!(t.device.installed_filters(), 0);
    t.nic.release_hardware();
}

#[test]
fn test_filter_errors() {
    let t = test_nic(Duration::from_millis(10));
    let spec = FilterSpec::ip_local(IPPROTO_UDP, LOCAL.into(), 53);

    assert!(matches!(
        t.nic.filter_insert(&filter_request(
            spec.clone(),
            FilterInsertFlags::new().with_replace(true),
        )),
        Err(Error::NotSupported(_))
    ));
    assert!(matches!(
        t.nic.filter_insert(&filter_request(
            FilterSpec::ip_local(132, LOCAL.into(), 53),
            FilterInsertFlags::new(),
        )),
        Err(Error::FilterTranslation(_))
    ));

    t.device.fail_next("filter_insert", TransportError::Status(-28));
    assert!(matches!(
        t.nic
            .filter_insert(&filter_request(spec.clone(), FilterInsertFlags::new())),
        Err(Error::Transport(TransportError::Status(-28)))
    ));

    // Removal from the table stands even if hardware removal fails.
    let inserted = t
        .nic
        .filter_insert(&filter_request(spec, FilterInsertFlags::new()))
        .unwrap();
    t.device.fail_next("filter_remove", TransportError::Status(-5));
    t.nic.filter_remove(inserted.filter_id);
    assert!(t.nic.filter_query(inserted.filter_id).is_err());
    t.nic.release_hardware();
}

#[test]
fn test_mismatch_blocking() {
    let t = test_nic(Duration::from_millis(10));
    assert_eq!(t.nic.mismatch_blocked(), (false, false));
    t.nic.multicast_block(true);
    t.nic.unicast_block(true);
    assert_eq!(t.nic.mismatch_blocked(), (true, true));
    t.nic.unicast_block(false);
    assert_eq!(t.nic.mismatch_blocked(), (true, false));
}

#[test]
fn test_capabilities() {
    let t = test_nic(Duration::from_millis(10));
    let caps = t.nic.capabilities();
    assert_eq!(caps.q_sizes, QueueSizes::EFCT);
    assert_eq!(caps.mac_addr, [0, 0x0f, 0x53, 0, 0, 1]);
    assert_eq!(caps.flags, NicFlags::EFCT);
    assert_eq!(
        caps.filter_flags,
        NicFilterFlags::new()
            .with_rx_type_ip_local(true)
            .with_rx_type_eth_local(true)
            .with_rx_type_ucast_mismatch(true)
            .with_rx_type_mcast_mismatch(true)
            .with_rx_type_mcast_all(true)
            .with_ipx_vlan_sw(true)
    );

    t.nic.post_reset();
    let flags = t.nic.capabilities().flags;
    assert!(flags.phys_contig_evq());
    assert!(flags.evq_irq());
    assert!(flags.tx_ctpio());
    assert_eq!(t.nic.max_shared_rxqs(), 8);
    assert!(t.nic.buffer_table_orders().is_empty());
}

#[test]
fn test_filter_query_failure_reports_no_hardware_filters() {
    init_tracing();
    let device = EmulatedEfctDevice::new();
    device.fail_next("fw_rpc", TransportError::Status(-5));
    let nic = EfctNic::new(
        device,
        EfctNicConfig::new(vec![None], 2),
        Arc::new(RecordingDoorbell::default()),
    );
    nic.init_hardware(Arc::new(RecordingHandler::default()), [0; 6]);
    assert_eq!(
        nic.capabilities().filter_flags,
        NicFilterFlags::new().with_ipx_vlan_sw(true)
    );
}

#[test]
fn test_vi_alloc() {
    let t = test_nic(Duration::from_millis(10));
    let txq = ViConstraints { want_txq: true };
    assert!(matches!(
        t.nic.vi_alloc(txq, 2),
        Err(Error::NotSupported(_))
    ));

    assert_eq!(t.nic.vi_alloc(txq, 1).unwrap(), 0);
    assert_eq!(t.nic.vi_alloc(txq, 1).unwrap(), 1);
    assert!(matches!(t.nic.vi_alloc(txq, 1), Err(Error::ViExhausted)));

    let rx = ViConstraints::default();
    let rx_vis: Vec<_> = (0..4).map(|_| t.nic.vi_alloc(rx, 1).unwrap()).collect();
    assert_eq!(rx_vis, [4, 5, 6, 7]);
    assert!(matches!(t.nic.vi_alloc(rx, 1), Err(Error::ViExhausted)));

    t.nic.vi_free(1, 1);
    t.nic.vi_free(6, 1);
    assert_eq!(t.nic.vi_alloc(txq, 1).unwrap(), 1);
    assert_eq!(t.nic.vi_alloc(rx, 1).unwrap(), 6);
}

#[test]
fn test_dmaq_init() {
    let t = test_nic(Duration::from_millis(10));
    let params = DmaqParams {
        evq: 1,
        dmaq: 1,
        tag: 7,
    };
    assert_eq!(t.nic.dmaq_tx_q_init(&params).unwrap(), 1);
    let txq = t.device.txq(1).unwrap();
    assert_eq!((txq.evq, txq.qid, txq.label), (1, 1, 7));

    t.device.fail_next("init_txq", TransportError::Status(-16));
    assert!(matches!(
        t.nic.dmaq_tx_q_init(&params),
        Err(Error::Transport(TransportError::Status(-16)))
    ));

    let params = DmaqParams {
        evq: 6,
        dmaq: 6,
        tag: 0,
    };
    assert_eq!(t.nic.dmaq_rx_q_init(&params), 6);

    let src = [0x1000, 0x5000, 0x9000];
    let mut dst = [0; 3];
    t.nic.translate_dma_addrs(&src, &mut dst);
    assert_eq!(dst, src);
}

#[test]
fn test_dmaq_init_binds_event_queue_txq() {
    let t = test_nic_with(EfctNicConfig::new(vec![Some(10), Some(11)], 4));
    let qid = t
        .nic
        .dmaq_tx_q_init(&DmaqParams {
            evq: 1,
            dmaq: 99,
            tag: 3,
        })
        .unwrap();
    assert_eq!(qid, 11);
    let txq = t.device.txq(11).unwrap();
    assert_eq!((txq.evq, txq.qid, txq.label), (1, 11, 3));
    assert!(t.device.txq(99).is_none());
}

#[test]
#[should_panic(expected = "has no transmit queue")]
fn test_dmaq_init_without_txq() {
    let t = test_nic(Duration::from_millis(10));
    let _ = t.nic.dmaq_tx_q_init(&DmaqParams {
        evq: 2,
        dmaq: 2,
        tag: 0,
    });
}

#[test]
fn test_io_regions() {
    let t = test_nic_with(EfctNicConfig {
        vi_min: 2,
        ..EfctNicConfig::new(vec![Some(0), Some(1), None, None], 8)
    });
    t.device.set_evq_window(EvqWindow {
        base: 0x2000_0000,
        stride: 0x2000,
    });
    let region = t.nic.vi_io_region(5).unwrap();
    assert_eq!(region.addr, 0x2000_0000 + 3 * 0x2000);
    assert_eq!(region.size, 0x2000);

    assert_eq!(t.nic.ctpio_addr(1).unwrap(), 0x4000_1000);
    t.device.set_ctpio_size(0x2000);
    assert!(matches!(t.nic.ctpio_addr(1), Err(Error::NotSupported(_))));
}

#[test]
fn test_design_parameters() {
    let t = test_nic(Duration::from_millis(10));
    let mut dp = NicDesignParameters::all_known();
    t.nic.design_parameters(&mut dp).unwrap();
    assert_eq!(dp.get(DesignParam::RxSuperbufBytes), 1 << 20);

    t.device.set_design_params(HwDesignParams {
        rx_buffer_len: 512,
        frame_offset_fixed: 64,
        rx_stride: 4096,
        rx_queues: 8,
        tx_aperture_size: 4096,
        tx_fifo_size: 32768,
        ts_subnano_bit: 2,
        unsol_credit_seq_mask: 0x7f,
    });
    let mut dp = NicDesignParameters::new(&[DesignParam::RxFrameOffset]);
    assert!(matches!(
        t.nic.design_parameters(&mut dp),
        Err(Error::IncompatibleDesignParameter {
            param: DesignParam::RxSuperbufBytes,
            value: 0x200000,
            assumed: 0x100000,
        })
    ));
}

#[test]
fn test_wakeup_request() {
    let t = test_nic(Duration::from_millis(10));
    t.nic.wakeup_request(3, 0x1234);
    t.nic.wakeup_request(0xffff, 0);
    assert_eq!(*t.doorbell.writes.lock(), [0x1234_0003, 0xffff]);
}

#[test]
fn test_detach() {
    let t = test_nic(Duration::from_millis(10));
    let mem = Arc::new(HeapEventQueue::new(128));
    t.nic.event_queue_enable(enable_params(0, &mem)).unwrap();

    assert!(t.nic.detach().is_some());
    assert!(t.nic.detach().is_none());
    assert!(matches!(
        t.nic.vi_alloc(ViConstraints::default(), 1),
        Err(Error::DeviceUnavailable)
    ));
    assert!(matches!(
        t.nic.flush_tx_dma_channel(0, 0),
        Err(Error::DeviceUnavailable)
    ));
    let alloc = Arc::new(CountingAllocator::default());
    assert!(matches!(
        bind(&t, 0, 1, &alloc),
        Err(Error::DeviceUnavailable)
    ));
    assert!(!t.nic.hugetlb_provided());

    // Teardown still completes without the device.
    t.nic.event_queue_disable(0);
    assert_eq!(t.nic.flush_state(0), Some(FlushState::Disabled));
    t.nic.vi_free(4, 1);
    assert_eq!(t.device.call_count("free_evq"), 0);
}
