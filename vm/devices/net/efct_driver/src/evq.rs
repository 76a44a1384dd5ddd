// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event queue enable/disable and transmit flush tracking.
//!
//! EFCT hardware does not deliver flush completions through the normal event
//! path. Instead, after a transmit queue is freed, the driver periodically
//! scans the event queue memory for the flush record and reports it to the
//! NIC layer.

use crate::client::DeviceClient;
use crate::device::EfctDevice;
use crate::device::EvqParams;
use crate::memory::EventQueueMemory;
use crate::work::DelayedWork;
use crate::work::WorkQueue;
use crate::Error;
use efct_defs::EVENT_SIZE;
use efct_defs::NIC_PAGE_SIZE;
use efct_defs::TIME_SYNC_EVENT_EVQ_CAPACITY;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Callbacks into the NIC layer.
pub trait NicEventHandler: Send + Sync {
    /// Transmit queue `txq` has finished flushing.
    fn handle_txdmaq_flushed(&self, txq: u32);
}

pub(crate) type HandlerSlot = RwLock<Option<Arc<dyn NicEventHandler>>>;

/// Parameters for enabling an event queue.
pub struct EvqEnableParams {
    /// The event queue instance.
    pub evq: u32,
    /// The number of event records.
    pub entries: u32,
    /// The address of each NIC page of queue memory, in order.
    pub dma_addrs: Vec<u64>,
    /// The queue memory, as written by hardware.
    pub mem: Arc<dyn EventQueueMemory>,
    /// The interrupt channel for wakeups, if any.
    pub wakeup_channel: Option<u32>,
    /// Subscribe to time sync events for transmit timestamps.
    pub tx_timestamps: bool,
}

/// Transmit flush tracking of an event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// The event queue is not enabled.
    Disabled,
    /// No flushes are outstanding.
    Idle,
    /// The number of outstanding flushes. Never zero.
    Flushing(u32),
}

/// The result of a flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Completion will be reported through
    /// [`NicEventHandler::handle_txdmaq_flushed`].
    Pending,
    /// There was nothing to flush.
    AlreadyComplete,
}

pub(crate) struct EventQueueTable {
    slots: Vec<EventQueueControl>,
    /// Runs the flush rechecks of every event queue.
    rechecks: WorkQueue,
    recheck_delay: Duration,
}

struct EventQueueControl {
    txq: Option<u32>,
    enabled: Mutex<Option<EnabledEvq>>,
}

struct EnabledEvq {
    tracker: Arc<FlushTracker>,
    work: DelayedWork,
}

struct FlushTracker {
    evq: u32,
    mem: Arc<dyn EventQueueMemory>,
    capacity: usize,
    state: Mutex<FlushState>,
    handler: Arc<HandlerSlot>,
    delay: Duration,
    misses: AtomicU32,
}

impl FlushTracker {
    /// Scans for a transmit flush completion. Returns the delay before the
    /// next scan if flushes remain outstanding.
    fn check_for_flushes(&self) -> Option<Duration> {
        if !matches!(*self.state.lock(), FlushState::Flushing(_)) {
            return None;
        }

        let txq = (0..self.capacity).find_map(|i| self.mem.read_event(i).tx_flush_queue());
        if let Some(txq) = txq {
            self.report_flushed(txq.into());
            let mut state = self.state.lock();
            match *state {
                FlushState::Flushing(1) => {
                    *state = FlushState::Idle;
                    self.misses.store(0, Ordering::Relaxed);
                    return None;
                }
                FlushState::Flushing(n) => *state = FlushState::Flushing(n - 1),
                FlushState::Idle | FlushState::Disabled => return None,
            }
        }

        let attempts = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
        if attempts <= 3 || attempts.is_power_of_two() {
            tracing::warn!(
                evq = self.evq,
                attempts,
                "tx flush still outstanding, rechecking later"
            );
        }
        Some(self.delay)
    }

    fn report_flushed(&self, txq: u32) {
        match &*self.handler.read() {
            Some(handler) => handler.handle_txdmaq_flushed(txq),
            None => tracing::error!(evq = self.evq, txq, "no handler for tx flush completion"),
        }
    }
}

impl EventQueueTable {
    /// Creates the table. `evq_txqs[i]` is the transmit queue served by event
    /// queue `i`, if any.
    pub fn new(evq_txqs: &[Option<u32>], recheck_delay: Duration) -> Self {
        Self {
            slots: evq_txqs
                .iter()
                .map(|&txq| EventQueueControl {
                    txq,
                    enabled: Mutex::new(None),
                })
                .collect(),
            rechecks: WorkQueue::new("efct-flush"),
            recheck_delay,
        }
    }

    pub fn evq_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Returns `None` for dummy queues, which have no hardware backing.
    fn slot(&self, evq: u32) -> Option<&EventQueueControl> {
        self.slots.get(evq as usize)
    }

    pub fn txq(&self, evq: u32) -> Option<u32> {
        self.slot(evq)?.txq
    }

    pub fn enable<T: EfctDevice>(
        &self,
        client: &DeviceClient<T>,
        handler: &Arc<HandlerSlot>,
        params: EvqEnableParams,
    ) -> Result<(), Error> {
        let evq = params.evq;
        let Some(slot) = self.slot(evq) else {
            tracing::debug!(evq, "enabling dummy event queue");
            return Ok(());
        };

        let q_size = params.entries as usize * EVENT_SIZE;
        assert!(
            !params.dma_addrs.is_empty()
                && params.dma_addrs.len() * NIC_PAGE_SIZE as usize >= q_size,
            "event queue memory is smaller than {q_size} bytes"
        );
        assert!(params.mem.len() >= params.entries as usize);
        debug_assert!(
            params
                .dma_addrs
                .windows(2)
                .all(|w| w[1].wrapping_sub(w[0]) == NIC_PAGE_SIZE),
            "event queue memory is not physically contiguous"
        );

        let mut enabled = slot.enabled.lock();
        if enabled.is_some() {
            return Err(Error::EvqAlreadyEnabled(evq));
        }

        let tracker = Arc::new(FlushTracker {
            evq,
            mem: params.mem,
            capacity: params.entries as usize,
            state: Mutex::new(FlushState::Idle),
            handler: handler.clone(),
            delay: self.recheck_delay,
            misses: AtomicU32::new(0),
        });
        let work = self
            .rechecks
            .add({
                let tracker = tracker.clone();
                move || tracker.check_for_flushes()
            })
            .map_err(Error::Worker)?;

        let unsol_credit = if params.tx_timestamps {
            TIME_SYNC_EVENT_EVQ_CAPACITY - 1
        } else {
            0
        };
        let evq_params = EvqParams {
            qid: evq,
            entries: params.entries,
            q_page: params.dma_addrs[0],
            page_offset: 0,
            q_size,
            subscribe_time_sync: params.tx_timestamps,
            unsol_credit,
            irq: params.wakeup_channel,
        };
        client
            .acquire()?
            .init_evq(&evq_params)
            .map_err(Error::Transport)?;

        *enabled = Some(EnabledEvq { tracker, work });
        tracing::debug!(evq, entries = params.entries, "event queue enabled");
        Ok(())
    }

    pub fn disable<T: EfctDevice>(&self, client: &DeviceClient<T>, evq: u32) {
        let Some(slot) = self.slot(evq) else {
            return;
        };

        let enabled = {
            let mut enabled = slot.enabled.lock();
            if let Some(enabled) = &*enabled {
                *enabled.tracker.state.lock() = FlushState::Disabled;
            }
            enabled.take()
        };
        match enabled {
            Some(enabled) => enabled.work.cancel(),
            None => tracing::warn!(evq, "disabling event queue that is not enabled"),
        }

        let result = client
            .acquire()
            .and_then(|device| device.free_evq(evq).map_err(Error::Transport));
        if let Err(err) = result {
            tracing::error!(
                evq,
                error = &err as &dyn std::error::Error,
                "failed to free event queue"
            );
        }
    }

    pub fn flush_tx<T: EfctDevice>(
        &self,
        client: &DeviceClient<T>,
        dmaq: u32,
        evq: u32,
    ) -> Result<FlushOutcome, Error> {
        let slot = self.slot(evq).ok_or(Error::EvqNotEnabled(evq))?;
        let enabled = slot.enabled.lock();
        let enabled = enabled.as_ref().ok_or(Error::EvqNotEnabled(evq))?;

        client
            .acquire()?
            .free_txq(dmaq)
            .map_err(Error::Transport)?;

        {
            let mut state = enabled.tracker.state.lock();
            *state = match *state {
                FlushState::Idle => FlushState::Flushing(1),
                FlushState::Flushing(n) => FlushState::Flushing(n + 1),
                FlushState::Disabled => return Err(Error::EvqNotEnabled(evq)),
            };
        }
        enabled.work.schedule(Duration::ZERO);
        tracing::debug!(evq, dmaq, "tx flush requested");
        Ok(FlushOutcome::Pending)
    }

    /// Returns the flush state of `evq`, or `None` for a dummy queue.
    pub fn flush_state(&self, evq: u32) -> Option<FlushState> {
        let enabled = self.slot(evq)?.enabled.lock();
        Some(match &*enabled {
            Some(enabled) => *enabled.tracker.state.lock(),
            None => FlushState::Disabled,
        })
    }

    pub fn recheck_pending(&self, evq: u32) -> bool {
        self.slot(evq)
            .and_then(|slot| {
                slot.enabled
                    .lock()
                    .as_ref()
                    .map(|enabled| enabled.work.is_pending())
            })
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn worker_threads(&self) -> usize {
        self.rechecks.threads()
    }

    /// Waits for at least `runs` completed flush scans on `evq`, returning the
    /// number completed.
    pub fn wait_for_rechecks(&self, evq: u32, runs: u64, timeout: Duration) -> u64 {
        self.slot(evq)
            .and_then(|slot| {
                slot.enabled
                    .lock()
                    .as_ref()
                    .map(|enabled| enabled.work.wait_for_runs(runs, timeout))
            })
            .unwrap_or(0)
    }
}
