// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hugepage budget accounting for receive queues.
//!
//! Receive queues are backed by hugepages drawn from a pool shared by the
//! whole NIC. Usage is never cached: each bind counts the hugepages currently
//! bound to the queue by asking the device, while holding the provider lock so
//! that the count and the bind are not interleaved with another bind.

use crate::client::DeviceClient;
use crate::device::EfctDevice;
use crate::device::RxqBindParams;
use crate::device::RxqFreeFn;
use crate::device::TransportError;
use crate::Error;
use efct_defs::MAX_HUGEPAGES;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;

/// Allocates hugepages on behalf of the application binding a receive queue.
pub trait HugetlbAllocator: Send + Sync {
    /// Allocates one hugepage, returning its address.
    fn alloc_hugepage(&self) -> anyhow::Result<u64>;
}

/// A request to bind hugepages to a receive queue.
pub struct RxqBindRequest<'a, S> {
    /// The receive queue id.
    pub qid: u32,
    /// Request hardware receive timestamps.
    pub timestamp_req: bool,
    /// The number of hugepages to add to the queue.
    pub n_hugepages: usize,
    /// State shared with the application.
    pub shm: &'a S,
    /// The VI to wake when packets arrive.
    pub wakeup_instance: u32,
}

/// The slot through which the device finds the allocator for the bind in
/// progress.
#[derive(Default)]
pub(crate) struct HugetlbProvider {
    bind_lock: Mutex<()>,
    current: Mutex<Option<Arc<dyn HugetlbAllocator>>>,
}

impl HugetlbProvider {
    /// Registers `alloc` until the returned guard is dropped. Only one
    /// allocator is registered at a time.
    pub fn provide(&self, alloc: Arc<dyn HugetlbAllocator>) -> ProvidedHugetlb<'_> {
        let bind_guard = self.bind_lock.lock();
        *self.current.lock() = Some(alloc.clone());
        ProvidedHugetlb {
            provider: self,
            alloc,
            _bind_guard: bind_guard,
        }
    }

    pub fn current(&self) -> Option<Arc<dyn HugetlbAllocator>> {
        self.current.lock().clone()
    }
}

pub(crate) struct ProvidedHugetlb<'a> {
    provider: &'a HugetlbProvider,
    alloc: Arc<dyn HugetlbAllocator>,
    _bind_guard: MutexGuard<'a, ()>,
}

impl ProvidedHugetlb<'_> {
    pub fn allocator(&self) -> &dyn HugetlbAllocator {
        self.alloc.as_ref()
    }
}

impl Drop for ProvidedHugetlb<'_> {
    fn drop(&mut self) {
        *self.provider.current.lock() = None;
    }
}

pub(crate) struct HugepageLedger {
    provider: HugetlbProvider,
    cap: usize,
}

impl HugepageLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            provider: HugetlbProvider::default(),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn provider(&self) -> &HugetlbProvider {
        &self.provider
    }

    /// Counts the hugepages currently bound to `qid`.
    pub fn used_hugepages<T: EfctDevice>(
        &self,
        client: &DeviceClient<T>,
        qid: u32,
    ) -> Result<usize, Error> {
        match client.acquire()?.get_hugepages(qid, MAX_HUGEPAGES) {
            // Dropping the pages releases the references taken by the query.
            Ok(pages) => Ok(pages.into_iter().flatten().count()),
            Err(TransportError::NotBound) => Ok(0),
            Err(err) => Err(Error::Transport(err)),
        }
    }

    pub fn bind<T: EfctDevice>(
        &self,
        client: &DeviceClient<T>,
        request: &RxqBindRequest<'_, T::RxqShm>,
        hugetlb: Arc<dyn HugetlbAllocator>,
    ) -> Result<T::Rxq, Error> {
        let provided = self.provider.provide(hugetlb);
        let used = self.used_hugepages(client, request.qid)?;
        let over_budget = request
            .n_hugepages
            .checked_add(used)
            .map_or(true, |total| total > self.cap);
        if over_budget {
            tracing::warn!(
                qid = request.qid,
                requested = request.n_hugepages,
                used,
                limit = self.cap,
                "hugepage budget exceeded"
            );
            return Err(Error::HugepageBudget {
                qid: request.qid,
                requested: request.n_hugepages,
                used,
                limit: self.cap,
            });
        }

        let params = RxqBindParams {
            qid: request.qid,
            timestamp_req: request.timestamp_req,
            n_hugepages: request.n_hugepages,
            shm: request.shm,
            wakeup_instance: request.wakeup_instance,
            hugetlb: provided.allocator(),
        };
        let rxq = client.acquire()?.rxq_bind(&params).map_err(Error::Transport)?;
        tracing::debug!(qid = request.qid, n_hugepages = request.n_hugepages, used, "rxq bound");
        Ok(rxq)
    }

    pub fn free<T: EfctDevice>(
        &self,
        client: &DeviceClient<T>,
        rxq: T::Rxq,
        freer: RxqFreeFn,
    ) -> Result<(), Error> {
        client.acquire()?.rxq_free(rxq, freer);
        Ok(())
    }

    pub fn get_hugepages<T: EfctDevice>(
        &self,
        client: &DeviceClient<T>,
        qid: u32,
        n_pages: usize,
    ) -> Result<Vec<Option<T::Hugepage>>, Error> {
        client
            .acquire()?
            .get_hugepages(qid, n_pages)
            .map_err(Error::Transport)
    }
}
