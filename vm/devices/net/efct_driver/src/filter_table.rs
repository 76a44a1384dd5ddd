// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-NIC table of installed filters.
//!
//! Identical filter requests share a single record through a reference count.
//! Shared filters whose widened hardware match is the same also share a
//! single hardware filter, which is removed with the last record using it.

use crate::device::FilterInsertOut;
use crate::filters::FilterInsertFlags;
use crate::flow::EthtoolFlowSpec;
use crate::flow::FilterSpec;
use crate::Error;
use parking_lot::Mutex;
use std::collections::hash_map;
use std::collections::HashMap;
use thiserror::Error;

/// A conflict with the filter table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterTableError {
    /// No filter has the id.
    #[error("filter {0} does not exist")]
    NotFound(u32),
    /// The filter owns an exclusive queue under another token.
    #[error("filter is held exclusively by another owner")]
    ExclusiveConflict,
    /// The filter is installed on another queue than the one requested.
    #[error("filter is already installed on rxq {existing:?}")]
    QueueConflict {
        /// The queue the filter is installed on.
        existing: Option<u32>,
    },
    /// The insertion flags select neither hardware nor software.
    #[error("filter placement selects neither hardware nor software")]
    NoPlacement,
}

/// A snapshot of an installed filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInfo {
    /// The receive queue serving the filter.
    pub rxq: Option<u32>,
    /// The hardware filter id, if the filter is installed in hardware.
    pub hw_id: Option<u32>,
    /// The hardware filter handle.
    pub filter_handle: Option<u64>,
    /// The insertion flags, with the chosen placement applied.
    pub flags: FilterInsertFlags,
    /// The number of insertions sharing the filter.
    pub refs: u32,
}

/// The result of a filter insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterInserted {
    /// The driver's filter id, passed to remove and query.
    pub filter_id: u32,
    /// The receive queue serving the filter.
    pub rxq: Option<u32>,
}

pub(crate) struct FilterState {
    inner: Mutex<FilterTable>,
}

#[derive(Default)]
struct FilterTable {
    filters: HashMap<u32, FilterRecord>,
    by_spec: HashMap<FilterSpec, u32>,
    /// Hardware filters that may serve more than one record.
    shared_hw: HashMap<EthtoolFlowSpec, SharedHwFilter>,
    next_id: u32,
    multicast_blocked: bool,
    unicast_blocked: bool,
}

struct FilterRecord {
    spec: FilterSpec,
    rxq: Option<u32>,
    hw: Option<FilterInsertOut>,
    flags: FilterInsertFlags,
    excl_token: u32,
    refs: u32,
    /// The key in `shared_hw`, if the hardware filter is shared.
    shared_key: Option<EthtoolFlowSpec>,
}

struct SharedHwFilter {
    out: FilterInsertOut,
    users: u32,
}

impl FilterState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FilterTable::default()),
        }
    }

    /// Installs `spec`, or takes another reference on an identical installed
    /// filter.
    ///
    /// `insert_hw` is called, with the table locked, to install the filter in
    /// hardware when `flags` selects hardware placement and no shared filter
    /// already installs `hw_spec`. Only filters that are also narrowed in
    /// software share hardware filters.
    pub fn insert(
        &self,
        spec: &FilterSpec,
        hw_spec: &EthtoolFlowSpec,
        rxq: Option<u32>,
        excl_token: u32,
        flags: FilterInsertFlags,
        insert_hw: impl FnOnce(&EthtoolFlowSpec) -> Result<FilterInsertOut, Error>,
    ) -> Result<FilterInserted, Error> {
        let mut table = self.inner.lock();
        let existing = table.by_spec.get(spec).copied();
        if let Some(filter_id) = existing {
            let record = table
                .filters
                .get_mut(&filter_id)
                .ok_or(FilterTableError::NotFound(filter_id))?;
            if (record.flags.excl_rxq() || flags.excl_rxq()) && record.excl_token != excl_token {
                return Err(FilterTableError::ExclusiveConflict.into());
            }
            check_queue(rxq, flags, record.rxq)?;
            record.refs += 1;
            tracing::debug!(filter_id, refs = record.refs, "sharing existing filter");
            return Ok(FilterInserted {
                filter_id,
                rxq: record.rxq,
            });
        }

        let shareable = flags.use_hw() && flags.use_sw();
        let mut shared_key = None;
        let (rxq, hw) = if shareable {
            let out = match table.shared_hw.entry(hw_spec.clone()) {
                hash_map::Entry::Occupied(mut entry) => {
                    let shared = entry.get_mut();
                    check_queue(rxq, flags, Some(shared.out.rxq))?;
                    shared.users += 1;
                    tracing::debug!(
                        hw_id = shared.out.filter_id,
                        users = shared.users,
                        "sharing hardware filter"
                    );
                    shared.out
                }
                hash_map::Entry::Vacant(entry) => {
                    let out = insert_hw(hw_spec)?;
                    entry.insert(SharedHwFilter { out, users: 1 });
                    out
                }
            };
            shared_key = Some(hw_spec.clone());
            (Some(out.rxq), Some(out))
        } else if flags.use_hw() {
            let out = insert_hw(hw_spec)?;
            (Some(out.rxq), Some(out))
        } else if flags.use_sw() {
            (rxq, None)
        } else {
            return Err(FilterTableError::NoPlacement.into());
        };

        let filter_id = table.alloc_id();
        table.by_spec.insert(spec.clone(), filter_id);
        table.filters.insert(
            filter_id,
            FilterRecord {
                spec: spec.clone(),
                rxq,
                hw,
                flags,
                excl_token,
                refs: 1,
                shared_key,
            },
        );
        Ok(FilterInserted { filter_id, rxq })
    }

    /// Drops a reference to a filter. Returns the hardware filter id once the
    /// last record using a hardware filter is gone.
    pub fn remove(&self, filter_id: u32) -> Option<u32> {
        let mut table = self.inner.lock();
        let hash_map::Entry::Occupied(mut entry) = table.filters.entry(filter_id) else {
            tracing::warn!(filter_id, "removing unknown filter");
            return None;
        };
        entry.get_mut().refs -= 1;
        if entry.get().refs > 0 {
            return None;
        }
        let record = entry.remove();
        table.by_spec.remove(&record.spec);
        let hw_id = record.hw.map(|hw| hw.filter_id)?;
        if let Some(key) = record.shared_key {
            if let hash_map::Entry::Occupied(mut shared) = table.shared_hw.entry(key) {
                shared.get_mut().users -= 1;
                if shared.get().users > 0 {
                    return None;
                }
                shared.remove();
            }
        }
        Some(hw_id)
    }

    pub fn query(&self, filter_id: u32) -> Result<FilterInfo, FilterTableError> {
        let table = self.inner.lock();
        let record = table
            .filters
            .get(&filter_id)
            .ok_or(FilterTableError::NotFound(filter_id))?;
        Ok(FilterInfo {
            rxq: record.rxq,
            hw_id: record.hw.map(|hw| hw.filter_id),
            filter_handle: record.hw.map(|hw| hw.filter_handle),
            flags: record.flags,
            refs: record.refs,
        })
    }

    pub fn set_multicast_block(&self, block: bool) {
        self.inner.lock().multicast_blocked = block;
    }

    pub fn set_unicast_block(&self, block: bool) {
        self.inner.lock().unicast_blocked = block;
    }

    /// Returns whether multicast and unicast mismatch traffic is blocked.
    pub fn blocked(&self) -> (bool, bool) {
        let table = self.inner.lock();
        (table.multicast_blocked, table.unicast_blocked)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fails if an explicitly requested queue differs from the one already
/// serving the filter.
fn check_queue(
    want: Option<u32>,
    flags: FilterInsertFlags,
    existing: Option<u32>,
) -> Result<(), FilterTableError> {
    match want {
        Some(want) if !flags.any_rxq() && !flags.pref_rxq() && existing != Some(want) => {
            Err(FilterTableError::QueueConflict { existing })
        }
        _ => Ok(()),
    }
}

impl FilterTable {
    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.filters.contains_key(&id) {
                break id;
            }
        }
    }
}
