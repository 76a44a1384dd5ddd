// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Filter admission: where a requested filter is placed and how it reaches
//! hardware.

use crate::client::DeviceClient;
use crate::device::CpuMask;
use crate::device::EfctDevice;
use crate::device::FilterParams;
use crate::device::TransportFilterFlags;
use crate::filter_table::FilterInserted;
use crate::filter_table::FilterState;
use crate::flow::sanitise_ethtool_flow;
use crate::flow::spec_to_ethtool_flow;
use crate::flow::FilterSpec;
use crate::Error;
use bitfield_struct::bitfield;

/// Flags for a filter insertion request.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FilterInsertFlags {
    /// Replace an existing filter in place.
    pub replace: bool,
    /// Any receive queue is acceptable.
    pub any_rxq: bool,
    /// Prefer the requested receive queue.
    pub pref_rxq: bool,
    /// The receive queue must be exclusive to this filter.
    pub excl_rxq: bool,
    /// Install the filter in hardware.
    pub use_hw: bool,
    /// The filter may be narrowed in software.
    pub use_sw: bool,
    #[bits(26)]
    _reserved: u32,
}

/// Where a filter is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// In hardware, on a queue of its own. Matches exactly.
    Exclusive,
    /// In hardware, possibly widened, on a shared queue.
    SharedHardware,
    /// Software only.
    SharedSoftware,
}

impl Placement {
    fn apply(self, flags: FilterInsertFlags) -> FilterInsertFlags {
        match self {
            Self::Exclusive => flags.with_use_hw(true),
            Self::SharedHardware => flags.with_use_hw(true).with_use_sw(true),
            Self::SharedSoftware => flags.with_use_sw(true),
        }
    }
}

/// Chooses a placement for a filter given whether the caller wants an
/// exclusive queue and whether hardware supports the filter.
///
/// An exclusive queue cannot be narrowed in software, so it requires an exact
/// hardware match.
pub fn decide_placement(exclusive: bool, hw_supported: bool) -> Result<Placement, Error> {
    match (exclusive, hw_supported) {
        (true, true) => Ok(Placement::Exclusive),
        (true, false) => Err(Error::ExclusiveFilterUnsupported),
        (false, true) => Ok(Placement::SharedHardware),
        (false, false) => Ok(Placement::SharedSoftware),
    }
}

/// A filter insertion request.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    /// The traffic to match.
    pub spec: FilterSpec,
    /// The requested receive queue.
    pub rxq: Option<u32>,
    /// Identifies the owner of an exclusive queue.
    pub excl_token: u32,
    /// The CPUs that may receive matching traffic.
    pub mask: CpuMask,
    /// Insertion flags.
    pub flags: FilterInsertFlags,
}

pub(crate) fn insert_filter<T: EfctDevice>(
    client: &DeviceClient<T>,
    filters: &FilterState,
    request: &FilterRequest,
) -> Result<FilterInserted, Error> {
    if request.flags.replace() {
        return Err(Error::NotSupported("filter replacement"));
    }

    let mut hw_spec = spec_to_ethtool_flow(&request.spec)?;
    let mut transport_flags = TransportFilterFlags::new()
        .with_anyqueue_loose(request.flags.any_rxq())
        .with_pref_queue(request.flags.pref_rxq());

    let exclusive = request.flags.excl_rxq();
    if exclusive {
        transport_flags.set_exclusive_queue(true);
    } else {
        sanitise_ethtool_flow(&mut hw_spec)?;
    }
    let supported = client.acquire()?.is_filter_supported(&hw_spec);
    let placement = decide_placement(exclusive, supported)?;
    tracing::debug!(?placement, spec = ?request.spec, "placing filter");

    filters.insert(
        &request.spec,
        &hw_spec,
        request.rxq,
        request.excl_token,
        placement.apply(request.flags),
        |hw_spec| {
            let params = FilterParams {
                spec: hw_spec.clone(),
                mask: request.mask.clone(),
                flags: transport_flags,
            };
            client
                .acquire()?
                .filter_insert(&params)
                .map_err(Error::Transport)
        },
    )
}

pub(crate) fn remove_filter<T: EfctDevice>(
    client: &DeviceClient<T>,
    filters: &FilterState,
    filter_id: u32,
) {
    let Some(hw_id) = filters.remove(filter_id) else {
        return;
    };
    let result = client
        .acquire()
        .and_then(|device| device.filter_remove(hw_id).map_err(Error::Transport));
    if let Err(err) = result {
        tracing::error!(
            filter_id,
            hw_id,
            error = &err as &dyn std::error::Error,
            "failed to remove hardware filter"
        );
    }
}
