// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NIC capability reporting.

use crate::client::DeviceClient;
use crate::device::EfctDevice;
use crate::Error;
use bitfield_struct::bitfield;
use efct_defs::mcdi::FilterMatchFields;
use efct_defs::mcdi::GetParserDispInfoIn;
use efct_defs::mcdi::GetParserDispInfoOutHdr;
use efct_defs::mcdi::GET_PARSER_DISP_INFO_MATCH_LEN;
use efct_defs::mcdi::GET_PARSER_DISP_INFO_OP_GET_SUPPORTED_RX_MATCHES;
use efct_defs::mcdi::GET_PARSER_DISP_INFO_OUT_LENMAX;
use efct_defs::mcdi::GET_PARSER_DISP_INFO_OUT_LENMIN;
use efct_defs::mcdi::MC_CMD_GET_PARSER_DISP_INFO;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Capabilities the NIC reports to the NIC layer.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct NicFlags {
    /// Event queue memory must be physically contiguous.
    pub phys_contig_evq: bool,
    /// Event queues can raise interrupts.
    pub evq_irq: bool,
    /// Transmit is through CTPIO apertures.
    pub tx_ctpio: bool,
    /// CTPIO is the only transmit path.
    pub ctpio_only: bool,
    /// Received packets carry hardware timestamps.
    pub hw_rx_timestamping: bool,
    /// Transmit completions carry hardware timestamps.
    pub hw_tx_timestamping: bool,
    /// Receive queues are shared between applications.
    pub rx_shared: bool,
    /// Hardware replicates multicast to every subscribed queue.
    pub hw_multicast_replication: bool,
    /// Protection domains are shared.
    pub shared_pd: bool,
    #[bits(55)]
    _reserved: u64,
}

impl NicFlags {
    /// Flags every EFCT NIC reports once its hardware is initialized.
    pub const EFCT: Self = Self::new()
        .with_tx_ctpio(true)
        .with_ctpio_only(true)
        .with_hw_rx_timestamping(true)
        .with_hw_tx_timestamping(true)
        .with_rx_shared(true)
        .with_hw_multicast_replication(true)
        .with_shared_pd(true);
}

/// The filter types the NIC supports.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct NicFilterFlags {
    /// Local IP address, protocol and port.
    pub rx_type_ip_local: bool,
    /// Full IP 5-tuple.
    pub rx_type_ip_full: bool,
    /// Destination MAC address.
    pub rx_type_eth_local: bool,
    /// Destination MAC address and VLAN.
    pub rx_type_eth_local_vlan: bool,
    /// Ethertype.
    pub rx_type_ether_type: bool,
    /// Unicast traffic no other filter matched.
    pub rx_type_ucast_mismatch: bool,
    /// Multicast traffic no other filter matched.
    pub rx_type_mcast_mismatch: bool,
    /// All multicast traffic.
    pub rx_type_mcast_all: bool,
    /// VLAN filtering is done in software.
    pub ipx_vlan_sw: bool,
    #[bits(55)]
    _reserved: u64,
}

/// Supported queue sizes, as bitmasks of the supported entry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    /// Event queue sizes.
    pub evq: u32,
    /// Transmit queue sizes.
    pub txq: u32,
    /// Receive queue sizes.
    pub rxq: u32,
}

impl QueueSizes {
    /// The sizes an EFCT NIC supports.
    pub const EFCT: Self = Self {
        evq: size_mask(128, 8192),
        txq: 512,
        rxq: size_mask(512, 131072),
    };
}

/// Every power of two from `min` to `max` inclusive.
const fn size_mask(min: u32, max: u32) -> u32 {
    (max << 1) - min
}

/// Folds the filter match types reported by firmware into filter flags.
pub fn filter_flags_from_matches(
    matches: impl IntoIterator<Item = FilterMatchFields>,
) -> NicFilterFlags {
    let mut flags = NicFilterFlags::new();
    for fields in matches {
        if fields == FilterMatchFields::IP_LOCAL {
            flags.set_rx_type_ip_local(true);
        } else if fields == FilterMatchFields::IP_FULL {
            flags.set_rx_type_ip_full(true);
        } else if fields == FilterMatchFields::ETH_LOCAL {
            flags.set_rx_type_eth_local(true);
        } else if fields == FilterMatchFields::ETH_LOCAL_VLAN {
            flags.set_rx_type_eth_local_vlan(true);
        } else if fields == FilterMatchFields::ETHER_TYPE {
            flags.set_rx_type_ether_type(true);
        } else if fields == FilterMatchFields::UCAST_MISMATCH {
            flags.set_rx_type_ucast_mismatch(true);
        } else if fields == FilterMatchFields::MCAST_MISMATCH {
            flags.set_rx_type_mcast_mismatch(true);
        }
    }
    flags
}

/// Asks firmware which filter types hardware can match.
///
/// Failure is logged and reported as no supported types, so that every filter
/// falls back to software.
pub(crate) fn query_filter_flags<T: EfctDevice>(client: &DeviceClient<T>) -> NicFilterFlags {
    match supported_rx_matches(client) {
        Ok(matches) => filter_flags_from_matches(matches),
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to query supported filter types"
            );
            NicFilterFlags::new()
        }
    }
}

fn supported_rx_matches<T: EfctDevice>(
    client: &DeviceClient<T>,
) -> Result<Vec<FilterMatchFields>, Error> {
    let input = GetParserDispInfoIn {
        op: GET_PARSER_DISP_INFO_OP_GET_SUPPORTED_RX_MATCHES,
    };
    let mut output = [0u8; GET_PARSER_DISP_INFO_OUT_LENMAX];
    let len = client
        .acquire()?
        .fw_rpc(MC_CMD_GET_PARSER_DISP_INFO, input.as_bytes(), &mut output)
        .map_err(Error::Transport)?;
    let (hdr, _) = GetParserDispInfoOutHdr::read_from_prefix(&output[..len.min(output.len())])
        .map_err(|_| Error::ShortMcdiResponse {
            expected: GET_PARSER_DISP_INFO_OUT_LENMIN,
            actual: len,
        })?;
    tracing::debug!(
        num_supported_matches = hdr.num_supported_matches,
        "supported filter types"
    );

    let matches = &output[GET_PARSER_DISP_INFO_OUT_LENMIN..len.min(output.len())];
    Ok(matches
        .chunks_exact(GET_PARSER_DISP_INFO_MATCH_LEN)
        .filter_map(|chunk| FilterMatchFields::read_from_bytes(chunk).ok())
        .collect())
}
