// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MCDI firmware command definitions used by the control plane.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const MC_CMD_GET_PARSER_DISP_INFO: u32 = 0xe4;

/// `GET_PARSER_DISP_INFO` operation selecting supported receive matches.
pub const GET_PARSER_DISP_INFO_OP_GET_SUPPORTED_RX_MATCHES: u32 = 0x1;

#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetParserDispInfoIn {
    pub op: u32,
}

#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetParserDispInfoOutHdr {
    pub op: u32,
    pub num_supported_matches: u32,
}

pub const GET_PARSER_DISP_INFO_OUT_LENMIN: usize = size_of::<GetParserDispInfoOutHdr>();
pub const GET_PARSER_DISP_INFO_OUT_LENMAX: usize = 252;
/// Each supported match is a [`FilterMatchFields`] dword following the header.
pub const GET_PARSER_DISP_INFO_MATCH_LEN: usize = size_of::<u32>();

/// The set of header fields a hardware filter type matches on.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq, Hash)]
pub struct FilterMatchFields {
    pub src_ip: bool,
    pub dst_ip: bool,
    pub src_mac: bool,
    pub src_port: bool,
    pub dst_mac: bool,
    pub dst_port: bool,
    pub ether_type: bool,
    pub inner_vlan: bool,
    pub outer_vlan: bool,
    pub ip_proto: bool,
    #[bits(20)]
    pub reserved: u32,
    pub unknown_mcast_dst: bool,
    pub unknown_ucast_dst: bool,
}

impl FilterMatchFields {
    /// Destination address, port and protocol.
    pub const IP_LOCAL: Self = Self::new()
        .with_ether_type(true)
        .with_ip_proto(true)
        .with_dst_ip(true)
        .with_dst_port(true);

    /// The full 5-tuple.
    pub const IP_FULL: Self = Self::IP_LOCAL.with_src_ip(true).with_src_port(true);

    pub const ETH_LOCAL: Self = Self::new().with_dst_mac(true);

    pub const ETH_LOCAL_VLAN: Self = Self::ETH_LOCAL.with_outer_vlan(true);

    pub const ETHER_TYPE: Self = Self::new().with_ether_type(true);

    pub const UCAST_MISMATCH: Self = Self::new().with_unknown_ucast_dst(true);

    pub const MCAST_MISMATCH: Self = Self::new().with_unknown_mcast_dst(true);
}
