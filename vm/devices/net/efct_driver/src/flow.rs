// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Filter requests and their translation to hardware flow specs.

use efct_defs::mcdi::FilterMatchFields;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use thiserror::Error;

/// IPv4 ethertype.
pub const ETH_P_IP: u16 = 0x0800;
/// IPv6 ethertype.
pub const ETH_P_IPV6: u16 = 0x86dd;
/// TCP protocol number.
pub const IPPROTO_TCP: u8 = 6;
/// UDP protocol number.
pub const IPPROTO_UDP: u8 = 17;

/// Which unknown destinations a mismatch filter catches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacGroup {
    /// Unicast destinations.
    Unicast,
    /// Multicast destinations.
    Multicast,
}

/// A filter as requested by the generic NIC layer. Each field that is `Some`
/// must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FilterSpec {
    /// Ethertype.
    pub ether_type: Option<u16>,
    /// IP protocol number.
    pub ip_proto: Option<u8>,
    /// Local (destination) IP address.
    pub loc_host: Option<IpAddr>,
    /// Local (destination) port.
    pub loc_port: Option<u16>,
    /// Remote (source) IP address.
    pub rem_host: Option<IpAddr>,
    /// Remote (source) port.
    pub rem_port: Option<u16>,
    /// Destination MAC address.
    pub loc_mac: Option<[u8; 6]>,
    /// Outer VLAN id.
    pub outer_vid: Option<u16>,
    /// Match traffic for destinations no other filter claims.
    pub loc_mac_ig: Option<MacGroup>,
}

impl FilterSpec {
    /// Matches a local address, port and protocol.
    pub fn ip_local(ip_proto: u8, host: IpAddr, port: u16) -> Self {
        Self {
            ether_type: Some(ether_type_for(host)),
            ip_proto: Some(ip_proto),
            loc_host: Some(host),
            loc_port: Some(port),
            ..Default::default()
        }
    }

    /// Matches the full 5-tuple.
    pub fn ip_full(
        ip_proto: u8,
        loc_host: IpAddr,
        loc_port: u16,
        rem_host: IpAddr,
        rem_port: u16,
    ) -> Self {
        Self {
            rem_host: Some(rem_host),
            rem_port: Some(rem_port),
            ..Self::ip_local(ip_proto, loc_host, loc_port)
        }
    }

    /// Matches a destination MAC address.
    pub fn eth_local(mac: [u8; 6]) -> Self {
        Self {
            loc_mac: Some(mac),
            ..Default::default()
        }
    }

    /// Matches traffic in `group` that no other filter claims.
    pub fn mismatch(group: MacGroup) -> Self {
        Self {
            loc_mac_ig: Some(group),
            ..Default::default()
        }
    }

    /// Additionally matches outer VLAN `vid`.
    pub fn with_vlan(self, vid: u16) -> Self {
        Self {
            outer_vid: Some(vid),
            ..self
        }
    }
}

fn ether_type_for(host: IpAddr) -> u16 {
    match host {
        IpAddr::V4(_) => ETH_P_IP,
        IpAddr::V6(_) => ETH_P_IPV6,
    }
}

/// A transport protocol hardware can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl L4Proto {
    fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            IPPROTO_TCP => Some(Self::Tcp),
            IPPROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }
}

/// An IP flow match. `src` is the remote end of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpFlow<A> {
    /// Transport protocol.
    pub proto: L4Proto,
    /// Destination address.
    pub dst: A,
    /// Destination port.
    pub dport: u16,
    /// Source address and port.
    pub src: Option<(A, u16)>,
}

/// The traffic a hardware flow spec matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flow {
    /// An IPv4 flow.
    Ipv4(IpFlow<Ipv4Addr>),
    /// An IPv6 flow.
    Ipv6(IpFlow<Ipv6Addr>),
    /// An Ethernet match.
    Ether {
        /// Destination MAC address.
        dst: Option<[u8; 6]>,
        /// Ethertype.
        ether_type: Option<u16>,
    },
    /// Only the individual/group bit of the destination MAC is matched.
    EtherGroup(MacGroup),
}

/// A filter in the form the hardware transport accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EthtoolFlowSpec {
    /// The traffic to match.
    pub flow: Flow,
    /// Outer VLAN id.
    pub vlan: Option<u16>,
}

impl EthtoolFlowSpec {
    /// The header fields hardware must inspect to implement this filter.
    pub fn match_fields(&self) -> FilterMatchFields {
        let fields = match &self.flow {
            Flow::Ipv4(IpFlow { src, .. }) => full_or_local(src.is_some()),
            Flow::Ipv6(IpFlow { src, .. }) => full_or_local(src.is_some()),
            Flow::Ether { dst, ether_type } => FilterMatchFields::new()
                .with_dst_mac(dst.is_some())
                .with_ether_type(ether_type.is_some()),
            Flow::EtherGroup(MacGroup::Unicast) => FilterMatchFields::UCAST_MISMATCH,
            Flow::EtherGroup(MacGroup::Multicast) => FilterMatchFields::MCAST_MISMATCH,
        };
        fields.with_outer_vlan(self.vlan.is_some())
    }
}

fn full_or_local(full: bool) -> FilterMatchFields {
    if full {
        FilterMatchFields::IP_FULL
    } else {
        FilterMatchFields::IP_LOCAL
    }
}

/// A filter that cannot be expressed as a hardware flow spec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowSpecError {
    /// Only TCP and UDP can be matched.
    #[error("ip protocol {0} is not supported")]
    UnsupportedProtocol(u8),
    /// The fields set do not form a supported filter type.
    #[error("unsupported combination of match fields")]
    UnsupportedMatch,
    /// An address does not belong to the requested ethertype.
    #[error("address family does not match ether type {0:#06x}")]
    AddressFamilyMismatch(u16),
    /// The local and remote addresses differ in family.
    #[error("local and remote addresses are of different families")]
    MixedAddressFamilies,
}

/// Translates a filter request directly into a hardware flow spec, without
/// any widening.
pub fn spec_to_ethtool_flow(spec: &FilterSpec) -> Result<EthtoolFlowSpec, FlowSpecError> {
    let vlan = spec.outer_vid;

    if let Some(group) = spec.loc_mac_ig {
        let only_group = FilterSpec {
            loc_mac_ig: Some(group),
            outer_vid: vlan,
            ..Default::default()
        };
        if *spec != only_group {
            return Err(FlowSpecError::UnsupportedMatch);
        }
        return Ok(EthtoolFlowSpec {
            flow: Flow::EtherGroup(group),
            vlan,
        });
    }

    let Some(proto) = spec.ip_proto else {
        if spec.loc_host.is_some()
            || spec.rem_host.is_some()
            || spec.loc_port.is_some()
            || spec.rem_port.is_some()
            || (spec.loc_mac.is_none() && spec.ether_type.is_none())
        {
            return Err(FlowSpecError::UnsupportedMatch);
        }
        return Ok(EthtoolFlowSpec {
            flow: Flow::Ether {
                dst: spec.loc_mac,
                ether_type: spec.ether_type,
            },
            vlan,
        });
    };

    let proto = L4Proto::from_ip_proto(proto).ok_or(FlowSpecError::UnsupportedProtocol(proto))?;
    if spec.loc_mac.is_some() {
        return Err(FlowSpecError::UnsupportedMatch);
    }
    let (Some(loc_host), Some(dport)) = (spec.loc_host, spec.loc_port) else {
        return Err(FlowSpecError::UnsupportedMatch);
    };
    let remote = match (spec.rem_host, spec.rem_port) {
        (Some(host), Some(port)) => Some((host, port)),
        (None, None) => None,
        _ => return Err(FlowSpecError::UnsupportedMatch),
    };
    let expected_ether_type = ether_type_for(loc_host);
    if let Some(ether_type) = spec.ether_type {
        if ether_type != expected_ether_type {
            return Err(FlowSpecError::AddressFamilyMismatch(ether_type));
        }
    }

    let flow = match loc_host {
        IpAddr::V4(dst) => {
            let src = match remote {
                Some((IpAddr::V4(host), port)) => Some((host, port)),
                Some((IpAddr::V6(_), _)) => return Err(FlowSpecError::MixedAddressFamilies),
                None => None,
            };
            Flow::Ipv4(IpFlow {
                proto,
                dst,
                dport,
                src,
            })
        }
        IpAddr::V6(dst) => {
            let src = match remote {
                Some((IpAddr::V6(host), port)) => Some((host, port)),
                Some((IpAddr::V4(_), _)) => return Err(FlowSpecError::MixedAddressFamilies),
                None => None,
            };
            Flow::Ipv6(IpFlow {
                proto,
                dst,
                dport,
                src,
            })
        }
    };
    Ok(EthtoolFlowSpec { flow, vlan })
}

/// Widens `spec` to a superset that the hardware can match natively. The
/// application narrows the result back down in software.
///
/// VLAN matching is always done in software on EFCT, and multicast filters
/// match on the destination only.
pub fn sanitise_ethtool_flow(spec: &mut EthtoolFlowSpec) -> Result<(), FlowSpecError> {
    spec.vlan = None;
    match &mut spec.flow {
        Flow::Ipv4(flow) => {
            if flow.dst.is_multicast() {
                flow.src = None;
            }
        }
        Flow::Ipv6(flow) => {
            if flow.dst.is_multicast() {
                flow.src = None;
            }
        }
        Flow::Ether {
            dst: None,
            ether_type: None,
        } => return Err(FlowSpecError::UnsupportedMatch),
        Flow::Ether { .. } | Flow::EtherGroup(_) => {}
    }
    Ok(())
}
