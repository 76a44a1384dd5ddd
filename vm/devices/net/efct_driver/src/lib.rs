// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control plane for EFCT NICs.
//!
//! This manages event queue lifecycle and transmit flush completion, the
//! hugepage budget of receive queues, and filter placement. Hardware is
//! reached through an [`EfctDevice`] transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod caps;
mod client;
pub mod design_params;
pub mod device;
pub mod emulated;
mod error;
mod evq;
mod filter_table;
pub mod filters;
pub mod flow;
pub mod hugepages;
pub mod memory;
mod nic;
#[cfg(test)]
mod tests;
mod vi_alloc;
mod work;

pub use caps::filter_flags_from_matches;
pub use caps::NicFilterFlags;
pub use caps::NicFlags;
pub use caps::QueueSizes;
pub use device::EfctDevice;
pub use error::Error;
pub use evq::EvqEnableParams;
pub use evq::FlushOutcome;
pub use evq::FlushState;
pub use evq::NicEventHandler;
pub use filter_table::FilterInfo;
pub use filter_table::FilterInserted;
pub use filter_table::FilterTableError;
pub use nic::DmaqParams;
pub use nic::EfctNic;
pub use nic::EfctNicConfig;
pub use nic::IoRegion;
pub use nic::NicCapabilities;
pub use nic::WakeupRegister;
pub use nic::DEFAULT_FLUSH_RECHECK_DELAY;
pub use vi_alloc::ViConstraints;
