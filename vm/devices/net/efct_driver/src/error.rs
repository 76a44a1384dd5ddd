// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::design_params::DesignParam;
use crate::device::TransportError;
use crate::filter_table::FilterTableError;
use crate::flow::FlowSpecError;
use thiserror::Error;

/// An error from an EFCT control-plane operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not implemented for this configuration.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    /// The device could not be acquired, for example because it is being
    /// detached.
    #[error("device is unavailable")]
    DeviceUnavailable,
    /// Binding would exceed the hugepage budget of the receive queue.
    #[error(
        "binding {requested} hugepages to rxq {qid} with {used} in use exceeds the limit of {limit}"
    )]
    HugepageBudget {
        /// The receive queue.
        qid: u32,
        /// Hugepages requested by the bind.
        requested: usize,
        /// Hugepages already bound to the queue.
        used: usize,
        /// The per-queue limit.
        limit: usize,
    },
    /// Every VI instance that satisfies the constraints is in use.
    #[error("no virtual interface instance available")]
    ViExhausted,
    /// Exclusive queues require hardware to match the requested filter
    /// exactly.
    #[error("hardware cannot match the filter exactly, as an exclusive queue requires")]
    ExclusiveFilterUnsupported,
    /// The filter cannot be expressed as a flow spec.
    #[error("failed to translate filter")]
    FilterTranslation(#[source] FlowSpecError),
    /// The filter conflicts with an installed filter.
    #[error("filter table error")]
    FilterTable(#[source] FilterTableError),
    /// The hardware reports a value the consumer has a different built-in
    /// assumption for.
    #[error("design parameter {param:?} is {value}, consumer assumes {assumed}")]
    IncompatibleDesignParameter {
        /// The parameter.
        param: DesignParam,
        /// The value hardware reports.
        value: u64,
        /// The value the consumer assumes.
        assumed: u64,
    },
    /// The event queue is not enabled.
    #[error("event queue {0} is not enabled")]
    EvqNotEnabled(u32),
    /// The event queue is already enabled.
    #[error("event queue {0} is already enabled")]
    EvqAlreadyEnabled(u32),
    /// The flush recheck worker could not be started.
    #[error("failed to start flush worker")]
    Worker(#[source] std::io::Error),
    /// Firmware returned fewer bytes than the response header.
    #[error("firmware response too short: expected at least {expected} bytes, got {actual}")]
    ShortMcdiResponse {
        /// The minimum response length.
        expected: usize,
        /// The length firmware returned.
        actual: usize,
    },
    /// The hardware-ops transport failed.
    #[error("hardware operation failed")]
    Transport(#[source] TransportError),
}

impl From<FlowSpecError> for Error {
    fn from(err: FlowSpecError) -> Self {
        Self::FilterTranslation(err)
    }
}

impl From<FilterTableError> for Error {
    fn from(err: FilterTableError) -> Self {
        Self::FilterTable(err)
    }
}
