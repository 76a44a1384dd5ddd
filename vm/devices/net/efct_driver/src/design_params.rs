// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Design parameters exchanged with consumers of the NIC.
//!
//! A consumer built before a parameter existed silently assumes its default
//! value. Such a consumer must not be handed a NIC whose value differs.

use crate::device::HwDesignParams;
use crate::Error;
use efct_defs::RX_BUFFER_LEN_UNIT;

/// A design parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesignParam {
    /// The size of a receive superbuffer in bytes.
    RxSuperbufBytes,
    /// The offset of packet data within a receive buffer.
    RxFrameOffset,
    /// The stride between receive queue registers.
    RxStride,
    /// The number of shared receive queues.
    RxQueues,
    /// The size of a CTPIO aperture in bytes.
    TxApertureBytes,
    /// The size of the transmit FIFO in bytes.
    TxFifoBytes,
    /// Sub-nanosecond bits in hardware timestamps.
    TimestampSubnanoBits,
    /// The mask applied to unsolicited credit sequence numbers.
    UnsolCreditSeqMask,
    /// Where packet metadata is placed.
    MdLocation,
}

impl DesignParam {
    /// Every parameter, in index order.
    pub const ALL: [Self; 9] = [
        Self::RxSuperbufBytes,
        Self::RxFrameOffset,
        Self::RxStride,
        Self::RxQueues,
        Self::TxApertureBytes,
        Self::TxFifoBytes,
        Self::TimestampSubnanoBits,
        Self::UnsolCreditSeqMask,
        Self::MdLocation,
    ];

    /// The value assumed by consumers that do not know the parameter.
    pub const fn assumed_default(self) -> u64 {
        match self {
            Self::RxSuperbufBytes => 1 << 20,
            Self::RxFrameOffset => 64,
            Self::RxStride => 4096,
            Self::RxQueues => 8,
            Self::TxApertureBytes => 4096,
            Self::TxFifoBytes => 32768,
            Self::TimestampSubnanoBits => 2,
            Self::UnsolCreditSeqMask => 0x7f,
            Self::MdLocation => 0,
        }
    }

    /// Whether an unknown value must match the default. Consumers derive
    /// these from other parameters rather than assuming them.
    const fn checked(self) -> bool {
        !matches!(self, Self::RxStride | Self::RxQueues)
    }
}

/// The design parameters of a NIC, as seen by one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicDesignParameters {
    known: Vec<DesignParam>,
    values: [u64; DesignParam::ALL.len()],
}

impl NicDesignParameters {
    /// Creates parameters for a consumer that knows about `known`. Every value
    /// starts at its assumed default.
    pub fn new(known: &[DesignParam]) -> Self {
        Self {
            known: known.to_vec(),
            values: DesignParam::ALL.map(DesignParam::assumed_default),
        }
    }

    /// Creates parameters for a consumer that knows every parameter.
    pub fn all_known() -> Self {
        Self::new(&DesignParam::ALL)
    }

    /// Returns whether the consumer knows `param`.
    pub fn is_known(&self, param: DesignParam) -> bool {
        self.known.contains(&param)
    }

    /// The current value of `param`.
    pub fn get(&self, param: DesignParam) -> u64 {
        self.values[param as usize]
    }

    fn set(&mut self, param: DesignParam, value: u64) -> Result<(), Error> {
        if self.is_known(param) {
            self.values[param as usize] = value;
        } else if param.checked() && value != param.assumed_default() {
            return Err(Error::IncompatibleDesignParameter {
                param,
                value,
                assumed: param.assumed_default(),
            });
        }
        Ok(())
    }

    /// Fills in the values reported by hardware.
    pub(crate) fn apply(&mut self, hw: &HwDesignParams) -> Result<(), Error> {
        self.set(
            DesignParam::RxSuperbufBytes,
            hw.rx_buffer_len * RX_BUFFER_LEN_UNIT,
        )?;
        self.set(DesignParam::RxFrameOffset, hw.frame_offset_fixed)?;
        self.set(DesignParam::RxStride, hw.rx_stride)?;
        self.set(DesignParam::RxQueues, hw.rx_queues)?;
        self.set(DesignParam::TxApertureBytes, hw.tx_aperture_size)?;
        self.set(DesignParam::TxFifoBytes, hw.tx_fifo_size)?;
        self.set(DesignParam::TimestampSubnanoBits, hw.ts_subnano_bit)?;
        self.set(DesignParam::UnsolCreditSeqMask, hw.unsol_credit_seq_mask)?;
        // Metadata always precedes the packet on this hardware.
        self.set(DesignParam::MdLocation, 0)?;
        Ok(())
    }
}
