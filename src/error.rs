//! Contract violations.
//!
//! Running out of space is not an error: the allocators report it by returning
//! `None`. Everything in here is a caller bug (or a bad bank configuration),
//! after which the block table can no longer be trusted. These are never
//! returned to be handled and retried; they go through [`fatal`], which logs
//! and panics.

use thiserror::Error;

use crate::algorithm::DeviceAddr;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    #[error("invalid deallocation at {address:#x}: block is not allocated (bad address or double free)")]
    InvalidDeallocation { address: DeviceAddr },

    #[error("shrink size {amount:#x} cuts into allocated block at {address:#x}")]
    ShrinkCutsIntoAllocation { amount: DeviceAddr, address: DeviceAddr },

    #[error("shrink size {amount:#x} exceeds usable size {max_size:#x}")]
    ShrinkExceedsCapacity { amount: DeviceAddr, max_size: DeviceAddr },

    #[error("shrinking from the top is not supported")]
    TopDownShrinkUnsupported,

    #[error("alignment {alignment:#x} must be a non-zero power of two")]
    InvalidAlignment { alignment: DeviceAddr },

    #[error("offset {offset:#x} should be {alignment} B aligned")]
    MisalignedOffset { offset: DeviceAddr, alignment: DeviceAddr },

    #[error("bank size {size:#x} should be {alignment} B aligned")]
    MisalignedSize { size: DeviceAddr, alignment: DeviceAddr },

    #[error("bank at {offset:#x} with size {size:#x} runs past the end of the address space")]
    BankOutOfRange { offset: DeviceAddr, size: DeviceAddr },

    #[error("out of memory: cannot allocate below {limit:#x}, allocation would start at {address:#x}")]
    AddressLimitExceeded { limit: DeviceAddr, address: DeviceAddr },
}

/// Escalate a contract violation. Never returns.
#[cold]
#[track_caller]
pub fn fatal(err: FatalError) -> ! {
    log::error!("{}", err);
    panic!("{}", err)
}
