#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod err;
pub mod platform;
pub mod probe;
pub mod sdhci;

pub use err::SdError;
pub use platform::{Deadline, Platform};
pub use sdhci::{
    AdmaConfig, AutoCmd, BlockDevice, CardInfo, CardType, HostConfig, InfiniteMode, IrqDelivery,
    SdHost, TransferStrategy,
    regs::{Mmio, RegisterIo},
};
