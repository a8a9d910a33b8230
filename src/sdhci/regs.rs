use bitflags::bitflags;

use super::{SdHost, constant::*};
use crate::platform::Platform;

/// Byte-offset access to an SDHCI register block.
pub trait RegisterIo {
    fn read32(&self, offset: u32) -> u32;
    fn read16(&self, offset: u32) -> u16;
    fn read8(&self, offset: u32) -> u8;
    fn write32(&self, offset: u32, value: u32);
    fn write16(&self, offset: u32, value: u16);
    fn write8(&self, offset: u32, value: u8);
}

/// Memory-mapped controller registers.
#[derive(Debug, Clone, Copy)]
pub struct Mmio {
    base_addr: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base_addr` must point at a mapped SDHCI register block that stays
    /// mapped for the lifetime of the returned value.
    pub const unsafe fn new(base_addr: usize) -> Self {
        Self { base_addr }
    }

    pub fn base_addr(&self) -> usize {
        self.base_addr
    }
}

impl RegisterIo for Mmio {
    fn read32(&self, offset: u32) -> u32 {
        unsafe { core::ptr::read_volatile((self.base_addr + offset as usize) as *const u32) }
    }

    fn read16(&self, offset: u32) -> u16 {
        unsafe { core::ptr::read_volatile((self.base_addr + offset as usize) as *const u16) }
    }

    fn read8(&self, offset: u32) -> u8 {
        unsafe { core::ptr::read_volatile((self.base_addr + offset as usize) as *const u8) }
    }

    fn write32(&self, offset: u32, value: u32) {
        unsafe { core::ptr::write_volatile((self.base_addr + offset as usize) as *mut u32, value) }
    }

    fn write16(&self, offset: u32, value: u16) {
        unsafe { core::ptr::write_volatile((self.base_addr + offset as usize) as *mut u16, value) }
    }

    fn write8(&self, offset: u32, value: u8) {
        unsafe { core::ptr::write_volatile((self.base_addr + offset as usize) as *mut u8, value) }
    }
}

/// Register width selector for the generated accessors.
pub trait RegWidth: Sized {
    fn load<R: RegisterIo + ?Sized>(io: &R, offset: u32) -> Self;
    fn store<R: RegisterIo + ?Sized>(io: &R, offset: u32, value: Self);
}

impl RegWidth for u32 {
    fn load<R: RegisterIo + ?Sized>(io: &R, offset: u32) -> Self {
        io.read32(offset)
    }

    fn store<R: RegisterIo + ?Sized>(io: &R, offset: u32, value: Self) {
        io.write32(offset, value)
    }
}

impl RegWidth for u16 {
    fn load<R: RegisterIo + ?Sized>(io: &R, offset: u32) -> Self {
        io.read16(offset)
    }

    fn store<R: RegisterIo + ?Sized>(io: &R, offset: u32, value: Self) {
        io.write16(offset, value)
    }
}

impl RegWidth for u8 {
    fn load<R: RegisterIo + ?Sized>(io: &R, offset: u32) -> Self {
        io.read8(offset)
    }

    fn store<R: RegisterIo + ?Sized>(io: &R, offset: u32, value: Self) {
        io.write8(offset, value)
    }
}

// `ro` registers get a reader, `wo` a writer, `rw` both.
macro_rules! sdhci_registers {
    (@ro $name:ident: $ty:ty = $offset:expr) => {
        paste::paste! {
            #[inline]
            pub(crate) fn [<read_ $name>](&self) -> $ty {
                <$ty as RegWidth>::load(&self.io, $offset)
            }
        }
    };
    (@wo $name:ident: $ty:ty = $offset:expr) => {
        paste::paste! {
            #[inline]
            pub(crate) fn [<write_ $name>](&self, value: $ty) {
                <$ty as RegWidth>::store(&self.io, $offset, value)
            }
        }
    };
    (@rw $name:ident: $ty:ty = $offset:expr) => {
        sdhci_registers!(@ro $name: $ty = $offset);
        sdhci_registers!(@wo $name: $ty = $offset);
    };
    ($($access:ident $name:ident: $ty:ty = $offset:expr;)*) => {
        impl<R: RegisterIo, P: Platform> SdHost<R, P> {
            $(sdhci_registers!(@$access $name: $ty = $offset);)*
        }
    };
}

sdhci_registers! {
    rw sdma_addr: u32 = SDHCI_DMA_ADDRESS;
    wo blk_size: u16 = SDHCI_BLOCK_SIZE;
    wo blk_cnt: u16 = SDHCI_BLOCK_COUNT;
    wo argument: u32 = SDHCI_ARGUMENT;
    wo xfer_mode: u16 = SDHCI_TRANSFER_MODE;
    wo command: u16 = SDHCI_COMMAND;
    rw buffer: u32 = SDHCI_BUFFER;
    rw buffer16: u16 = SDHCI_BUFFER;
    rw buffer8: u8 = SDHCI_BUFFER;
    ro present_state: u32 = SDHCI_PRESENT_STATE;
    rw host_ctl1: u8 = SDHCI_HOST_CONTROL;
    wo pwr_ctl: u8 = SDHCI_POWER_CONTROL;
    rw blk_gap_ctl: u8 = SDHCI_BLOCK_GAP_CONTROL;
    rw clk_ctl: u16 = SDHCI_CLOCK_CONTROL;
    wo timeout_ctl: u8 = SDHCI_TIMEOUT_CONTROL;
    rw sw_rst: u8 = SDHCI_SOFTWARE_RESET;
    rw normal_int_stat: u16 = SDHCI_INT_STATUS;
    rw err_int_stat: u16 = SDHCI_ERR_INT_STATUS;
    rw normal_int_en: u16 = SDHCI_INT_ENABLE;
    wo err_int_en: u16 = SDHCI_ERR_INT_ENABLE;
    wo normal_int_sig: u16 = SDHCI_SIGNAL_ENABLE;
    wo err_int_sig: u16 = SDHCI_ERR_SIGNAL_ENABLE;
    ro auto_cmd_stat: u16 = SDHCI_AUTO_CMD_STATUS;
    rw host_ctl2: u16 = SDHCI_HOST_CONTROL2;
    ro caps: u32 = SDHCI_CAPABILITIES;
    ro caps1: u32 = SDHCI_CAPABILITIES_1;
    wo adma_addr: u32 = SDHCI_ADMA_ADDRESS;
    ro host_version: u16 = SDHCI_HOST_VERSION;
    rw vendor_reg0: u32 = SDHCI_VENDOR_REG0;
    rw vendor_reg3: u32 = SDHCI_VENDOR_REG3;
    ro vendor_reg4: u32 = SDHCI_VENDOR_REG4;
    rw dma_hndshk: u32 = SDHCI_DMA_HANDSHAKE;
    ro hw_attr: u32 = SDHCI_HW_ATTRIBUTES;
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    // Read a 32-bit register
    pub fn read_reg(&self, offset: u32) -> u32 {
        self.io.read32(offset)
    }

    // Read a 16-bit register
    pub fn read_reg16(&self, offset: u32) -> u16 {
        self.io.read16(offset)
    }

    // Read an 8-bit register
    pub fn read_reg8(&self, offset: u32) -> u8 {
        self.io.read8(offset)
    }

    // Write a 32-bit register
    pub fn write_reg(&self, offset: u32, value: u32) {
        self.io.write32(offset, value)
    }

    // Write a 16-bit register
    pub fn write_reg16(&self, offset: u32, value: u16) {
        self.io.write16(offset, value)
    }

    // Write an 8-bit register
    pub fn write_reg8(&self, offset: u32, value: u8) {
        self.io.write8(offset, value)
    }

    pub(crate) fn present(&self) -> PresentState {
        PresentState::from_bits_truncate(self.read_present_state())
    }

    /// The four response words, lowest first.
    pub(crate) fn read_response(&self) -> [u32; 4] {
        [
            self.read_reg(SDHCI_RESPONSE),
            self.read_reg(SDHCI_RESPONSE + 4),
            self.read_reg(SDHCI_RESPONSE + 8),
            self.read_reg(SDHCI_RESPONSE + 12),
        ]
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentState: u32 {
        const CMD_INHIBIT = SDHCI_CMD_INHIBIT;
        const DATA_INHIBIT = SDHCI_DATA_INHIBIT;
        const DAT_LINE_ACTIVE = SDHCI_DAT_LINE_ACTIVE;
        const BUFFER_WRITE_ENABLE = SDHCI_BUFFER_WRITE_ENABLE;
        const BUFFER_READ_ENABLE = SDHCI_BUFFER_READ_ENABLE;
        const CARD_INSERTED = SDHCI_CARD_INSERTED;
        const CARD_STABLE = SDHCI_CARD_STABLE;
        const WRITE_PROTECT = SDHCI_WRITE_PROTECT;
        const DAT_LINE_LEVEL = SDHCI_DAT_LINE_LEVEL;
        const CMD_LINE_LEVEL = SDHCI_CMD_LINE_LEVEL;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NormalInt: u16 {
        const CMD_COMPLETE = SDHCI_INT_CMD_COMPLETE;
        const XFER_COMPLETE = SDHCI_INT_XFER_COMPLETE;
        const BLOCK_GAP = SDHCI_INT_BLOCK_GAP;
        const DMA = SDHCI_INT_DMA;
        const BUF_WR_READY = SDHCI_INT_BUF_WR_READY;
        const BUF_RD_READY = SDHCI_INT_BUF_RD_READY;
        const CARD_INSERT = SDHCI_INT_CARD_INSERT;
        const CARD_REMOVE = SDHCI_INT_CARD_REMOVE;
        const CARD_INT = SDHCI_INT_CARD_INT;
        const RETUNE = SDHCI_INT_RETUNE;
        const ERROR = SDHCI_INT_ERROR;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorInt: u16 {
        const CMD_TIMEOUT = SDHCI_INT_ERR_CMD_TIMEOUT;
        const CMD_CRC = SDHCI_INT_ERR_CMD_CRC;
        const CMD_END_BIT = SDHCI_INT_ERR_CMD_END_BIT;
        const CMD_INDEX = SDHCI_INT_ERR_CMD_INDEX;
        const DATA_TIMEOUT = SDHCI_INT_ERR_DATA_TIMEOUT;
        const DATA_CRC = SDHCI_INT_ERR_DATA_CRC;
        const DATA_END_BIT = SDHCI_INT_ERR_DATA_END_BIT;
        const CURRENT_LIMIT = SDHCI_INT_ERR_CURRENT_LIMIT;
        const AUTO_CMD = SDHCI_INT_ERR_AUTO_CMD;
        const ADMA = SDHCI_INT_ERR_ADMA;
        const TUNING = SDHCI_INT_ERR_TUNING;
        const CMD_LINE = SDHCI_INT_ERR_CMD_LINE;
        const DATA_LINE = SDHCI_INT_ERR_DATA_LINE;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferMode: u16 {
        const DMA = SDHCI_TRNS_DMA;
        const BLK_CNT_EN = SDHCI_TRNS_BLK_CNT_EN;
        const AUTO_CMD12 = SDHCI_TRNS_AUTO_CMD12;
        const AUTO_CMD23 = SDHCI_TRNS_AUTO_CMD23;
        const READ = SDHCI_TRNS_READ;
        const MULTI = SDHCI_TRNS_MULTI;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AutoCmdErr: u16 {
        const NOT_EXECUTED = SDHCI_AUTO_CMD_NOT_EXECUTED;
        const TIMEOUT = SDHCI_AUTO_CMD_TIMEOUT;
        const CRC = SDHCI_AUTO_CMD_CRC;
        const END_BIT = SDHCI_AUTO_CMD_END_BIT;
        const INDEX = SDHCI_AUTO_CMD_INDEX;
        const NOT_ISSUED = SDHCI_AUTO_CMD_NOT_ISSUED;
    }
}

bitflags! {
    /// Conditions still outstanding for the operation in flight.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Completion: u8 {
        const CMD = WAIT_CMD_COMPLETE;
        const TRANS = WAIT_TRANS_COMPLETE;
        const DMA = WAIT_DMA_INTR;
        const BLOCK_GAP = WAIT_BLOCK_GAP;
    }
}
