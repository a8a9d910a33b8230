// ===== Card Session =====

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use crate::err::SdError;

use super::constant::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Unknown,
    Sd,
    Mmc,
    Sdio,
}

/// CURRENT_STATE field of the R1 card status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Standby = 3,
    Transfer = 4,
    Data = 5,
    Receive = 6,
    Program = 7,
    Disconnect = 8,
}

impl CardState {
    pub fn from_r1(status: u32) -> u8 {
        ((status >> R1_CURRENT_STATE_SHIFT) & R1_CURRENT_STATE_MASK) as u8
    }
}

// 136-bit responses arrive without the CRC byte, so record bit n sits at
// register bit n - 8. `hi` holds register bits 127:64, `lo` bits 63:0.
fn split_r2(raw: &[u32; 4]) -> (u64, u64) {
    let hi = ((raw[3] as u64) << 32) | raw[2] as u64;
    let lo = ((raw[1] as u64) << 32) | raw[0] as u64;
    (hi, lo)
}

fn bits(word: u64, shift: u32, width: u32) -> u32 {
    ((word >> shift) & ((1u64 << width) - 1)) as u32
}

/// Card identification register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 6],
    pub revision: u8,
    pub serial: u32,
    pub month: u8,
    pub year: u16,
}

impl Cid {
    pub fn decode_sd(raw: &[u32; 4]) -> Self {
        let (hi, lo) = split_r2(raw);
        let mut product_name = [0u8; 6];
        product_name[0] = bits(hi, 24, 8) as u8;
        product_name[1] = bits(hi, 16, 8) as u8;
        product_name[2] = bits(hi, 8, 8) as u8;
        product_name[3] = bits(hi, 0, 8) as u8;
        product_name[4] = bits(lo, 56, 8) as u8;

        Self {
            manufacturer_id: bits(hi, 48, 8) as u8,
            oem_id: bits(hi, 32, 16) as u16,
            product_name,
            revision: bits(lo, 48, 8) as u8,
            serial: bits(lo, 16, 32),
            month: bits(lo, 0, 4) as u8,
            year: bits(lo, 4, 8) as u16 + 2000,
        }
    }

    pub fn decode_mmc(raw: &[u32; 4]) -> Self {
        let (hi, lo) = split_r2(raw);
        let mut product_name = [0u8; 6];
        product_name[0] = bits(hi, 24, 8) as u8;
        product_name[1] = bits(hi, 16, 8) as u8;
        product_name[2] = bits(hi, 8, 8) as u8;
        product_name[3] = bits(hi, 0, 8) as u8;
        product_name[4] = bits(lo, 56, 8) as u8;
        product_name[5] = bits(lo, 48, 8) as u8;

        Self {
            manufacturer_id: bits(hi, 48, 8) as u8,
            oem_id: bits(hi, 32, 8) as u16,
            product_name,
            revision: bits(lo, 40, 8) as u8,
            serial: bits(lo, 8, 32),
            month: bits(lo, 4, 4) as u8,
            year: bits(lo, 0, 4) as u16 + 1997,
        }
    }

    pub fn name(&self) -> &str {
        let len = self
            .product_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.product_name.len());
        core::str::from_utf8(&self.product_name[..len]).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CsdLayout {
    #[default]
    SdV1,
    /// High capacity layout, 22-bit C_SIZE in 512 KiB units.
    SdV2,
    Mmc,
}

/// Card-specific data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Csd {
    pub layout: CsdLayout,
    pub taac: u8,
    pub nsac: u8,
    pub tran_speed: u8,
    pub ccc: u16,
    pub read_bl_len: u8,
    pub write_bl_len: u8,
    pub dsr_imp: bool,
    pub c_size: u32,
    pub c_size_mult: u8,
    /// MMC only.
    pub spec_vers: u8,
    pub erase_grp_size: u8,
    pub erase_grp_mult: u8,
}

const TRAN_EXP: [u32; 8] = [10_000, 100_000, 1_000_000, 10_000_000, 0, 0, 0, 0];
const TRAN_MANT: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

impl Csd {
    fn common(hi: u64, lo: u64, layout: CsdLayout) -> Self {
        Self {
            layout,
            taac: bits(hi, 40, 8) as u8,
            nsac: bits(hi, 32, 8) as u8,
            tran_speed: bits(hi, 24, 8) as u8,
            ccc: bits(hi, 12, 12) as u16,
            read_bl_len: bits(hi, 8, 4) as u8,
            write_bl_len: bits(lo, 14, 4) as u8,
            dsr_imp: bits(hi, 4, 1) != 0,
            ..Default::default()
        }
    }

    /// Decodes an SD CSD, picking the layout from CSD_STRUCTURE.
    pub fn decode_sd(raw: &[u32; 4]) -> Result<Self, SdError> {
        let (hi, lo) = split_r2(raw);
        match bits(hi, 54, 2) {
            0 => {
                let mut csd = Self::common(hi, lo, CsdLayout::SdV1);
                csd.c_size = (bits(hi, 0, 2) << 10) | bits(lo, 54, 10);
                csd.c_size_mult = bits(lo, 39, 3) as u8;
                Ok(csd)
            }
            1 => {
                let mut csd = Self::common(hi, lo, CsdLayout::SdV2);
                csd.c_size = bits(lo, 40, 22);
                Ok(csd)
            }
            _ => Err(SdError::InvalidResponse),
        }
    }

    pub fn decode_mmc(raw: &[u32; 4]) -> Self {
        let (hi, lo) = split_r2(raw);
        let mut csd = Self::common(hi, lo, CsdLayout::Mmc);
        csd.spec_vers = bits(hi, 50, 4) as u8;
        csd.c_size = (bits(hi, 0, 2) << 10) | bits(lo, 54, 10);
        csd.c_size_mult = bits(lo, 39, 3) as u8;
        csd.erase_grp_size = bits(lo, 34, 5) as u8;
        csd.erase_grp_mult = bits(lo, 29, 5) as u8;
        csd
    }

    /// Capacity in 512-byte blocks.
    pub fn blocks(&self) -> u64 {
        match self.layout {
            CsdLayout::SdV2 => (self.c_size as u64 + 1) << 10,
            CsdLayout::SdV1 | CsdLayout::Mmc => {
                let scale = (self.read_bl_len as u32).saturating_sub(SD_BLOCK_LEN_SHIFT);
                ((self.c_size as u64 + 1) << (self.c_size_mult as u32 + 2)) << scale
            }
        }
    }

    /// Maximum data rate in Hz from TRAN_SPEED.
    pub fn max_dtr(&self) -> u32 {
        let exp = (self.tran_speed & 0x7) as usize;
        let mant = ((self.tran_speed >> 3) & 0xF) as usize;
        TRAN_EXP[exp] * TRAN_MANT[mant]
    }
}

/// SD configuration register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scr {
    pub structure: u8,
    pub sd_spec: u8,
    pub bus_widths: u8,
    pub sd_spec3: bool,
    pub cmd_support: u8,
}

impl Scr {
    pub const BUS_WIDTH_1: u8 = 0x1;
    pub const BUS_WIDTH_4: u8 = 0x4;

    /// The register is sent most significant byte first.
    pub fn decode(raw: &[u8; SD_SCR_LEN]) -> Self {
        let scr = u64::from_be_bytes(*raw);
        Self {
            structure: bits(scr, 60, 4) as u8,
            sd_spec: bits(scr, 56, 4) as u8,
            bus_widths: bits(scr, 48, 4) as u8,
            sd_spec3: bits(scr, 47, 1) != 0,
            cmd_support: bits(scr, 32, 2) as u8,
        }
    }

    pub fn supports_width(&self, width: u8) -> bool {
        match width {
            1 => self.bus_widths & Self::BUS_WIDTH_1 != 0,
            4 => self.bus_widths & Self::BUS_WIDTH_4 != 0,
            _ => false,
        }
    }
}

/// The EXT_CSD fields the driver acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtCsd {
    pub rev: u8,
    pub structure: u8,
    pub card_type: u8,
    pub bus_width: u8,
    pub hs_timing: u8,
    pub sec_count: u32,
    pub boot_size_mult: u8,
}

impl ExtCsd {
    pub fn decode(raw: &[u8; EXT_CSD_LEN]) -> Self {
        Self {
            rev: raw[EXT_CSD_REV],
            structure: raw[EXT_CSD_STRUCTURE],
            card_type: raw[EXT_CSD_CARD_TYPE],
            bus_width: raw[EXT_CSD_BUS_WIDTH as usize],
            hs_timing: raw[EXT_CSD_HS_TIMING as usize],
            sec_count: u32::from_le_bytes([
                raw[EXT_CSD_SEC_CNT],
                raw[EXT_CSD_SEC_CNT + 1],
                raw[EXT_CSD_SEC_CNT + 2],
                raw[EXT_CSD_SEC_CNT + 3],
            ]),
            boot_size_mult: raw[EXT_CSD_BOOT_MULT],
        }
    }

    /// High speed clock the card type field allows, 0 if none.
    pub fn hs_max_dtr(&self) -> u32 {
        if self.card_type & 0xE != 0 {
            MMC_HS52_DTR
        } else if self.card_type & 0x1 != 0 {
            MMC_HS26_DTR
        } else {
            0
        }
    }

    /// Boot partition size in 512-byte blocks.
    pub fn boot_blocks(&self) -> u64 {
        ((self.boot_size_mult as u64) * 128 * 1024) >> SD_BLOCK_LEN_SHIFT
    }
}

// SD Card structure
#[derive(Debug)]
pub struct SdCard {
    pub card_type: CardType,
    pub rca: u16,
    pub ocr: u32,
    pub raw_cid: [u32; 4],
    pub cid: Cid,
    pub raw_csd: [u32; 4],
    pub csd: Csd,
    pub scr: Option<Scr>,
    pub ext_csd: Option<ExtCsd>,
    /// SEND_IF_COND was answered, the card speaks SD 2.0 or later.
    pub f8: bool,
    /// Block rather than byte addressing.
    pub high_capacity: bool,
    pub max_dtr: u32,
    /// Last addressable block.
    pub max_block: u64,
    pub boot_blocks: u64,
    pub bus_width: AtomicU8,
    pub speed_mode: AtomicU8,
    pub initialized: AtomicBool,
}

impl SdCard {
    pub fn new(card_type: CardType) -> Self {
        Self {
            card_type,
            rca: 0,
            ocr: 0,
            raw_cid: [0; 4],
            cid: Cid::default(),
            raw_csd: [0; 4],
            csd: Csd::default(),
            scr: None,
            ext_csd: None,
            f8: false,
            high_capacity: false,
            max_dtr: 0,
            max_block: 0,
            boot_blocks: 0,
            bus_width: AtomicU8::new(1),
            speed_mode: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn bus_width(&self) -> u8 {
        self.bus_width.load(Ordering::Acquire)
    }

    pub fn speed_mode(&self) -> u8 {
        self.speed_mode.load(Ordering::Acquire)
    }

    pub fn block_count(&self) -> u64 {
        self.max_block + 1
    }

    /// Argument for a data command addressing `block`.
    pub fn data_address(&self, block: u32) -> u32 {
        if self.high_capacity {
            block
        } else {
            block << SD_BLOCK_LEN_SHIFT
        }
    }

    pub fn info(&self) -> CardInfo {
        CardInfo {
            card_type: self.card_type,
            rca: self.rca,
            manufacturer_id: self.cid.manufacturer_id,
            application_id: self.cid.oem_id,
            product_name: self.cid.product_name,
            serial_number: self.cid.serial,
            manufacturing_month: self.cid.month,
            manufacturing_year: self.cid.year,
            capacity_bytes: self.block_count() * SD_BLOCK_SIZE as u64,
            block_size: SD_BLOCK_SIZE as u32,
            max_dtr: self.max_dtr,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CardInfo {
    pub card_type: CardType,
    pub rca: u16,
    pub manufacturer_id: u8,
    pub application_id: u16,
    pub product_name: [u8; 6],
    pub serial_number: u32,
    pub manufacturing_month: u8,
    pub manufacturing_year: u16,
    pub capacity_bytes: u64,
    pub block_size: u32,
    pub max_dtr: u32,
}

impl fmt::Display for CardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.product_name.iter().position(|&c| c == 0).unwrap_or(6);
        let name = core::str::from_utf8(&self.product_name[..len]).unwrap_or("?");
        write!(
            f,
            "{:?} {} mid {:#x} oid {:#x} sn {:#x} {}/{} rca {:#x}, {} MiB, {} Hz",
            self.card_type,
            name,
            self.manufacturer_id,
            self.application_id,
            self.serial_number,
            self.manufacturing_month,
            self.manufacturing_year,
            self.rca,
            self.capacity_bytes >> 20,
            self.max_dtr
        )
    }
}
