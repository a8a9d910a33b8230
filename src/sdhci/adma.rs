//! ADMA2 descriptor table.
//!
//! Each line is 64 bits: attribute in 15:0, length in 31:16 (0 encodes
//! 65536) and a 32-bit system address in 63:32.

#[cfg(not(feature = "dma"))]
use alloc::{vec, vec::Vec};

use dma_api::Direction;
use log::debug;
use rand::{RngCore, SeedableRng, rngs::SmallRng};

#[cfg(feature = "dma")]
use dma_api::DVec;

use crate::{err::SdError, platform::Platform};

pub const ADMA2_LINES: usize = 64;
pub const ADMA2_LINE_SIZE: usize = 8;

// Lines the random fill may place freely; the rest are kept for the tail.
const ADMA2_FREE_LINES: usize = ADMA2_LINES - 2;

pub const ADMA2_VALID: u16 = 1 << 0;
pub const ADMA2_END: u16 = 1 << 1;
pub const ADMA2_INT: u16 = 1 << 2;
pub const ADMA2_ACT_MASK: u16 = 0x3 << 4;
pub const ADMA2_ACT_NOP: u16 = 0 << 4;
pub const ADMA2_ACT_TRAN: u16 = 2 << 4;
pub const ADMA2_ACT_LINK: u16 = 3 << 4;

const ADMA2_MAX_LINE_LEN: u32 = 0x1_0000;

/// How descriptor lines are laid out. Anything but `Linear` is a stress mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmaFill {
    #[default]
    Linear,
    /// Random 4-byte aligned lengths.
    RandomLength,
    /// Random mix of transfer, link and no-op lines.
    RandomAction,
    /// Both of the above.
    Random,
}

impl AdmaFill {
    fn random_length(self) -> bool {
        matches!(self, AdmaFill::RandomLength | AdmaFill::Random)
    }

    fn random_action(self) -> bool {
        matches!(self, AdmaFill::RandomAction | AdmaFill::Random)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmaConfig {
    /// Bytes per transfer line, 0 for the 64 KiB maximum.
    pub line_len: u32,
    /// Raise a DMA interrupt when the END line is reached.
    pub use_interrupt: bool,
    /// Terminate the table with an extra no-op line.
    pub insert_nop: bool,
    pub fill: AdmaFill,
    pub seed: u64,
}

impl Default for AdmaConfig {
    fn default() -> Self {
        Self {
            line_len: 0,
            use_interrupt: false,
            insert_nop: false,
            fill: AdmaFill::Linear,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adma2Line(pub u64);

impl Adma2Line {
    pub fn new(attr: u16, len: u32, addr: u32) -> Self {
        Self(attr as u64 | (((len & 0xFFFF) as u64) << 16) | ((addr as u64) << 32))
    }

    pub fn attr(&self) -> u16 {
        self.0 as u16
    }

    pub fn action(&self) -> u16 {
        self.attr() & ADMA2_ACT_MASK
    }

    pub fn is_valid(&self) -> bool {
        self.attr() & ADMA2_VALID != 0
    }

    pub fn is_end(&self) -> bool {
        self.attr() & ADMA2_END != 0
    }

    pub fn is_transfer(&self) -> bool {
        self.is_valid() && self.action() == ADMA2_ACT_TRAN
    }

    pub fn is_link(&self) -> bool {
        self.is_valid() && self.action() == ADMA2_ACT_LINK
    }

    /// Byte count, with the zero encoding of a transfer line expanded.
    pub fn len(&self) -> u32 {
        let len = ((self.0 >> 16) & 0xFFFF) as u32;
        if len == 0 && self.is_transfer() {
            ADMA2_MAX_LINE_LEN
        } else {
            len
        }
    }

    pub fn addr(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Fills `lines` to move `len` bytes starting at bus address `data`.
///
/// `table` is the bus address of `lines[0]`, needed to encode link lines.
/// Returns the index of the END line.
pub fn build_descriptors<G: RngCore>(
    lines: &mut [u64; ADMA2_LINES],
    table: u32,
    data: u32,
    len: usize,
    cfg: &AdmaConfig,
    rng: &mut G,
) -> Result<usize, SdError> {
    if len < 4 {
        return Err(SdError::InvalidArgument);
    }

    let per_line = if cfg.line_len == 0 {
        ADMA2_MAX_LINE_LEN
    } else {
        cfg.line_len.min(ADMA2_MAX_LINE_LEN)
    };

    lines.fill(0);

    let mut remaining = len as u64;
    let mut addr = data;
    let mut i = 0usize;
    let mut last = 0usize;

    while remaining > 0 {
        let free = i < ADMA2_FREE_LINES;
        let ran = if free && (cfg.fill != AdmaFill::Linear) {
            rng.next_u32()
        } else {
            0
        };

        let action = if free && cfg.fill.random_action() {
            match ran & 0xF {
                0..=7 => ADMA2_ACT_TRAN,
                8..=12 => ADMA2_ACT_LINK,
                _ => ADMA2_ACT_NOP,
            }
        } else {
            ADMA2_ACT_TRAN
        };

        match action {
            ADMA2_ACT_TRAN => {
                let mut count = if remaining > 256 && free {
                    if cfg.fill.random_length() {
                        ((ran as u64 % remaining) & 0xFFFC).min(per_line as u64)
                    } else {
                        remaining.min(per_line as u64)
                    }
                } else {
                    if remaining > ADMA2_MAX_LINE_LEN as u64 {
                        debug!("adma: {} bytes left with no free line", remaining);
                        return Err(SdError::DescriptorTable);
                    }
                    remaining
                };
                count = count.max(4).min(remaining);

                lines[i] = Adma2Line::new(ADMA2_ACT_TRAN | ADMA2_VALID, count as u32, addr).0;
                addr = addr.wrapping_add(count as u32);
                remaining -= count;
                last = i;
                i += 1;
            }
            ADMA2_ACT_LINK => {
                // A zero skip would point the line at itself.
                let skip = ((ran >> 4) & 0x7).max(1) as usize;
                let target = (i + skip).min(ADMA2_FREE_LINES);
                let target_addr = table + (target * ADMA2_LINE_SIZE) as u32;
                lines[i] = Adma2Line::new(ADMA2_ACT_LINK | ADMA2_VALID, 0, target_addr).0;
                i = target;
            }
            _ => {
                lines[i] = Adma2Line::new(ADMA2_ACT_NOP | ADMA2_VALID, 0, 0).0;
                i += 1;
            }
        }

        if i >= ADMA2_LINES && remaining > 0 {
            return Err(SdError::DescriptorTable);
        }
    }

    if cfg.insert_nop && i < ADMA2_LINES {
        lines[i] = 0;
        last = i;
    }

    let mut tail = ADMA2_VALID | ADMA2_END;
    if cfg.use_interrupt {
        tail |= ADMA2_INT;
    }
    lines[last] |= tail as u64;

    Ok(last)
}

/// Descriptor memory the controller walks during an ADMA2 transfer.
pub struct DescriptorTable {
    #[cfg(feature = "dma")]
    lines: DVec<u64>,
    #[cfg(not(feature = "dma"))]
    lines: Vec<u64>,
    bus: u32,
    rng: SmallRng,
}

impl DescriptorTable {
    pub(crate) fn new<P: Platform>(platform: &P, seed: u64) -> Result<Self, SdError> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "dma")] {
                let _ = platform;
                let lines: DVec<u64> = DVec::zeros(ADMA2_LINES, 0x1000, Direction::ToDevice)
                    .ok_or(SdError::MemoryError)?;
                let bus = lines.bus_addr() as u32;
            } else {
                let lines = vec![0u64; ADMA2_LINES];
                let bus = platform.dma_map(
                    lines.as_ptr() as usize,
                    ADMA2_LINES * ADMA2_LINE_SIZE,
                    Direction::ToDevice,
                );
            }
        }

        debug!("adma: descriptor table at bus {:#x}", bus);

        Ok(Self {
            lines,
            bus,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn bus_addr(&self) -> u32 {
        self.bus
    }

    pub fn line(&self, index: usize) -> Adma2Line {
        Adma2Line(self.lines[index])
    }

    pub(crate) fn fill(&mut self, data: u32, len: usize, cfg: &AdmaConfig) -> Result<usize, SdError> {
        let mut lines = [0u64; ADMA2_LINES];
        let end = build_descriptors(&mut lines, self.bus, data, len, cfg, &mut self.rng)?;

        cfg_if::cfg_if! {
            if #[cfg(feature = "dma")] {
                for (i, line) in lines.iter().enumerate() {
                    self.lines.set(i, *line);
                }
            } else {
                self.lines.copy_from_slice(&lines);
            }
        }

        Ok(end)
    }
}
