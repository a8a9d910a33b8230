pub mod constant;
pub mod regs;

mod adma;
mod block;
mod bus;
mod card;
mod cmd;
mod init;
mod irq;
mod ops;
mod recovery;
mod transfer;

use core::{
    fmt::Display,
    sync::atomic::{AtomicU32, Ordering},
};

use log::{debug, info, warn};
use spin::Mutex;

use constant::*;
use regs::RegisterIo;

use crate::{
    err::SdError,
    platform::{Deadline, Platform},
};

pub use adma::{Adma2Line, AdmaConfig, AdmaFill, DescriptorTable, build_descriptors};
pub use block::BlockDevice;
pub use card::{CardInfo, CardState, CardType, Cid, Csd, CsdLayout, ExtCsd, Scr, SdCard};
pub use cmd::{ResponseType, SdCommand, SdResponse};
pub use irq::IrqShared;

/// How data moves between memory and the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// CPU copies through the data port, `unit` bytes (1, 2 or 4) per access.
    Pio { unit: u8 },
    /// Single-buffer DMA that pauses every `4 KiB << boundary` bytes.
    Sdma { boundary: u8 },
    /// Scatter-gather DMA driven by a descriptor table.
    Adma2(AdmaConfig),
}

impl TransferStrategy {
    pub fn is_dma(&self) -> bool {
        !matches!(self, TransferStrategy::Pio { .. })
    }
}

/// Stop command the controller issues on its own after a multi-block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCmd {
    None,
    Cmd12,
    Cmd23,
}

/// Open-ended transfer test mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfiniteMode {
    Off,
    /// Program twice the block count and stop at the block gap.
    DoubleCount,
    /// Program a block count of zero and stop at the block gap.
    ZeroCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqDelivery {
    /// Waits service the status registers themselves.
    Polled,
    /// The platform calls [`SdHost::handle_interrupt`] from its interrupt line.
    External,
}

#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub strategy: TransferStrategy,
    pub auto_cmd: AutoCmd,
    pub infinite: InfiniteMode,
    pub irq: IrqDelivery,
    /// Overrides the base clock reported in the capabilities register.
    pub base_clock_hz: Option<u32>,
}

impl Default for HostConfig {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "dma")] {
                let strategy = TransferStrategy::Adma2(AdmaConfig::default());
            } else {
                let strategy = TransferStrategy::Pio { unit: 4 };
            }
        }

        Self {
            strategy,
            auto_cmd: AutoCmd::Cmd12,
            infinite: InfiniteMode::Off,
            irq: IrqDelivery::Polled,
            base_clock_hz: None,
        }
    }
}

// SD Host Controller structure
pub struct SdHost<R: RegisterIo, P: Platform> {
    io: R,
    platform: P,
    config: HostConfig,
    card: Option<SdCard>,
    caps: u32,
    caps1: u32,
    version: u16,
    max_clk: u32,
    min_clk: u32,
    ocr_avail: u32,
    fifo_depth: usize,
    timeout_ms: u64,
    clock: AtomicU32,
    irq: IrqShared,
    desc: Mutex<Option<DescriptorTable>>,
}

impl<R: RegisterIo, P: Platform> Display for SdHost<R, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SDHCI Controller {{ version: {:#x}, caps: {:#x}, caps1: {:#x}, max_clk: {}, strategy: {:?}, card: {:?} }}",
            self.version,
            self.caps,
            self.caps1,
            self.max_clk,
            self.config.strategy,
            self.card.as_ref().map(|c| c.card_type)
        )
    }
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    pub fn new(io: R, platform: P, config: HostConfig) -> Self {
        let host = Self {
            io,
            platform,
            config,
            card: None,
            caps: 0,
            caps1: 0,
            version: 0,
            max_clk: 0,
            min_clk: 0,
            ocr_avail: 0,
            fifo_depth: 0,
            timeout_ms: 0,
            clock: AtomicU32::new(0),
            irq: IrqShared::default(),
            desc: Mutex::new(None),
        };

        info!("SDHCI Controller created: {}", host);

        host
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn card(&self) -> Option<&SdCard> {
        self.card.as_ref()
    }

    pub fn irq_state(&self) -> &IrqShared {
        &self.irq
    }

    pub fn max_clock(&self) -> u32 {
        self.max_clk
    }

    /// SD clock last programmed, 0 while stopped.
    pub fn clock(&self) -> u32 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn fifo_depth(&self) -> usize {
        self.fifo_depth
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn is_card_present(&self) -> bool {
        self.present().contains(regs::PresentState::CARD_INSERTED)
    }

    /// Brings the controller to a known state: reset, clocks, power,
    /// interrupt enables and the transfer strategy.
    pub fn initialize(&mut self) -> Result<(), SdError> {
        info!("Init SDHCI Controller");

        self.reset(SDHCI_RESET_ALL)?;

        self.version = self.read_host_version();
        self.caps = self.read_caps();
        self.caps1 = self.read_caps1();
        info!("SDHCI Version: 0x{:x}", self.version);
        info!("SDHCI Capabilities: {:#x} {:#x}", self.caps, self.caps1);

        let mut base_mhz = (self.caps & SDHCI_CLOCK_BASE_MASK) >> SDHCI_CLOCK_BASE_SHIFT;
        if base_mhz == 0 {
            base_mhz = SDHCI_DEFAULT_BASE_CLOCK_MHZ;
        }
        self.max_clk = match self.config.base_clock_hz {
            Some(hz) if hz > 0 => hz,
            _ => base_mhz * 1_000_000,
        };
        self.min_clk = self.max_clk / 256;

        self.ocr_avail = 0;
        if self.caps & SDHCI_CAN_VDD_330 != 0 {
            self.ocr_avail |= (1 << 20) | (1 << 21);
        }
        if self.caps & SDHCI_CAN_VDD_300 != 0 {
            self.ocr_avail |= (1 << 17) | (1 << 18);
        }
        if self.caps & SDHCI_CAN_VDD_180 != 0 {
            self.ocr_avail |= OCR_LOW_VOLTAGE;
        }

        self.set_clock(self.min_clk)?;
        self.set_power(Some(OCR_3V0_BIT))?;

        let attr = self.read_hw_attr();
        self.fifo_depth = if attr & SDHCI_HW_FIFO_SRAM != 0 {
            512
        } else if attr & SDHCI_HW_FIFO_16W != 0 {
            64
        } else {
            32
        };

        self.write_timeout_ctl(SDHCI_TIMEOUT_VALUE);
        let mhz = (self.max_clk / 1_000_000).max(1) as u64;
        self.timeout_ms = ((1u64 << (SDHCI_TIMEOUT_VALUE as u32 + 13)) / (mhz * 1000)).max(1);

        self.write_normal_int_en(SDHCI_INT_ENABLE_ALL);
        self.write_err_int_en(SDHCI_ERR_ENABLE_ALL);

        self.irq.set_card_present(self.is_card_present());
        self.irq.set_card_removed(false);

        self.set_transfer_type()?;

        info!(
            "max clock {} Hz, fifo {} bytes, timeout {} ms, ocr window {:#x}",
            self.max_clk, self.fifo_depth, self.timeout_ms, self.ocr_avail
        );

        Ok(())
    }

    /// Full bring-up: controller, card enumeration and the fastest default
    /// speed the card accepts.
    pub fn init(&mut self) -> Result<(), SdError> {
        self.initialize()?;

        if !self.is_card_present() {
            return Err(SdError::NoCard);
        }

        self.scan_cards()?;

        match self.set_speed_mode(1) {
            Ok(()) => {
                let max_dtr = self.card.as_ref().map(|c| c.max_dtr).unwrap_or(0);
                self.set_clock(max_dtr)?;
            }
            Err(e) => warn!("high speed not negotiated, staying at default: {}", e),
        }

        if let Some(card) = &self.card {
            info!("card ready: {}", card.info());
        }

        Ok(())
    }

    fn set_transfer_type(&mut self) -> Result<(), SdError> {
        let ctl = self.read_host_ctl1() & !SDHCI_CTRL_DMA_MASK;
        self.write_dma_hndshk(self.read_dma_hndshk() & !SDHCI_DMA_HANDSHAKE_EN);

        match self.config.strategy {
            TransferStrategy::Pio { unit } => {
                if !matches!(unit, 1 | 2 | 4) {
                    return Err(SdError::InvalidArgument);
                }
                self.write_host_ctl1(ctl);
                self.write_normal_int_sig(SDHCI_SIGNAL_PIO);
            }
            TransferStrategy::Sdma { .. } => {
                self.write_host_ctl1(ctl);
                self.write_normal_int_sig(SDHCI_SIGNAL_SDMA);
            }
            TransferStrategy::Adma2(adma) => {
                let bus = {
                    let mut desc = self.desc.lock();
                    if desc.is_none() {
                        *desc = Some(DescriptorTable::new(&self.platform, adma.seed)?);
                    }
                    desc.as_ref().map(|t| t.bus_addr()).unwrap_or(0)
                };
                self.write_adma_addr(bus);
                self.write_host_ctl1(ctl | SDHCI_CTRL_ADMA2);
                self.write_normal_int_sig(SDHCI_SIGNAL_ADMA);
            }
        }
        self.write_err_int_sig(SDHCI_ERR_SIGNAL_ALL);

        debug!("transfer strategy {:?}", self.config.strategy);
        Ok(())
    }

    /// Software reset of the lines in `mask`, waiting for the bits to self-clear.
    pub(crate) fn reset(&self, mask: u8) -> Result<(), SdError> {
        self.write_sw_rst(mask);

        let deadline = Deadline::after_ms(&self.platform, RESET_WAIT_MS);
        while self.read_sw_rst() & mask != 0 {
            if deadline.expired(&self.platform) {
                warn!("software reset {:#x} did not complete", mask);
                return Err(SdError::Timeout);
            }
        }

        Ok(())
    }

    pub(crate) fn card_ref(&self) -> Result<&SdCard, SdError> {
        if self.irq.card_removed() {
            return Err(SdError::NoCard);
        }
        self.card.as_ref().ok_or(SdError::NoCard)
    }
}
