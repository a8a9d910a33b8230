// ===== Data Transfer =====

use dma_api::Direction;
use log::{debug, warn};
use spin::MutexGuard;

use crate::{
    err::SdError,
    platform::{Deadline, Platform},
};

use super::{
    AutoCmd, DescriptorTable, InfiniteMode, SdHost, TransferStrategy,
    cmd::{ResponseType, SdCommand},
    constant::*,
    regs::{Completion, NormalInt, RegisterIo, TransferMode},
};

pub(crate) enum DataBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl DataBuffer<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            DataBuffer::Read(buf) => buf.len(),
            DataBuffer::Write(buf) => buf.len(),
        }
    }

    pub(crate) fn is_read(&self) -> bool {
        matches!(self, DataBuffer::Read(_))
    }

    fn addr(&self) -> usize {
        match self {
            DataBuffer::Read(buf) => buf.as_ptr() as usize,
            DataBuffer::Write(buf) => buf.as_ptr() as usize,
        }
    }

    fn direction(&self) -> Direction {
        if self.is_read() {
            Direction::FromDevice
        } else {
            Direction::ToDevice
        }
    }
}

/// Bytes an SDMA transfer moves before pausing at the programmed boundary.
pub(crate) fn sdma_window(boundary: u8) -> u32 {
    SDHCI_SDMA_WINDOW_BASE << (boundary & 0x7)
}

/// Transfer mode register value for a card data command.
///
/// Open-ended transfers never use an automatic stop command nor the block
/// count. More than 65535 blocks only fit an ADMA2 transfer, which is
/// bounded by its descriptor table instead of the block count register.
pub(crate) fn transfer_mode(
    strategy: &TransferStrategy,
    auto_cmd: AutoCmd,
    infinite: bool,
    blocks: u32,
    read: bool,
) -> Result<TransferMode, SdError> {
    if blocks == 0 {
        return Err(SdError::InvalidArgument);
    }

    let mut mode = TransferMode::empty();
    if strategy.is_dma() {
        mode |= TransferMode::DMA;
    }
    if read {
        mode |= TransferMode::READ;
    }

    if blocks == 1 && !infinite {
        return Ok(mode);
    }
    mode |= TransferMode::MULTI;

    if infinite {
        return Ok(mode);
    }

    if blocks > SDHCI_MAX_BLOCK_COUNT {
        if !matches!(strategy, TransferStrategy::Adma2(_)) {
            return Err(SdError::InvalidArgument);
        }
    } else {
        mode |= TransferMode::BLK_CNT_EN;
    }

    // SDMA keeps its system address in the register CMD23 would use for the count.
    let auto_cmd = match (strategy, auto_cmd) {
        (TransferStrategy::Sdma { .. }, AutoCmd::Cmd23) => AutoCmd::Cmd12,
        (_, auto_cmd) => auto_cmd,
    };
    match auto_cmd {
        AutoCmd::None => {}
        AutoCmd::Cmd12 => mode |= TransferMode::AUTO_CMD12,
        AutoCmd::Cmd23 => mode |= TransferMode::AUTO_CMD23,
    }

    Ok(mode)
}

/// A data phase in flight.
///
/// Holds the DMA mapping and, for ADMA2, the descriptor table lock until the
/// transfer is over; both are released on drop, on every exit path.
struct DataPhase<'a, R: RegisterIo, P: Platform> {
    host: &'a SdHost<R, P>,
    bus: u32,
    len: usize,
    dir: Direction,
    mapped: bool,
    infinite: bool,
    _desc: Option<MutexGuard<'a, Option<DescriptorTable>>>,
}

impl<R: RegisterIo, P: Platform> Drop for DataPhase<'_, R, P> {
    fn drop(&mut self) {
        self.host.irq.set_mask(Completion::empty());
        if self.mapped {
            self.host.platform.dma_unmap(self.bus, self.len, self.dir);
        }
    }
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// Moves `blocks` blocks between `buf` and the card starting at `start`.
    pub(crate) fn transfer_blocks(
        &self,
        start: u32,
        blocks: u32,
        mut buf: DataBuffer<'_>,
    ) -> Result<(), SdError> {
        let infinite = self.config.infinite != InfiniteMode::Off;
        let mode = transfer_mode(
            &self.config.strategy,
            self.config.auto_cmd,
            infinite,
            blocks,
            buf.is_read(),
        )?;

        let phase = self.prepare_data(&buf, blocks, mode, infinite)?;
        self.send_data_command(start, blocks, buf.is_read(), infinite)?;
        self.transfer_data(&phase, &mut buf)
    }

    fn prepare_data(
        &self,
        buf: &DataBuffer<'_>,
        blocks: u32,
        mode: TransferMode,
        infinite: bool,
    ) -> Result<DataPhase<'_, R, P>, SdError> {
        let len = buf.len();
        let mut phase = DataPhase {
            host: self,
            bus: 0,
            len,
            dir: buf.direction(),
            mapped: false,
            infinite,
            _desc: None,
        };

        let blk_cnt = if infinite {
            match self.config.infinite {
                InfiniteMode::DoubleCount => blocks.saturating_mul(2).min(SDHCI_MAX_BLOCK_COUNT),
                _ => 0,
            }
        } else if blocks > SDHCI_MAX_BLOCK_COUNT {
            0
        } else {
            blocks
        };
        let mut blk_size = SD_BLOCK_SIZE as u16;
        let mut mask = Completion::TRANS;

        if mode.contains(TransferMode::AUTO_CMD23) {
            self.write_sdma_addr(blocks);
        }

        match self.config.strategy {
            TransferStrategy::Pio { .. } => {}
            TransferStrategy::Sdma { boundary } => {
                let bound = sdma_window(boundary);
                phase.bus = self.platform.dma_map(buf.addr(), len, phase.dir);
                phase.mapped = true;

                self.write_sdma_addr(phase.bus);
                blk_size |= ((boundary & 0x7) as u16) << SDHCI_SDMA_BOUNDARY_SHIFT;

                let crosses = (phase.bus % bound) as usize + len > bound as usize;
                if (infinite && mode.contains(TransferMode::MULTI)) || crosses {
                    mask = Completion::DMA;
                }
            }
            TransferStrategy::Adma2(cfg) => {
                phase.bus = self.platform.dma_map(buf.addr(), len, phase.dir);
                phase.mapped = true;

                let mut desc = self.desc.lock();
                if desc.is_none() {
                    *desc = Some(DescriptorTable::new(&self.platform, cfg.seed)?);
                }
                let table = desc.as_mut().ok_or(SdError::DescriptorTable)?;
                let end = table.fill(phase.bus, len, &cfg)?;
                self.write_adma_addr(table.bus_addr());
                debug!("adma: {} bytes, end line {}", len, end);
                phase._desc = Some(desc);

                if cfg.use_interrupt {
                    mask |= Completion::DMA;
                }
            }
        }

        self.write_blk_size(blk_size);
        self.write_blk_cnt(blk_cnt as u16);
        self.write_xfer_mode(mode.bits());
        self.irq.set_mask(mask);

        debug!(
            "data: {} blocks {}, mode {:?}, wait {:?}",
            blocks,
            if buf.is_read() { "in" } else { "out" },
            mode,
            mask
        );
        Ok(phase)
    }

    fn send_data_command(
        &self,
        start: u32,
        blocks: u32,
        read: bool,
        infinite: bool,
    ) -> Result<(), SdError> {
        let card = self.card_ref()?;
        let multi = blocks > 1 || infinite;
        let opcode = match (read, multi) {
            (true, false) => MMC_READ_SINGLE_BLOCK,
            (true, true) => MMC_READ_MULTIPLE_BLOCK,
            (false, false) => MMC_WRITE_BLOCK,
            (false, true) => MMC_WRITE_MULTIPLE_BLOCK,
        };

        let cmd = SdCommand::new(opcode, card.data_address(start), ResponseType::R1).with_data();
        let status = self.send_command(&cmd)?.as_r1();
        if status & R1_ERROR_BITS != 0 {
            warn!("cmd{}: card status {:#010x}", opcode, status);
            if let Err(e) = self.abort() {
                warn!("cmd{}: abort after card status error failed: {}", opcode, e);
            }
            return Err(SdError::CardError(status, "card status error"));
        }

        Ok(())
    }

    fn transfer_data(
        &self,
        phase: &DataPhase<'_, R, P>,
        buf: &mut DataBuffer<'_>,
    ) -> Result<(), SdError> {
        let moved = match self.config.strategy {
            TransferStrategy::Pio { unit } => self.pio_transfer(buf, unit, phase.infinite),
            TransferStrategy::Sdma { boundary } => {
                self.sdma_transfer(phase, buf.is_read(), sdma_window(boundary))
            }
            TransferStrategy::Adma2(_) => self.wait_completion(
                Completion::all(),
                self.timeout_ms * 10,
                SdError::DataTimeout,
            ),
        };

        let result = moved.and_then(|_| {
            self.wait_completion(Completion::all(), self.timeout_ms, SdError::DataTimeout)
        });

        result.map_err(|e| {
            if self.irq.error_status() != 0 {
                self.recover(e)
            } else {
                e
            }
        })
    }

    fn pio_transfer(&self, buf: &mut DataBuffer<'_>, unit: u8, infinite: bool) -> Result<(), SdError> {
        let chunk_len = self.fifo_depth.max(4);

        match buf {
            DataBuffer::Read(data) => {
                for chunk in data.chunks_mut(chunk_len) {
                    self.wait_int_status(NormalInt::BUF_RD_READY, self.timeout_ms)?;
                    self.write_normal_int_stat(SDHCI_INT_BUF_RD_READY);
                    self.read_fifo(chunk, unit);
                }
                if infinite {
                    // The card keeps sending until stopped, there is no transfer complete to wait for.
                    self.irq.complete(Completion::TRANS);
                }
            }
            DataBuffer::Write(data) => {
                for chunk in data.chunks(chunk_len) {
                    self.wait_int_status(NormalInt::BUF_WR_READY, self.timeout_ms)?;
                    self.write_normal_int_stat(SDHCI_INT_BUF_WR_READY);
                    self.write_fifo(chunk, unit);
                }
                if infinite {
                    self.irq.set_mask(Completion::BLOCK_GAP);
                    self.write_blk_gap_ctl(self.read_blk_gap_ctl() | SDHCI_STOP_AT_BLOCK_GAP);
                }
            }
        }

        Ok(())
    }

    fn read_fifo(&self, chunk: &mut [u8], unit: u8) {
        match unit {
            1 => {
                for byte in chunk.iter_mut() {
                    *byte = self.read_buffer8();
                }
            }
            2 => {
                for pair in chunk.chunks_mut(2) {
                    let val = self.read_buffer16().to_le_bytes();
                    pair.copy_from_slice(&val[..pair.len()]);
                }
            }
            _ => {
                for word in chunk.chunks_mut(4) {
                    let val = self.read_buffer().to_le_bytes();
                    word.copy_from_slice(&val[..word.len()]);
                }
            }
        }
    }

    fn write_fifo(&self, chunk: &[u8], unit: u8) {
        match unit {
            1 => {
                for byte in chunk {
                    self.write_buffer8(*byte);
                }
            }
            2 => {
                for pair in chunk.chunks(2) {
                    let mut val = [0u8; 2];
                    val[..pair.len()].copy_from_slice(pair);
                    self.write_buffer16(u16::from_le_bytes(val));
                }
            }
            _ => {
                for word in chunk.chunks(4) {
                    let mut val = [0u8; 4];
                    val[..word.len()].copy_from_slice(word);
                    self.write_buffer(u32::from_le_bytes(val));
                }
            }
        }
    }

    /// Restarts the engine at every boundary pause until the whole buffer moved.
    fn sdma_transfer(&self, phase: &DataPhase<'_, R, P>, read: bool, bound: u32) -> Result<(), SdError> {
        let wait_ms = self.timeout_ms * (bound >> SD_BLOCK_LEN_SHIFT).max(1) as u64;
        let mut addr = phase.bus;
        let mut remaining = phase.len as u64;

        loop {
            self.wait_completion(Completion::all(), wait_ms, SdError::DataTimeout)?;

            let next = self.read_sdma_addr();
            remaining = remaining.saturating_sub(next.wrapping_sub(addr) as u64);
            if remaining == 0 {
                break;
            }
            if next % bound != 0 {
                warn!("sdma: paused at unaligned address {:#x}", next);
                return Err(SdError::TransferError);
            }
            addr = next;

            let mask = if remaining > bound as u64 || phase.infinite {
                Completion::DMA
            } else {
                Completion::TRANS
            };
            self.irq.set_mask(mask);
            debug!("sdma: resume at {:#x}, {} bytes left", next, remaining);
            self.write_sdma_addr(next);
        }

        // An open-ended write only raises transfer complete once stopped at the gap.
        if phase.infinite && !read {
            self.irq.set_mask(Completion::BLOCK_GAP | Completion::TRANS);
            self.write_blk_gap_ctl(self.read_blk_gap_ctl() | SDHCI_STOP_AT_BLOCK_GAP);
        }

        Ok(())
    }

    /// Waits for a status bit the interrupt handler leaves for the caller.
    pub(crate) fn wait_int_status(&self, bit: NormalInt, timeout_ms: u64) -> Result<(), SdError> {
        let deadline = Deadline::after_ms(&self.platform, timeout_ms);
        loop {
            self.poll_interrupt();

            let err = self.irq.error_status();
            if err != 0 {
                return Err(SdError::from_error_status(err));
            }
            if NormalInt::from_bits_truncate(self.read_normal_int_stat()).contains(bit) {
                return Ok(());
            }
            if deadline.expired(&self.platform) {
                debug!("wait for {:?} timed out", bit);
                return Err(SdError::DataTimeout);
            }
            core::hint::spin_loop();
        }
    }

    /// Reads a short register-style payload (SCR, switch status, EXT_CSD)
    /// through the data port, whatever the configured strategy.
    pub(crate) fn read_register_data(&self, cmd: &SdCommand, out: &mut [u8]) -> Result<(), SdError> {
        self.write_blk_size(out.len() as u16 & SDHCI_BLOCK_SIZE_MASK);
        self.write_blk_cnt(1);
        self.write_xfer_mode(TransferMode::READ.bits());
        self.irq.set_mask(Completion::TRANS);

        let result = self.send_command(cmd).and_then(|_| {
            for chunk in out.chunks_mut(self.fifo_depth.max(4)) {
                self.wait_int_status(NormalInt::BUF_RD_READY, self.timeout_ms)?;
                self.write_normal_int_stat(SDHCI_INT_BUF_RD_READY);
                self.read_fifo(chunk, 4);
            }
            self.wait_completion(Completion::all(), self.timeout_ms, SdError::DataTimeout)
        });

        result.map_err(|e| {
            self.irq.set_mask(Completion::empty());
            if self.irq.error_status() != 0 {
                self.recover(e)
            } else {
                e
            }
        })
    }
}
