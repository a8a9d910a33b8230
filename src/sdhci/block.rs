// ===== Block Device Interface =====

use core::sync::atomic::Ordering;

use log::debug;

use crate::{err::SdError, platform::Platform};

use super::{
    AutoCmd, CardInfo, CardState, InfiniteMode, SdHost, constant::*, regs::RegisterIo,
    transfer::DataBuffer,
};

// Simple block device trait that could be used by a filesystem
pub trait BlockDevice {
    fn read_block(&self, block_addr: u32, buffer: &mut [u8]) -> Result<(), SdError>;
    fn write_block(&self, block_addr: u32, buffer: &[u8]) -> Result<(), SdError>;
    fn read_blocks(&self, block_addr: u32, blocks: u16, buffer: &mut [u8]) -> Result<(), SdError>;
    fn write_blocks(&self, block_addr: u32, blocks: u16, buffer: &[u8]) -> Result<(), SdError>;
    fn get_capacity(&self) -> Result<u64, SdError>;
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// Reads `count` 512-byte blocks starting at block `start` into `buf`.
    pub fn card_read(&self, start: u32, count: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.check_request(start, count, buf.len())?;
        debug!("read {} blocks at {}", count, start);

        self.transfer_blocks(start, count, DataBuffer::Read(buf))?;
        self.finish_transfer(count)
    }

    /// Writes `count` 512-byte blocks from `buf` starting at block `start`,
    /// returning once the card has finished programming.
    pub fn card_write(&self, start: u32, count: u32, buf: &[u8]) -> Result<(), SdError> {
        self.check_request(start, count, buf.len())?;
        debug!("write {} blocks at {}", count, start);

        self.transfer_blocks(start, count, DataBuffer::Write(buf))?;
        self.finish_transfer(count)?;
        self.wait_for_state(CardState::Transfer, WRITE_DONE_MS)
    }

    pub fn card_info(&self) -> Result<CardInfo, SdError> {
        Ok(self.card_ref()?.info())
    }

    fn check_request(&self, start: u32, count: u32, len: usize) -> Result<(), SdError> {
        let card = self.card_ref()?;
        if !card.initialized.load(Ordering::Acquire) {
            return Err(SdError::NoCard);
        }

        if count == 0 || len != count as usize * SD_BLOCK_SIZE {
            debug!("{} bytes for {} blocks", len, count);
            return Err(SdError::InvalidArgument);
        }

        let last = start as u64 + count as u64 - 1;
        if last > card.max_block {
            debug!("block {} beyond last block {}", last, card.max_block);
            return Err(SdError::InvalidArgument);
        }

        Ok(())
    }

    // Stop a transfer the controller did not end by itself.
    fn finish_transfer(&self, count: u32) -> Result<(), SdError> {
        let infinite = self.config.infinite != InfiniteMode::Off;
        if infinite {
            self.write_blk_gap_ctl(self.read_blk_gap_ctl() & !SDHCI_STOP_AT_BLOCK_GAP);
        }

        if infinite || (count > 1 && self.config.auto_cmd == AutoCmd::None) {
            self.abort()?;
        }

        Ok(())
    }
}

impl<R: RegisterIo, P: Platform> BlockDevice for SdHost<R, P> {
    fn read_block(&self, block_addr: u32, buffer: &mut [u8]) -> Result<(), SdError> {
        self.card_read(block_addr, 1, buffer)
    }

    fn write_block(&self, block_addr: u32, buffer: &[u8]) -> Result<(), SdError> {
        self.card_write(block_addr, 1, buffer)
    }

    fn read_blocks(&self, block_addr: u32, blocks: u16, buffer: &mut [u8]) -> Result<(), SdError> {
        self.card_read(block_addr, blocks as u32, buffer)
    }

    fn write_blocks(&self, block_addr: u32, blocks: u16, buffer: &[u8]) -> Result<(), SdError> {
        self.card_write(block_addr, blocks as u32, buffer)
    }

    fn get_capacity(&self) -> Result<u64, SdError> {
        Ok(self.card_ref()?.block_count() * SD_BLOCK_SIZE as u64)
    }
}
