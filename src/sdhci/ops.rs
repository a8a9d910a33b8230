// ===== Card Commands =====

use log::debug;

use crate::{err::SdError, platform::Platform};

use super::{
    CardType, SdHost,
    cmd::{ResponseType, SdCommand, SdResponse},
    constant::*,
    regs::{RegisterIo, TransferMode},
};

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// CMD0. The alternative boot argument carries a data phase.
    pub(crate) fn go_idle_state(&self, arg: u32) -> Result<(), SdError> {
        let mut cmd = SdCommand::new(MMC_GO_IDLE_STATE, arg, ResponseType::None);
        cmd.data_present = arg == 0xFFFF_FFFA;
        self.send_command(&cmd)?;
        Ok(())
    }

    /// CMD8 for SD. The card must echo the check pattern.
    pub(crate) fn send_if_cond(&self, arg: u32) -> Result<(), SdError> {
        let resp = self.send_command(&SdCommand::new(SD_SEND_IF_COND, arg, ResponseType::R7))?;
        if resp.as_r7() & 0xFF != arg & 0xFF {
            debug!("if_cond echo {:#x} != {:#x}", resp.as_r7() & 0xFF, arg & 0xFF);
            return Err(SdError::InvalidResponse);
        }
        Ok(())
    }

    /// CMD55 + ACMD41, polled until the card leaves busy. An OCR of 0 only probes.
    pub(crate) fn send_app_op_cond(&self, ocr: u32) -> Result<u32, SdError> {
        for _ in 0..OP_COND_RETRIES {
            self.app_cmd(0)?;
            let resp =
                self.send_command(&SdCommand::new(SD_APP_OP_COND, ocr, ResponseType::R3))?;
            let rocr = resp.as_r3();

            if ocr == 0 || rocr & OCR_BUSY != 0 {
                return Ok(rocr);
            }
            self.platform.delay_us(OP_COND_DELAY_US);
        }
        Err(SdError::Timeout)
    }

    /// CMD1, same polling policy as ACMD41.
    pub(crate) fn send_op_cond(&self, ocr: u32) -> Result<u32, SdError> {
        for _ in 0..OP_COND_RETRIES {
            let resp =
                self.send_command(&SdCommand::new(MMC_SEND_OP_COND, ocr, ResponseType::R3))?;
            let rocr = resp.as_r3();

            if ocr == 0 || rocr & OCR_BUSY != 0 {
                return Ok(rocr);
            }
            self.platform.delay_us(OP_COND_DELAY_US);
        }
        Err(SdError::Timeout)
    }

    pub(crate) fn all_send_cid(&self) -> Result<[u32; 4], SdError> {
        let cmd = SdCommand::new(MMC_ALL_SEND_CID, 0, ResponseType::R2).inhibit_check();
        Ok(self.send_command(&cmd)?.as_r2())
    }

    /// CMD3. An MMC card is given `rca`; an SD card with `rca == 0` publishes its own.
    pub(crate) fn send_relative_addr(&self, rca: u16) -> Result<u16, SdError> {
        for _ in 0..OP_COND_RETRIES {
            let resp = self.send_command(&SdCommand::new(
                SD_SEND_RELATIVE_ADDR,
                (rca as u32) << 16,
                ResponseType::R6,
            ))?;

            if rca != 0 {
                return Ok(rca);
            }
            let published = (resp.as_r6() >> 16) as u16;
            if published != 0 {
                return Ok(published);
            }
            self.platform.delay_us(RCA_DELAY_US);
        }
        Err(SdError::Timeout)
    }

    pub(crate) fn send_csd(&self, rca: u16) -> Result<[u32; 4], SdError> {
        let cmd = SdCommand::new(MMC_SEND_CSD, (rca as u32) << 16, ResponseType::R2);
        Ok(self.send_command(&cmd)?.as_r2())
    }

    pub(crate) fn select_card(&self, rca: u16) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_SELECT_CARD, (rca as u32) << 16, ResponseType::R1);
        self.send_command(&cmd)?;
        Ok(())
    }

    pub(crate) fn send_status(&self, rca: u16) -> Result<SdResponse, SdError> {
        let cmd = SdCommand::new(MMC_SEND_STATUS, (rca as u32) << 16, ResponseType::R1);
        self.send_command(&cmd)
    }

    pub(crate) fn app_cmd(&self, rca: u16) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_APP_CMD, (rca as u32) << 16, ResponseType::R1);
        self.send_command(&cmd)?;
        Ok(())
    }

    /// ACMD51, the 8-byte SCR.
    pub(crate) fn app_send_scr(&self, rca: u16) -> Result<[u8; SD_SCR_LEN], SdError> {
        let cmd = SdCommand::new(MMC_APP_CMD, (rca as u32) << 16, ResponseType::R1).inhibit_check();
        self.send_command(&cmd)?;

        let mut scr = [0u8; SD_SCR_LEN];
        let cmd = SdCommand::new(SD_APP_SEND_SCR, 0, ResponseType::R1).with_data();
        self.read_register_data(&cmd, &mut scr)?;
        Ok(scr)
    }

    /// ACMD6, `arg` is 0 for one data line or 2 for four.
    pub(crate) fn app_set_bus_width(&self, rca: u16, arg: u32) -> Result<(), SdError> {
        self.app_cmd(rca)?;
        let cmd = SdCommand::new(SD_APP_SET_BUS_WIDTH, arg, ResponseType::R1);
        self.send_command(&cmd)?;
        Ok(())
    }

    /// CMD6 for SD: query (`mode` 0) or switch (`mode` 1) one function group.
    pub(crate) fn sd_switch(
        &self,
        mode: u32,
        group: u32,
        value: u8,
    ) -> Result<[u8; SD_SWITCH_STATUS_LEN], SdError> {
        let shift = group * 4;
        let mut arg = (mode << 31) | 0x00FF_FFFF;
        arg &= !(0xF << shift);
        arg |= ((value as u32) & 0xF) << shift;

        let mut status = [0u8; SD_SWITCH_STATUS_LEN];
        let cmd = SdCommand::new(SD_SWITCH, arg, ResponseType::R1).with_data();
        self.read_register_data(&cmd, &mut status)?;
        Ok(status)
    }

    /// CMD6 for MMC: write one EXT_CSD byte.
    pub(crate) fn mmc_switch(&self, set: u8, index: u8, value: u8) -> Result<(), SdError> {
        if self.card.as_ref().map(|c| c.card_type) != Some(CardType::Mmc) {
            return Err(SdError::UnsupportedCard);
        }

        let arg = (EXT_CSD_WRITE_BYTE << 24)
            | ((index as u32) << 16)
            | ((value as u32) << 8)
            | set as u32;
        let cmd = SdCommand::new(MMC_SWITCH, arg, ResponseType::R1b).inhibit_check();
        self.send_command(&cmd)?;
        Ok(())
    }

    /// CMD8 for MMC, the 512-byte EXT_CSD.
    pub(crate) fn send_ext_csd(&self) -> Result<[u8; EXT_CSD_LEN], SdError> {
        let mut ext_csd = [0u8; EXT_CSD_LEN];
        let mut cmd = SdCommand::new(MMC_SEND_EXT_CSD, 0, ResponseType::R1);
        cmd.data_present = true;
        self.read_register_data(&cmd, &mut ext_csd)?;
        Ok(ext_csd)
    }

    /// CMD19. Only meaningful while the controller is executing tuning.
    pub(crate) fn send_tuning_block(&self) -> Result<(), SdError> {
        if self.read_host_ctl2() & SDHCI_CTRL_EXEC_TUNING == 0 {
            return Err(SdError::TuningFailed);
        }

        self.write_xfer_mode(TransferMode::READ.bits());
        self.write_blk_size(TUNING_BLOCK_LEN);
        self.write_blk_cnt(1);

        let cmd = SdCommand::new(MMC_SEND_TUNING_BLOCK, 0, ResponseType::None).with_data();
        self.send_command(&cmd)?;
        Ok(())
    }
}
