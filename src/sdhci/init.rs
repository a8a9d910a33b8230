// ===== Card Enumeration =====

use core::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::{err::SdError, platform::Platform};

use super::{
    CardState, CardType, Cid, Csd, CsdLayout, ExtCsd, Scr, SdCard, SdHost, constant::*,
    regs::RegisterIo,
};

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// Enumerates the card in the slot and leaves it selected in transfer state.
    ///
    /// Any previous card session is dropped first.
    pub fn scan_cards(&mut self) -> Result<(), SdError> {
        if !self.is_card_present() {
            return Err(SdError::NoCard);
        }

        self.card = None;
        self.irq.set_card_removed(false);
        // Probing legitimately times out, nothing to recover until the card is selected.
        self.irq.set_recovery(false);

        let s18r = self.caps1 & (SDHCI_SUPPORT_SDR50 | SDHCI_SUPPORT_SDR104 | SDHCI_SUPPORT_DDR50) != 0;

        // CMD0 puts the card back on a 1-bit bus at default speed, follow it.
        let ctl = self.read_host_ctl1() & !(SDHCI_CTRL_4BITBUS | SDHCI_CTRL_8BITBUS | SDHCI_CTRL_HISPD);
        self.write_host_ctl1(ctl);
        self.write_host_ctl2(self.read_host_ctl2() & !SDHCI_CTRL_UHS_MASK);
        self.set_clock(self.min_clk)?;

        self.go_idle_state(0)?;

        let mut if_cond = SD_IF_COND_PATTERN;
        if self.ocr_avail & OCR_HOST_WINDOW != 0 {
            if_cond |= SD_IF_COND_VHS_27_36;
        }
        let f8 = self.send_if_cond(if_cond).is_ok();

        let (card_type, mut ocr) = if let Ok(ocr) = self.send_app_op_cond(0) {
            (CardType::Sd, ocr)
        } else if let Ok(ocr) = self.send_op_cond(0) {
            (CardType::Mmc, ocr)
        } else {
            warn!("card answers neither ACMD41 nor CMD1");
            return Err(SdError::UnsupportedCard);
        };
        info!("{:?} card, f8 {}, ocr {:#010x}", card_type, f8, ocr);

        let mut card = SdCard::new(card_type);
        card.f8 = f8;

        ocr &= !OCR_RESERVED_LOW;
        if ocr & OCR_LOW_VOLTAGE != 0 {
            warn!("card reports the low voltage range, ignoring it");
            ocr &= !OCR_LOW_VOLTAGE;
        }
        ocr &= self.ocr_avail;

        let bit = ocr.trailing_zeros();
        if bit >= 24 {
            warn!("no common voltage, host window {:#x}", self.ocr_avail);
            return Err(SdError::Voltage);
        }
        self.set_power(Some(bit))?;
        ocr |= 3 << bit;

        match card_type {
            CardType::Mmc => {
                let rocr = self.send_op_cond(ocr | OCR_HCS)?;
                card.ocr = rocr;
                card.high_capacity =
                    (rocr >> OCR_ACCESS_MODE_SHIFT) & 0x3 == OCR_ACCESS_MODE_SECTOR;
            }
            _ => {
                if f8 {
                    ocr |= OCR_HCS;
                    if s18r {
                        ocr |= OCR_S18R;
                    }
                }
                let rocr = self.send_app_op_cond(ocr)?;
                card.ocr = rocr;
                card.high_capacity = rocr & OCR_HCS != 0;
            }
        }

        card.raw_cid = self.all_send_cid()?;
        card.cid = match card_type {
            CardType::Mmc => Cid::decode_mmc(&card.raw_cid),
            _ => Cid::decode_sd(&card.raw_cid),
        };

        let rca = match card_type {
            CardType::Mmc => MMC_DEFAULT_RCA,
            _ => 0,
        };
        card.rca = self.send_relative_addr(rca)?;

        card.raw_csd = self.send_csd(card.rca)?;
        card.csd = match card_type {
            CardType::Mmc => Csd::decode_mmc(&card.raw_csd),
            _ => {
                let csd = Csd::decode_sd(&card.raw_csd)?;
                card.high_capacity = csd.layout == CsdLayout::SdV2;
                csd
            }
        };
        card.max_dtr = card.csd.max_dtr();
        card.max_block = card.csd.blocks().saturating_sub(1);
        debug!("csd {:?}", card.csd);

        let found = self.send_status(card.rca)?.card_state();
        if found != CardState::Standby as u8 {
            warn!("card in state {} after CSD, expected standby", found);
            return Err(SdError::StateTransition {
                expected: CardState::Standby as u8,
                found,
            });
        }

        self.select_card(card.rca)?;
        self.irq.set_recovery(true);

        let state = self.send_status(card.rca)?.card_state();
        debug!("selected rca {:#x}, state {}", card.rca, state);

        card.initialized.store(true, Ordering::Release);
        self.card = Some(card);

        match card_type {
            CardType::Mmc => self.read_ext_csd()?,
            _ => self.read_scr()?,
        }

        if let Some(card) = &self.card {
            info!(
                "{:?} rca {:#x}: {} blocks, {} Hz, {} addressing",
                card.card_type,
                card.rca,
                card.block_count(),
                card.max_dtr,
                if card.high_capacity { "block" } else { "byte" }
            );
        }

        Ok(())
    }

    /// Fetches and stores the SD configuration register.
    pub fn read_scr(&mut self) -> Result<(), SdError> {
        let rca = self.card_ref()?.rca;
        let scr = Scr::decode(&self.app_send_scr(rca)?);
        debug!("scr {:?}", scr);

        if let Some(card) = self.card.as_mut() {
            card.scr = Some(scr);
        }
        Ok(())
    }

    /// Fetches the EXT_CSD of an MMC 4.x card and refines capacity from it.
    pub fn read_ext_csd(&mut self) -> Result<(), SdError> {
        let spec_vers = self.card_ref()?.csd.spec_vers;
        if spec_vers < 4 {
            debug!("mmc spec {} has no EXT_CSD", spec_vers);
            return Ok(());
        }

        let ext = ExtCsd::decode(&self.send_ext_csd()?);
        debug!("ext_csd {:?}", ext);

        if let Some(card) = self.card.as_mut() {
            if ext.rev >= 2 && ext.sec_count != 0 {
                card.max_block = ext.sec_count as u64 - 1;
                card.high_capacity = true;
            }
            card.boot_blocks = ext.boot_blocks();
            card.ext_csd = Some(ext);
        }
        Ok(())
    }
}
