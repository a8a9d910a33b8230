// ===== Bus Configuration =====

use core::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::{err::SdError, platform::Platform};

use super::{
    CardState, CardType, SdHost,
    constant::*,
    regs::{NormalInt, RegisterIo},
};

/// Smallest divisor `d` with `max_hz / (2 * d) <= target_hz`, 0 meaning the
/// undivided base clock. Saturates at the 10-bit maximum.
pub(crate) fn clock_divisor(max_hz: u32, target_hz: u32) -> u16 {
    if target_hz == 0 {
        return SDHCI_MAX_DIV;
    }
    if max_hz <= target_hz {
        return 0;
    }

    let div = (max_hz as u64).div_ceil(2 * target_hz as u64);
    div.clamp(1, SDHCI_MAX_DIV as u64) as u16
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// Programs the SD clock to at most `hz`; 0 stops it.
    pub fn set_clock(&self, hz: u32) -> Result<(), SdError> {
        self.write_clk_ctl(0);

        if hz == 0 {
            self.clock.store(0, Ordering::Release);
            return Ok(());
        }

        let div = clock_divisor(self.max_clk, hz);
        let mut clk = (div & SDHCI_DIV_MASK) << SDHCI_DIVIDER_SHIFT;
        clk |= ((div & SDHCI_DIV_HI_MASK) >> 8) << SDHCI_DIVIDER_HI_SHIFT;
        clk |= SDHCI_CLOCK_INT_EN;
        self.write_clk_ctl(clk);

        let mut stable = false;
        for _ in 0..CLOCK_STABLE_MS {
            if self.read_clk_ctl() & SDHCI_CLOCK_INT_STABLE != 0 {
                stable = true;
                break;
            }
            self.platform.delay_ms(1);
        }
        if !stable {
            warn!("internal clock not stable after {} ms", CLOCK_STABLE_MS);
        }

        self.write_clk_ctl(clk | SDHCI_CLOCK_CARD_EN);

        let sd_clk = if div == 0 {
            self.max_clk
        } else {
            self.max_clk / (2 * div as u32)
        };

        let vendor0 = self.read_vendor_reg0();
        if sd_clk < DLL_THRESHOLD_HZ {
            let mut latch = (vendor0 & !SDHCI_VENDOR0_LATCH_OFFSET) | SDHCI_VENDOR0_PULSE_LATCH;
            if div > 0 {
                latch |= SDHCI_VENDOR0_LATCH_OFFSET;
            }
            self.write_vendor_reg0(latch);
        } else {
            self.write_vendor_reg0(vendor0 & !SDHCI_VENDOR0_PULSE_LATCH);

            let tries = if sd_clk == DLL_THRESHOLD_HZ {
                16
            } else {
                (8 * (sd_clk / 1_000_000) / 25).saturating_sub(16)
            };
            if let Err(e) = self.execute_tuning(tries) {
                warn!("tuning at {} Hz failed: {}", sd_clk, e);
            }
        }

        self.clock.store(sd_clk, Ordering::Release);
        debug!("clock {} Hz requested, divisor {}, running at {} Hz", hz, div, sd_clk);

        Ok(())
    }

    /// Switches the card rail to the level of OCR bit `level`, or off for `None`.
    pub fn set_power(&self, level: Option<u32>) -> Result<(), SdError> {
        self.write_pwr_ctl(0);

        let Some(bit) = level else {
            debug!("power off");
            return Ok(());
        };

        let code = match bit {
            7 => SDHCI_POWER_180,
            17 | 18 => SDHCI_POWER_300,
            20 | 21 => SDHCI_POWER_330,
            _ => {
                warn!("no supply for OCR bit {}", bit);
                return Err(SdError::BusPower);
            }
        };

        self.write_pwr_ctl(code | SDHCI_POWER_ON);
        debug!("power on, OCR bit {}", bit);

        Ok(())
    }

    /// Selects 1.8 V or 3.3 V I/O signalling; the card rail is left alone.
    pub fn set_signal_voltage(&self, low: bool) {
        let ctl2 = self.read_host_ctl2();
        if low {
            self.write_host_ctl2(ctl2 | SDHCI_CTRL_VDD_180);
        } else {
            self.write_host_ctl2(ctl2 & !SDHCI_CTRL_VDD_180);
        }
        debug!("{} signalling", if low { "1.8 V" } else { "3.3 V" });
    }

    /// Negotiates a 1, 4 or 8 bit data bus with the card, then the host.
    pub fn set_bus_width(&self, width: u8) -> Result<(), SdError> {
        let card = self.card_ref()?;

        match card.card_type {
            CardType::Mmc => {
                if card.csd.spec_vers < 4 {
                    debug!("mmc spec {} has a fixed bus width", card.csd.spec_vers);
                    return Ok(());
                }
                let value = match width {
                    1 => 0,
                    4 => 1,
                    8 => 2,
                    _ => return Err(SdError::BusWidthNotSupported),
                };
                self.mmc_switch(EXT_CSD_CMD_SET_NORMAL, EXT_CSD_BUS_WIDTH, value)?;
            }
            CardType::Sd => {
                let scr = card.scr.ok_or(SdError::BusWidthNotSupported)?;
                if !scr.supports_width(width) {
                    return Err(SdError::BusWidthNotSupported);
                }
                let arg = if width == 4 {
                    SD_BUS_WIDTH_4
                } else {
                    SD_BUS_WIDTH_1
                };
                self.app_set_bus_width(card.rca, arg)?;
            }
            _ => return Err(SdError::UnsupportedCard),
        }

        let mut ctl = self.read_host_ctl1() & !(SDHCI_CTRL_4BITBUS | SDHCI_CTRL_8BITBUS);
        match width {
            4 => ctl |= SDHCI_CTRL_4BITBUS,
            8 => ctl |= SDHCI_CTRL_8BITBUS,
            _ => {}
        }
        self.write_host_ctl1(ctl);

        card.bus_width.store(width, Ordering::Release);
        info!("bus width {}", width);

        Ok(())
    }

    /// Switches the bus timing: 0 default, 1 high speed, 2 SDR50, 3 SDR104, 4 DDR50.
    ///
    /// UHS modes need 1.8 V signalling. The card's maximum data rate is
    /// updated to the new mode; the clock itself is left to the caller.
    pub fn set_speed_mode(&mut self, speed: u8) -> Result<(), SdError> {
        if speed > 4 {
            return Err(SdError::SpeedModeNotSupported);
        }

        let card = self.card_ref()?;
        let card_type = card.card_type;
        let s18 = self.read_host_ctl2() & SDHCI_CTRL_VDD_180 != 0;
        if !s18 && speed > 1 {
            debug!("speed mode {} needs 1.8 V signalling", speed);
            return Err(SdError::SpeedModeNotSupported);
        }
        let mut speed = speed;

        match card_type {
            CardType::Sd => {
                let sd_spec = card.scr.map(|scr| scr.sd_spec).unwrap_or(0);
                if sd_spec == 0 {
                    debug!("sd 1.0 card has no switch function");
                    speed = 0;
                } else {
                    let mut supported = 0u8;
                    for func in 0..5u8 {
                        let status = self.sd_switch(SD_SWITCH_CHECK, SD_SWITCH_GROUP_ACCESS_MODE, func)?;
                        supported |= status[SD_SWITCH_SUPPORT_BYTE] & (1 << func);
                    }
                    debug!("access modes supported {:#x}", supported);

                    if supported & (1 << speed) == 0 {
                        return Err(SdError::SpeedModeNotSupported);
                    }

                    let status = self.sd_switch(SD_SWITCH_SET, SD_SWITCH_GROUP_ACCESS_MODE, speed)?;
                    if status[SD_SWITCH_RESULT_BYTE] & 0xF != speed {
                        warn!(
                            "card switched to access mode {}, wanted {}",
                            status[SD_SWITCH_RESULT_BYTE] & 0xF,
                            speed
                        );
                        return Err(SdError::SpeedModeNotSupported);
                    }
                }
            }
            CardType::Mmc => {
                if card.csd.spec_vers < 4 {
                    speed = 0;
                } else {
                    self.mmc_switch(EXT_CSD_CMD_SET_NORMAL, EXT_CSD_HS_TIMING, speed)?;
                    self.wait_for_state(CardState::Transfer, SPEED_SWITCH_MS)?;
                }
            }
            _ => return Err(SdError::UnsupportedCard),
        }

        if s18 {
            let ctl2 = self.read_host_ctl2() & !SDHCI_CTRL_UHS_MASK;
            self.write_host_ctl2(ctl2 | speed as u16);
        } else {
            let ctl = self.read_host_ctl1();
            match speed {
                0 => self.write_host_ctl1(ctl & !SDHCI_CTRL_HISPD),
                1 => self.write_host_ctl1(ctl | SDHCI_CTRL_HISPD),
                _ => return Err(SdError::SpeedModeNotSupported),
            }
        }

        let mut max_dtr = match speed {
            0..=2 => SDR12_MAX_DTR << speed,
            3 => self.max_clk,
            _ => DDR50_MAX_DTR,
        };
        if card_type == CardType::Mmc && speed == 1 {
            let hs = card.ext_csd.map(|ext| ext.hs_max_dtr()).unwrap_or(0);
            if hs != 0 {
                max_dtr = hs;
            }
        }

        if let Some(card) = self.card.as_mut() {
            card.max_dtr = max_dtr;
            card.speed_mode.store(speed, Ordering::Release);
        }
        info!("speed mode {}, max data rate {} Hz", speed, max_dtr);

        Ok(())
    }

    /// Runs SDR104 sampling clock tuning, giving up after three retries.
    pub fn execute_tuning(&self, tries: u32) -> Result<(), SdError> {
        let ctl2 = self.read_host_ctl2();
        if ctl2 & SDHCI_CTRL_UHS_MASK != 3 || ctl2 & SDHCI_CTRL_VDD_180 == 0 {
            debug!("tuning needs SDR104 at 1.8 V, host control 2 {:#x}", ctl2);
            return Err(SdError::TuningFailed);
        }

        if !self.irq.enter_tuning() {
            debug!("tuning already running");
            return Ok(());
        }

        let result = self.card_ref().and_then(|card| {
            if card.bus_width() != 4 {
                self.set_bus_width(4)?;
            }

            let hndshk = self.read_dma_hndshk();
            self.write_dma_hndshk(0);
            let result = self.tuning_rounds(tries);
            self.write_dma_hndshk(hndshk);
            result
        });

        self.irq.leave_tuning();
        result
    }

    fn tuning_rounds(&self, tries: u32) -> Result<(), SdError> {
        let mut retry = 0;

        loop {
            self.write_vendor_reg3(SDHCI_VENDOR3_TUNE_BASE | ((tries & 0xFF) << SDHCI_VENDOR3_TUNE_SHIFT));
            self.reset(SDHCI_RESET_DATA)?;
            self.write_host_ctl2(self.read_host_ctl2() | SDHCI_CTRL_EXEC_TUNING);

            let mut rounds = 0;
            while self.read_host_ctl2() & SDHCI_CTRL_EXEC_TUNING != 0 && rounds < TUNING_MAX_LOOP {
                if self.send_tuning_block().is_err() {
                    break;
                }
                if self
                    .wait_int_status(NormalInt::BUF_RD_READY, TUNING_BLOCK_WAIT_MS)
                    .is_ok()
                {
                    self.write_normal_int_stat(SDHCI_INT_BUF_RD_READY);
                }
                rounds += 1;
            }

            let ctl2 = self.read_host_ctl2();
            if ctl2 & SDHCI_CTRL_EXEC_TUNING != 0 {
                self.write_host_ctl2(ctl2 & !SDHCI_CTRL_EXEC_TUNING);
            }
            if ctl2 & SDHCI_CTRL_TUNED_CLK == 0 {
                warn!("tuning: sampling clock not tuned after {} rounds", rounds);
                return Err(SdError::TuningFailed);
            }

            let delay = (self.read_vendor_reg3() >> SDHCI_VENDOR3_DELAY_SHIFT) & SDHCI_VENDOR3_DELAY_MASK;
            if self.read_vendor_reg4() & (1 << delay) != 0 {
                debug!("tuning: delay {} after {} rounds", delay, rounds);
                return Ok(());
            }

            if retry >= TUNING_RETRIES {
                warn!("tuning: delay {} outside the valid window", delay);
                return Err(SdError::TuningFailed);
            }
            retry += 1;
            debug!("tuning: delay {} invalid, retry {}", delay, retry);
        }
    }
}
