use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};

use log::{debug, warn};

use super::{
    IrqDelivery, SdHost,
    constant::*,
    regs::{Completion, ErrorInt, NormalInt, RegisterIo},
};
use crate::{
    err::SdError,
    platform::{Deadline, Platform},
};

/// State handed from the interrupt handler to the waiting caller.
///
/// The handler is the only writer of the error words; callers arm the
/// completion mask and the handler clears bits as events arrive.
#[derive(Debug, Default)]
pub struct IrqShared {
    cmpl_mask: AtomicU8,
    err_sts: AtomicU16,
    auto_err: AtomicU16,
    card_present: AtomicBool,
    card_removed: AtomicBool,
    recovery_enabled: AtomicBool,
    tuning: AtomicBool,
}

impl IrqShared {
    pub fn pending(&self) -> Completion {
        Completion::from_bits_truncate(self.cmpl_mask.load(Ordering::Acquire))
    }

    pub(crate) fn arm(&self, mask: Completion) {
        self.cmpl_mask.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_mask(&self, mask: Completion) {
        self.cmpl_mask.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn complete(&self, mask: Completion) {
        self.cmpl_mask.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    pub fn error_status(&self) -> u16 {
        self.err_sts.load(Ordering::Acquire)
    }

    pub fn auto_cmd_error(&self) -> u16 {
        self.auto_err.load(Ordering::Acquire)
    }

    pub(crate) fn clear_errors(&self) {
        self.err_sts.store(0, Ordering::Release);
        self.auto_err.store(0, Ordering::Release);
    }

    fn latch_error(&self, bits: u16) {
        self.err_sts.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn card_present(&self) -> bool {
        self.card_present.load(Ordering::Acquire)
    }

    pub(crate) fn set_card_present(&self, present: bool) {
        self.card_present.store(present, Ordering::Release);
    }

    /// True once a removal was seen and the session has not been rebuilt.
    pub fn card_removed(&self) -> bool {
        self.card_removed.load(Ordering::Acquire)
    }

    pub(crate) fn set_card_removed(&self, removed: bool) {
        self.card_removed.store(removed, Ordering::Release);
    }

    pub(crate) fn recovery_enabled(&self) -> bool {
        self.recovery_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_recovery(&self, enabled: bool) {
        self.recovery_enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn enter_tuning(&self) -> bool {
        !self.tuning.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn leave_tuning(&self) {
        self.tuning.store(false, Ordering::Release);
    }
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// Interrupt entry point.
    ///
    /// Register this with the platform interrupt controller when the host is
    /// configured for [`IrqDelivery::External`]. Buffer-ready bits are left
    /// for the PIO loop to consume.
    pub fn handle_interrupt(&self) {
        let status = NormalInt::from_bits_truncate(self.read_normal_int_stat());
        let sts = status - (NormalInt::BUF_RD_READY | NormalInt::BUF_WR_READY);
        if sts.is_empty() {
            return;
        }

        // The summary bit is cleared through the error register below.
        self.write_normal_int_stat((sts - NormalInt::ERROR).bits());

        // Writing 1 does not clear the card interrupt, toggling its enable does.
        if sts.contains(NormalInt::CARD_INT) {
            let en = self.read_normal_int_en();
            self.write_normal_int_en(en & !SDHCI_INT_CARD_INT);
            self.write_normal_int_en(en | SDHCI_INT_CARD_INT);
        }

        if sts.contains(NormalInt::CARD_INSERT) {
            self.irq.set_card_present(true);
            if let Err(e) = self.set_clock(self.min_clk) {
                warn!("card insert: clock setup failed: {}", e);
            }
            if let Err(e) = self.set_power(Some(OCR_3V0_BIT)) {
                warn!("card insert: power setup failed: {}", e);
            }
        }

        if sts.contains(NormalInt::CARD_REMOVE) {
            self.irq.set_card_present(false);
            self.irq.set_card_removed(true);
            if let Err(e) = self.set_clock(0) {
                warn!("card remove: clock stop failed: {}", e);
            }
            if let Err(e) = self.set_power(None) {
                warn!("card remove: power off failed: {}", e);
            }
        }

        if sts.contains(NormalInt::CMD_COMPLETE) {
            self.irq.complete(Completion::CMD);
        }

        if sts.contains(NormalInt::XFER_COMPLETE) {
            if !self.irq.pending().contains(Completion::TRANS) {
                warn!("transfer complete while not waiting for it");
            }
            self.irq.complete(Completion::TRANS);
        }

        if sts.contains(NormalInt::BLOCK_GAP) {
            self.irq.complete(Completion::BLOCK_GAP);
        }

        if sts.contains(NormalInt::DMA) {
            self.irq.complete(Completion::DMA);
        }

        if sts.contains(NormalInt::ERROR) {
            let err = ErrorInt::from_bits_truncate(self.read_err_int_stat());
            debug!("irq: error status {:#06x}", err.bits());
            self.irq.latch_error(err.bits());

            if err.intersects(ErrorInt::CMD_LINE) && self.reset(SDHCI_RESET_CMD).is_err() {
                warn!("irq: command line reset failed");
            }
            if err.intersects(ErrorInt::DATA_LINE) && self.reset(SDHCI_RESET_DATA).is_err() {
                warn!("irq: data line reset failed");
            }
            if err.contains(ErrorInt::AUTO_CMD) {
                self.irq
                    .auto_err
                    .store(self.read_auto_cmd_stat(), Ordering::Release);
            }

            self.write_err_int_stat(err.bits());

            if err.contains(ErrorInt::TUNING) {
                if let Err(e) = self.execute_tuning(16) {
                    warn!("irq: retune failed: {}", e);
                }
            }
        }
    }

    /// Services the status register from the waiting context when no
    /// interrupt line is wired up.
    pub(crate) fn poll_interrupt(&self) {
        if self.config.irq == IrqDelivery::Polled {
            self.handle_interrupt();
        }
    }

    /// Waits until every bit of `mask` has been cleared by the handler.
    ///
    /// Returns the classified error as soon as one is latched, or `timeout`
    /// once the deadline passes.
    pub(crate) fn wait_completion(
        &self,
        mask: Completion,
        timeout_ms: u64,
        timeout: SdError,
    ) -> Result<(), SdError> {
        let deadline = Deadline::after_ms(&self.platform, timeout_ms);
        loop {
            self.poll_interrupt();

            let err = self.irq.error_status();
            if err != 0 {
                return Err(SdError::from_error_status(err));
            }
            if !self.irq.pending().intersects(mask) {
                return Ok(());
            }
            if deadline.expired(&self.platform) {
                debug!(
                    "wait for {:?} timed out, pending {:?}",
                    mask,
                    self.irq.pending()
                );
                return Err(timeout);
            }
            core::hint::spin_loop();
        }
    }
}
