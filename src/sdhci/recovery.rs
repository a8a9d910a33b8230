// ===== Error Recovery =====

use log::{debug, warn};

use crate::{
    err::SdError,
    platform::{Deadline, Platform},
};

use super::{
    CardState, SdHost,
    cmd::{ResponseType, SdCommand},
    constant::*,
    regs::{AutoCmdErr, Completion, ErrorInt, PresentState, RegisterIo},
};

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    /// Issues CMD12 as an abort command, then resets both lines.
    pub fn abort(&self) -> Result<(), SdError> {
        self.irq.clear_errors();
        self.irq.set_mask(Completion::CMD | Completion::TRANS);

        let cmd = SdCommand::new(MMC_STOP_TRANSMISSION, 0, ResponseType::R1b);
        debug!("abort: cmd12");
        self.write_argument(0);
        self.write_command(cmd.encode());

        let waited = self.wait_completion(
            Completion::CMD | Completion::TRANS,
            self.timeout_ms * 2,
            SdError::Timeout,
        );
        if waited.is_err() && self.irq.error_status() == 0 {
            return Err(SdError::Timeout);
        }

        // The stop was not issued by the controller, so the lines are reset by hand.
        self.reset(SDHCI_RESET_CMD | SDHCI_RESET_DATA)?;

        if self.irq.error_status() != 0 {
            return Err(SdError::Abort);
        }

        Ok(())
    }

    /// Polls SEND_STATUS until the card reports `state` or `timeout_ms` passes.
    pub fn wait_for_state(&self, state: CardState, timeout_ms: u64) -> Result<(), SdError> {
        let rca = self.card.as_ref().map(|c| c.rca).unwrap_or(0);
        let deadline = Deadline::after_ms(&self.platform, timeout_ms);

        loop {
            let found = self.send_status(rca)?.card_state();
            if found == state as u8 {
                return Ok(());
            }
            if deadline.expired(&self.platform) {
                debug!("card stuck in state {}, wanted {:?}", found, state);
                return Err(SdError::StateTransition {
                    expected: state as u8,
                    found,
                });
            }
            self.platform.delay_us(STATE_POLL_DELAY_US);
        }
    }

    /// Resolves latched error bits and reports whether the caller may retry.
    pub(crate) fn recover(&self, cause: SdError) -> SdError {
        if !self.irq.recovery_enabled() {
            return cause;
        }

        let err = ErrorInt::from_bits_truncate(self.irq.error_status());
        let outcome = if err.contains(ErrorInt::AUTO_CMD) {
            self.auto_cmd_error_recovery(cause)
        } else {
            self.error_recovery(cause)
        };

        debug!("recovery of {:?}: {}", err, outcome);
        outcome
    }

    fn wait_lines_idle(&self) {
        let deadline = Deadline::after_ms(&self.platform, self.timeout_ms.max(RESET_WAIT_MS));
        while self
            .present()
            .intersects(PresentState::CMD_INHIBIT | PresentState::DATA_INHIBIT)
        {
            if deadline.expired(&self.platform) {
                warn!("lines still inhibited after abort");
                return;
            }
        }
    }

    fn error_recovery(&self, cause: SdError) -> SdError {
        // Classification uses what the failed operation latched, not the abort.
        let err = ErrorInt::from_bits_truncate(self.irq.error_status());

        if let Err(e) = self.abort() {
            warn!("recovery: abort failed: {}", e);
        }
        self.wait_lines_idle();

        if err.intersects(ErrorInt::CMD_LINE) || err.contains(ErrorInt::DATA_TIMEOUT) {
            return cause;
        }

        self.platform.delay_us(RECOVERY_SETTLE_US);

        if self.present().intersects(PresentState::DAT_LINE_LEVEL) {
            SdError::Recoverable
        } else {
            cause
        }
    }

    fn auto_cmd_error_recovery(&self, cause: SdError) -> SdError {
        let err = ErrorInt::from_bits_truncate(self.irq.error_status());
        let auto = AutoCmdErr::from_bits_truncate(self.irq.auto_cmd_error());
        debug!("auto command error {:?}", auto);

        let not_executed = auto.contains(AutoCmdErr::NOT_EXECUTED);
        if not_executed {
            let outcome = self.error_recovery(cause);
            if outcome != SdError::Recoverable {
                return outcome;
            }
        } else if self.reset(SDHCI_RESET_CMD).is_err() {
            return cause;
        }

        if self.abort().is_err() {
            return SdError::Abort;
        }

        if self
            .wait_for_state(CardState::Transfer, AUTO_CMD_RECOVERY_MS)
            .is_err()
        {
            return SdError::Recoverable;
        }

        if !(not_executed && !err.intersects(ErrorInt::DATA_LINE))
            && self.reset(SDHCI_RESET_DATA).is_err()
        {
            warn!("recovery: data line reset failed");
        }

        SdError::Recoverable
    }
}
