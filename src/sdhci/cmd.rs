use log::debug;

use crate::{err::SdError, platform::Platform};

use super::{
    CardType, SdHost,
    constant::*,
    regs::{Completion, PresentState, RegisterIo},
};

/// Response format expected for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    None,
    R1,
    R1b,
    R2,
    R3,
    R6,
    R7,
}

impl ResponseType {
    /// Response type select, CRC check and index check bits of the command register.
    pub fn code(self) -> u16 {
        match self {
            ResponseType::None => SDHCI_CMD_RTYPE_NONE,
            ResponseType::R2 => SDHCI_CMD_RTYPE_R2,
            ResponseType::R3 => SDHCI_CMD_RTYPE_R3R4,
            ResponseType::R1 | ResponseType::R6 | ResponseType::R7 => SDHCI_CMD_RTYPE_R1R5R6R7,
            ResponseType::R1b => SDHCI_CMD_RTYPE_R1BR5B,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SdCommand {
    pub opcode: u8,
    pub arg: u32,
    pub resp_type: ResponseType,
    pub cmd_type: u16,
    pub data_present: bool,
    /// Refuse to issue while the data lines are busy.
    pub check_data_inhibit: bool,
}

impl SdCommand {
    pub fn new(opcode: u8, arg: u32, resp_type: ResponseType) -> Self {
        Self {
            opcode,
            arg,
            resp_type,
            cmd_type: if opcode == MMC_STOP_TRANSMISSION {
                SDHCI_CMD_TYPE_ABORT
            } else {
                SDHCI_CMD_TYPE_NORMAL
            },
            data_present: false,
            check_data_inhibit: false,
        }
    }

    pub fn with_data(mut self) -> Self {
        self.data_present = true;
        self.check_data_inhibit = true;
        self
    }

    pub fn inhibit_check(mut self) -> Self {
        self.check_data_inhibit = true;
        self
    }

    /// Value for the command register.
    pub fn encode(&self) -> u16 {
        let mut val = ((self.opcode as u16) & 0x3F) << SDHCI_CMD_INDEX_SHIFT;
        val |= (self.cmd_type & 0x3) << SDHCI_CMD_TYPE_SHIFT;
        if self.data_present {
            val |= SDHCI_CMD_DATA;
        }
        val | self.resp_type.code()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdResponse {
    pub raw: [u32; 4],
}

impl SdResponse {
    pub fn new() -> Self {
        Self { raw: [0; 4] }
    }

    pub fn as_r1(&self) -> u32 {
        self.raw[0]
    }

    pub fn as_r2(&self) -> [u32; 4] {
        self.raw
    }

    pub fn as_r3(&self) -> u32 {
        self.raw[0]
    }

    pub fn as_r6(&self) -> u32 {
        self.raw[0]
    }

    pub fn as_r7(&self) -> u32 {
        self.raw[0]
    }

    /// CURRENT_STATE of an R1 card status.
    pub fn card_state(&self) -> u8 {
        ((self.raw[0] >> R1_CURRENT_STATE_SHIFT) & R1_CURRENT_STATE_MASK) as u8
    }
}

impl<R: RegisterIo, P: Platform> SdHost<R, P> {
    // Send a command to the card
    pub fn send_command(&self, cmd: &SdCommand) -> Result<SdResponse, SdError> {
        if let Some(card) = &self.card {
            if card.card_type == CardType::Mmc
                && card.csd.spec_vers < 4
                && matches!(cmd.opcode, MMC_SWITCH | MMC_SEND_EXT_CSD)
            {
                return Err(SdError::CommandNotSupported);
            }
        }

        let present = self.present();
        if present.contains(PresentState::CMD_INHIBIT) {
            debug!("cmd{}: command line inhibited", cmd.opcode);
            return Err(SdError::Inhibit);
        }

        self.irq.clear_errors();

        let mut wait = Completion::CMD;
        if cmd.check_data_inhibit || cmd.resp_type == ResponseType::R1b {
            if present.contains(PresentState::DATA_INHIBIT) {
                debug!("cmd{}: data line inhibited", cmd.opcode);
                return Err(SdError::Inhibit);
            }
            // Busy signalling ends with a transfer complete.
            if cmd.resp_type == ResponseType::R1b {
                wait |= Completion::TRANS;
            }
        }
        self.irq.arm(wait);

        debug!(
            "cmd{} arg {:#010x} {:?}{}",
            cmd.opcode,
            cmd.arg,
            cmd.resp_type,
            if cmd.data_present { " +data" } else { "" }
        );

        self.write_argument(cmd.arg);
        self.write_command(cmd.encode());

        // Completion is observed through buffer read ready by the tuning loop.
        if cmd.opcode == MMC_SEND_TUNING_BLOCK {
            return Ok(SdResponse::new());
        }

        if let Err(e) = self.wait_completion(wait, CMD_WAIT_MS, SdError::Timeout) {
            if self.irq.error_status() == 0 {
                debug!("cmd{}: no completion", cmd.opcode);
                self.irq.complete(wait);
                return Err(e);
            }
            debug!(
                "cmd{}: error status {:#06x}",
                cmd.opcode,
                self.irq.error_status()
            );
            return Err(self.recover(e));
        }

        let resp = SdResponse {
            raw: self.read_response(),
        };

        Ok(resp)
    }
}
