// ===== Types and Structures =====

use core::fmt;

use crate::sdhci::constant::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    Timeout,
    Crc,
    EndBit,
    Index,
    DataTimeout,
    DataCrc,
    DataEndBit,
    BusPower,
    Acmd12Error,
    AdmaError,
    InvalidResponse,
    NoCard,
    UnsupportedCard,
    IoError,
    CommandError,
    TransferError,
    InvalidResponseType,
    CardError(u32, &'static str), // card status word and description
    Inhibit,
    Recoverable,
    Abort,
    StateTransition { expected: u8, found: u8 },
    TuningFailed,
    Voltage,
    CommandNotSupported,
    BusWidthNotSupported,
    SpeedModeNotSupported,
    InvalidArgument,
    DescriptorTable,
    MemoryError,
}

impl SdError {
    /// Maps latched error-interrupt bits to the most specific error.
    ///
    /// Command-line errors win over data-line errors, which win over the
    /// auxiliary sources (auto command, ADMA, current limit, tuning).
    pub fn from_error_status(err_sts: u16) -> Self {
        if err_sts & SDHCI_INT_ERR_CMD_TIMEOUT != 0 {
            SdError::Timeout
        } else if err_sts & SDHCI_INT_ERR_CMD_CRC != 0 {
            SdError::Crc
        } else if err_sts & SDHCI_INT_ERR_CMD_END_BIT != 0 {
            SdError::EndBit
        } else if err_sts & SDHCI_INT_ERR_CMD_INDEX != 0 {
            SdError::Index
        } else if err_sts & SDHCI_INT_ERR_DATA_TIMEOUT != 0 {
            SdError::DataTimeout
        } else if err_sts & SDHCI_INT_ERR_DATA_CRC != 0 {
            SdError::DataCrc
        } else if err_sts & SDHCI_INT_ERR_DATA_END_BIT != 0 {
            SdError::DataEndBit
        } else if err_sts & SDHCI_INT_ERR_AUTO_CMD != 0 {
            SdError::Acmd12Error
        } else if err_sts & SDHCI_INT_ERR_ADMA != 0 {
            SdError::AdmaError
        } else if err_sts & SDHCI_INT_ERR_CURRENT_LIMIT != 0 {
            SdError::BusPower
        } else if err_sts & SDHCI_INT_ERR_TUNING != 0 {
            SdError::TuningFailed
        } else {
            SdError::CommandError
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, SdError::Recoverable)
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::Timeout => write!(f, "Command timeout error"),
            SdError::Crc => write!(f, "Command CRC error"),
            SdError::EndBit => write!(f, "Command end bit error"),
            SdError::Index => write!(f, "Command index error"),
            SdError::DataTimeout => write!(f, "Data timeout error"),
            SdError::DataCrc => write!(f, "Data CRC error"),
            SdError::DataEndBit => write!(f, "Data end bit error"),
            SdError::BusPower => write!(f, "Bus power error"),
            SdError::Acmd12Error => write!(f, "Auto command error"),
            SdError::AdmaError => write!(f, "ADMA error"),
            SdError::InvalidResponse => write!(f, "Invalid response"),
            SdError::NoCard => write!(f, "No card detected"),
            SdError::UnsupportedCard => write!(f, "Unsupported card"),
            SdError::IoError => write!(f, "I/O error"),
            SdError::CommandError => write!(f, "Command error"),
            SdError::TransferError => write!(f, "Transfer error"),
            SdError::InvalidResponseType => write!(f, "Invalid response type"),
            SdError::CardError(status, desc) => write!(f, "Card error: 0x{:X} ({})", status, desc),
            SdError::Inhibit => write!(f, "Command or data line inhibited"),
            SdError::Recoverable => write!(f, "Recoverable error, lines were reset"),
            SdError::Abort => write!(f, "Abort command failed"),
            SdError::StateTransition { expected, found } => write!(
                f,
                "Card state transition error: expected {}, found {}",
                expected, found
            ),
            SdError::TuningFailed => write!(f, "Sampling clock tuning failed"),
            SdError::Voltage => write!(f, "No usable voltage window"),
            SdError::CommandNotSupported => write!(f, "Command not supported by card"),
            SdError::BusWidthNotSupported => write!(f, "Bus width not supported"),
            SdError::SpeedModeNotSupported => write!(f, "Bus speed mode not supported"),
            SdError::InvalidArgument => write!(f, "Invalid argument"),
            SdError::DescriptorTable => write!(f, "ADMA2 descriptor table cannot cover transfer"),
            SdError::MemoryError => write!(f, "Memory allocation error"),
        }
    }
}
