#![allow(unused)]

// SDHCI register offsets
pub const SDHCI_DMA_ADDRESS: u32 = 0x00;
pub const SDHCI_BLOCK_SIZE: u32 = 0x04;
pub const SDHCI_BLOCK_COUNT: u32 = 0x06;
pub const SDHCI_ARGUMENT: u32 = 0x08;
pub const SDHCI_TRANSFER_MODE: u32 = 0x0C;
pub const SDHCI_COMMAND: u32 = 0x0E;
pub const SDHCI_RESPONSE: u32 = 0x10; // 0x10-0x1F, 4 registers
pub const SDHCI_BUFFER: u32 = 0x20;
pub const SDHCI_PRESENT_STATE: u32 = 0x24;
pub const SDHCI_HOST_CONTROL: u32 = 0x28;
pub const SDHCI_POWER_CONTROL: u32 = 0x29;
pub const SDHCI_BLOCK_GAP_CONTROL: u32 = 0x2A;
pub const SDHCI_WAKE_UP_CONTROL: u32 = 0x2B;
pub const SDHCI_CLOCK_CONTROL: u32 = 0x2C;
pub const SDHCI_TIMEOUT_CONTROL: u32 = 0x2E;
pub const SDHCI_SOFTWARE_RESET: u32 = 0x2F;
pub const SDHCI_INT_STATUS: u32 = 0x30;
pub const SDHCI_ERR_INT_STATUS: u32 = 0x32;
pub const SDHCI_INT_ENABLE: u32 = 0x34;
pub const SDHCI_ERR_INT_ENABLE: u32 = 0x36;
pub const SDHCI_SIGNAL_ENABLE: u32 = 0x38;
pub const SDHCI_ERR_SIGNAL_ENABLE: u32 = 0x3A;
pub const SDHCI_AUTO_CMD_STATUS: u32 = 0x3C;
pub const SDHCI_HOST_CONTROL2: u32 = 0x3E;
pub const SDHCI_CAPABILITIES: u32 = 0x40;
pub const SDHCI_CAPABILITIES_1: u32 = 0x44;
pub const SDHCI_ADMA_ADDRESS: u32 = 0x58;
pub const SDHCI_HOST_VERSION: u32 = 0xFE;

/* Vendor block */
pub const SDHCI_VENDOR_REG0: u32 = 0x100;
pub const SDHCI_VENDOR_REG3: u32 = 0x10C;
pub const SDHCI_VENDOR_REG4: u32 = 0x110;
pub const SDHCI_DMA_HANDSHAKE: u32 = 0x128;
pub const SDHCI_HW_ATTRIBUTES: u32 = 0x178;

// Command register: [13:8] index, [7:6] type, [5] data present, [4:0] response
pub const SDHCI_CMD_INDEX_SHIFT: u16 = 8;
pub const SDHCI_CMD_TYPE_SHIFT: u16 = 6;
pub const SDHCI_CMD_DATA: u16 = 0x20;

pub const SDHCI_CMD_RTYPE_NONE: u16 = 0x00;
pub const SDHCI_CMD_RTYPE_R2: u16 = 0x09;
pub const SDHCI_CMD_RTYPE_R3R4: u16 = 0x02;
pub const SDHCI_CMD_RTYPE_R1R5R6R7: u16 = 0x1A;
pub const SDHCI_CMD_RTYPE_R1BR5B: u16 = 0x1B;

pub const SDHCI_CMD_TYPE_NORMAL: u16 = 0;
pub const SDHCI_CMD_TYPE_SUSPEND: u16 = 1;
pub const SDHCI_CMD_TYPE_RESUME: u16 = 2;
pub const SDHCI_CMD_TYPE_ABORT: u16 = 3;

// Transfer mode
pub const SDHCI_TRNS_DMA: u16 = 0x01;
pub const SDHCI_TRNS_BLK_CNT_EN: u16 = 0x02;
pub const SDHCI_TRNS_AUTO_CMD12: u16 = 0x04;
pub const SDHCI_TRNS_AUTO_CMD23: u16 = 0x08;
pub const SDHCI_TRNS_READ: u16 = 0x10;
pub const SDHCI_TRNS_MULTI: u16 = 0x20;

// Block size register: [14:12] SDMA boundary, [11:0] block size
pub const SDHCI_BLOCK_SIZE_MASK: u16 = 0x0FFF;
pub const SDHCI_SDMA_BOUNDARY_SHIFT: u16 = 12;
pub const SDHCI_SDMA_WINDOW_BASE: u32 = 0x1000;
pub const SDHCI_MAX_BLOCK_COUNT: u32 = 0xFFFF;

// Present state
pub const SDHCI_CMD_INHIBIT: u32 = 1 << 0;
pub const SDHCI_DATA_INHIBIT: u32 = 1 << 1;
pub const SDHCI_DAT_LINE_ACTIVE: u32 = 1 << 2;
pub const SDHCI_BUFFER_WRITE_ENABLE: u32 = 1 << 10;
pub const SDHCI_BUFFER_READ_ENABLE: u32 = 1 << 11;
pub const SDHCI_CARD_INSERTED: u32 = 1 << 16;
pub const SDHCI_CARD_STABLE: u32 = 1 << 17;
pub const SDHCI_WRITE_PROTECT: u32 = 1 << 19;
pub const SDHCI_DAT_LINE_LEVEL: u32 = 0xF << 20;
pub const SDHCI_CMD_LINE_LEVEL: u32 = 1 << 24;

// Host control 1
pub const SDHCI_CTRL_LED: u8 = 0x01;
pub const SDHCI_CTRL_4BITBUS: u8 = 0x02;
pub const SDHCI_CTRL_HISPD: u8 = 0x04;
pub const SDHCI_CTRL_ADMA2: u8 = 0x08;
pub const SDHCI_CTRL_DMA_MASK: u8 = 0x18;
pub const SDHCI_CTRL_8BITBUS: u8 = 0x20;

// Power control
pub const SDHCI_POWER_ON: u8 = 0x01;
pub const SDHCI_POWER_180: u8 = 0x0A;
pub const SDHCI_POWER_300: u8 = 0x0C;
pub const SDHCI_POWER_330: u8 = 0x0E;

// Block gap control
pub const SDHCI_STOP_AT_BLOCK_GAP: u8 = 0x01;
pub const SDHCI_CONTINUE_REQUEST: u8 = 0x02;
pub const SDHCI_READ_WAIT: u8 = 0x04;
pub const SDHCI_INT_AT_BLOCK_GAP: u8 = 0x08;

// Clock control
pub const SDHCI_CLOCK_INT_EN: u16 = 0x0001;
pub const SDHCI_CLOCK_INT_STABLE: u16 = 0x0002;
pub const SDHCI_CLOCK_CARD_EN: u16 = 0x0004;
pub const SDHCI_DIVIDER_SHIFT: u16 = 8;
pub const SDHCI_DIVIDER_HI_SHIFT: u16 = 6;
pub const SDHCI_DIV_MASK: u16 = 0xFF;
pub const SDHCI_DIV_HI_MASK: u16 = 0x300;
pub const SDHCI_MAX_DIV: u16 = 0x3FF;

// Timeout control
pub const SDHCI_TIMEOUT_VALUE: u8 = 13;

// Software reset
pub const SDHCI_RESET_ALL: u8 = 0x01;
pub const SDHCI_RESET_CMD: u8 = 0x02;
pub const SDHCI_RESET_DATA: u8 = 0x04;

// Normal interrupt status
pub const SDHCI_INT_CMD_COMPLETE: u16 = 1 << 0;
pub const SDHCI_INT_XFER_COMPLETE: u16 = 1 << 1;
pub const SDHCI_INT_BLOCK_GAP: u16 = 1 << 2;
pub const SDHCI_INT_DMA: u16 = 1 << 3;
pub const SDHCI_INT_BUF_WR_READY: u16 = 1 << 4;
pub const SDHCI_INT_BUF_RD_READY: u16 = 1 << 5;
pub const SDHCI_INT_CARD_INSERT: u16 = 1 << 6;
pub const SDHCI_INT_CARD_REMOVE: u16 = 1 << 7;
pub const SDHCI_INT_CARD_INT: u16 = 1 << 8;
pub const SDHCI_INT_RETUNE: u16 = 1 << 12;
pub const SDHCI_INT_ERROR: u16 = 1 << 15;

// Error interrupt status
pub const SDHCI_INT_ERR_CMD_TIMEOUT: u16 = 1 << 0;
pub const SDHCI_INT_ERR_CMD_CRC: u16 = 1 << 1;
pub const SDHCI_INT_ERR_CMD_END_BIT: u16 = 1 << 2;
pub const SDHCI_INT_ERR_CMD_INDEX: u16 = 1 << 3;
pub const SDHCI_INT_ERR_DATA_TIMEOUT: u16 = 1 << 4;
pub const SDHCI_INT_ERR_DATA_CRC: u16 = 1 << 5;
pub const SDHCI_INT_ERR_DATA_END_BIT: u16 = 1 << 6;
pub const SDHCI_INT_ERR_CURRENT_LIMIT: u16 = 1 << 7;
pub const SDHCI_INT_ERR_AUTO_CMD: u16 = 1 << 8;
pub const SDHCI_INT_ERR_ADMA: u16 = 1 << 9;
pub const SDHCI_INT_ERR_TUNING: u16 = 1 << 10;
pub const SDHCI_INT_ERR_CMD_LINE: u16 = 0x000F;
pub const SDHCI_INT_ERR_DATA_LINE: u16 = 0x0070;

// Interrupt enables
pub const SDHCI_INT_ENABLE_ALL: u16 = 0x10FF;
pub const SDHCI_ERR_ENABLE_ALL: u16 = 0xF7FF;
pub const SDHCI_ERR_SIGNAL_ALL: u16 = 0xF3FF;
pub const SDHCI_SIGNAL_BASE: u16 =
    SDHCI_INT_CARD_REMOVE | SDHCI_INT_CARD_INSERT | SDHCI_INT_CMD_COMPLETE | SDHCI_INT_XFER_COMPLETE;
pub const SDHCI_SIGNAL_PIO: u16 = SDHCI_SIGNAL_BASE | SDHCI_INT_BLOCK_GAP;
pub const SDHCI_SIGNAL_SDMA: u16 = SDHCI_SIGNAL_BASE | SDHCI_INT_DMA | SDHCI_INT_BLOCK_GAP;
pub const SDHCI_SIGNAL_ADMA: u16 = SDHCI_SIGNAL_BASE | SDHCI_INT_DMA;

// Auto CMD error status
pub const SDHCI_AUTO_CMD_NOT_EXECUTED: u16 = 1 << 0;
pub const SDHCI_AUTO_CMD_TIMEOUT: u16 = 1 << 1;
pub const SDHCI_AUTO_CMD_CRC: u16 = 1 << 2;
pub const SDHCI_AUTO_CMD_END_BIT: u16 = 1 << 3;
pub const SDHCI_AUTO_CMD_INDEX: u16 = 1 << 4;
pub const SDHCI_AUTO_CMD_NOT_ISSUED: u16 = 1 << 7;

// Host control 2
pub const SDHCI_CTRL_UHS_MASK: u16 = 0x0007;
pub const SDHCI_CTRL_VDD_180: u16 = 1 << 3;
pub const SDHCI_CTRL_EXEC_TUNING: u16 = 1 << 6;
pub const SDHCI_CTRL_TUNED_CLK: u16 = 1 << 7;
pub const SDHCI_CTRL_ASYNC_INT: u16 = 1 << 14;
pub const SDHCI_CTRL_PRESET_VAL: u16 = 1 << 15;

// Capabilities
pub const SDHCI_CLOCK_BASE_MASK: u32 = 0x0000_FF00;
pub const SDHCI_CLOCK_BASE_SHIFT: u32 = 8;
pub const SDHCI_CAN_VDD_330: u32 = 1 << 24;
pub const SDHCI_CAN_VDD_300: u32 = 1 << 25;
pub const SDHCI_CAN_VDD_180: u32 = 1 << 26;
pub const SDHCI_SUPPORT_SDR50: u32 = 1 << 0;
pub const SDHCI_SUPPORT_SDR104: u32 = 1 << 1;
pub const SDHCI_SUPPORT_DDR50: u32 = 1 << 2;
pub const SDHCI_DEFAULT_BASE_CLOCK_MHZ: u32 = 100;

// Vendor register bits
pub const SDHCI_VENDOR0_PULSE_LATCH: u32 = 1 << 0;
pub const SDHCI_VENDOR0_LATCH_OFFSET: u32 = 0x200;
pub const SDHCI_VENDOR3_TUNE_BASE: u32 = 0x0000_0804;
pub const SDHCI_VENDOR3_TUNE_SHIFT: u32 = 24;
pub const SDHCI_VENDOR3_DELAY_SHIFT: u32 = 16;
pub const SDHCI_VENDOR3_DELAY_MASK: u32 = 0x1F;
pub const SDHCI_DMA_HANDSHAKE_EN: u32 = 1 << 0;
pub const SDHCI_HW_FIFO_SRAM: u32 = 0x1C;
pub const SDHCI_HW_FIFO_16W: u32 = 0x02;
pub const SDHCI_HW_FIFO_8W: u32 = 0x01;

/*
 * End of controller registers.
 */

// Card commands
pub const MMC_GO_IDLE_STATE: u8 = 0;
pub const MMC_SEND_OP_COND: u8 = 1;
pub const MMC_ALL_SEND_CID: u8 = 2;
pub const MMC_SET_RELATIVE_ADDR: u8 = 3;
pub const SD_SEND_RELATIVE_ADDR: u8 = 3;
pub const MMC_SWITCH: u8 = 6;
pub const SD_SWITCH: u8 = 6;
pub const SD_APP_SET_BUS_WIDTH: u8 = 6;
pub const MMC_SELECT_CARD: u8 = 7;
pub const SD_SEND_IF_COND: u8 = 8;
pub const MMC_SEND_EXT_CSD: u8 = 8;
pub const MMC_SEND_CSD: u8 = 9;
pub const MMC_SEND_CID: u8 = 10;
pub const MMC_STOP_TRANSMISSION: u8 = 12;
pub const MMC_SEND_STATUS: u8 = 13;
pub const MMC_SET_BLOCKLEN: u8 = 16;
pub const MMC_READ_SINGLE_BLOCK: u8 = 17;
pub const MMC_READ_MULTIPLE_BLOCK: u8 = 18;
pub const MMC_SEND_TUNING_BLOCK: u8 = 19;
pub const MMC_SET_BLOCK_COUNT: u8 = 23;
pub const MMC_WRITE_BLOCK: u8 = 24;
pub const MMC_WRITE_MULTIPLE_BLOCK: u8 = 25;
pub const SD_APP_OP_COND: u8 = 41;
pub const SD_APP_SEND_SCR: u8 = 51;
pub const MMC_APP_CMD: u8 = 55;

// Command arguments
pub const SD_IF_COND_PATTERN: u32 = 0xAA;
pub const SD_IF_COND_VHS_27_36: u32 = 1 << 8;
pub const OCR_BUSY: u32 = 1 << 31;
pub const OCR_HCS: u32 = 1 << 30;
pub const OCR_S18R: u32 = 1 << 24;
pub const OCR_ACCESS_MODE_SHIFT: u32 = 29;
pub const OCR_ACCESS_MODE_SECTOR: u32 = 2;
pub const OCR_LOW_VOLTAGE: u32 = 1 << 7;
pub const OCR_RESERVED_LOW: u32 = 0x7F;
pub const OCR_VOLTAGE_MASK: u32 = 0x00FF_FFFF;
pub const OCR_HOST_WINDOW: u32 = 0x00FF_8000;
pub const OCR_3V0_BIT: u32 = 17;
pub const MMC_DEFAULT_RCA: u16 = 2;
pub const SD_BUS_WIDTH_1: u32 = 0;
pub const SD_BUS_WIDTH_4: u32 = 2;
pub const SD_SWITCH_CHECK: u32 = 0;
pub const SD_SWITCH_SET: u32 = 1;
pub const SD_SWITCH_STATUS_LEN: usize = 64;
pub const SD_SWITCH_GROUP_ACCESS_MODE: u32 = 0;
pub const SD_SWITCH_SUPPORT_BYTE: usize = 13;
pub const SD_SWITCH_RESULT_BYTE: usize = 16;
pub const SD_SCR_LEN: usize = 8;
pub const TUNING_BLOCK_LEN: u16 = 64;

// EXT_CSD layout
pub const EXT_CSD_LEN: usize = 512;
pub const EXT_CSD_WRITE_BYTE: u32 = 3;
pub const EXT_CSD_CMD_SET_NORMAL: u8 = 1 << 0;
pub const EXT_CSD_BUS_WIDTH: u8 = 183;
pub const EXT_CSD_HS_TIMING: u8 = 185;
pub const EXT_CSD_REV: usize = 192;
pub const EXT_CSD_STRUCTURE: usize = 194;
pub const EXT_CSD_CARD_TYPE: usize = 196;
pub const EXT_CSD_SEC_CNT: usize = 212;
pub const EXT_CSD_BOOT_MULT: usize = 226;

// R1 card status
pub const R1_READY_FOR_DATA: u32 = 1 << 8;
pub const R1_CURRENT_STATE_SHIFT: u32 = 9;
pub const R1_CURRENT_STATE_MASK: u32 = 0xF;
pub const R1_APP_CMD: u32 = 1 << 5;
pub const R1_ERROR_BITS: u32 = 0xFD3F_8088;

// Completion mask
pub const WAIT_CMD_COMPLETE: u8 = 1 << 0;
pub const WAIT_TRANS_COMPLETE: u8 = 1 << 1;
pub const WAIT_DMA_INTR: u8 = 1 << 2;
pub const WAIT_BLOCK_GAP: u8 = 1 << 3;

// Block geometry
pub const SD_BLOCK_LEN_SHIFT: u32 = 9;
pub const SD_BLOCK_SIZE: usize = 1 << SD_BLOCK_LEN_SHIFT;

// Waits, in milliseconds unless stated otherwise
pub const CMD_WAIT_MS: u64 = 1000;
pub const CLOCK_STABLE_MS: u32 = 10;
pub const OP_COND_RETRIES: u32 = 100;
pub const OP_COND_DELAY_US: u64 = 10_000;
pub const RCA_DELAY_US: u64 = 10_000;
pub const STATE_POLL_DELAY_US: u64 = 3_000;
pub const WRITE_DONE_MS: u64 = 5000;
pub const SPEED_SWITCH_MS: u64 = 2000;
pub const AUTO_CMD_RECOVERY_MS: u64 = 1000;
pub const TUNING_BLOCK_WAIT_MS: u64 = 100;
pub const TUNING_RETRIES: u32 = 3;
pub const TUNING_MAX_LOOP: u32 = 40;
pub const RESET_WAIT_MS: u64 = 100;
pub const RECOVERY_SETTLE_US: u64 = 40;

// Clock rates
pub const DLL_THRESHOLD_HZ: u32 = 100_000_000;
pub const SDR12_MAX_DTR: u32 = 25_000_000;
pub const DDR50_MAX_DTR: u32 = 50_000_000;
pub const MMC_HS52_DTR: u32 = 52_000_000;
pub const MMC_HS26_DTR: u32 = 26_000_000;
