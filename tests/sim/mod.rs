//! Register-level model of an SDHCI controller with one card in its slot.
//!
//! Commands execute synchronously when the command register is written.
//! A data phase starts once the driver acknowledges command complete and
//! then moves bytes through the data port (PIO) or straight between the
//! card and the buffers handed out by `dma_map` (SDMA, ADMA2).

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell, RefMut},
    collections::BTreeMap,
    rc::Rc,
};

use dma_api::Direction;
use sdhci_host::{
    HostConfig, Platform, RegisterIo, SdHost,
    sdhci::{Adma2Line, constant::*},
};

pub const BASE_CLOCK_MHZ: u32 = 200;
pub const SD_RCA: u16 = 0x1234;
pub const CARD_OCR: u32 = 0x00FF_8000;

const BUS_BASE: u32 = 0x1000_0000;
const BUS_STRIDE: u32 = 0x0100_0000;
const ADMA2_INT: u16 = 1 << 2;

const IDLE: u8 = 0;
const READY: u8 = 1;
const IDENT: u8 = 2;
const STANDBY: u8 = 3;
const TRAN: u8 = 4;
const DATA: u8 = 5;
const RCV: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// SD 1.x: byte addressed, silent on CMD8.
    SdV1,
    /// SDHC: block addressed.
    SdV2,
    /// eMMC 4.x in sector mode.
    Mmc,
}

enum Reply {
    None,
    Short(u32),
    Long([u32; 4]),
    Data(u32, Payload),
    Timeout,
}

#[derive(Clone)]
enum Payload {
    Register(Vec<u8>),
    Blocks(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Pio,
    Sdma,
    Adma,
}

fn r2(hi: u64, lo: u64) -> [u32; 4] {
    [lo as u32, (lo >> 32) as u32, hi as u32, (hi >> 32) as u32]
}

pub struct Card {
    pub kind: CardKind,
    pub state: u8,
    pub rca: u16,
    /// Advertises SDR50, SDR104 and DDR50 in the switch status.
    pub uhs: bool,
    pub blocks: u32,
    /// ACMD41/CMD1 rounds answered busy before the card powers up.
    pub busy_polls: u32,
    pub access_mode: u8,
    pub bus_width: u32,
    pub ext_csd: Vec<u8>,
    pub storage: BTreeMap<u32, Vec<u8>>,
    app: bool,
    polls: u32,
}

impl Card {
    pub fn new(kind: CardKind) -> Self {
        let mut ext_csd = vec![0u8; EXT_CSD_LEN];
        ext_csd[EXT_CSD_REV] = 5;
        ext_csd[EXT_CSD_CARD_TYPE] = 0x3;
        ext_csd[EXT_CSD_BOOT_MULT] = 2;
        ext_csd[EXT_CSD_SEC_CNT..EXT_CSD_SEC_CNT + 4].copy_from_slice(&8192u32.to_le_bytes());

        Self {
            kind,
            state: IDLE,
            rca: 0,
            uhs: false,
            blocks: match kind {
                CardKind::SdV1 => 4096,
                CardKind::SdV2 => 2048,
                CardKind::Mmc => 8192,
            },
            busy_polls: 2,
            access_mode: 0,
            bus_width: 0,
            ext_csd,
            storage: BTreeMap::new(),
            app: false,
            polls: 0,
        }
    }

    pub fn sd_v2() -> Self {
        Self::new(CardKind::SdV2)
    }

    pub fn uhs(mut self) -> Self {
        self.uhs = true;
        self
    }

    pub fn block(&self, n: u32) -> Vec<u8> {
        self.storage
            .get(&n)
            .cloned()
            .unwrap_or_else(|| vec![0; SD_BLOCK_SIZE])
    }

    fn status(&self) -> u32 {
        ((self.state as u32) << R1_CURRENT_STATE_SHIFT) | R1_READY_FOR_DATA
    }

    fn block_of(&self, arg: u32) -> u32 {
        match self.kind {
            CardKind::SdV1 => arg >> SD_BLOCK_LEN_SHIFT,
            _ => arg,
        }
    }

    fn cid(&self) -> [u32; 4] {
        let hi = (0x03u64 << 48) | (0x5344 << 32) | u32::from_be_bytes(*b"SIM0") as u64;
        let lo = ((b'1' as u64) << 56) | (0x10 << 48) | (0xCAFE_F00D << 16) | (0x18 << 4) | 0x3;
        r2(hi, lo)
    }

    fn csd(&self) -> [u32; 4] {
        match self.kind {
            CardKind::SdV2 => {
                let c_size = ((self.blocks as u64) >> 10) - 1;
                r2((1 << 54) | (0x32 << 24) | (9 << 8), c_size << 40)
            }
            CardKind::SdV1 => {
                // 256 << (2 + 2) blocks
                let c_size = 0xFFu64;
                r2(
                    (0x32 << 24) | (9 << 8) | (c_size >> 10),
                    ((c_size & 0x3FF) << 54) | (2 << 39) | (9 << 14),
                )
            }
            CardKind::Mmc => {
                let c_size = 0xFFFu64;
                r2(
                    (4 << 50) | (0x2A << 24) | (9 << 8) | (c_size >> 10),
                    ((c_size & 0x3FF) << 54) | (7 << 39),
                )
            }
        }
    }

    fn scr(&self) -> Vec<u8> {
        vec![0x02, 0x05, if self.uhs { 0x80 } else { 0 }, 0x03, 0, 0, 0, 0]
    }

    fn switch_status(&mut self, arg: u32) -> Vec<u8> {
        let set = arg >> 31 != 0;
        let func = (arg & 0xF) as u8;
        let supported: u8 = if self.uhs { 0x1F } else { 0x03 };

        let mut status = vec![0u8; SD_SWITCH_STATUS_LEN];
        status[SD_SWITCH_SUPPORT_BYTE] = supported;
        status[SD_SWITCH_RESULT_BYTE] = if func < 8 && supported & (1 << func) != 0 {
            if set {
                self.access_mode = func;
            }
            func
        } else {
            0xF
        };
        status
    }

    fn op_cond(&mut self, arg: u32) -> Reply {
        if arg & OCR_VOLTAGE_MASK == 0 {
            return Reply::Short(CARD_OCR);
        }

        self.polls += 1;
        if self.polls < self.busy_polls {
            return Reply::Short(CARD_OCR);
        }

        self.state = READY;
        let mut ocr = CARD_OCR | OCR_BUSY;
        match self.kind {
            CardKind::SdV2 if arg & OCR_HCS != 0 => ocr |= OCR_HCS,
            CardKind::Mmc => ocr |= OCR_ACCESS_MODE_SECTOR << OCR_ACCESS_MODE_SHIFT,
            _ => {}
        }
        Reply::Short(ocr)
    }

    fn execute(&mut self, opcode: u8, arg: u32, faults: &Faults) -> Reply {
        let app = std::mem::take(&mut self.app);
        let mmc = self.kind == CardKind::Mmc;
        let addressed = (arg >> 16) as u16 == self.rca;

        match (app, opcode) {
            (_, MMC_GO_IDLE_STATE) => {
                self.state = IDLE;
                self.polls = 0;
                self.bus_width = 0;
                Reply::None
            }
            (true, SD_APP_SET_BUS_WIDTH) => {
                self.bus_width = arg & 0x3;
                Reply::Short(self.status())
            }
            (true, SD_APP_OP_COND) => self.op_cond(arg),
            (true, SD_APP_SEND_SCR) => Reply::Data(self.status(), Payload::Register(self.scr())),
            (false, MMC_SEND_OP_COND) if mmc => self.op_cond(arg),
            (false, MMC_ALL_SEND_CID) if self.state == READY => {
                self.state = IDENT;
                Reply::Long(self.cid())
            }
            (false, SD_SEND_RELATIVE_ADDR) => {
                self.rca = if mmc { (arg >> 16) as u16 } else { SD_RCA };
                let status = self.status();
                self.state = STANDBY;
                if mmc {
                    Reply::Short(status)
                } else {
                    Reply::Short(((self.rca as u32) << 16) | (status & 0x1FFF))
                }
            }
            (false, MMC_SWITCH) if mmc => {
                let index = ((arg >> 16) & 0xFF) as usize;
                self.ext_csd[index] = (arg >> 8) as u8;
                Reply::Short(self.status())
            }
            (false, SD_SWITCH) => {
                let status = self.status();
                Reply::Data(status, Payload::Register(self.switch_status(arg)))
            }
            (false, MMC_SELECT_CARD) => {
                let status = self.status();
                self.state = if addressed { TRAN } else { STANDBY };
                Reply::Short(status)
            }
            (false, MMC_SEND_EXT_CSD) if mmc && self.state == TRAN => {
                Reply::Data(self.status(), Payload::Register(self.ext_csd.clone()))
            }
            (false, SD_SEND_IF_COND) if self.kind == CardKind::SdV2 && self.state == IDLE => {
                Reply::Short(arg & 0xFFF)
            }
            (false, MMC_SEND_CSD) if addressed => {
                if faults.skip_standby {
                    self.state = IDENT;
                }
                Reply::Long(self.csd())
            }
            (false, MMC_STOP_TRANSMISSION) => {
                let status = self.status();
                if matches!(self.state, DATA | RCV) {
                    self.state = TRAN;
                }
                Reply::Short(status)
            }
            (false, MMC_SEND_STATUS) if addressed => Reply::Short(self.status()),
            (false, MMC_SET_BLOCKLEN) => Reply::Short(self.status()),
            (false, MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK) if self.state == TRAN => {
                let status = self.status();
                self.state = DATA;
                Reply::Data(status, Payload::Blocks(self.block_of(arg)))
            }
            (false, MMC_WRITE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK) if self.state == TRAN => {
                let status = self.status();
                self.state = RCV;
                Reply::Data(status, Payload::Blocks(self.block_of(arg)))
            }
            (false, MMC_APP_CMD) if !mmc => {
                self.app = true;
                Reply::Short(self.status() | R1_APP_CMD)
            }
            _ => Reply::Timeout,
        }
    }
}

/// Faults and vendor tuning behaviour injected by a test.
#[derive(Debug, Default)]
pub struct Faults {
    /// Card reads left to fail with a data CRC error instead of data.
    pub read_crc: u32,
    /// The card drops back to identification after CMD9.
    pub skip_standby: bool,
    /// CMD19 rounds before the controller ends a tuning pass.
    pub tuning_rounds: u32,
    /// Whether a finished pass reports a tuned sampling clock.
    pub tuned: bool,
    /// Delay tap reported through vendor register 3.
    pub tuning_delay: u32,
    /// Bitmap of valid delay taps, vendor register 4.
    pub valid_delays: u32,
    /// Auto command status the next automatic stop fails with.
    pub auto_cmd_error: Option<u16>,
}

struct Xfer {
    read: bool,
    payload: Payload,
    blk_size: usize,
    total: Option<u32>,
    block: u32,
    offset: usize,
    buf: Vec<u8>,
    engine: Engine,
    auto_stop: bool,
    auto_cmd: bool,
    dma_addr: u32,
}

impl Xfer {
    fn done(&self) -> bool {
        self.total.is_some_and(|total| self.block >= total)
    }

    /// Next byte from the card; true when it ended a block.
    fn pull(&mut self, card: &Card) -> (u8, bool) {
        if self.offset == 0 {
            self.buf = match &self.payload {
                Payload::Register(data) => data.clone(),
                Payload::Blocks(start) => card.block(start + self.block),
            };
            self.buf.resize(self.blk_size, 0);
        }

        let byte = self.buf[self.offset];
        self.offset += 1;
        if self.offset == self.blk_size {
            self.offset = 0;
            self.block += 1;
            return (byte, true);
        }
        (byte, false)
    }

    /// Next byte to the card; true when it completed a block.
    fn push(&mut self, card: &mut Card, byte: u8) -> bool {
        if self.offset == 0 {
            self.buf.clear();
        }
        self.buf.push(byte);
        self.offset += 1;

        if self.offset == self.blk_size {
            if let Payload::Blocks(start) = self.payload {
                card.storage.insert(start + self.block, self.buf.clone());
            }
            self.offset = 0;
            self.block += 1;
            return true;
        }
        false
    }
}

struct Mapping {
    bus: u32,
    host: usize,
    len: usize,
}

fn resolve(maps: &[Mapping], bus: u32) -> Option<*mut u8> {
    maps.iter()
        .find(|m| bus >= m.bus && ((bus - m.bus) as usize) < m.len)
        .map(|m| (m.host + (bus - m.bus) as usize) as *mut u8)
}

pub struct SimState {
    regs: [u8; 0x200],
    normal: u16,
    err: u16,
    pub card: Option<Card>,
    pub faults: Faults,
    pending: Option<Xfer>,
    xfer: Option<Xfer>,
    sdma_paused: bool,
    maps: Vec<Mapping>,
    /// Added to every bus address handed out, to misalign DMA buffers.
    pub bus_offset: u32,
    pub commands: Vec<(u8, u32)>,
    pub resets: Vec<u8>,
    pub tuning_starts: u32,
    tuning_count: u32,
    /// Writes ended by stop-at-block-gap.
    pub block_gap_stops: u32,
    /// Every busy-wait the driver asked the platform for, in microseconds.
    pub delays: Vec<u64>,
}

impl SimState {
    fn new(card: Option<Card>) -> Self {
        let mut sim = Self {
            regs: [0; 0x200],
            normal: 0,
            err: 0,
            card,
            faults: Faults {
                tuning_rounds: 8,
                tuned: true,
                ..Default::default()
            },
            pending: None,
            xfer: None,
            sdma_paused: false,
            maps: Vec::new(),
            bus_offset: 0,
            commands: Vec::new(),
            resets: Vec::new(),
            tuning_starts: 0,
            tuning_count: 0,
            block_gap_stops: 0,
            delays: Vec::new(),
        };
        sim.power_on_defaults();
        sim
    }

    fn power_on_defaults(&mut self) {
        self.regs = [0; 0x200];
        self.store(
            SDHCI_CAPABILITIES,
            4,
            (BASE_CLOCK_MHZ << SDHCI_CLOCK_BASE_SHIFT) | SDHCI_CAN_VDD_330 | SDHCI_CAN_VDD_300,
        );
        self.store(
            SDHCI_CAPABILITIES_1,
            4,
            SDHCI_SUPPORT_SDR50 | SDHCI_SUPPORT_SDR104 | SDHCI_SUPPORT_DDR50,
        );
        self.store(SDHCI_HOST_VERSION, 2, 0x0002);
        self.store(SDHCI_HW_ATTRIBUTES, 4, SDHCI_HW_FIFO_SRAM);
    }

    fn load(&self, offset: u32, width: usize) -> u32 {
        let off = offset as usize;
        self.regs[off..off + width]
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32)
    }

    fn store(&mut self, offset: u32, width: usize, value: u32) {
        let off = offset as usize;
        for (i, byte) in self.regs[off..off + width].iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }
    }

    fn normal_status(&self) -> u16 {
        let mut status = self.normal;
        if self.err != 0 {
            status |= SDHCI_INT_ERROR;
        }
        status
    }

    fn read(&mut self, offset: u32, width: usize) -> u32 {
        match offset {
            SDHCI_BUFFER => self.fifo_read(width),
            SDHCI_PRESENT_STATE => {
                let mut state = SDHCI_DAT_LINE_LEVEL | SDHCI_CMD_LINE_LEVEL;
                if self.card.is_some() {
                    state |= SDHCI_CARD_INSERTED | SDHCI_CARD_STABLE;
                }
                state
            }
            SDHCI_INT_STATUS if width == 4 => self.normal_status() as u32 | (self.err as u32) << 16,
            SDHCI_INT_STATUS => self.normal_status() as u32,
            SDHCI_ERR_INT_STATUS => self.err as u32,
            SDHCI_SOFTWARE_RESET => 0,
            SDHCI_VENDOR_REG3 => {
                let mask = SDHCI_VENDOR3_DELAY_MASK << SDHCI_VENDOR3_DELAY_SHIFT;
                (self.load(offset, 4) & !mask)
                    | ((self.faults.tuning_delay & SDHCI_VENDOR3_DELAY_MASK) << SDHCI_VENDOR3_DELAY_SHIFT)
            }
            SDHCI_VENDOR_REG4 => self.faults.valid_delays,
            _ => self.load(offset, width),
        }
    }

    fn write(&mut self, offset: u32, width: usize, value: u32) {
        match offset {
            SDHCI_BUFFER => self.fifo_write(value, width),
            SDHCI_INT_STATUS => {
                let ack = value as u16;
                self.normal &= !ack;
                if width == 4 {
                    self.err &= !((value >> 16) as u16);
                }
                if ack & SDHCI_INT_CMD_COMPLETE != 0 {
                    if let Some(xfer) = self.pending.take() {
                        self.start(xfer);
                    }
                }
            }
            SDHCI_ERR_INT_STATUS => self.err &= !(value as u16),
            SDHCI_SOFTWARE_RESET => self.soft_reset(value as u8),
            SDHCI_COMMAND => {
                self.store(offset, width, value);
                self.command(value as u16);
            }
            SDHCI_CLOCK_CONTROL => {
                let mut clk = value as u16 & !SDHCI_CLOCK_INT_STABLE;
                if clk & SDHCI_CLOCK_INT_EN != 0 {
                    clk |= SDHCI_CLOCK_INT_STABLE;
                }
                self.store(offset, width, clk as u32);
            }
            SDHCI_HOST_CONTROL2 => {
                let old = self.load(offset, 2) as u16;
                let mut ctl = value as u16;
                if ctl & SDHCI_CTRL_EXEC_TUNING != 0 && old & SDHCI_CTRL_EXEC_TUNING == 0 {
                    self.tuning_starts += 1;
                    self.tuning_count = 0;
                    ctl &= !SDHCI_CTRL_TUNED_CLK;
                }
                self.store(offset, width, ctl as u32);
            }
            SDHCI_DMA_ADDRESS => {
                self.store(offset, width, value);
                if self.sdma_paused {
                    self.sdma_paused = false;
                    if let Some(xfer) = self.xfer.as_mut() {
                        xfer.dma_addr = value;
                    }
                    self.run_sdma();
                }
            }
            SDHCI_BLOCK_GAP_CONTROL => {
                self.store(offset, width, value);
                if value as u8 & SDHCI_STOP_AT_BLOCK_GAP != 0 {
                    self.stop_at_block_gap();
                }
            }
            _ => self.store(offset, width, value),
        }
    }

    fn soft_reset(&mut self, mask: u8) {
        self.resets.push(mask);

        if mask & SDHCI_RESET_ALL != 0 {
            self.power_on_defaults();
            self.normal = 0;
            self.err = 0;
            self.xfer = None;
            self.pending = None;
            self.sdma_paused = false;
            return;
        }
        if mask & SDHCI_RESET_CMD != 0 {
            self.normal &= !SDHCI_INT_CMD_COMPLETE;
        }
        if mask & SDHCI_RESET_DATA != 0 {
            self.xfer = None;
            self.pending = None;
            self.sdma_paused = false;
            self.normal &= !(SDHCI_INT_BUF_RD_READY
                | SDHCI_INT_BUF_WR_READY
                | SDHCI_INT_XFER_COMPLETE
                | SDHCI_INT_DMA
                | SDHCI_INT_BLOCK_GAP);
        }
    }

    fn respond(&mut self, raw: [u32; 4], busy: bool) {
        for (i, word) in raw.iter().enumerate() {
            self.store(SDHCI_RESPONSE + 4 * i as u32, 4, *word);
        }
        self.normal |= SDHCI_INT_CMD_COMPLETE;
        if busy {
            self.normal |= SDHCI_INT_XFER_COMPLETE;
        }
    }

    fn new_xfer(&self, payload: Payload) -> Xfer {
        let mode = self.load(SDHCI_TRANSFER_MODE, 2) as u16;
        let blk_cnt = self.load(SDHCI_BLOCK_COUNT, 2);

        let total = if mode & SDHCI_TRNS_BLK_CNT_EN != 0 {
            Some(blk_cnt)
        } else if mode & SDHCI_TRNS_MULTI != 0 {
            None
        } else {
            Some(1)
        };
        let engine = if mode & SDHCI_TRNS_DMA == 0 {
            Engine::Pio
        } else if self.load(SDHCI_HOST_CONTROL, 1) as u8 & SDHCI_CTRL_DMA_MASK == SDHCI_CTRL_ADMA2 {
            Engine::Adma
        } else {
            Engine::Sdma
        };

        Xfer {
            read: mode & SDHCI_TRNS_READ != 0,
            payload,
            blk_size: (self.load(SDHCI_BLOCK_SIZE, 2) as u16 & SDHCI_BLOCK_SIZE_MASK) as usize,
            total,
            block: 0,
            offset: 0,
            buf: Vec::new(),
            engine,
            auto_stop: mode & SDHCI_TRNS_MULTI == 0
                || mode & (SDHCI_TRNS_AUTO_CMD12 | SDHCI_TRNS_AUTO_CMD23) != 0,
            auto_cmd: mode & SDHCI_TRNS_MULTI != 0
                && mode & (SDHCI_TRNS_AUTO_CMD12 | SDHCI_TRNS_AUTO_CMD23) != 0,
            dma_addr: self.load(SDHCI_DMA_ADDRESS, 4),
        }
    }

    fn command(&mut self, value: u16) {
        let opcode = ((value >> SDHCI_CMD_INDEX_SHIFT) & 0x3F) as u8;
        let arg = self.load(SDHCI_ARGUMENT, 4);
        let busy = value & 0x3 == 0x3;
        self.commands.push((opcode, arg));

        if opcode == MMC_STOP_TRANSMISSION {
            self.xfer = None;
            self.pending = None;
            self.sdma_paused = false;
            self.normal &= !(SDHCI_INT_BUF_RD_READY | SDHCI_INT_BUF_WR_READY);
        }

        if opcode == MMC_SEND_TUNING_BLOCK {
            self.tuning_block();
            return;
        }

        let Some(card) = self.card.as_mut() else {
            self.err |= SDHCI_INT_ERR_CMD_TIMEOUT;
            return;
        };

        match card.execute(opcode, arg, &self.faults) {
            Reply::None => self.respond([0; 4], busy),
            Reply::Short(r) => self.respond([r, 0, 0, 0], busy),
            Reply::Long(raw) => self.respond(raw, busy),
            Reply::Data(r, payload) => {
                self.respond([r, 0, 0, 0], busy);
                self.pending = Some(self.new_xfer(payload));
            }
            Reply::Timeout => self.err |= SDHCI_INT_ERR_CMD_TIMEOUT,
        }
    }

    fn tuning_block(&mut self) {
        self.normal |= SDHCI_INT_CMD_COMPLETE;
        self.tuning_count += 1;

        let ctl2 = self.load(SDHCI_HOST_CONTROL2, 2) as u16;
        if ctl2 & SDHCI_CTRL_EXEC_TUNING != 0 && self.tuning_count >= self.faults.tuning_rounds.max(1) {
            let mut ctl2 = ctl2 & !SDHCI_CTRL_EXEC_TUNING;
            if self.faults.tuned {
                ctl2 |= SDHCI_CTRL_TUNED_CLK;
            }
            self.store(SDHCI_HOST_CONTROL2, 2, ctl2 as u32);
        }

        let pattern = (0..TUNING_BLOCK_LEN as usize).map(|i| i as u8).collect();
        let xfer = self.new_xfer(Payload::Register(pattern));
        self.start(xfer);
    }

    fn start(&mut self, xfer: Xfer) {
        if xfer.read && matches!(xfer.payload, Payload::Blocks(_)) && self.faults.read_crc > 0 {
            self.faults.read_crc -= 1;
            self.err |= SDHCI_INT_ERR_DATA_CRC;
            return;
        }

        let engine = xfer.engine;
        let read = xfer.read;
        self.xfer = Some(xfer);

        match engine {
            Engine::Pio => {
                self.normal |= if read {
                    SDHCI_INT_BUF_RD_READY
                } else {
                    SDHCI_INT_BUF_WR_READY
                };
            }
            Engine::Sdma => self.run_sdma(),
            Engine::Adma => self.run_adma(),
        }
    }

    fn finish(&mut self) {
        let Some(xfer) = self.xfer.take() else {
            return;
        };
        self.normal |= SDHCI_INT_XFER_COMPLETE;

        if xfer.auto_cmd {
            if let Some(status) = self.faults.auto_cmd_error.take() {
                // The data moved but the stop failed, the card keeps streaming.
                self.store(SDHCI_AUTO_CMD_STATUS, 2, status as u32);
                self.err |= SDHCI_INT_ERR_AUTO_CMD;
                return;
            }
        }

        if xfer.auto_stop {
            if let Some(card) = self.card.as_mut() {
                if matches!(card.state, DATA | RCV) {
                    card.state = TRAN;
                }
            }
        }
    }

    fn block_done(&mut self) {
        let Some(xfer) = self.xfer.as_ref() else {
            return;
        };
        if xfer.done() {
            self.finish();
        } else if xfer.read {
            self.normal |= SDHCI_INT_BUF_RD_READY;
        } else {
            self.normal |= SDHCI_INT_BUF_WR_READY;
        }
    }

    fn fifo_read(&mut self, width: usize) -> u32 {
        let mut value = 0u32;
        let mut boundary = false;

        if let (Some(xfer), Some(card)) = (self.xfer.as_mut(), self.card.as_ref()) {
            if xfer.engine == Engine::Pio && xfer.read {
                for i in 0..width {
                    if xfer.done() {
                        break;
                    }
                    let (byte, end) = xfer.pull(card);
                    value |= (byte as u32) << (8 * i);
                    boundary |= end;
                }
            }
        }

        if boundary {
            self.block_done();
        }
        value
    }

    fn fifo_write(&mut self, value: u32, width: usize) {
        let mut boundary = false;

        if let (Some(xfer), Some(card)) = (self.xfer.as_mut(), self.card.as_mut()) {
            if xfer.engine == Engine::Pio && !xfer.read {
                for i in 0..width {
                    if xfer.done() {
                        break;
                    }
                    boundary |= xfer.push(card, (value >> (8 * i)) as u8);
                }
            }
        }

        if boundary {
            self.block_done();
        }
    }

    fn stop_at_block_gap(&mut self) {
        let writing = self.xfer.as_ref().is_some_and(|x| !x.read && x.offset == 0);
        if writing {
            self.xfer = None;
            self.sdma_paused = false;
            self.block_gap_stops += 1;
            self.normal &= !SDHCI_INT_BUF_WR_READY;
            self.normal |= SDHCI_INT_BLOCK_GAP | SDHCI_INT_XFER_COMPLETE;
        }
    }

    fn run_sdma(&mut self) {
        let bound = 0x1000u32 << ((self.load(SDHCI_BLOCK_SIZE, 2) >> SDHCI_SDMA_BOUNDARY_SHIFT) & 0x7);
        let (Some(card), Some(xfer)) = (self.card.as_mut(), self.xfer.as_mut()) else {
            return;
        };

        let mut paused = false;
        while !xfer.done() {
            let Some(ptr) = resolve(&self.maps, xfer.dma_addr) else {
                // Ran off the end of an open-ended transfer's buffer.
                paused = true;
                break;
            };
            if xfer.read {
                let (byte, _) = xfer.pull(card);
                unsafe { ptr.write(byte) };
            } else {
                let byte = unsafe { ptr.read() };
                xfer.push(card, byte);
            }
            xfer.dma_addr += 1;

            if !xfer.done() && xfer.dma_addr % bound == 0 {
                paused = true;
                break;
            }
        }

        let addr = xfer.dma_addr;
        self.store(SDHCI_DMA_ADDRESS, 4, addr);
        if paused {
            self.sdma_paused = true;
            self.normal |= SDHCI_INT_DMA;
        } else {
            self.finish();
        }
    }

    fn run_adma(&mut self) {
        let mut desc = self.load(SDHCI_ADMA_ADDRESS, 4);
        let (Some(card), Some(xfer)) = (self.card.as_mut(), self.xfer.as_mut()) else {
            return;
        };

        let mut interrupt = false;
        let mut error = false;

        'walk: for _ in 0..256 {
            let Some(ptr) = resolve(&self.maps, desc) else {
                error = true;
                break;
            };
            let line = Adma2Line(unsafe { (ptr as *const u64).read_unaligned() });
            if !line.is_valid() {
                error = true;
                break;
            }

            if line.is_link() {
                desc = line.addr();
                continue;
            }

            if line.is_transfer() {
                for i in 0..line.len() {
                    let Some(data) = resolve(&self.maps, line.addr().wrapping_add(i)) else {
                        error = true;
                        break 'walk;
                    };
                    if xfer.read {
                        let (byte, _) = xfer.pull(card);
                        unsafe { data.write(byte) };
                    } else {
                        let byte = unsafe { data.read() };
                        xfer.push(card, byte);
                    }
                }
            }

            if line.attr() & ADMA2_INT != 0 {
                interrupt = true;
            }
            if line.is_end() {
                break;
            }
            desc += 8;
        }

        if error {
            self.err |= SDHCI_INT_ERR_ADMA;
            return;
        }
        if interrupt {
            self.normal |= SDHCI_INT_DMA;
        }
        self.finish();
    }

    fn map(&mut self, host: usize, len: usize) -> u32 {
        let mut slot = BUS_BASE;
        while self.maps.iter().any(|m| m.bus & !(BUS_STRIDE - 1) == slot) {
            slot += BUS_STRIDE;
        }
        let bus = slot + self.bus_offset;
        self.maps.push(Mapping { bus, host, len });
        bus
    }

    fn unmap(&mut self, bus: u32) {
        self.maps.retain(|m| m.bus != bus);
    }

    /// Pulls the card out and raises the removal interrupt.
    pub fn remove_card(&mut self) -> Option<Card> {
        self.normal |= SDHCI_INT_CARD_REMOVE;
        self.card.take()
    }

    pub fn host_ctl1(&self) -> u8 {
        self.load(SDHCI_HOST_CONTROL, 1) as u8
    }

    pub fn host_ctl2(&self) -> u16 {
        self.load(SDHCI_HOST_CONTROL2, 2) as u16
    }

    pub fn live_mappings(&self) -> usize {
        self.maps.len()
    }
}

pub struct SimIo(Rc<RefCell<SimState>>);

impl RegisterIo for SimIo {
    fn read32(&self, offset: u32) -> u32 {
        self.0.borrow_mut().read(offset, 4)
    }

    fn read16(&self, offset: u32) -> u16 {
        self.0.borrow_mut().read(offset, 2) as u16
    }

    fn read8(&self, offset: u32) -> u8 {
        self.0.borrow_mut().read(offset, 1) as u8
    }

    fn write32(&self, offset: u32, value: u32) {
        self.0.borrow_mut().write(offset, 4, value)
    }

    fn write16(&self, offset: u32, value: u16) {
        self.0.borrow_mut().write(offset, 2, value as u32)
    }

    fn write8(&self, offset: u32, value: u8) {
        self.0.borrow_mut().write(offset, 1, value as u32)
    }
}

/// Fake clock plus the bus address map of the simulated controller.
pub struct SimPlatform {
    state: Rc<RefCell<SimState>>,
    now: Cell<u64>,
}

impl Platform for SimPlatform {
    fn now_us(&self) -> u64 {
        let now = self.now.get() + 10;
        self.now.set(now);
        now
    }

    fn delay_us(&self, us: u64) {
        self.state.borrow_mut().delays.push(us);
        self.now.set(self.now.get() + us);
    }

    fn dma_map(&self, addr: usize, len: usize, _dir: Direction) -> u32 {
        self.state.borrow_mut().map(addr, len)
    }

    fn dma_unmap(&self, bus_addr: u32, _len: usize, _dir: Direction) {
        self.state.borrow_mut().unmap(bus_addr)
    }
}

/// Test-side handle on the simulated controller.
#[derive(Clone)]
pub struct Sim(Rc<RefCell<SimState>>);

impl Sim {
    pub fn state(&self) -> RefMut<'_, SimState> {
        self.0.borrow_mut()
    }

    pub fn faults(&self) -> RefMut<'_, Faults> {
        RefMut::map(self.0.borrow_mut(), |s| &mut s.faults)
    }

    pub fn card(&self) -> RefMut<'_, Card> {
        RefMut::map(self.0.borrow_mut(), |s| {
            s.card.as_mut().expect("no card in the slot")
        })
    }

    pub fn take_commands(&self) -> Vec<(u8, u32)> {
        std::mem::take(&mut self.0.borrow_mut().commands)
    }

    pub fn take_resets(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().resets)
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.0.borrow().commands.iter().map(|c| c.0).collect()
    }
}

pub type SimHost = SdHost<SimIo, SimPlatform>;

pub fn host_with(card: Option<Card>, config: HostConfig) -> (SimHost, Sim) {
    let state = Rc::new(RefCell::new(SimState::new(card)));
    let platform = SimPlatform {
        state: state.clone(),
        now: Cell::new(0),
    };
    let host = SdHost::new(SimIo(state.clone()), platform, config);
    (host, Sim(state))
}

/// Host brought up with [`SdHost::init`] over the given card.
pub fn ready_host(card: Card, config: HostConfig) -> (SimHost, Sim) {
    let (mut host, sim) = host_with(Some(card), config);
    host.init().expect("card bring-up");
    sim.take_commands();
    sim.take_resets();
    (host, sim)
}
