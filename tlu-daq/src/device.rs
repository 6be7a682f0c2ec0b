//! Device model of the TLU: a declarative register map over the transport,
//! typed facades for the hardware blocks and the I2C-attached front panel
//! state (LEDs, trigger/reset enables, input selection).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::transport::{Transport, TransportError, STREAM_BASE};

/// Firmware version this host build talks to.
pub const REQUIRED_FW_VERSION: u8 = 4;

/// The gateware drains the stream FIFO in 512 byte bursts.
pub const FIFO_BURST: u64 = 512;

const REGISTER_DESCRIPTION: &str = include_str!("registers.json");

const I2C_ADDR_LED: u8 = 0x40;
const I2C_ADDR_TRIGGER_EN: u8 = 0x42;
const I2C_ADDR_RESET_EN: u8 = 0x44;
const I2C_ADDR_IPSEL: u8 = 0x46;

const I2C_MUX_LEMO: u8 = 1;
const I2C_MUX_MB: u8 = 3;

const PCA9555_DIR: u8 = 6;
const PCA9555_OUT: u8 = 2;

/// Byte offset of the I2C data window inside the i2c block.
const I2C_DATA_WINDOW: u64 = 16;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("TLU firmware version does not satisfy version requirements (read: {read}, require: {required})")]
    VersionMismatch { read: u8, required: u8 },
    #[error("unknown register {block}.{name}")]
    UnknownRegister { block: String, name: String },
    #[error("register {block}.{name} does not allow this access")]
    Access { block: String, name: String, write: bool },
    #[error("I2C transaction did not complete")]
    I2cTimeout,
    #[error("stream read of {0} bytes is not record aligned")]
    Layout(usize),
    #[error("bad register description: {0}")]
    Description(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Ro,
    Wo,
    Rw,
}

fn default_access() -> Access {
    Access::Rw
}

#[derive(Debug, Clone, Deserialize)]
pub struct Register {
    pub addr: u64,
    /// Field width in bits.
    pub size: u32,
    /// Bit offset inside the first byte.
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_access")]
    pub access: Access,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockDescription {
    pub base: u64,
    pub registers: BTreeMap<String, Register>,
}

/// Hardware description parsed once; every register access resolves through
/// this table.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterMap {
    pub blocks: BTreeMap<String, BlockDescription>,
}

impl RegisterMap {
    pub fn embedded() -> Result<Self, DeviceError> {
        Ok(serde_json::from_str(REGISTER_DESCRIPTION)?)
    }

    pub fn lookup(&self, block: &str, name: &str) -> Result<(&BlockDescription, &Register), DeviceError> {
        let blk = self.blocks.get(block).ok_or_else(|| DeviceError::UnknownRegister {
            block: block.into(),
            name: name.into(),
        })?;
        let reg = blk.registers.get(name).ok_or_else(|| DeviceError::UnknownRegister {
            block: block.into(),
            name: name.into(),
        })?;
        Ok((blk, reg))
    }

    /// Absolute byte address of a register, for consumers that mirror the
    /// address space (the simulator does).
    pub fn address_of(&self, block: &str, name: &str) -> Result<u64, DeviceError> {
        let (blk, reg) = self.lookup(block, name)?;
        Ok(blk.base + reg.addr)
    }
}

/// One 16 byte trigger record as emitted by the gateware, little-endian.
/// Records with a zero timestamp are drained padding.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TriggerRecord {
    pub le0: u8,
    pub le1: u8,
    pub le2: u8,
    pub le3: u8,
    time_stamp: U64,
    trigger_id: U32,
}

impl TriggerRecord {
    pub const SIZE: usize = 16;

    pub fn new(le: [u8; 4], time_stamp: u64, trigger_id: u32) -> Self {
        TriggerRecord {
            le0: le[0],
            le1: le[1],
            le2: le[2],
            le3: le[3],
            time_stamp: U64::new(time_stamp),
            trigger_id: U32::new(trigger_id),
        }
    }

    pub fn time_stamp(&self) -> u64 {
        self.time_stamp.get()
    }

    pub fn trigger_id(&self) -> u32 {
        self.trigger_id.get()
    }
}

impl std::fmt::Debug for TriggerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRecord")
            .field("le", &[self.le0, self.le1, self.le2, self.le3])
            .field("time_stamp", &self.time_stamp())
            .field("trigger_id", &self.trigger_id())
            .finish()
    }
}

/// Input selection per DUT channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSel {
    Rj45,
    Lemo,
}

impl IpSel {
    fn bits(self) -> u16 {
        match self {
            IpSel::Rj45 => 0b11,
            IpSel::Lemo => 0b10,
        }
    }
}

/// Software-held words for the PCA9555 expanders on the front panel. They
/// only reach the hardware on `write_i2c_config`.
#[derive(Debug, Clone, Copy, Default)]
struct ExpanderState {
    led_cnt: u16,
    lemo_leds: u16,
    trigger_en: u16,
    reset_en: u16,
    ip_sel: u16,
}

pub struct Tlu {
    transport: Arc<dyn Transport>,
    map: RegisterMap,
    expanders: Mutex<ExpanderState>,
}

impl Tlu {
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, DeviceError> {
        Ok(Tlu { transport, map: RegisterMap::embedded()?, expanders: Mutex::new(ExpanderState::default()) })
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Version gate, stream-engine warm-up and initial front panel state.
    pub fn init(&self) -> Result<(), DeviceError> {
        let fw_version = self.block("sitlu").get("VERSION")? as u8;
        log::info!("TLU firmware version: {}", fw_version);
        if fw_version != REQUIRED_FW_VERSION {
            return Err(DeviceError::VersionMismatch { read: fw_version, required: REQUIRED_FW_VERSION });
        }

        // The very first stream transfer after power-up drops leading bytes;
        // throw one away.
        self.stream_fifo().set_count(8 * FIFO_BURST as u32)?;
        let _ = self.transport.read(STREAM_BASE, 8 * FIFO_BURST as usize)?;

        self.write_i2c_config()
    }

    pub fn block(&self, name: &'static str) -> Block<'_> {
        Block { tlu: self, name }
    }

    pub fn master(&self) -> TluMaster<'_> {
        TluMaster(self.block("tlu_master"))
    }

    pub fn stream_fifo(&self) -> StreamFifo<'_> {
        StreamFifo(self.block("stream_fifo"))
    }

    pub fn pulser(&self) -> TestPulser<'_> {
        TestPulser(self.block("test_pulser"))
    }

    fn read_register(&self, block: &str, name: &str) -> Result<u64, DeviceError> {
        let (blk, reg) = self.map.lookup(block, name)?;
        if reg.access == Access::Wo {
            return Err(DeviceError::Access { block: block.into(), name: name.into(), write: false });
        }
        let nbytes = ((reg.offset + reg.size + 7) / 8) as usize;
        let raw = self.transport.read(blk.base + reg.addr, nbytes)?;
        let mut value: u64 = 0;
        for (i, b) in raw.iter().enumerate() {
            value |= (*b as u64) << (8 * i);
        }
        Ok((value >> reg.offset) & mask(reg.size))
    }

    fn write_register(&self, block: &str, name: &str, value: u64) -> Result<(), DeviceError> {
        let (blk, reg) = self.map.lookup(block, name)?;
        if reg.access == Access::Ro {
            return Err(DeviceError::Access { block: block.into(), name: name.into(), write: true });
        }
        let value = value & mask(reg.size);
        let addr = blk.base + reg.addr;
        let nbytes = ((reg.offset + reg.size + 7) / 8) as usize;

        let mut word: u64 = 0;
        if reg.offset != 0 || reg.size % 8 != 0 {
            // partial bytes keep their neighbours via read-modify-write
            if reg.access == Access::Rw {
                let raw = self.transport.read(addr, nbytes)?;
                for (i, b) in raw.iter().enumerate() {
                    word |= (*b as u64) << (8 * i);
                }
            }
            word &= !(mask(reg.size) << reg.offset);
        }
        word |= value << reg.offset;

        let mut bytes = Vec::with_capacity(nbytes);
        for i in 0..nbytes {
            bytes.push(((word >> (8 * i)) & 0xff) as u8);
        }
        self.transport.write(addr, &bytes)?;
        Ok(())
    }

    /// Burst-rounded drain of the stream FIFO. Padding records (zero
    /// timestamp) are dropped before the data leaves this layer.
    pub fn get_fifo_data(&self) -> Result<Vec<TriggerRecord>, DeviceError> {
        let size = self.stream_fifo().size()? as u64;
        if size < TriggerRecord::SIZE as u64 {
            return Ok(Vec::new());
        }
        let how_much = (size / FIFO_BURST + 1) * FIFO_BURST;
        self.stream_fifo().set_count(how_much as u32)?;
        let raw = self.transport.read(STREAM_BASE, how_much as usize)?;
        let records =
            <[TriggerRecord]>::ref_from_bytes(&raw).map_err(|_| DeviceError::Layout(raw.len()))?;
        Ok(records.iter().filter(|r| r.time_stamp() > 0).copied().collect())
    }

    fn select_i2c_mux(&self, channel: u8) -> Result<(), DeviceError> {
        self.write_register("i2c_mux", "SEL", channel as u64)
    }

    /// Byte write on the I2C bus behind the currently selected mux channel.
    pub fn i2c_write(&self, addr: u8, data: &[u8]) -> Result<(), DeviceError> {
        let i2c = self.block("i2c");
        let base = self.map.address_of("i2c", "RESET")?;
        i2c.set("ADDR", addr as u64)?;
        i2c.set("SIZE", data.len() as u64)?;
        self.transport.write(base + I2C_DATA_WINDOW, data)?;
        i2c.pulse("START")?;
        for _ in 0..100 {
            if self.read_register("i2c", "READY")? != 0 {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(DeviceError::I2cTimeout)
    }

    /// Push all five expander words out. Mux is switched per target; every
    /// PCA9555 first has all pins configured as outputs. The RJ45 LED bank
    /// is active-low on both bytes, the LEMO bank on the low byte only.
    pub fn write_i2c_config(&self) -> Result<(), DeviceError> {
        let state = *self.expanders.lock().unwrap();

        self.select_i2c_mux(I2C_MUX_MB)?;
        self.write_expander(I2C_ADDR_LED, state.led_cnt, [true, true])?;

        self.select_i2c_mux(I2C_MUX_LEMO)?;
        self.write_expander(I2C_ADDR_LED, state.lemo_leds, [true, false])?;

        self.select_i2c_mux(I2C_MUX_MB)?;
        self.write_expander(I2C_ADDR_TRIGGER_EN, state.trigger_en, [false, false])?;
        self.write_expander(I2C_ADDR_RESET_EN, state.reset_en, [false, false])?;
        self.write_expander(I2C_ADDR_IPSEL, state.ip_sel, [false, false])?;
        Ok(())
    }

    fn write_expander(&self, addr: u8, word: u16, invert: [bool; 2]) -> Result<(), DeviceError> {
        self.i2c_write(addr, &[PCA9555_DIR, 0x00, 0x00])?;
        let [lo, hi] = word.to_le_bytes();
        let lo = if invert[0] { !lo } else { lo };
        let hi = if invert[1] { !hi } else { hi };
        self.i2c_write(addr, &[PCA9555_OUT, lo, hi])
    }

    /// RJ45 activity LED, two bits per DUT channel.
    pub fn set_led_cnt(&self, channel: u8, value: u8) {
        let mut state = self.expanders.lock().unwrap();
        let shift = 2 * channel as u16;
        state.led_cnt = (state.led_cnt & !(0b11 << shift)) | (((value & 0b11) as u16) << shift);
    }

    /// BUSY/TRIG/RST indicators of one LEMO channel.
    pub fn set_lemo_leds(&self, channel: u8, on: bool) {
        let mut state = self.expanders.lock().unwrap();
        for base in [0u16, 4, 8] {
            let bit = 1 << (base + channel as u16);
            if on {
                state.lemo_leds |= bit;
            } else {
                state.lemo_leds &= !bit;
            }
        }
    }

    pub fn set_ip_sel(&self, channel: u8, sel: IpSel) {
        let mut state = self.expanders.lock().unwrap();
        let shift = 2 * channel as u16;
        state.ip_sel = (state.ip_sel & !(0b11 << shift)) | (sel.bits() << shift);
    }

    pub fn set_trigger_en(&self, mask: u16) {
        self.expanders.lock().unwrap().trigger_en = mask;
    }

    pub fn set_reset_en(&self, mask: u16) {
        self.expanders.lock().unwrap().reset_en = mask;
    }

    /// Snapshot of every readable tlu_master register, for the data file's
    /// `config` attribute.
    pub fn register_snapshot(&self) -> Result<serde_json::Value, DeviceError> {
        let mut snapshot = serde_json::Map::new();
        let (master, _) = self.map.lookup("tlu_master", "VERSION")?;
        let names: Vec<String> = master
            .registers
            .iter()
            .filter(|(_, reg)| reg.access != Access::Wo)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let value = self.read_register("tlu_master", &name)?;
            snapshot.insert(name, serde_json::Value::from(value));
        }
        Ok(serde_json::Value::Object(snapshot))
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Untyped view of one hardware block; resolves names through the map.
pub struct Block<'a> {
    tlu: &'a Tlu,
    name: &'static str,
}

impl Block<'_> {
    pub fn get(&self, register: &str) -> Result<u64, DeviceError> {
        self.tlu.read_register(self.name, register)
    }

    pub fn set(&self, register: &str, value: u64) -> Result<(), DeviceError> {
        self.tlu.write_register(self.name, register, value)
    }

    /// Strobe a write-only register.
    pub fn pulse(&self, register: &str) -> Result<(), DeviceError> {
        self.tlu.write_register(self.name, register, 0)
    }
}

pub struct TluMaster<'a>(Block<'a>);

impl TluMaster<'_> {
    pub fn reset(&self) -> Result<(), DeviceError> {
        self.0.pulse("RESET")
    }

    pub fn start(&self) -> Result<(), DeviceError> {
        self.0.pulse("START")
    }

    pub fn ready(&self) -> Result<bool, DeviceError> {
        Ok(self.0.get("READY")? != 0)
    }

    pub fn set_en_input(&self, mask: u8) -> Result<(), DeviceError> {
        self.0.set("EN_INPUT", mask as u64)
    }

    pub fn en_input(&self) -> Result<u8, DeviceError> {
        Ok(self.0.get("EN_INPUT")? as u8)
    }

    pub fn set_invert_input(&self, mask: u8) -> Result<(), DeviceError> {
        self.0.set("INVERT_INPUT", mask as u64)
    }

    pub fn set_max_distance(&self, value: u8) -> Result<(), DeviceError> {
        self.0.set("MAX_DISTANCE", value as u64)
    }

    pub fn set_threshold(&self, value: u8) -> Result<(), DeviceError> {
        self.0.set("THRESHOLD", value as u64)
    }

    pub fn set_en_output(&self, mask: u8) -> Result<(), DeviceError> {
        self.0.set("EN_OUTPUT", mask as u64)
    }

    pub fn set_timeout(&self, value: u16) -> Result<(), DeviceError> {
        self.0.set("TIMEOUT", value as u64)
    }

    pub fn set_n_bits_trigger_id(&self, value: u8) -> Result<(), DeviceError> {
        self.0.set("N_BITS_TRIGGER_ID", value as u64)
    }

    pub fn time_stamp(&self) -> Result<u64, DeviceError> {
        self.0.get("TIME_STAMP")
    }

    pub fn trigger_id(&self) -> Result<u32, DeviceError> {
        Ok(self.0.get("TRIGGER_ID")? as u32)
    }

    pub fn skip_trig_counter(&self) -> Result<u32, DeviceError> {
        Ok(self.0.get("SKIP_TRIG_COUNTER")? as u32)
    }

    pub fn timeout_counter(&self) -> Result<u8, DeviceError> {
        Ok(self.0.get("TIMEOUT_COUNTER")? as u8)
    }

    pub fn lost_data_cnt(&self) -> Result<u8, DeviceError> {
        Ok(self.0.get("LOST_DATA_CNT")? as u8)
    }

    pub fn tx_state(&self) -> Result<u32, DeviceError> {
        Ok(self.0.get("TX_STATE")? as u32)
    }
}

pub struct StreamFifo<'a>(Block<'a>);

impl StreamFifo<'_> {
    pub fn reset(&self) -> Result<(), DeviceError> {
        self.0.pulse("RESET")
    }

    pub fn version(&self) -> Result<u8, DeviceError> {
        Ok(self.0.get("VERSION")? as u8)
    }

    /// How many bytes the next stream read will deliver.
    pub fn set_count(&self, count: u32) -> Result<(), DeviceError> {
        self.0.set("SET_COUNT", count as u64)
    }

    /// Current fill in bytes.
    pub fn size(&self) -> Result<u32, DeviceError> {
        Ok(self.0.get("SIZE")? as u32)
    }
}

pub struct TestPulser<'a>(Block<'a>);

impl TestPulser<'_> {
    pub fn reset(&self) -> Result<(), DeviceError> {
        self.0.pulse("RESET")
    }

    pub fn start(&self) -> Result<(), DeviceError> {
        self.0.pulse("START")
    }

    pub fn is_ready(&self) -> Result<bool, DeviceError> {
        Ok(self.0.get("READY")? != 0)
    }

    /// Pulse period offset in 25 ns units.
    pub fn set_delay(&self, value: u16) -> Result<(), DeviceError> {
        self.0.set("DELAY", value as u64)
    }

    pub fn set_width(&self, value: u16) -> Result<(), DeviceError> {
        self.0.set("WIDTH", value as u64)
    }

    /// Number of pulses, zero for free running.
    pub fn set_repeat(&self, value: u16) -> Result<(), DeviceError> {
        self.0.set("REPEAT", value as u64)
    }
}
