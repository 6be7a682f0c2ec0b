//! Simulated TLU behind the `Transport` trait. Stands in for the board in
//! the test suite and in developer runs without hardware: a register file
//! plus a scripted stream FIFO that behaves like the gateware (512 byte
//! bursts, zero padding, internal pulser, I2C engine).

use std::collections::VecDeque;
use std::sync::Mutex;

use zerocopy::IntoBytes;

use crate::device::{RegisterMap, TriggerRecord, FIFO_BURST, REQUIRED_FW_VERSION};
use crate::transport::{Transport, TransportError, REG_LIMIT, STREAM_BASE};

struct SpecialAddrs {
    stream_reset: u64,
    stream_size: u64,
    master_reset: u64,
    master_start: u64,
    master_en_output: u64,
    master_timeout: u64,
    master_time_stamp: u64,
    master_trigger_id: u64,
    master_skip: u64,
    master_timeout_counter: u64,
    master_lost: u64,
    master_tx_state: u64,
    pulser_reset: u64,
    pulser_start: u64,
    pulser_delay: u64,
    pulser_width: u64,
    pulser_repeat: u64,
    i2c_start: u64,
    i2c_addr: u64,
    i2c_size: u64,
    i2c_data: u64,
}

struct SimState {
    regs: Vec<u8>,
    stream: VecDeque<u8>,
    trigger_counter: u32,
    time_stamp: u64,
    skip_counter: u32,
    timeout_counter: u8,
    lost_counter: u8,
    tx_state: u32,
    dut_responds: bool,
    fail_next_read: Option<String>,
    i2c_log: Vec<(u8, Vec<u8>)>,
}

pub struct SimTransport {
    addrs: SpecialAddrs,
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new() -> Self {
        let map = RegisterMap::embedded().expect("embedded register map is well formed");
        let a = |block, name| map.address_of(block, name).expect("embedded register map is complete");
        let addrs = SpecialAddrs {
            stream_reset: a("stream_fifo", "RESET"),
            stream_size: a("stream_fifo", "SIZE"),
            master_reset: a("tlu_master", "RESET"),
            master_start: a("tlu_master", "START"),
            master_en_output: a("tlu_master", "EN_OUTPUT"),
            master_timeout: a("tlu_master", "TIMEOUT"),
            master_time_stamp: a("tlu_master", "TIME_STAMP"),
            master_trigger_id: a("tlu_master", "TRIGGER_ID"),
            master_skip: a("tlu_master", "SKIP_TRIG_COUNTER"),
            master_timeout_counter: a("tlu_master", "TIMEOUT_COUNTER"),
            master_lost: a("tlu_master", "LOST_DATA_CNT"),
            master_tx_state: a("tlu_master", "TX_STATE"),
            pulser_reset: a("test_pulser", "RESET"),
            pulser_start: a("test_pulser", "START"),
            pulser_delay: a("test_pulser", "DELAY"),
            pulser_width: a("test_pulser", "WIDTH"),
            pulser_repeat: a("test_pulser", "REPEAT"),
            i2c_start: a("i2c", "START"),
            i2c_addr: a("i2c", "ADDR"),
            i2c_size: a("i2c", "SIZE"),
            i2c_data: a("i2c", "RESET") + 16,
        };

        let mut regs = vec![0u8; REG_LIMIT as usize];
        regs[a("sitlu", "VERSION") as usize] = REQUIRED_FW_VERSION;
        regs[a("tlu_master", "VERSION") as usize] = 1;
        regs[a("stream_fifo", "VERSION") as usize] = 2;
        regs[a("test_pulser", "VERSION") as usize] = 1;
        regs[addrs.master_start as usize] = 1; // READY
        regs[addrs.pulser_start as usize] = 1;
        regs[addrs.i2c_start as usize] = 1;

        let state = SimState {
            regs,
            stream: VecDeque::new(),
            trigger_counter: 0,
            time_stamp: 0,
            skip_counter: 0,
            timeout_counter: 0,
            lost_counter: 0,
            tx_state: 0,
            dut_responds: true,
            fail_next_read: None,
            i2c_log: Vec::new(),
        };
        SimTransport { addrs, state: Mutex::new(state) }
    }

    /// Append scripted records to the stream FIFO.
    pub fn push_records(&self, records: &[TriggerRecord]) {
        let mut state = self.state.lock().unwrap();
        state.stream.extend(records.as_bytes().iter().copied());
        self.sync_derived(&mut state);
    }

    /// Append raw bytes, for scripting malformed or padding content.
    pub fn push_raw(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.stream.extend(bytes.iter().copied());
        self.sync_derived(&mut state);
    }

    pub fn set_skip_counter(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.skip_counter = value;
        self.sync_derived(&mut state);
    }

    pub fn set_lost_count(&self, value: u8) {
        let mut state = self.state.lock().unwrap();
        state.lost_counter = value;
        self.sync_derived(&mut state);
    }

    pub fn set_tx_state(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.tx_state = value;
        self.sync_derived(&mut state);
    }

    /// Whether a DUT answers the BUSY handshake; when false every generated
    /// trigger runs into the timeout.
    pub fn set_dut_responds(&self, responds: bool) {
        self.state.lock().unwrap().dut_responds = responds;
    }

    pub fn set_firmware_version(&self, version: u8) {
        let map = RegisterMap::embedded().expect("embedded register map is well formed");
        let addr = map.address_of("sitlu", "VERSION").expect("sitlu block present") as usize;
        self.state.lock().unwrap().regs[addr] = version;
    }

    /// The next `read` fails with a simulated transport fault.
    pub fn fail_next_read(&self, message: &str) {
        self.state.lock().unwrap().fail_next_read = Some(message.to_string());
    }

    pub fn pending_stream_bytes(&self) -> usize {
        self.state.lock().unwrap().stream.len()
    }

    pub fn trigger_count(&self) -> u32 {
        self.state.lock().unwrap().trigger_counter
    }

    /// I2C transactions seen so far, as (bus address, payload).
    pub fn i2c_transactions(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.lock().unwrap().i2c_log.clone()
    }

    fn read_reg_word(&self, state: &SimState, addr: u64, nbytes: usize) -> u64 {
        let mut value = 0u64;
        for i in 0..nbytes {
            value |= (state.regs[addr as usize + i] as u64) << (8 * i);
        }
        value
    }

    fn write_reg_word(&self, state: &mut SimState, addr: u64, nbytes: usize, value: u64) {
        for i in 0..nbytes {
            state.regs[addr as usize + i] = ((value >> (8 * i)) & 0xff) as u8;
        }
    }

    /// Mirror the derived counters into the register file so plain reads
    /// observe them.
    fn sync_derived(&self, state: &mut SimState) {
        let stream_len = state.stream.len() as u64;
        let (time_stamp, trigger, skip, timeout_cnt, lost, tx) = (
            state.time_stamp,
            state.trigger_counter,
            state.skip_counter,
            state.timeout_counter,
            state.lost_counter,
            state.tx_state,
        );
        self.write_reg_word(state, self.addrs.stream_size, 3, stream_len);
        self.write_reg_word(state, self.addrs.master_time_stamp, 8, time_stamp);
        self.write_reg_word(state, self.addrs.master_trigger_id, 4, trigger as u64);
        self.write_reg_word(state, self.addrs.master_skip, 4, skip as u64);
        self.write_reg_word(state, self.addrs.master_timeout_counter, 1, timeout_cnt as u64);
        self.write_reg_word(state, self.addrs.master_lost, 1, lost as u64);
        self.write_reg_word(state, self.addrs.master_tx_state, 3, tx as u64);
    }

    fn run_pulser(&self, state: &mut SimState) {
        let delay = self.read_reg_word(state, self.addrs.pulser_delay, 2);
        let width = self.read_reg_word(state, self.addrs.pulser_width, 2).max(1);
        let repeat = self.read_reg_word(state, self.addrs.pulser_repeat, 2);
        let period = delay + width;

        for _ in 0..repeat {
            state.time_stamp += period;
            let record = TriggerRecord::new([0; 4], state.time_stamp, state.trigger_counter);
            state.trigger_counter += 1;
            state.stream.extend(record.as_bytes().iter().copied());
        }

        let timeout = self.read_reg_word(state, self.addrs.master_timeout, 2);
        let en_output = self.read_reg_word(state, self.addrs.master_en_output, 1) & 0x3f;
        if timeout != 0 && en_output != 0 && !state.dut_responds {
            state.timeout_counter = state.timeout_counter.saturating_add(repeat.min(255) as u8);
        }

        state.regs[self.addrs.pulser_start as usize] = 1; // READY
        self.sync_derived(state);
    }

    fn run_i2c(&self, state: &mut SimState) {
        let addr = state.regs[self.addrs.i2c_addr as usize];
        let size = state.regs[self.addrs.i2c_size as usize] as usize;
        let data: Vec<u8> = (0..size)
            .map(|i| state.regs[self.addrs.i2c_data as usize + i])
            .collect();
        state.i2c_log.push((addr, data));
        state.regs[self.addrs.i2c_start as usize] = 1; // READY
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        SimTransport::new()
    }
}

impl Transport for SimTransport {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_read.take() {
            return Err(TransportError::Simulated(message));
        }

        if addr >= STREAM_BASE {
            // burst semantics: real bytes first, zero padding up to the
            // requested length
            let take = state.stream.len().min(size);
            let mut out: Vec<u8> = state.stream.drain(..take).collect();
            out.resize(size, 0);
            self.sync_derived(&mut state);
            debug_assert!(size % FIFO_BURST as usize == 0 || size < FIFO_BURST as usize);
            return Ok(out);
        }

        if addr + size as u64 > REG_LIMIT {
            return Err(TransportError::AddressRange(addr));
        }
        Ok((0..size).map(|i| state.regs[addr as usize + i]).collect())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();

        if addr >= STREAM_BASE {
            return Ok(()); // stream writes are sunk
        }
        if addr + data.len() as u64 > REG_LIMIT {
            return Err(TransportError::AddressRange(addr));
        }

        for (i, byte) in data.iter().enumerate() {
            let target = addr + i as u64;
            if target == self.addrs.stream_reset {
                state.stream.clear();
                self.sync_derived(&mut state);
            } else if target == self.addrs.master_reset {
                state.trigger_counter = 0;
                state.time_stamp = 0;
                state.skip_counter = 0;
                state.timeout_counter = 0;
                state.lost_counter = 0;
                state.tx_state = 0;
                self.sync_derived(&mut state);
            } else if target == self.addrs.master_start {
                state.regs[target as usize] = 1; // READY
            } else if target == self.addrs.pulser_reset {
                state.regs[self.addrs.pulser_start as usize] = 1;
            } else if target == self.addrs.pulser_start {
                self.run_pulser(&mut state);
            } else if target == self.addrs.i2c_start {
                self.run_i2c(&mut state);
            } else {
                state.regs[target as usize] = *byte;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::device::Tlu;

    fn sim_tlu() -> (Arc<SimTransport>, Tlu) {
        let sim = Arc::new(SimTransport::new());
        let tlu = Tlu::new(sim.clone()).unwrap();
        (sim, tlu)
    }

    #[test]
    fn rw_registers_round_trip() {
        let (_sim, tlu) = sim_tlu();
        let master = tlu.master();
        master.set_max_distance(10).unwrap();
        master.set_threshold(5).unwrap();
        master.set_timeout(0x1234).unwrap();
        master.set_en_output(0b10_1010).unwrap();
        master.set_n_bits_trigger_id(15).unwrap();
        assert_eq!(tlu.block("tlu_master").get("MAX_DISTANCE").unwrap(), 10);
        assert_eq!(tlu.block("tlu_master").get("THRESHOLD").unwrap(), 5);
        assert_eq!(tlu.block("tlu_master").get("TIMEOUT").unwrap(), 0x1234);
        assert_eq!(tlu.block("tlu_master").get("EN_OUTPUT").unwrap(), 0b10_1010);
        assert_eq!(tlu.block("tlu_master").get("N_BITS_TRIGGER_ID").unwrap(), 15);
    }

    #[test]
    fn shared_byte_fields_do_not_clobber_each_other() {
        let (_sim, tlu) = sim_tlu();
        let master = tlu.master();
        master.set_en_input(0b1010).unwrap();
        master.set_invert_input(0b0110).unwrap();
        assert_eq!(tlu.block("tlu_master").get("EN_INPUT").unwrap(), 0b1010);
        assert_eq!(tlu.block("tlu_master").get("INVERT_INPUT").unwrap(), 0b0110);
    }

    #[test]
    fn write_only_and_read_only_are_enforced() {
        let (_sim, tlu) = sim_tlu();
        assert!(tlu.block("tlu_master").get("RESET").is_err());
        assert!(tlu.block("tlu_master").set("TRIGGER_ID", 1).is_err());
    }

    #[test]
    fn fifo_drain_rounds_to_bursts_and_filters_padding() {
        let (sim, tlu) = sim_tlu();
        let records: Vec<TriggerRecord> =
            (0..10).map(|i| TriggerRecord::new([0; 4], 100 + i, i as u32)).collect();
        sim.push_records(&records);
        assert_eq!(tlu.stream_fifo().size().unwrap(), 160);

        let drained = tlu.get_fifo_data().unwrap();
        assert_eq!(drained.len(), 10);
        for (i, rec) in drained.iter().enumerate() {
            assert_eq!(rec.trigger_id(), i as u32);
            assert!(rec.time_stamp() > 0);
        }
        // the burst rounding read 512 bytes; the 352 padding bytes were
        // dropped by the timestamp filter and the FIFO is now empty
        assert_eq!(tlu.stream_fifo().size().unwrap(), 0);
        assert_eq!(tlu.get_fifo_data().unwrap().len(), 0);
    }

    #[test]
    fn stream_reset_empties_the_fifo() {
        let (sim, tlu) = sim_tlu();
        sim.push_records(&[TriggerRecord::new([0; 4], 1, 0)]);
        assert_ne!(tlu.stream_fifo().size().unwrap(), 0);
        tlu.stream_fifo().reset().unwrap();
        assert_eq!(tlu.stream_fifo().size().unwrap(), 0);
        // VERSION shares the RESET address and must survive the strobe
        assert_eq!(tlu.stream_fifo().version().unwrap(), 2);
    }

    #[test]
    fn pulser_generates_consecutive_ids_and_spaced_timestamps() {
        let (_sim, tlu) = sim_tlu();
        let pulser = tlu.pulser();
        pulser.set_delay(19).unwrap();
        pulser.set_width(1).unwrap();
        pulser.set_repeat(300).unwrap();
        pulser.start().unwrap();
        assert!(pulser.is_ready().unwrap());

        let mut all = Vec::new();
        loop {
            let chunk = tlu.get_fifo_data().unwrap();
            if chunk.is_empty() {
                break;
            }
            all.extend(chunk);
        }
        assert_eq!(all.len(), 300);
        for (i, rec) in all.iter().enumerate() {
            assert_eq!(rec.trigger_id(), i as u32);
            assert_eq!(rec.time_stamp(), 20 * (i as u64 + 1));
        }
        assert_eq!(tlu.master().trigger_id().unwrap(), 300);
    }

    #[test]
    fn unanswered_handshake_saturates_the_timeout_counter() {
        let (sim, tlu) = sim_tlu();
        sim.set_dut_responds(false);
        tlu.master().set_en_output(1).unwrap();
        tlu.master().set_timeout(5).unwrap();
        let pulser = tlu.pulser();
        pulser.set_delay(19).unwrap();
        pulser.set_width(1).unwrap();
        pulser.set_repeat(300).unwrap();
        pulser.start().unwrap();
        assert_eq!(tlu.master().timeout_counter().unwrap(), 255);
    }

    #[test]
    fn init_checks_firmware_version() {
        let (sim, tlu) = sim_tlu();
        tlu.init().unwrap();
        sim.set_firmware_version(3);
        match tlu.init() {
            Err(crate::device::DeviceError::VersionMismatch { read: 3, required: 4 }) => {}
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn i2c_config_writes_directions_and_inverted_led_bytes() {
        let (sim, tlu) = sim_tlu();
        tlu.set_led_cnt(0, 3);
        tlu.set_lemo_leds(1, true);
        tlu.write_i2c_config().unwrap();

        let log = sim.i2c_transactions();
        // five targets, two writes each (DIR then OUT)
        assert_eq!(log.len(), 10);
        assert_eq!(log[0], (0x40, vec![6, 0x00, 0x00]));
        // RJ45 LED bank is active-low on both bytes: CH0=3 -> !0x03, !0x00
        assert_eq!(log[1], (0x40, vec![2, 0xfc, 0xff]));
        // LEMO bank inverts the low byte only: BUSY1|TRIG1|RST1 = 0x0222
        assert_eq!(log[3], (0x40, vec![2, !0x22u8, 0x02]));
        // plain banks are written as-is
        assert_eq!(log[5], (0x42, vec![2, 0x00, 0x00]));
        assert_eq!(log[7], (0x44, vec![2, 0x00, 0x00]));
        assert_eq!(log[9], (0x46, vec![2, 0x00, 0x00]));
    }

    #[test]
    fn injected_fault_surfaces_as_transport_error() {
        let (sim, tlu) = sim_tlu();
        sim.fail_next_read("bulk stall");
        assert!(tlu.get_fifo_data().is_err());
        // fault is one-shot
        assert!(tlu.get_fifo_data().is_ok());
    }
}
