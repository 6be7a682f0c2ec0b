//! Run-control integration: a polled state machine that configures the TLU,
//! runs the readout and emits one event per trigger towards the beam-test
//! DAQ. The foreign producer binding is modelled as the `RunControl` trait;
//! `MockRunControl` drives the replay and test paths.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::unbounded;
use thiserror::Error;

use crate::config::{ConfigError, InputChannel, OutputChannel, RunConfig};
use crate::device::{DeviceError, Tlu, TriggerRecord};
use crate::readout::{
    wallclock, DataCallback, DataChunk, ErrorCallback, FifoReadout, ReadoutError, ReadoutOptions,
};
use crate::sink::{SinkError, TableFile};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll intervals the run loop lingers after a stop request so in-flight
/// triggers drain before the EORE.
const STOP_LINGER_POLLS: u32 = 5;

#[derive(Debug, Error)]
pub enum EudaqError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Readout(#[from] ReadoutError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("event emission failed: {0}")]
    Send(String),
}

/// Snapshot of the run-control flag set, polled by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    pub configuring: bool,
    pub starting: bool,
    pub stopping: bool,
    pub terminating: bool,
    pub error: bool,
}

impl ControlFlags {
    pub const NONE: ControlFlags =
        ControlFlags { configuring: false, starting: false, stopping: false, terminating: false, error: false };

    pub fn configuring() -> Self {
        ControlFlags { configuring: true, ..Self::NONE }
    }

    pub fn starting() -> Self {
        ControlFlags { starting: true, ..Self::NONE }
    }

    pub fn stopping() -> Self {
        ControlFlags { stopping: true, ..Self::NONE }
    }

    pub fn terminating() -> Self {
        ControlFlags { terminating: true, ..Self::NONE }
    }

    fn fatal(&self) -> bool {
        self.terminating || self.error
    }
}

/// One emitted trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TluEvent {
    pub trigger_id: u32,
    pub time_stamp: u64,
    pub event_counter: u64,
}

/// Interface to the external run controller. A production adapter wraps the
/// foreign producer binding; the mock below scripts it.
pub trait RunControl {
    fn poll(&mut self) -> ControlFlags;
    fn config_parameter(&mut self, key: &str, default: &str) -> String;
    fn run_number(&mut self) -> u32;
    fn confirm_configured(&mut self);
    fn confirm_started(&mut self);
    fn confirm_stopped(&mut self);
    fn send_event(&mut self, event: &TluEvent) -> Result<(), EudaqError>;
    fn send_event_extra(
        &mut self,
        event: &TluEvent,
        particles: &str,
        tx_state: &str,
    ) -> Result<(), EudaqError>;
}

/// DUT handshake states, one hex digit per enabled channel (MSB first),
/// `-` for disabled channels.
pub fn tx_state_string(tx_state: u32, enable_mask: u8) -> String {
    let mut parts = Vec::with_capacity(6);
    for i in 0..6 {
        if enable_mask & (0x20 >> i) != 0 {
            parts.push(format!(" {:x}", (tx_state >> (4 * i)) & 0xf));
        } else {
            parts.push(" -".to_string());
        }
    }
    parts.join(",")
}

/// Parameters read from the run-control configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EudaqParams {
    pub and_mask: u8,
    pub dut_mask: u8,
    pub inverted_mask: u8,
    /// Internal pulser period in 25 ns units; 0 uses the physical inputs.
    pub pulser_delay: u32,
}

impl EudaqParams {
    pub fn read<C: RunControl>(rc: &mut C) -> Self {
        let trigger_interval: f64 =
            rc.config_parameter("TriggerInterval", "0").trim().parse().unwrap_or(0.0);
        let and_mask = parse_mask(&rc.config_parameter("AndMask", "0"));
        let dut_mask = parse_mask(&rc.config_parameter("DutMask", "0"));
        let inverted_mask = parse_mask(&rc.config_parameter("InvertedInputs", "0"));
        let testpulse: u32 =
            rc.config_parameter("Testpulse", "0").trim().parse().unwrap_or(0);

        // Testpulse is the period in 25 ns units directly; TriggerInterval
        // arrives in milliseconds
        let pulser_delay =
            if testpulse > 0 { testpulse } else { (trigger_interval * 1e6 / 25.0) as u32 };

        log::info!(
            "Received Configuration: AndMask=0x{:x} DutMask=0x{:x} InvertedInputs=0x{:x} pulser={}",
            and_mask,
            dut_mask,
            inverted_mask,
            pulser_delay
        );
        EudaqParams { and_mask, dut_mask, inverted_mask, pulser_delay }
    }

    fn run_config(&self, base: &RunConfig) -> RunConfig {
        let mut cfg = base.clone();
        cfg.input_enable =
            (0..4).filter(|i| self.and_mask & (1 << i) != 0).map(InputChannel).collect();
        cfg.output_enable =
            (0..6).filter(|i| self.dut_mask & (1 << i) != 0).map(OutputChannel::Ch).collect();
        cfg.input_invert =
            (0..4).filter(|i| self.inverted_mask & (1 << i) != 0).map(InputChannel).collect();
        cfg.test = if self.pulser_delay > 0 { Some(self.pulser_delay) } else { None };
        cfg
    }
}

fn parse_mask(s: &str) -> u8 {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.unwrap_or(0)
}

/// Warns on trigger-id discontinuities and keeps the running event counter;
/// the last event of every chunk carries the extended auxiliary info.
#[derive(Debug, Default)]
pub struct EventEmitter {
    event_counter: u64,
    last_trigger_id: Option<u32>,
}

impl EventEmitter {
    pub fn event_counter(&self) -> u64 {
        self.event_counter
    }

    pub fn emit<C: RunControl>(
        &mut self,
        rc: &mut C,
        records: &[TriggerRecord],
        skipped_triggers: u64,
        tx_state: &str,
    ) -> Result<(), EudaqError> {
        let last_emit = records.iter().rposition(|r| r.trigger_id() != 0);
        for (i, record) in records.iter().enumerate() {
            let trigger_id = record.trigger_id();
            if trigger_id == 0 {
                continue;
            }
            if let Some(last) = self.last_trigger_id {
                let expected = last.wrapping_add(1);
                if trigger_id != expected {
                    log::warn!(
                        "Trigger ID discontinuity: got {}, expected {} (event {})",
                        trigger_id,
                        expected,
                        self.event_counter
                    );
                }
            }
            self.last_trigger_id = Some(trigger_id);

            let event = TluEvent {
                trigger_id,
                time_stamp: record.time_stamp(),
                event_counter: self.event_counter,
            };
            if Some(i) == last_emit {
                let particles = trigger_id as u64 + skipped_triggers;
                rc.send_event_extra(&event, &particles.to_string(), tx_state)?;
            } else {
                rc.send_event(&event)?;
            }
            self.event_counter += 1;
        }
        Ok(())
    }
}

enum RunEnd {
    Stopped,
    Teardown,
}

/// The producer state machine. Owns the device and drives it from the
/// polled run-control flags.
pub struct EudaqProducer<C: RunControl> {
    rc: C,
    tlu: Arc<Tlu>,
    base_config: RunConfig,
    data_file: Option<PathBuf>,
    poll_interval: Duration,
}

impl<C: RunControl> EudaqProducer<C> {
    pub fn new(rc: C, tlu: Arc<Tlu>, base_config: RunConfig) -> Self {
        EudaqProducer {
            rc,
            tlu,
            base_config,
            data_file: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Base path for per-run table files; the run number is appended.
    pub fn with_data_file(mut self, path: PathBuf) -> Self {
        self.data_file = Some(path);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn into_run_control(self) -> C {
        self.rc
    }

    pub fn run(&mut self) -> Result<(), EudaqError> {
        let mut params: Option<EudaqParams> = None;
        let mut initialized = false;

        loop {
            let flags = self.rc.poll();
            if flags.fatal() {
                break;
            }
            if flags.configuring {
                if !initialized {
                    self.tlu.init()?;
                    initialized = true;
                }
                let new_params = EudaqParams::read(&mut self.rc);
                self.configure(&new_params)?;
                params = Some(new_params);
                self.rc.confirm_configured();
                continue;
            }
            if flags.starting {
                let Some(active) = params else {
                    log::warn!("Run start requested before configuration, ignoring");
                    thread::sleep(self.poll_interval);
                    continue;
                };
                match self.run_once(&active)? {
                    RunEnd::Stopped => self.rc.confirm_stopped(),
                    RunEnd::Teardown => break,
                }
                continue;
            }
            thread::sleep(self.poll_interval);
        }

        if initialized {
            self.teardown()?;
        }
        Ok(())
    }

    fn configure(&mut self, params: &EudaqParams) -> Result<(), EudaqError> {
        self.tlu.master().reset()?;
        let cfg = params.run_config(&self.base_config);
        cfg.validate()?;
        cfg.apply(&self.tlu)?;
        Ok(())
    }

    fn run_once(&mut self, params: &EudaqParams) -> Result<RunEnd, EudaqError> {
        self.tlu.stream_fifo().reset()?;
        self.tlu.master().start()?;
        let run_number = self.rc.run_number();
        log::info!("Starting run {}", run_number);
        self.rc.confirm_started();

        let readout = FifoReadout::new(self.tlu.clone());
        let (chunk_tx, chunk_rx) = unbounded::<DataChunk>();

        let mut sink = match &self.data_file {
            Some(base) => Some(run_table_file(base, run_number)?),
            None => None,
        };
        let callback: DataCallback = Box::new(move |chunk| {
            if let Some(sink) = sink.as_mut() {
                sink.append_chunk(chunk)?;
            }
            let _ = chunk_tx.send(chunk.clone());
            Ok(())
        });
        let errback: ErrorCallback = Box::new(|e| match e {
            ReadoutError::FifoLost(_) => log::warn!("{}", e),
            _ => log::error!("readout error: {}", e),
        });

        let scope = readout.scoped(Some(callback), Some(errback), ReadoutOptions::default())?;
        if params.pulser_delay > 0 {
            let pulser = self.tlu.pulser();
            pulser.set_delay(params.pulser_delay.min(u16::MAX as u32) as u16)?;
            pulser.set_width(1)?;
            pulser.set_repeat(0)?;
            pulser.start()?;
        } else {
            self.tlu.master().set_en_input(params.and_mask)?;
        }

        let mut emitter = EventEmitter::default();
        let mut linger: Option<u32> = None;
        let mut end = RunEnd::Stopped;
        let mut last_log = wallclock();
        let mut last_counts: Option<(f64, u32, u32)> = None;

        loop {
            while let Ok(chunk) = chunk_rx.try_recv() {
                self.emit_chunk(&mut emitter, params, &chunk)?;
            }

            let flags = self.rc.poll();
            if flags.fatal() {
                self.disable_triggers(params)?;
                end = RunEnd::Teardown;
                break;
            }
            if flags.stopping && linger.is_none() {
                log::info!("Stop Run received");
                self.disable_triggers(params)?;
                linger = Some(0);
            }
            if let Some(polls) = linger.as_mut() {
                *polls += 1;
                if *polls > STOP_LINGER_POLLS {
                    break;
                }
            }

            let now = wallclock();
            if now - last_log >= 1.0 {
                last_log = now;
                self.log_status(&mut last_counts, now)?;
            }
            thread::sleep(self.poll_interval);
        }

        scope.finish()?;
        while let Ok(chunk) = chunk_rx.try_recv() {
            self.emit_chunk(&mut emitter, params, &chunk)?;
        }
        log::info!("Run {} done, {} events", run_number, emitter.event_counter());
        Ok(end)
    }

    fn emit_chunk(
        &mut self,
        emitter: &mut EventEmitter,
        params: &EudaqParams,
        chunk: &DataChunk,
    ) -> Result<(), EudaqError> {
        let tx_state = tx_state_string(self.tlu.master().tx_state()?, params.dut_mask);
        emitter.emit(&mut self.rc, &chunk.data, chunk.skipped_triggers, &tx_state)
    }

    fn disable_triggers(&self, params: &EudaqParams) -> Result<(), EudaqError> {
        if params.pulser_delay > 0 {
            // the pulser has no graceful stop, only reset
            self.tlu.pulser().reset()?;
        } else {
            self.tlu.master().set_en_input(0)?;
        }
        Ok(())
    }

    fn log_status(
        &self,
        last: &mut Option<(f64, u32, u32)>,
        now: f64,
    ) -> Result<(), EudaqError> {
        let master = self.tlu.master();
        let trigger_id = master.trigger_id()?;
        let skipped = master.skip_trig_counter()?;
        let timeout_counter = master.timeout_counter()?;
        let tx_state = master.tx_state()?;
        if let Some((t0, id0, skip0)) = *last {
            let dt = now - t0;
            if dt > 0.0 {
                let freq = (trigger_id.wrapping_sub(id0)) as f64 / dt;
                let freq_all = freq + (skipped.wrapping_sub(skip0)) as f64 / dt;
                log::info!(
                    "Trigger: {:8} | Skip: {:8} | Timeout: {:3} | Rate: {:6.0} ({:6.0}) Hz | TxState: {:06x}",
                    trigger_id,
                    skipped,
                    timeout_counter,
                    freq,
                    freq_all,
                    tx_state
                );
            }
        }
        *last = Some((now, trigger_id, skipped));
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), EudaqError> {
        log::info!("Closing TLU");
        self.tlu.pulser().reset()?;
        let master = self.tlu.master();
        master.set_en_input(0)?;
        master.set_en_output(0)?;
        Ok(())
    }
}

fn run_table_file(base: &Path, run_number: u32) -> Result<TableFile, SinkError> {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("tlu");
    let name = format!("{}_run{}.tlu", stem, run_number);
    let path = base.with_file_name(name);
    TableFile::create(path)
}

/// Replay a captured table file through the state machine instead of
/// hardware, paced by the recorded readout intervals.
pub fn replay<C: RunControl>(
    rc: &mut C,
    path: &Path,
    delay: Option<f64>,
    poll_interval: Duration,
) -> Result<(), EudaqError> {
    let table = crate::sink::TableReader::open(path)?;
    log::info!("Replaying {} readouts from {}", table.meta_data.len(), path.display());

    // configure handshake
    loop {
        let flags = rc.poll();
        if flags.fatal() {
            return Ok(());
        }
        if flags.configuring {
            log::info!("Received Configuration");
            let _ = EudaqParams::read(rc);
            rc.confirm_configured();
            break;
        }
        thread::sleep(poll_interval);
    }
    // start handshake
    loop {
        let flags = rc.poll();
        if flags.fatal() {
            return Ok(());
        }
        if flags.starting {
            log::info!("Starting replay run {}", rc.run_number());
            rc.confirm_started();
            break;
        }
        thread::sleep(poll_interval);
    }

    let mut emitter = EventEmitter::default();
    let tx_state = tx_state_string(0, 0);
    let mut last_start: Option<f64> = None;
    for row in &table.meta_data {
        let flags = rc.poll();
        if flags.fatal() {
            return Ok(());
        }
        if flags.stopping {
            log::info!("Stop Run received");
            rc.confirm_stopped();
            return Ok(());
        }

        if let Some(last) = last_start {
            let pace = row.timestamp_start() - last;
            if pace > 0.0 {
                thread::sleep(Duration::from_secs_f64(pace));
            }
        }
        if let Some(extra) = delay {
            thread::sleep(Duration::from_secs_f64(extra));
        }
        last_start = Some(row.timestamp_start());

        emitter.emit(rc, table.chunk_records(row), row.skipped_triggers(), &tx_state)?;
    }
    log::info!("Replay data exhausted after {} events", emitter.event_counter());

    loop {
        let flags = rc.poll();
        if flags.stopping {
            log::info!("Stop Run received");
            rc.confirm_stopped();
            return Ok(());
        }
        if flags.fatal() {
            return Ok(());
        }
        thread::sleep(poll_interval);
    }
}

/// Scripted run control for tests and dry runs: flags are served from a
/// queue, emitted events are recorded.
pub struct MockRunControl {
    script: VecDeque<ControlFlags>,
    when_empty: ControlFlags,
    params: HashMap<String, String>,
    run_number: u32,
    pub events: Vec<(TluEvent, Option<(String, String)>)>,
    pub confirmations: Vec<&'static str>,
}

impl MockRunControl {
    pub fn new(script: Vec<ControlFlags>) -> Self {
        MockRunControl {
            script: script.into(),
            when_empty: ControlFlags::terminating(),
            params: HashMap::new(),
            run_number: 1,
            events: Vec::new(),
            confirmations: Vec::new(),
        }
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn set_run_number(&mut self, run_number: u32) {
        self.run_number = run_number;
    }
}

impl RunControl for MockRunControl {
    fn poll(&mut self) -> ControlFlags {
        self.script.pop_front().unwrap_or(self.when_empty)
    }

    fn config_parameter(&mut self, key: &str, default: &str) -> String {
        self.params.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    fn run_number(&mut self) -> u32 {
        self.run_number
    }

    fn confirm_configured(&mut self) {
        self.confirmations.push("configured");
    }

    fn confirm_started(&mut self) {
        self.confirmations.push("started");
    }

    fn confirm_stopped(&mut self) {
        self.confirmations.push("stopped");
    }

    fn send_event(&mut self, event: &TluEvent) -> Result<(), EudaqError> {
        self.events.push((*event, None));
        Ok(())
    }

    fn send_event_extra(
        &mut self,
        event: &TluEvent,
        particles: &str,
        tx_state: &str,
    ) -> Result<(), EudaqError> {
        self.events.push((*event, Some((particles.to_string(), tx_state.to_string()))));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_state_encodes_enabled_duts_msb_first() {
        // nibble 5 belongs to DUT0, nibble 0 to DUT5
        let tx = (2 << 20) | (4 << 16); // DUT0 in state 2, DUT1 in state 4
        assert_eq!(tx_state_string(tx, 0b000011), " -, -, -, -, 4, 2");
        assert_eq!(tx_state_string(tx, 0b100001), " 0, -, -, -, -, 2");
        assert_eq!(tx_state_string(0, 0), " -, -, -, -, -, -");
    }

    #[test]
    fn masks_parse_decimal_and_hex() {
        assert_eq!(parse_mask("5"), 5);
        assert_eq!(parse_mask("0x3f"), 0x3f);
        assert_eq!(parse_mask(" 0X0A "), 10);
        assert_eq!(parse_mask("junk"), 0);
    }

    #[test]
    fn emitter_counts_and_flags_the_chunk_tail() {
        let mut rc = MockRunControl::new(Vec::new());
        let mut emitter = EventEmitter::default();
        let records: Vec<TriggerRecord> =
            (1..=5).map(|i| TriggerRecord::new([0; 4], 100 + i, i as u32)).collect();
        emitter.emit(&mut rc, &records, 7, "tx").unwrap();

        assert_eq!(rc.events.len(), 5);
        assert_eq!(emitter.event_counter(), 5);
        for (i, (event, extra)) in rc.events.iter().enumerate() {
            assert_eq!(event.event_counter, i as u64);
            assert_eq!(event.trigger_id, i as u32 + 1);
            if i == 4 {
                let (particles, tx_state) = extra.as_ref().unwrap();
                assert_eq!(particles, "12"); // trigger 5 + 7 skipped
                assert_eq!(tx_state, "tx");
            } else {
                assert!(extra.is_none());
            }
        }
    }

    #[test]
    fn emitter_skips_zero_ids_and_survives_discontinuities() {
        let mut rc = MockRunControl::new(Vec::new());
        let mut emitter = EventEmitter::default();
        let records = vec![
            TriggerRecord::new([0; 4], 10, 0), // padding-like, not emitted
            TriggerRecord::new([0; 4], 11, 1),
            TriggerRecord::new([0; 4], 12, 5), // discontinuity, warned not dropped
        ];
        emitter.emit(&mut rc, &records, 0, "tx").unwrap();
        assert_eq!(rc.events.len(), 2);
        assert_eq!(rc.events[1].0.trigger_id, 5);
        assert!(rc.events[1].1.is_some()); // tail carries the extra info
    }

    #[test]
    fn params_prefer_testpulse_over_trigger_interval() {
        let mut rc = MockRunControl::new(Vec::new());
        rc.set_param("TriggerInterval", "1");
        rc.set_param("AndMask", "0x3");
        rc.set_param("DutMask", "0x5");
        let params = EudaqParams::read(&mut rc);
        assert_eq!(params.and_mask, 3);
        assert_eq!(params.dut_mask, 5);
        // 1 ms = 40000 periods of 25 ns
        assert_eq!(params.pulser_delay, 40_000);

        rc.set_param("Testpulse", "200");
        let params = EudaqParams::read(&mut rc);
        assert_eq!(params.pulser_delay, 200);
    }
}
