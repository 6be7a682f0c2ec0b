//! Online-monitor link: a ZeroMQ publisher for per-readout meta + raw data,
//! and the converter that turns the stream into sliding rate-vs-time curves
//! for the plotting frontend.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::IntoBytes;

use crate::readout::{wallclock, DataChunk};

/// Record description published with every meta frame so consumers can
/// decode the raw frame without this crate.
pub const RAW_DTYPE: &str = "[('le0', 'u1'), ('le1', 'u1'), ('le2', 'u1'), ('le3', 'u1'), \
                             ('time_stamp', '<u8'), ('trigger_id', '<u4')]";

/// Plot history depth per curve.
pub const HISTORY_SLOTS: usize = 1600;

const FPS_SMOOTHING: f64 = 0.3;
const POLL_TIMEOUT_MS: i64 = 100;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("ZMQ socket failed: {0}")]
    Zmq(#[from] zmq::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Frame 1 of the two-part readout publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadoutMeta {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_length: u64,
    pub timestamp_start: f64,
    pub timestamp_stop: f64,
    pub readout_error: u32,
    pub skipped_triggers: u64,
}

impl ReadoutMeta {
    pub fn from_chunk(chunk: &DataChunk) -> Self {
        ReadoutMeta {
            name: "ReadoutData".into(),
            dtype: RAW_DTYPE.into(),
            shape: vec![chunk.data.len()],
            data_length: chunk.data.len() as u64,
            timestamp_start: chunk.timestamp_start,
            timestamp_stop: chunk.timestamp_stop,
            readout_error: chunk.error,
            skipped_triggers: chunk.skipped_triggers,
        }
    }
}

/// Publisher bound at the configured endpoint. Sends are non-blocking and
/// best effort; a full send queue drops the readout on the floor.
pub struct MonitorSender {
    socket: zmq::Socket,
}

impl MonitorSender {
    pub fn bind(addr: &str) -> Result<Self, MonitorError> {
        log::info!("Creating socket connection to server {}", addr);
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.bind(addr)?;
        let sender = MonitorSender { socket };
        // reset frame announces a new run to every subscriber
        sender.send_json(&serde_json::json!({ "name": "Reset", "conf": null }), 0)?;
        Ok(sender)
    }

    fn send_json(&self, value: &serde_json::Value, more: i32) -> Result<(), MonitorError> {
        match self.socket.send(value.to_string().as_bytes(), zmq::DONTWAIT | more) {
            Ok(()) | Err(zmq::Error::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn send_chunk(&self, chunk: &DataChunk) -> Result<(), MonitorError> {
        let meta = serde_json::to_value(ReadoutMeta::from_chunk(chunk))?;
        self.send_json(&meta, zmq::SNDMORE)?;
        match self.socket.send(chunk.data.as_bytes(), zmq::DONTWAIT) {
            Ok(()) | Err(zmq::Error::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct Curve {
    time: Vec<f64>,
    rate: Vec<f64>,
    index: usize,
    time_index: usize,
    cycle_start: f64,
}

impl Curve {
    fn new() -> Self {
        Curve {
            time: vec![0.0; HISTORY_SLOTS],
            rate: vec![0.0; HISTORY_SLOTS],
            index: 0,
            time_index: 0,
            cycle_start: 0.0,
        }
    }

    fn push(&mut self, timestamp_start: f64, value: f64) {
        if self.index % HISTORY_SLOTS == 0 {
            self.cycle_start = timestamp_start;
            self.time_index = 0;
        }
        self.time[self.time_index] = self.cycle_start - timestamp_start;
        self.rate.rotate_right(1);
        self.rate[0] = value;
        self.time_index += 1;
        self.index += 1;
    }

    fn clear(&mut self) {
        self.time.iter_mut().for_each(|v| *v = 0.0);
        self.rate.iter_mut().for_each(|v| *v = 0.0);
        self.index = 0;
        self.time_index = 0;
    }
}

/// Sliding-window rate history fed from meta frames. Tracks the accepted
/// rate and the real rate (accepted plus skipped) in kHz.
pub struct RateHistory {
    accepted: Curve,
    real: Curve,
    fps: f64,
    last_update: f64,
    last_skipped: Option<u64>,
    n_readouts: usize,
    readouts_seen: usize,
}

impl RateHistory {
    pub fn new() -> Self {
        RateHistory {
            accepted: Curve::new(),
            real: Curve::new(),
            fps: 0.0,
            last_update: 0.0,
            last_skipped: None,
            n_readouts: 0,
            readouts_seen: 0,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn reset(&mut self) {
        self.accepted.clear();
        self.real.clear();
        self.last_skipped = None;
        self.readouts_seen = 0;
    }

    /// Limit the integration window to n readouts; 0 integrates forever.
    pub fn set_n_readouts(&mut self, n: usize) {
        self.n_readouts = n;
    }

    pub fn push_meta(&mut self, meta: &ReadoutMeta) -> Option<serde_json::Value> {
        let dt = meta.timestamp_stop - meta.timestamp_start;
        if dt <= 0.0 {
            return None;
        }
        let accepted_khz = meta.data_length as f64 / dt / 1e3;
        let skipped_delta = match self.last_skipped {
            Some(last) => meta.skipped_triggers.saturating_sub(last),
            None => 0,
        };
        self.last_skipped = Some(meta.skipped_triggers);
        let real_khz = accepted_khz + skipped_delta as f64 / dt / 1e3;

        self.accepted.push(meta.timestamp_start, accepted_khz);
        self.real.push(meta.timestamp_start, real_khz);

        let now = meta.timestamp_stop;
        if now > self.last_update {
            let recent_fps = 1.0 / (now - self.last_update);
            self.fps = self.fps * (1.0 - FPS_SMOOTHING) + recent_fps * FPS_SMOOTHING;
        }
        self.last_update = now;

        self.readouts_seen += 1;
        if self.n_readouts != 0 && self.readouts_seen % self.n_readouts == 0 {
            let update = self.render();
            self.reset();
            return Some(update);
        }
        Some(self.render())
    }

    fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "tlu": {
                "trigger_rate_acc": [self.accepted.time, self.accepted.rate],
                "trigger_rate_real": [self.real.time, self.real.rate],
            },
            "indices": {
                "trigger_rate_acc": self.accepted.index,
                "trigger_rate_real": self.real.index,
            },
            "fps": self.fps,
            "timestamp_stop": self.last_update,
        })
    }
}

impl Default for RateHistory {
    fn default() -> Self {
        RateHistory::new()
    }
}

/// Converter process: subscribe to the DAQ publisher, maintain the rate
/// history, republish rendered updates. An optional REP socket accepts
/// `RESET` or an integration-window count.
pub fn run_converter(
    in_addr: &str,
    out_addr: &str,
    command_addr: Option<&str>,
    stop: &AtomicBool,
) -> Result<(), MonitorError> {
    let context = zmq::Context::new();
    let sub = context.socket(zmq::SUB)?;
    sub.connect(in_addr)?;
    sub.set_subscribe(b"")?;
    let publisher = context.socket(zmq::PUB)?;
    publisher.bind(out_addr)?;
    let commands = match command_addr {
        Some(addr) => {
            let rep = context.socket(zmq::REP)?;
            rep.bind(addr)?;
            Some(rep)
        }
        None => None,
    };

    log::info!("Converting {} -> {}", in_addr, out_addr);
    let mut history = RateHistory::new();
    while !stop.load(Ordering::SeqCst) {
        {
            let mut items = Vec::with_capacity(2);
            items.push(sub.as_poll_item(zmq::POLLIN));
            if let Some(rep) = &commands {
                items.push(rep.as_poll_item(zmq::POLLIN));
            }
            zmq::poll(&mut items, POLL_TIMEOUT_MS)?;
        }

        while let Ok(frame) = sub.recv_bytes(zmq::DONTWAIT) {
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&frame) else {
                continue; // raw data frame, rates only need the meta
            };
            match value.get("name").and_then(|n| n.as_str()) {
                Some("Reset") => history.reset(),
                Some("ReadoutData") => {
                    let Ok(meta) = serde_json::from_value::<ReadoutMeta>(value) else {
                        continue;
                    };
                    if let Some(update) = history.push_meta(&meta) {
                        match publisher.send(update.to_string().as_bytes(), zmq::DONTWAIT) {
                            Ok(()) | Err(zmq::Error::EAGAIN) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(rep) = &commands {
            while let Ok(command) = rep.recv_string(zmq::DONTWAIT) {
                match command.as_deref() {
                    Ok("RESET") => history.reset(),
                    Ok(n) => {
                        if let Ok(n) = n.parse::<usize>() {
                            history.set_n_readouts(n);
                        }
                    }
                    Err(_) => {}
                }
                rep.send("OK", 0)?;
            }
        }
    }
    Ok(())
}

/// Terminal receiver: subscribe to the converter output and report the most
/// recent accepted/real rates.
pub fn watch(addr: &str, stop: &AtomicBool) -> Result<(), MonitorError> {
    let context = zmq::Context::new();
    let sub = context.socket(zmq::SUB)?;
    sub.connect(addr)?;
    sub.set_subscribe(b"")?;

    let mut last_line = wallclock();
    while !stop.load(Ordering::SeqCst) {
        {
            let mut items = [sub.as_poll_item(zmq::POLLIN)];
            zmq::poll(&mut items, POLL_TIMEOUT_MS)?;
        }
        while let Ok(frame) = sub.recv_bytes(zmq::DONTWAIT) {
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&frame) else { continue };
            let now = wallclock();
            if now - last_line < 1.0 {
                continue;
            }
            last_line = now;
            let accepted = value["tlu"]["trigger_rate_acc"][1][0].as_f64().unwrap_or(0.0);
            let real = value["tlu"]["trigger_rate_real"][1][0].as_f64().unwrap_or(0.0);
            let fps = value["fps"].as_f64().unwrap_or(0.0);
            log::info!(
                "Accepted rate: {:8.3} kHz | Real rate: {:8.3} kHz | Readout: {:5.1} Hz",
                accepted,
                real,
                fps
            );
        }
    }
    Ok(())
}
