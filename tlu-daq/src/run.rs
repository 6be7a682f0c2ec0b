//! Run orchestration: push the configuration, open the data sink, keep the
//! readout running and log counters once per second until Ctrl-C, the scan
//! time budget or the pulser says it is done.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, RunConfig};
use crate::device::{DeviceError, Tlu};
use crate::monitor::MonitorSender;
use crate::readout::{
    wallclock, DataCallback, ErrorCallback, FifoReadout, ReadoutError, ReadoutOptions,
};
use crate::sink::{SinkError, TableFile};

const STATUS_PERIOD: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Readout(#[from] ReadoutError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub struct RunArgs {
    pub config: RunConfig,
    pub data_file: PathBuf,
    pub monitor_addr: Option<String>,
    pub scan_time: Option<Duration>,
}

/// Derived output names for one run, `tlu_YYYYMMDD_HHMMSS` style.
pub struct RunPaths {
    pub run_name: String,
    pub data_file: PathBuf,
    pub log_file: PathBuf,
}

impl RunPaths {
    pub fn derive(
        output_folder: &std::path::Path,
        log_file: Option<PathBuf>,
        data_file: Option<PathBuf>,
    ) -> std::io::Result<RunPaths> {
        std::fs::create_dir_all(output_folder)?;
        let run_name = chrono::Local::now().format("tlu_%Y%m%d_%H%M%S").to_string();
        Ok(RunPaths {
            data_file: data_file.unwrap_or_else(|| output_folder.join(format!("{}.tlu", run_name))),
            log_file: log_file.unwrap_or_else(|| output_folder.join(format!("{}.log", run_name))),
            run_name,
        })
    }
}

/// The main acquisition loop. `stop` is the Ctrl-C flag set from the signal
/// handler; the loop only polls it.
pub fn run(tlu: Arc<Tlu>, args: &RunArgs, stop: Arc<AtomicBool>) -> Result<(), RunError> {
    args.config.validate()?;
    args.config.apply(&tlu)?;

    log::info!("Data file name: {}", args.data_file.display());
    let mut sink = TableFile::create(&args.data_file)?;
    sink.set_attr("kwargs", &serde_json::to_value(&args.config).unwrap_or_default())?;
    sink.set_attr("config", &tlu.register_snapshot()?)?;

    let mut monitor = match &args.monitor_addr {
        Some(addr) => match MonitorSender::bind(addr) {
            Ok(sender) => {
                log::info!("Initializing online monitor: connected={}", addr);
                Some(sender)
            }
            Err(e) => {
                log::warn!("Initializing online monitor failed: addr={} ({})", addr, e);
                None
            }
        },
        None => None,
    };

    let readout = FifoReadout::new(tlu.clone());
    readout.reset_sram_fifo()?;
    readout.print_readout_status()?;

    let callback: DataCallback = Box::new(move |chunk| {
        sink.append_chunk(chunk)?;
        if let Some(sender) = monitor.take() {
            // best effort: a dead monitor must not stop the run
            match sender.send_chunk(chunk) {
                Ok(()) => monitor = Some(sender),
                Err(e) => log::warn!("sending readout to online monitor failed: {}", e),
            }
        }
        Ok(())
    });
    let errback: ErrorCallback = Box::new(|e| match e {
        ReadoutError::FifoLost(_) => log::warn!("{}", e),
        other => log::error!("readout error: {}", other),
    });

    let scope = readout.scoped(Some(callback), Some(errback), ReadoutOptions::default())?;

    let outcome = if let Some(test) = args.config.test {
        run_pulser_loop(&tlu, &readout, test, args.config.count, &stop, args.scan_time)
    } else {
        run_beam_loop(&tlu, &readout, &args.config, &stop, args.scan_time)
    };

    // disarm whatever happened
    let master = tlu.master();
    master.set_en_input(0)?;
    master.set_en_output(0)?;

    outcome?;
    scope.finish()?;
    readout.print_readout_status()?;
    Ok(())
}

fn run_pulser_loop(
    tlu: &Tlu,
    readout: &FifoReadout,
    delay: u32,
    count: u16,
    stop: &AtomicBool,
    scan_time: Option<Duration>,
) -> Result<(), RunError> {
    log::info!("Starting test pulser...");
    let pulser = tlu.pulser();
    pulser.set_delay(delay.min(u16::MAX as u32) as u16)?;
    pulser.set_width(1)?;
    pulser.set_repeat(count)?;
    pulser.start()?;

    let start_time = wallclock();
    let mut last = None;
    loop {
        log_status(tlu, readout, start_time, &mut last)?;
        if pulser.is_ready()? && count != 0 {
            break;
        }
        if wait_or_stop(stop, start_time, scan_time) {
            break;
        }
    }
    log_status(tlu, readout, start_time, &mut last)?;
    Ok(())
}

fn run_beam_loop(
    tlu: &Tlu,
    readout: &FifoReadout,
    config: &RunConfig,
    stop: &AtomicBool,
    scan_time: Option<Duration>,
) -> Result<(), RunError> {
    log::info!("Starting... Ctrl-C to exit");
    tlu.master().set_en_input(config.input_mask())?;

    let start_time = wallclock();
    let mut last = None;
    loop {
        log_status(tlu, readout, start_time, &mut last)?;
        if wait_or_stop(stop, start_time, scan_time) {
            break;
        }
    }
    log_status(tlu, readout, start_time, &mut last)?;
    Ok(())
}

/// Sleep one status period in small slices; true when the run should end.
fn wait_or_stop(stop: &AtomicBool, start_time: f64, scan_time: Option<Duration>) -> bool {
    let slices = (STATUS_PERIOD.as_millis() / STOP_POLL.as_millis()) as u32;
    for _ in 0..slices {
        if stop.load(Ordering::SeqCst) {
            log::info!("Pressed Ctrl-C");
            return true;
        }
        if let Some(budget) = scan_time {
            if wallclock() - start_time >= budget.as_secs_f64() {
                log::info!("Scan time of {:.0} s elapsed", budget.as_secs_f64());
                return true;
            }
        }
        thread::sleep(STOP_POLL);
    }
    false
}

fn log_status(
    tlu: &Tlu,
    readout: &FifoReadout,
    start_time: f64,
    last: &mut Option<(f64, u32, u32)>,
) -> Result<(), DeviceError> {
    let master = tlu.master();
    let trigger_id = master.trigger_id()?;
    let time_stamp = master.time_stamp()?;
    let skipped = master.skip_trig_counter()?;
    let timeout_counter = master.timeout_counter()?;
    let tx_state = master.tx_state()?;
    let now = wallclock();

    match *last {
        Some((t0, id0, skip0)) if now > t0 => {
            let dt = now - t0;
            let accepted = trigger_id.wrapping_sub(id0) as f64 / dt;
            let real = accepted + skipped.wrapping_sub(skip0) as f64 / dt;
            let queue_rate = readout.data_words_per_second().unwrap_or(0.0);
            log::info!(
                "Time: {:8.2} TriggerId: {:8} TimeStamp: {:16} Skipped: {:8} Timeout: {:3} TxState: {:06x} Rate: {:.2} ({:.2}) Hz Readout: {:.1} rec/s",
                now - start_time,
                trigger_id,
                time_stamp,
                skipped,
                timeout_counter,
                tx_state,
                accepted,
                real,
                queue_rate
            );
        }
        _ => {
            log::info!(
                "Time: {:8.2} TriggerId: {:8} TimeStamp: {:16} Skipped: {:8} Timeout: {:3} TxState: {:06x}",
                now - start_time,
                trigger_id,
                time_stamp,
                skipped,
                timeout_counter,
                tx_state
            );
        }
    }
    *last = Some((now, trigger_id, skipped));
    Ok(())
}
