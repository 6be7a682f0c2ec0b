//! Continuous FIFO readout: a producer thread drains the on-board stream
//! FIFO into an in-process queue, a consumer thread hands chunks to the data
//! callback and a watchdog surfaces hardware lost-data errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;

use crate::device::{DeviceError, Tlu, TriggerRecord};

pub const READOUT_INTERVAL: Duration = Duration::from_millis(50);
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);
const FIFO_RESET_SETTLE: Duration = Duration::from_millis(200);
const MOVING_AVERAGE_PERIOD: f64 = 10.0;
const WORDS_PER_READ_DEPTH: usize = 200; // MOVING_AVERAGE_PERIOD / READOUT_INTERVAL
const DATA_BUFFER_DEPTH: usize = 1024;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReadoutError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("TLU FIFO lost data error(s) detected: counter = {0}")]
    FifoLost(u8),
    #[error("received no data for {0:.1} second(s)")]
    NoDataTimeout(f64),
    #[error("FIFO stop timeout after {0:.1} second(s)")]
    StopTimeout(f64),
    #[error("readout already running: use stop() before start()")]
    AlreadyRunning,
    #[error("readout not running: use start() before stop()")]
    NotRunning,
    #[error("data callback failed: {0}")]
    Callback(String),
}

/// One producer drain: the records plus the wall-clock interval they were
/// collected in and the skip counter observed at drain time.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub data: Vec<TriggerRecord>,
    pub timestamp_start: f64,
    pub timestamp_stop: f64,
    pub error: u32,
    pub skipped_triggers: u64,
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type DataCallback = Box<dyn FnMut(&DataChunk) -> Result<(), CallbackError> + Send>;
pub type ErrorCallback = Box<dyn FnMut(&ReadoutError) + Send>;

/// Wall-clock seconds since the epoch, double precision.
pub fn wallclock() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Manually-reset event with a cancellable timed wait.
struct OneShot {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl OneShot {
    fn new() -> Self {
        OneShot { flag: Mutex::new(false), cond: Condvar::new() }
    }

    fn set(&self) {
        *self.flag.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.flag.lock().unwrap() = false;
    }

    fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Sleep until the event fires or the timeout elapses; true if it fired.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.cond.wait_timeout_while(guard, timeout, |set| !*set).unwrap();
        *guard
    }
}

struct Shared {
    stop_readout: OneShot,
    force_stop: OneShot,
    rate_request: AtomicBool,
    rate_tx: Sender<usize>,
    rate_rx: Receiver<usize>,
    record_count: AtomicU64,
    words_per_read: Mutex<VecDeque<usize>>,
    data_buffer: Mutex<VecDeque<DataChunk>>,
    timestamp: Mutex<f64>,
    errback: Mutex<Option<ErrorCallback>>,
}

impl Shared {
    fn new() -> Self {
        let (rate_tx, rate_rx) = bounded(1);
        Shared {
            stop_readout: OneShot::new(),
            force_stop: OneShot::new(),
            rate_request: AtomicBool::new(false),
            rate_tx,
            rate_rx,
            record_count: AtomicU64::new(0),
            words_per_read: Mutex::new(VecDeque::with_capacity(WORDS_PER_READ_DEPTH)),
            data_buffer: Mutex::new(VecDeque::new()),
            timestamp: Mutex::new(wallclock()),
            errback: Mutex::new(None),
        }
    }

    fn update_timestamp(&self) -> (f64, f64) {
        let mut ts = self.timestamp.lock().unwrap();
        let last = *ts;
        *ts = wallclock();
        (last, *ts)
    }

    fn push_words(&self, words: usize) {
        let mut ring = self.words_per_read.lock().unwrap();
        if ring.len() == WORDS_PER_READ_DEPTH {
            ring.pop_front();
        }
        ring.push_back(words);
    }

    fn push_buffer(&self, chunk: DataChunk) {
        let mut buffer = self.data_buffer.lock().unwrap();
        if buffer.len() == DATA_BUFFER_DEPTH {
            buffer.pop_front();
        }
        buffer.push_back(chunk);
    }

    /// Route an error to the errback if one is installed; otherwise log it.
    /// Returns whether an errback consumed it.
    fn report(&self, error: ReadoutError) -> bool {
        let mut slot = self.errback.lock().unwrap();
        match slot.as_mut() {
            Some(errback) => {
                errback(&error);
                true
            }
            None => {
                match error {
                    ReadoutError::FifoLost(_) => log::warn!("{}", error),
                    ref e => log::error!("{}", e),
                }
                false
            }
        }
    }
}

#[derive(Default)]
struct Workers {
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadoutOptions {
    pub reset_fifo: bool,
    pub clear_buffer: bool,
    pub fill_buffer: bool,
    /// Seconds of producer idleness before a one-shot *no-data* error.
    pub no_data_timeout: Option<f64>,
}

pub struct FifoReadout {
    tlu: Arc<Tlu>,
    shared: Arc<Shared>,
    running: AtomicBool,
    workers: Mutex<Workers>,
    queue_rx: Mutex<Option<Receiver<Option<DataChunk>>>>,
}

impl FifoReadout {
    pub fn new(tlu: Arc<Tlu>) -> Self {
        FifoReadout {
            tlu,
            shared: Arc::new(Shared::new()),
            running: AtomicBool::new(false),
            workers: Mutex::new(Workers::default()),
            queue_rx: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> u64 {
        self.shared.record_count.load(Ordering::SeqCst)
    }

    /// Buffered chunks, if `fill_buffer` was requested.
    pub fn buffered_data(&self) -> Vec<DataChunk> {
        self.shared.data_buffer.lock().unwrap().iter().cloned().collect()
    }

    pub fn start(
        &self,
        callback: Option<DataCallback>,
        errback: Option<ErrorCallback>,
        options: ReadoutOptions,
    ) -> Result<(), ReadoutError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ReadoutError::AlreadyRunning);
        }
        log::info!("Starting FIFO readout...");

        let has_errback = errback.is_some();
        *self.shared.errback.lock().unwrap() = errback;
        self.shared.record_count.store(0, Ordering::SeqCst);

        let prepared = if options.reset_fifo {
            self.reset_sram_fifo()
        } else {
            self.tlu.stream_fifo().size().map_err(ReadoutError::from).map(|fifo_size| {
                if fifo_size != 0 {
                    log::warn!(
                        "SRAM FIFO not empty when starting FIFO readout: size = {}",
                        fifo_size
                    );
                }
            })
        };
        if let Err(e) = prepared {
            self.running.store(false, Ordering::SeqCst);
            *self.shared.errback.lock().unwrap() = None;
            return Err(e);
        }

        self.shared.words_per_read.lock().unwrap().clear();
        if options.clear_buffer {
            self.shared.data_buffer.lock().unwrap().clear();
        }
        self.shared.stop_readout.clear();
        self.shared.force_stop.clear();

        let mut workers = self.workers.lock().unwrap();

        if has_errback {
            let tlu = self.tlu.clone();
            let shared = self.shared.clone();
            workers.watchdog = Some(
                thread::Builder::new()
                    .name("tlu-watchdog".into())
                    .spawn(move || watchdog_loop(tlu, shared))
                    .expect("spawning watchdog thread"),
            );
        }

        let queue_tx = match callback {
            Some(callback) => {
                let (tx, rx) = unbounded();
                *self.queue_rx.lock().unwrap() = Some(rx.clone());
                let shared = self.shared.clone();
                workers.consumer = Some(
                    thread::Builder::new()
                        .name("tlu-worker".into())
                        .spawn(move || consumer_loop(rx, callback, shared))
                        .expect("spawning worker thread"),
                );
                Some(tx)
            }
            None => None,
        };

        let tlu = self.tlu.clone();
        let shared = self.shared.clone();
        let fill_buffer = options.fill_buffer;
        let no_data_timeout = options.no_data_timeout;
        workers.producer = Some(
            thread::Builder::new()
                .name("tlu-readout".into())
                .spawn(move || producer_loop(tlu, shared, queue_tx, fill_buffer, no_data_timeout))
                .expect("spawning readout thread"),
        );
        Ok(())
    }

    /// Graceful stop with escalation: after `timeout` the producer is woken
    /// with `force_stop` and the stop is reported as timed out.
    pub fn stop(&self, timeout: Duration) -> Result<(), ReadoutError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ReadoutError::NotRunning);
        }
        self.shared.stop_readout.set();

        let mut workers = self.workers.lock().unwrap();
        let mut timed_out = false;
        if let Some(producer) = workers.producer.take() {
            let deadline = Instant::now() + timeout;
            while !producer.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !producer.is_finished() {
                timed_out = true;
                self.shared.force_stop.set();
                self.shared.report(ReadoutError::StopTimeout(timeout.as_secs_f64()));
            }
            if producer.join().is_err() {
                log::error!("readout thread panicked");
            }
        }
        if let Some(watchdog) = workers.watchdog.take() {
            if watchdog.join().is_err() {
                log::error!("watchdog thread panicked");
            }
        }
        if let Some(consumer) = workers.consumer.take() {
            if consumer.join().is_err() {
                log::error!("worker thread panicked");
            }
        }

        *self.shared.errback.lock().unwrap() = None;
        *self.queue_rx.lock().unwrap() = None;
        log::info!("Stopped FIFO readout");
        if timed_out {
            Err(ReadoutError::StopTimeout(timeout.as_secs_f64()))
        } else {
            Ok(())
        }
    }

    /// Start with a guard; dropping the guard stops the readout.
    pub fn scoped(
        &self,
        callback: Option<DataCallback>,
        errback: Option<ErrorCallback>,
        options: ReadoutOptions,
    ) -> Result<ReadoutScope<'_>, ReadoutError> {
        self.start(callback, errback, options)?;
        Ok(ReadoutScope { readout: self, armed: true })
    }

    /// Records moved through the queue per second, averaged over the moving
    /// window. None when the producer could not answer in time.
    pub fn data_words_per_second(&self) -> Option<f64> {
        while self.shared.rate_rx.try_recv().is_ok() {}
        self.shared.rate_request.store(true, Ordering::SeqCst);
        match self.shared.rate_rx.recv_timeout(2 * READOUT_INTERVAL) {
            Ok(sum) => Some(sum as f64 / MOVING_AVERAGE_PERIOD),
            Err(_) => {
                self.shared.rate_request.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Pulse the stream FIFO reset and verify it drained within the settle
    /// window.
    pub fn reset_sram_fifo(&self) -> Result<(), ReadoutError> {
        let fifo_size = self.tlu.stream_fifo().size()?;
        log::info!("Resetting SRAM FIFO: size = {}", fifo_size);
        self.shared.update_timestamp();
        self.tlu.stream_fifo().reset()?;
        thread::sleep(FIFO_RESET_SETTLE);
        let fifo_size = self.tlu.stream_fifo().size()?;
        if fifo_size != 0 {
            log::warn!("SRAM FIFO not empty after reset: size = {}", fifo_size);
        }
        Ok(())
    }

    pub fn print_readout_status(&self) -> Result<(), ReadoutError> {
        let lost_count = self.tlu.master().lost_data_cnt()?;
        let queued = self.queue_rx.lock().unwrap().as_ref().map(|rx| rx.len()).unwrap_or(0);
        log::info!("Received records: {}", self.record_count());
        log::info!("Data queue size: {}", queued);
        log::info!("SRAM FIFO size: {}", self.tlu.stream_fifo().size()?);
        log::info!("Channel:           {}", "TLU");
        log::info!("Lost data counter: {}", lost_count);
        if lost_count != 0 {
            log::warn!("Errors detected");
        }
        Ok(())
    }
}

/// Stops the readout when it leaves scope; `finish()` surfaces stop errors.
pub struct ReadoutScope<'a> {
    readout: &'a FifoReadout,
    armed: bool,
}

impl ReadoutScope<'_> {
    pub fn finish(mut self) -> Result<(), ReadoutError> {
        self.armed = false;
        self.readout.stop(DEFAULT_STOP_TIMEOUT)
    }
}

impl Drop for ReadoutScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.readout.stop(DEFAULT_STOP_TIMEOUT) {
                log::error!("stopping readout on scope exit failed: {}", e);
            }
        }
    }
}

fn producer_loop(
    tlu: Arc<Tlu>,
    shared: Arc<Shared>,
    queue: Option<Sender<Option<DataChunk>>>,
    fill_buffer: bool,
    mut no_data_timeout: Option<f64>,
) {
    log::debug!("starting readout thread");
    let mut last_data_time = wallclock();
    loop {
        let tick = Instant::now();
        if let Some(limit) = no_data_timeout {
            if last_data_time + limit < wallclock() {
                // only reported once
                no_data_timeout = None;
                shared.report(ReadoutError::NoDataTimeout(limit));
            }
        }
        match tlu.get_fifo_data() {
            Err(e) => {
                no_data_timeout = None;
                let handled = shared.report(ReadoutError::Device(e));
                if !handled || shared.stop_readout.is_set() {
                    break;
                }
            }
            Ok(data) if !data.is_empty() => {
                shared.record_count.fetch_add(data.len() as u64, Ordering::SeqCst);
                let (timestamp_start, timestamp_stop) = shared.update_timestamp();
                last_data_time = timestamp_stop;
                let skipped_triggers = match tlu.master().skip_trig_counter() {
                    Ok(count) => count as u64,
                    Err(e) => {
                        shared.report(ReadoutError::Device(e));
                        0
                    }
                };
                let words = data.len();
                let chunk = DataChunk {
                    data,
                    timestamp_start,
                    timestamp_stop,
                    error: 0,
                    skipped_triggers,
                };
                if fill_buffer {
                    shared.push_buffer(chunk.clone());
                }
                if let Some(tx) = &queue {
                    let _ = tx.send(Some(chunk));
                }
                shared.push_words(words);
            }
            Ok(_) => {
                // drained empty: a graceful stop may now complete
                if shared.stop_readout.is_set() {
                    break;
                }
                shared.push_words(0);
            }
        }
        if shared.rate_request.swap(false, Ordering::SeqCst) {
            let sum: usize = shared.words_per_read.lock().unwrap().iter().sum();
            let _ = shared.rate_tx.try_send(sum);
        }
        let wait = READOUT_INTERVAL.saturating_sub(tick.elapsed());
        if shared.force_stop.wait(wait) {
            break;
        }
    }
    if let Some(tx) = &queue {
        let _ = tx.send(None); // poison, stops the worker
    }
    log::debug!("stopped readout thread");
}

fn consumer_loop(rx: Receiver<Option<DataChunk>>, mut callback: DataCallback, shared: Arc<Shared>) {
    log::debug!("starting worker thread");
    while let Ok(item) = rx.recv() {
        let Some(chunk) = item else { break };
        if let Err(e) = callback(&chunk) {
            shared.report(ReadoutError::Callback(e.to_string()));
        }
    }
    log::debug!("stopped worker thread");
}

fn watchdog_loop(tlu: Arc<Tlu>, shared: Arc<Shared>) {
    log::debug!("starting watchdog thread");
    loop {
        match tlu.master().lost_data_cnt() {
            Ok(0) => {}
            Ok(count) => {
                shared.report(ReadoutError::FifoLost(count));
            }
            Err(e) => {
                shared.report(ReadoutError::Device(e));
            }
        }
        if shared.stop_readout.wait(WATCHDOG_INTERVAL) {
            break;
        }
    }
    log::debug!("stopped watchdog thread");
}
