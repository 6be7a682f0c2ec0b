use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use tlu_daq::config::RunConfig;
use tlu_daq::device::Tlu;
use tlu_daq::eudaq::{
    replay, ControlFlags, EudaqError, EudaqProducer, MockRunControl, RunControl, TluEvent,
    DEFAULT_POLL_INTERVAL,
};
use tlu_daq::sim::SimTransport;
use tlu_daq::sink::TableReader;
use tlu_daq::transport::{Transport, UsbTransport};
use tlu_daq::zest::ZestBoard;

/// TLU producer for a EUDAQ 1.x beam-test DAQ.
///
/// TX_STATE digits: 0=DISABLED 1=WAIT 2=TRIGGERED (wait for busy HIGH)
/// 4=READ_TRIG (wait for busy LOW).
#[derive(Debug, Parser)]
#[command(name = "tlu-eudaq", rename_all = "snake_case")]
struct Cli {
    /// Digital threshold for input (in units of 1.5625 ns)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=31))]
    threshold: u8,

    /// Number of bits for the trigger ID; should match the gateware counter
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u8).range(0..=31))]
    n_bits: u8,

    /// Maximum distance between input rise times (in units of 1.5625 ns)
    #[arg(long, default_value_t = 31, value_parser = clap::value_parser!(u8).range(0..=31))]
    distance: u8,

    /// Timeout to wait for DUT busy; keep 0 when running synchronous DUTs
    #[arg(long, default_value_t = 0)]
    timeout: u16,

    /// Output folder for data and log files
    #[arg(long, default_value = "output_data")]
    output_folder: PathBuf,

    /// Address of the EUDAQ run control (informational; the foreign binding
    /// adapter is hooked up through the RunControl trait)
    #[arg(long, default_value = "tcp://localhost:44000")]
    runcontrol: String,

    /// Replay a recorded table file instead of reading hardware
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Additional per-readout delay during replay, seconds
    #[arg(long)]
    delay: Option<f64>,

    /// Scintillator input bitmap used by the local control loop
    #[arg(long, default_value = "0x1")]
    and_mask: String,

    /// DUT output bitmap used by the local control loop
    #[arg(long, default_value = "0x1")]
    dut_mask: String,

    /// Inverted input bitmap used by the local control loop
    #[arg(long, default_value = "0")]
    inverted_inputs: String,

    /// Internal pulser period in 25 ns units, 0=physical inputs
    #[arg(long, default_value = "0")]
    testpulse: String,

    /// Select the board by EEPROM serial number
    #[arg(long)]
    board_sn: Option<u32>,

    /// Run against the built-in simulated TLU instead of hardware
    #[arg(long)]
    simulate: bool,
}

/// Stand-in run controller when no external EUDAQ binding is attached:
/// configure and start immediately, stop on Ctrl-C, then terminate.
struct LocalControl {
    stop: Arc<AtomicBool>,
    phase: u8,
    drain_polls: u8,
    params: HashMap<String, String>,
    events: u64,
}

impl LocalControl {
    fn new(stop: Arc<AtomicBool>, params: HashMap<String, String>) -> Self {
        LocalControl { stop, phase: 0, drain_polls: 0, params, events: 0 }
    }
}

impl RunControl for LocalControl {
    fn poll(&mut self) -> ControlFlags {
        match self.phase {
            0 => {
                self.phase = 1;
                ControlFlags::configuring()
            }
            1 => {
                self.phase = 2;
                ControlFlags::starting()
            }
            2 => {
                if self.stop.load(Ordering::SeqCst) {
                    self.phase = 3;
                    ControlFlags::stopping()
                } else {
                    ControlFlags::NONE
                }
            }
            // let the producer drain and confirm the stop before terminating
            3 if self.drain_polls < 10 => {
                self.drain_polls += 1;
                ControlFlags::NONE
            }
            _ => ControlFlags::terminating(),
        }
    }

    fn config_parameter(&mut self, key: &str, default: &str) -> String {
        self.params.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    fn run_number(&mut self) -> u32 {
        1
    }

    fn confirm_configured(&mut self) {
        log::info!("Configured");
    }

    fn confirm_started(&mut self) {
        log::info!("Run started (BORE)");
    }

    fn confirm_stopped(&mut self) {
        log::info!("Run stopped (EORE) after {} events", self.events);
    }

    fn send_event(&mut self, event: &TluEvent) -> Result<(), EudaqError> {
        self.events += 1;
        log::debug!(
            "event {} trigger {} timestamp {}",
            event.event_counter,
            event.trigger_id,
            event.time_stamp
        );
        Ok(())
    }

    fn send_event_extra(
        &mut self,
        event: &TluEvent,
        particles: &str,
        tx_state: &str,
    ) -> Result<(), EudaqError> {
        self.events += 1;
        log::info!(
            "event {} trigger {} | particles {} | tx{}",
            event.event_counter,
            event.trigger_id,
            particles,
            tx_state
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.output_folder)
        .with_context(|| format!("creating {}", cli.output_folder.display()))?;
    tlu_daq::logging::init(None)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    if let Some(path) = &cli.replay {
        // pace a captured run through the same event emission path
        let readouts = TableReader::open(path)
            .with_context(|| format!("opening replay file {}", path.display()))?
            .meta_data
            .len();
        let mut script = vec![ControlFlags::configuring(), ControlFlags::starting()];
        script.extend(std::iter::repeat(ControlFlags::NONE).take(readouts));
        script.push(ControlFlags::stopping());
        let mut rc = MockRunControl::new(script);
        replay(&mut rc, path, cli.delay, DEFAULT_POLL_INTERVAL)?;
        log::info!("Replay finished: {} events sent", rc.events.len());
        return Ok(());
    }

    log::info!("Run control at {} (driving the local control loop)", cli.runcontrol);
    let mut params = HashMap::new();
    params.insert("AndMask".to_string(), cli.and_mask.clone());
    params.insert("DutMask".to_string(), cli.dut_mask.clone());
    params.insert("InvertedInputs".to_string(), cli.inverted_inputs.clone());
    params.insert("Testpulse".to_string(), cli.testpulse.clone());
    let rc = LocalControl::new(stop, params);

    let tlu = open_device(&cli)?;
    let base_config = RunConfig {
        threshold: cli.threshold,
        max_distance: cli.distance,
        n_bits_trigger_id: cli.n_bits,
        timeout: cli.timeout,
        ..RunConfig::default()
    };

    let mut producer = EudaqProducer::new(rc, tlu, base_config)
        .with_data_file(cli.output_folder.join("tlu_eudaq.tlu"));
    producer.run()?;
    Ok(())
}

fn open_device(cli: &Cli) -> anyhow::Result<Arc<Tlu>> {
    if cli.simulate {
        log::info!("Using the simulated TLU");
        let transport: Arc<dyn Transport> = Arc::new(SimTransport::new());
        return Ok(Arc::new(Tlu::new(transport)?));
    }
    let board = match cli.board_sn {
        Some(serial) => ZestBoard::open_by_serial(serial)?,
        None => {
            let mut boards = ZestBoard::enumerate().context("enumerating ZestSC1 boards")?;
            anyhow::ensure!(!boards.is_empty(), "no ZestSC1 board found");
            boards.remove(0)
        }
    };
    board.open_card()?;
    let transport: Arc<dyn Transport> = Arc::new(UsbTransport::new(Arc::new(board)));
    Ok(Arc::new(Tlu::new(transport)?))
}
