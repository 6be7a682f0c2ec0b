use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use tlu_daq::config::{InputChannel, OutputChannel, RunConfig};
use tlu_daq::device::Tlu;
use tlu_daq::run::{run, RunArgs, RunError, RunPaths};
use tlu_daq::sim::SimTransport;
use tlu_daq::transport::{Transport, UsbTransport};
use tlu_daq::zest::{Bitfile, ZestBoard};

/// TLU DAQ, e.g. `tlu-daq --output_enable CH0 --input_enable CH0`
#[derive(Debug, Parser)]
#[command(name = "tlu-daq", rename_all = "snake_case")]
struct Cli {
    /// Enable input channels (CH0..CH3)
    #[arg(long, value_name = "CHx", value_delimiter = ',')]
    input_enable: Vec<InputChannel>,

    /// Enable output channels; CHx and LEMOx with the same digit are exclusive
    #[arg(long, value_name = "CHx/LEMOx", value_delimiter = ',', required = true)]
    output_enable: Vec<OutputChannel>,

    /// Invert input and detect positive edges
    #[arg(long, value_name = "CHx", value_delimiter = ',')]
    input_invert: Vec<InputChannel>,

    /// Digital threshold for input (in units of 1.5625 ns)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=31))]
    threshold: u8,

    /// Maximum distance between input rise times (in units of 1.5625 ns), 0=disabled
    #[arg(long, default_value_t = 31, value_parser = clap::value_parser!(u8).range(0..=31))]
    distance: u8,

    /// Number of bits for the trigger ID
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u8).range(0..=31))]
    n_bits: u8,

    /// Timeout to wait for DUT busy, 0=wait forever
    #[arg(long, default_value_t = 0xffff)]
    timeout: u16,

    /// Generate internal triggers with the given period (in 25 ns units)
    #[arg(long, value_name = "1...n")]
    test: Option<u32>,

    /// Number of generated triggers, 0=infinite
    #[arg(long, default_value_t = 0)]
    count: u16,

    /// Output folder for data and log files
    #[arg(long, default_value = "output_data")]
    output_folder: PathBuf,

    /// Name of the log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Name of the data file
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Online monitor address, e.g. tcp://127.0.0.1:5500
    #[arg(long)]
    monitor_addr: Option<String>,

    /// Stop after this many seconds
    #[arg(long, value_name = "seconds")]
    scan_time: Option<u64>,

    /// Select the board by EEPROM serial number
    #[arg(long)]
    board_sn: Option<u32>,

    /// Program the FPGA with this bit file before the run
    #[arg(long)]
    bit_file: Option<PathBuf>,

    /// Run against the built-in simulated TLU instead of hardware
    #[arg(long)]
    simulate: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths =
        match RunPaths::derive(&cli.output_folder, cli.log_file.clone(), cli.data_file.clone()) {
            Ok(paths) => paths,
            Err(e) => {
                eprintln!("cannot prepare output folder: {}", e);
                return ExitCode::from(1);
            }
        };
    if let Err(e) = tlu_daq::logging::init(Some(&paths.log_file)) {
        eprintln!("cannot open log file: {}", e);
        return ExitCode::from(1);
    }
    log::info!("Initializing run {}", paths.run_name);

    let config = RunConfig {
        input_enable: cli.input_enable.clone(),
        output_enable: cli.output_enable.clone(),
        input_invert: cli.input_invert.clone(),
        threshold: cli.threshold,
        max_distance: cli.distance,
        n_bits_trigger_id: cli.n_bits,
        timeout: cli.timeout,
        test: cli.test,
        count: cli.count,
    };
    if let Err(e) = config.validate() {
        log::error!("{}", e);
        return ExitCode::from(2);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)).is_err() {
            log::warn!("could not install Ctrl-C handler");
        }
    }

    let (tlu, board) = match open_device(&cli) {
        Ok(opened) => opened,
        Err(e) => {
            log::error!("{:#}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = tlu.init() {
        log::error!("{}", e);
        return ExitCode::from(1);
    }

    let args = RunArgs {
        config,
        data_file: paths.data_file,
        monitor_addr: cli.monitor_addr.clone(),
        scan_time: cli.scan_time.map(Duration::from_secs),
    };
    let code = match run(tlu, &args, stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(e)) => {
            log::error!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(1)
        }
    };

    if let Some(board) = board {
        if let Err(e) = board.close_board() {
            log::warn!("closing board failed: {}", e);
        }
    }
    code
}

fn open_device(cli: &Cli) -> anyhow::Result<(Arc<Tlu>, Option<Arc<ZestBoard>>)> {
    if cli.simulate {
        log::info!("Using the simulated TLU");
        let transport: Arc<dyn Transport> = Arc::new(SimTransport::new());
        return Ok((Arc::new(Tlu::new(transport)?), None));
    }

    let board = match cli.board_sn {
        Some(serial) => ZestBoard::open_by_serial(serial)?,
        None => {
            let mut boards = ZestBoard::enumerate().context("enumerating ZestSC1 boards")?;
            anyhow::ensure!(!boards.is_empty(), "no ZestSC1 board found");
            let board = boards.remove(0);
            if let Ok(identity) = board.identity() {
                log::info!("Found USB board: {}", identity);
            }
            board
        }
    };
    board.open_card()?;

    if let Some(path) = &cli.bit_file {
        let bitfile =
            Bitfile::open(path).with_context(|| format!("reading bit file {}", path.display()))?;
        board.load_bitfile(&bitfile)?;
    }

    let board = Arc::new(board);
    let transport: Arc<dyn Transport> = Arc::new(UsbTransport::new(board.clone()));
    Ok((Arc::new(Tlu::new(transport)?), Some(board)))
}
