use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tlu_daq::monitor;

/// Online-monitor plumbing: rate converter and a terminal watcher.
#[derive(Debug, Parser)]
#[command(name = "tlu-monitor", rename_all = "snake_case")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Subscribe to the DAQ publisher and republish rate-vs-time curves
    Convert {
        /// DAQ publisher endpoint
        #[arg(long, default_value = "tcp://127.0.0.1:5500")]
        in_addr: String,

        /// Endpoint the rendered curves are published on
        #[arg(long, default_value = "tcp://127.0.0.1:5501")]
        out_addr: String,

        /// Optional REP endpoint accepting RESET or an integration count
        #[arg(long)]
        command_addr: Option<String>,
    },

    /// Print the most recent accepted/real trigger rates
    Watch {
        /// Converter output endpoint
        #[arg(long, default_value = "tcp://127.0.0.1:5501")]
        addr: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tlu_daq::logging::init(None)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    match cli.command {
        Command::Convert { in_addr, out_addr, command_addr } => {
            monitor::run_converter(&in_addr, &out_addr, command_addr.as_deref(), &stop)?
        }
        Command::Watch { addr } => monitor::watch(&addr, &stop)?,
    }
    Ok(())
}
