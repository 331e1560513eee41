//! Trace-driven simulator CLI.
//!
//! This binary wires the simulated machine from its default configuration,
//! opens one trace per simulated CPU, runs the warm-up and measured phases,
//! and prints the statistics report. Exit code 0 on normal completion,
//! nonzero on I/O errors or deadlock.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tracesim_core::{Config, Machine, TraceReader};

#[derive(Parser, Debug)]
#[command(
    name = "tracesim",
    author,
    version,
    about = "Cycle-accurate out-of-order CPU simulator",
    long_about = "Replay pre-recorded instruction traces through a timing model of an\n\
                  out-of-order core, a multi-level cache hierarchy, and DRAM.\n\n\
                  Examples:\n  tracesim --warmup-instructions 1000000 --simulation-instructions 10000000 trace.xz\n  tracesim --json stats.json trace0.xz trace1.xz"
)]
struct Cli {
    /// Instructions to run before measurement begins.
    #[arg(long, default_value_t = 1_000_000)]
    warmup_instructions: u64,

    /// Instructions to measure.
    #[arg(long, default_value_t = 10_000_000)]
    simulation_instructions: u64,

    /// Instructions between progress lines.
    #[arg(long, default_value_t = 1_000_000)]
    heartbeat_instructions: u64,

    /// Also write the report as JSON to this path.
    #[arg(long)]
    json: Option<std::path::PathBuf>,

    /// Trace files, one per simulated CPU.
    #[arg(required = true)]
    traces: Vec<std::path::PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut readers = Vec::new();
    for path in &cli.traces {
        match TraceReader::open(path) {
            Ok(reader) => readers.push(reader),
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    let config = Config::default();
    let mut machine = Machine::new(&config, readers);

    let result = machine.run(
        cli.warmup_instructions,
        cli.simulation_instructions,
        cli.heartbeat_instructions,
    );

    let (report, code) = match result {
        Ok(report) => (report, ExitCode::SUCCESS),
        Err(e) => {
            // Whatever was measured so far still gets reported.
            eprintln!("tracesim: {}", e);
            (machine.report(), ExitCode::FAILURE)
        }
    };

    report.print();

    if let Some(path) = &cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(path, serialized) {
                    eprintln!("{}: {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            }
            Err(e) => {
                eprintln!("could not serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    code
}
