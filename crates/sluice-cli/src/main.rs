//! The sluice CLI.
//!
//! Builds a filter session from command-line graph specs and runs it
//! to completion:
//!
//! ```text
//! sluice src=in.bin dst=out.bin
//! sluice -i in.bin -o out.bin --threads 4
//! sluice src=in.bin passthrough dst=out.bin
//! sluice filein:src=in.bin:blocksize=1024 fileout:dst=out.bin
//! ```
//!
//! Each positional argument is either `src=URI` (shorthand for the
//! probed source filter), `dst=URI` (probed sink filter) or a
//! `name:arg=val:arg2=val2` filter spec. Exit code 0 on clean
//! termination, else a stable code per error class.

use std::process::ExitCode;

use clap::Parser;
use log::error;

use sluice_rt::{FilterSession, SessionConfig};

mod filters;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Run a filter graph over media/byte streams")]
struct Cli {
    /// Input file, shorthand for a leading `src=FILE`
    #[arg(short = 'i', long = "input")]
    input: Option<String>,

    /// Output file, shorthand for a trailing `dst=FILE`
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Worker threads (0 = run on the main thread)
    #[arg(long = "threads", default_value = "0")]
    threads: usize,

    /// Disable output blocking (producers never back off)
    #[arg(long = "no-block")]
    no_block: bool,

    /// Use lock-free packet queues between filters
    #[arg(long = "lock-free")]
    lock_free: bool,

    /// Print per-filter statistics after the run ("text" or "json")
    #[arg(
        long = "stats",
        value_name = "FORMAT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "text"
    )]
    stats: Option<String>,

    /// List registered filters and exit
    #[arg(long = "list")]
    list: bool,

    /// Graph specs: `src=URI`, `dst=URI` or `name:arg=val`
    graph: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let session = FilterSession::new(SessionConfig {
        threads: cli.threads,
        no_block: cli.no_block,
        lock_free_queues: cli.lock_free,
        ..SessionConfig::default()
    });
    filters::register_all(&session);

    if cli.list {
        for name in session.registry_names() {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let mut specs: Vec<String> = Vec::new();
    if let Some(input) = &cli.input {
        specs.push(format!("src={input}"));
    }
    specs.extend(cli.graph.iter().cloned());
    if let Some(output) = &cli.output {
        specs.push(format!("dst={output}"));
    }
    if specs.is_empty() {
        error!("nothing to do, pass a graph (see --help)");
        return ExitCode::from(2);
    }

    for spec in &specs {
        let loaded = if let Some(url) = spec.strip_prefix("src=") {
            session.load_source(url)
        } else if let Some(url) = spec.strip_prefix("dst=") {
            session.load_destination(url)
        } else {
            session.load(spec)
        };
        if let Err(err) = loaded {
            error!("failed to load '{spec}': {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    }

    let result = session.run();

    if let Some(format) = &cli.stats {
        let stats = session.stats();
        if format == "json" {
            match serde_json::to_string_pretty(&stats) {
                Ok(json) => println!("{json}"),
                Err(err) => error!("stats serialization failed: {err}"),
            }
        } else {
            for f in &stats.filters {
                println!(
                    "{:<24} {:<12} packets {:<8} bytes {:<12} {}",
                    f.name,
                    f.register,
                    f.nb_packets_sent,
                    f.nb_bytes_sent,
                    f.status
                );
            }
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("session ended with error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
