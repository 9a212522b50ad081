//! Run a tick-filtered latency benchmark on host threads.
//!
//! # Usage
//!
//! ```bash
//! # Cross-core round trip between CPU 0 and CPU 1
//! cargo run --release --bin llping -- --preset roundtrip
//!
//! # Response latency under allocation load on 8 cores, with flush markers
//! cargo run --release --bin llping -- --preset response --cores 8 --marker 'FLUSH!!'
//!
//! # Load a saved configuration and print JSON
//! cargo run --release --bin llping -- --config run.json --json
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tickgate::harness::{self, SharedSink};
use tickgate::output::{emit_report, format_terminal, to_json};
use tickgate::{
    Background, NullSink, PayloadKind, RunConfig, SamplerConfig, StdoutSink, Workload,
};

/// Tick-filtered cycle latency benchmark
#[derive(Parser, Debug)]
#[command(name = "llping")]
#[command(about = "Measure operation latency with interrupt-contaminated samples filtered out")]
#[command(version)]
struct Args {
    /// Preset: null, spin, roundtrip, response, alloc
    #[arg(short, long, default_value = "roundtrip")]
    preset: String,

    /// JSON configuration file (overrides the preset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Participating cores
    #[arg(long)]
    cores: Option<usize>,

    /// Completed iterations per test
    #[arg(short, long)]
    samples: Option<usize>,

    /// Upper bound on attempts, including rejected ones
    #[arg(long)]
    max_attempts: Option<usize>,

    /// A-priori expected mean in cycles
    #[arg(long)]
    baseline: Option<u64>,

    /// Reject samples above this many cycles
    #[arg(long)]
    ceiling: Option<u64>,

    /// Emulated timer period in microseconds (0 disables)
    #[arg(long)]
    tick_us: Option<u64>,

    /// Run interference on every spare core
    #[arg(long)]
    interfere: bool,

    /// Treat the receiver reply as an opaque sentinel instead of a timestamp
    #[arg(long)]
    sentinel: bool,

    /// Text emitted at every flush point
    #[arg(long)]
    marker: Option<String>,

    /// Do not pin threads to CPUs
    #[arg(long)]
    no_pin: bool,

    /// Also report the unfiltered average
    #[arg(long)]
    unfiltered: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    save_config: Option<PathBuf>,
}

fn preset(name: &str) -> Option<RunConfig> {
    let config = match name.to_lowercase().as_str() {
        "null" => RunConfig::new().cores(1).workload(Workload::Null),
        "spin" => RunConfig::new()
            .cores(1)
            .workload(Workload::Spin { iterations: 100 }),
        "roundtrip" | "ipi" => RunConfig::new()
            .cores(2)
            .workload(Workload::RoundTrip)
            .sampler(SamplerConfig::ipi()),
        "response" => RunConfig::new()
            .cores(4)
            .workload(Workload::Response)
            .background(Background::Interfere)
            .sampler(SamplerConfig::response()),
        "alloc" | "alloc-free" => RunConfig::new()
            .cores(1)
            .workload(Workload::AllocFree)
            .sampler(SamplerConfig::mem_map())
            .reverse_baseline(3_248),
        _ => return None,
    };
    Some(config)
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match RunConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Cannot load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => match preset(&args.preset) {
            Some(config) => config,
            None => {
                eprintln!(
                    "Unknown preset '{}'. Available: null, spin, roundtrip, response, alloc",
                    args.preset
                );
                std::process::exit(1);
            }
        },
    };

    // Apply overrides
    if let Some(cores) = args.cores {
        config.cores = cores;
    }
    if let Some(samples) = args.samples {
        config.sampler.samples = samples;
    }
    if args.max_attempts.is_some() {
        config.sampler.max_attempts = args.max_attempts;
    }
    if let Some(baseline) = args.baseline {
        config.sampler.baseline = baseline;
    }
    if let Some(ceiling) = args.ceiling {
        config.sampler.outlier_ceiling = ceiling;
    }
    if let Some(us) = args.tick_us {
        config.tick_period_us = us;
    }
    if args.interfere {
        config.background = Background::Interfere;
    }
    if args.sentinel {
        config.payload = PayloadKind::Sentinel;
    }
    if args.marker.is_some() {
        config.flush_marker = args.marker.clone();
    }
    if args.no_pin {
        config.pin_cores = false;
    }
    if args.unfiltered {
        config.unfiltered = true;
    }

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    if let Some(path) = &args.save_config {
        let written = config
            .to_json()
            .and_then(|json| fs::write(path, json).map_err(Into::into));
        if let Err(e) = written {
            eprintln!("Cannot write {}: {}", path.display(), e);
            std::process::exit(1);
        }
        println!("Configuration written to {}", path.display());
        return;
    }

    // Flush markers go to stdout only in text mode; JSON output stays parseable.
    let sink: SharedSink = if args.json {
        Arc::new(NullSink)
    } else {
        Arc::new(StdoutSink)
    };

    let report = match harness::run(&config, sink) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Run failed: {}", e);
            std::process::exit(1);
        }
    };

    if args.json {
        match to_json(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Cannot serialise report: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        emit_report(&StdoutSink, &report);
        println!();
        print!("{}", format_terminal(&report));
    }
}
