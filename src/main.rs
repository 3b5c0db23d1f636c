use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use shuttersync::config::SystemConfig;
use shuttersync::sim::{self, SimScenario};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate the GPS-disciplined shutter drive on the host", long_about = None)]
struct Args {
    /// JSON config file; missing fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated reference seconds
    #[arg(long, default_value_t = 120)]
    seconds: u32,

    /// Oscillator error against its nominal frequency
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    drift_ppm: f64,

    /// Uniform jitter on every reference edge (+/- us)
    #[arg(long, default_value_t = 2)]
    jitter_us: u32,

    /// Delay between an edge and the poller servicing it
    #[arg(long, default_value_t = 300)]
    poll_latency_us: u32,

    /// Active share of each half-wave, overriding the config
    #[arg(long)]
    duty: Option<u8>,

    /// Inject a spurious edge at this many seconds (repeatable)
    #[arg(long)]
    glitch_at: Vec<f64>,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Print the full report as JSON on stdout
    #[arg(long, default_value_t = false)]
    json: bool,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(duty) = args.duty {
        config.oscillator.duty_percent = Some(duty);
    }
    config.validate().context("Invalid configuration")?;

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Stopping simulation...");
        s.store(true, Ordering::SeqCst);
    })?;

    let scenario = SimScenario {
        seconds: args.seconds,
        drift_ppm: args.drift_ppm,
        jitter_micros: args.jitter_us,
        poll_latency_micros: args.poll_latency_us,
        glitch_at_secs: args.glitch_at,
        seed: args.seed,
        ..SimScenario::default()
    };

    let report = sim::run(&scenario, &config, &stop)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.log_summary();
    }

    if stop.load(Ordering::SeqCst) {
        info!("Interrupted after {} edges.", report.edges);
    }
    info!("Exiting.");
    Ok(())
}
