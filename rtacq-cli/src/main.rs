//! CLI for the rtacq real-time acquisition layer.
//!
//! Validates module configs and runs receivers and transmitters against a
//! live UDP stream.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use rtacq::clock::{Clock, SystemClock};
use rtacq::{AcquisitionConfig, AcquisitionPipeline, Buffering, DataStatus, ModuleRole};
use tracing_subscriber::EnvFilter;

/// rtacq: real-time datagram acquisition CLI.
#[derive(Parser)]
#[command(name = "rtacq", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Validate a module config and print its effective settings.
    Check {
        /// Path to the JSON config.
        config: PathBuf,
    },

    /// Run a receiver with a simulated control cycle reading it.
    Receive {
        /// Path to the JSON config of a receiver.
        config: PathBuf,

        /// How long to run (e.g., "500ms", "10s", "5m").
        #[arg(long, default_value = "10s")]
        duration: String,

        /// Control cycle period in microseconds.
        #[arg(long, default_value = "1000")]
        cycle_us: u64,

        /// Interval between counter reports.
        #[arg(long, default_value = "1s")]
        report_every: String,
    },

    /// Send synthetic frames from a transmitter.
    Transmit {
        /// Path to the JSON config of a transmitter.
        config: PathBuf,

        /// Number of datagrams to send.
        #[arg(long, default_value = "1000")]
        count: u64,

        /// Send period in microseconds (defaults to the producer period).
        #[arg(long)]
        period_us: Option<u64>,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { config } => cmd_check(&config),
        Commands::Receive {
            config,
            duration,
            cycle_us,
            report_every,
        } => cmd_receive(&config, &duration, cycle_us, &report_every),
        Commands::Transmit {
            config,
            count,
            period_us,
        } => cmd_transmit(&config, count, period_us),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Implements `rtacq check <config>`.
fn cmd_check(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = AcquisitionConfig::from_json_file(path)?;

    println!("Module: {} ({})", config.name, config.role.as_str());
    println!("  Datagram: {} bytes ({} payload)", config.datagram_size(), config.payload_size);
    match config.buffering {
        Buffering::Trailing => println!("  Buffering: trailing (3 slots)"),
        Buffering::Scan {
            slots,
            units_per_packet,
        } => println!(
            "  Buffering: scan ({slots} slots, {units_per_packet} units of {} bytes per datagram)",
            config.unit_size()
        ),
    }
    println!(
        "  Sequence: mod 2^{}, up to {} lost packets before rollover",
        config.sequence_bits, config.max_lost_packets
    );
    match config.max_data_age_us {
        0 => println!("  Max data age: unlimited"),
        age => println!("  Max data age: {age} us"),
    }
    if let Some(period) = config.producer_period_us {
        println!("  Producer period: {period} us ±{}%", config.period_tolerance_pct);
    }
    match config.role {
        ModuleRole::Receiver => {
            if let Some(port) = config.listen_port {
                println!("  Listen port: {port}");
            }
            if let Some(mask) = config.cpu_mask {
                println!("  CPU mask: {mask:#x}");
            }
            if let Some(priority) = config.receiver_priority {
                println!("  Receiver priority: SCHED_FIFO {priority}");
            }
        }
        ModuleRole::Transmitter => {
            if let Some(destination) = &config.destination {
                println!("  Destination: {destination}");
            }
        }
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}

/// Implements `rtacq receive <config>`.
fn cmd_receive(
    path: &Path,
    duration: &str,
    cycle_us: u64,
    report_every: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AcquisitionConfig::from_json_file(path)?;
    if config.role != ModuleRole::Receiver {
        return Err(format!("'{}' is not a receiver config", path.display()).into());
    }
    let run_for = parse_duration(duration)?;
    let report_interval = parse_duration(report_every)?;
    let cycle = Duration::from_micros(cycle_us.max(1));

    let mut pipeline = AcquisitionPipeline::new(config)?;
    pipeline.claim_input()?;
    pipeline.enable_acquisition()?;

    if pipeline.config().sync.is_some() && !pipeline.poll()? {
        tracing::warn!("no data within the sync timeout, starting anyway");
    }

    let clock = SystemClock;
    let mut unit = vec![0u8; pipeline.config().unit_size()];
    let (mut ready, mut stale, mut not_ready) = (0u64, 0u64, 0u64);

    let start = Instant::now();
    let mut next_cycle = start;
    let mut next_report = start + report_interval;

    while start.elapsed() < run_for {
        match pipeline.get_data(clock.now_us(), &mut unit)? {
            DataStatus::Ready { .. } => ready += 1,
            DataStatus::Stale { .. } => stale += 1,
            DataStatus::NotReady => not_ready += 1,
        }

        let now = Instant::now();
        if now >= next_report {
            println!("{}", serde_json::to_string(&pipeline.counters())?);
            next_report += report_interval;
        }

        next_cycle += cycle;
        if let Some(wait) = next_cycle.checked_duration_since(now) {
            std::thread::sleep(wait);
        }
    }

    pipeline.disable_acquisition();
    pipeline.release_claims();

    let summary = serde_json::json!({
        "cycles": ready + stale + not_ready,
        "ready": ready,
        "stale": stale,
        "not_ready": not_ready,
        "counters": pipeline.counters(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

/// Implements `rtacq transmit <config>`.
fn cmd_transmit(
    path: &Path,
    count: u64,
    period_us: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AcquisitionConfig::from_json_file(path)?;
    if config.role != ModuleRole::Transmitter {
        return Err(format!("'{}' is not a transmitter config", path.display()).into());
    }
    let period = Duration::from_micros(
        period_us
            .or(config.producer_period_us)
            .unwrap_or(1_000)
            .max(1),
    );

    let mut pipeline = AcquisitionPipeline::new(config)?;
    pipeline.claim_output()?;
    pipeline.pulse_start();

    let clock = SystemClock;
    let mut payload = vec![0u8; pipeline.config().payload_size];
    let start = Instant::now();
    let mut next_send = start;

    for n in 0..count {
        fill_sawtooth(&mut payload, n);
        pipeline.write_data(clock.now_us(), &payload)?;

        next_send += period;
        if let Some(wait) = next_send.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    pipeline.release_claims();
    println!(
        "Sent {count} datagrams to {} in {:.3?}",
        pipeline.config().destination.as_deref().unwrap_or("?"),
        start.elapsed()
    );

    Ok(())
}

/// Fills `payload` with host-order u32 words counting up from `n`.
#[allow(clippy::cast_possible_truncation)] // synthetic data wraps
fn fill_sawtooth(payload: &mut [u8], n: u64) {
    for (i, word) in payload.chunks_exact_mut(4).enumerate() {
        let value = n.wrapping_add(i as u64) as u32;
        word.copy_from_slice(&value.to_ne_bytes());
    }
}

/// Parses a human-readable duration string (e.g., "500ms", "10s", "5m").
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(ms.parse()?));
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse()?;

    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use ms, s, m, or h.").into()),
    };

    Ok(Duration::from_secs(secs))
}
