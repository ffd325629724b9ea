use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gpucmd_replay::{read_entries, replay_entries, DEFAULT_RING_SIZE};
use gpucmd_service::ServiceConfig;

#[derive(Debug, Parser)]
#[command(name = "gpucmd-replay", version, about = "Replay a recorded command buffer stream")]
struct Args {
    /// File of little-endian u32 command buffer entries.
    input: PathBuf,

    /// JSON service configuration; `GPUCMD_*` variables and flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ring buffer size in bytes.
    #[arg(long, default_value_t = DEFAULT_RING_SIZE)]
    ring_size: usize,

    /// Log every dispatched command at trace level.
    #[arg(long)]
    trace_commands: bool,
}

fn load_config(args: &Args) -> Result<ServiceConfig> {
    let base = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open config {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => ServiceConfig::default(),
    };
    let mut config = base.with_overrides(|name| std::env::var(name).ok())?;
    if args.trace_commands {
        config.trace_commands = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let file = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let entries = read_entries(BufReader::new(file))?;
    tracing::debug!(entries = entries.len(), ring_size = args.ring_size, "replaying");

    let report = replay_entries(&entries, &config, args.ring_size)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.state.error.is_error() {
        std::process::exit(1);
    }
    Ok(())
}
