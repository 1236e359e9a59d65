//! CLI entry point for rust-capture
//!
//! Provides two commands:
//! - `run`: capture from the simulated camera into a capture file
//! - `inspect`: summarise an existing capture file
//!
//! # Usage
//!
//! ```bash
//! rust-capture run --frames 500 --output capture.bin
//! rust-capture inspect capture.bin
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_capture::config::Settings;
use rust_capture::source::MockCamera;
use rust_capture::storage::summarize;
use rust_capture::{logging, Engine};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rust-capture")]
#[command(about = "Three-stage camera capture pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames from the simulated camera
    Run {
        /// Configuration file (defaults to config/capture.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Frames to acquire; -1 runs until Ctrl-C
        #[arg(long, allow_hyphen_values = true)]
        frames: Option<i64>,

        /// Output capture file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Log status lines at INFO
        #[arg(long)]
        verbose: bool,

        /// Telemetry print period in milliseconds
        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },

    /// Summarise a capture file
    Inspect {
        /// Capture file to read
        file: PathBuf,
    },
}

/// What a Ctrl-C should do, given how many came before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// Stop acquisition and let the queued frames drain
    Drain,
    /// Give up on the drain and exit
    Exit,
}

/// Ctrl-C counter shared between the signal handler and the poll loop.
#[derive(Debug, Default)]
struct Interrupts(AtomicUsize);

impl Interrupts {
    fn register(&self) -> InterruptAction {
        match self.0.fetch_add(1, Ordering::SeqCst) {
            0 => InterruptAction::Drain,
            _ => InterruptAction::Exit,
        }
    }

    fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            frames,
            output,
            verbose,
            poll_ms,
        } => run_capture(config, frames, output, verbose, Duration::from_millis(poll_ms.max(1))),
        Commands::Inspect { file } => inspect(&file),
    }
}

fn run_capture(
    config: Option<PathBuf>,
    frames: Option<i64>,
    output: Option<PathBuf>,
    verbose: bool,
    poll: Duration,
) -> Result<()> {
    let mut settings = match config {
        Some(path) => Settings::load_from(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::load().context("loading configuration")?,
    };
    if let Some(frames) = frames {
        settings.engine.frame_limit = frames;
    }
    if let Some(output) = output {
        settings.engine.output_path = output;
    }
    settings.engine.verbose |= verbose;
    logging::init_from_settings(&settings)?;

    let camera = MockCamera::new(settings.camera.mock_config()?);
    let engine = Engine::from_settings(camera, &settings)?;

    let interrupts = Arc::new(Interrupts::default());
    {
        let interrupts = Arc::clone(&interrupts);
        ctrlc::set_handler(move || {
            if interrupts.register() == InterruptAction::Exit {
                eprintln!("Interrupted again, exiting without draining");
                process::exit(130);
            }
        })
        .context("installing Ctrl-C handler")?;
    }

    engine.start()?;
    println!(
        "Capturing to {} (limit {}), Ctrl-C to stop, twice to abort",
        engine.output_path().display(),
        engine.frame_limit()
    );

    let mut stop_sent = false;
    while !engine.wait_stopped(poll) {
        if interrupts.requested() && !stop_sent {
            println!("Stopping, draining queued frames...");
            engine.stop();
            stop_sent = true;
        }
        let snap = engine.snapshot();
        let temperature = snap
            .sensor_temperature
            .map(|celsius| format!(" | sensor {celsius:.1} C"))
            .unwrap_or_default();
        println!(
            "acquire {:>8.1} fps | process {:>8.1} fps | write {:>8.1} fps | queues {}/{} {}/{}{temperature}",
            snap.acquire_fps,
            snap.process_fps,
            snap.write_fps,
            snap.queues.process,
            snap.queues.process_capacity,
            snap.queues.write,
            snap.queues.write_capacity,
        );
    }

    let counts = engine.snapshot().counts;
    println!(
        "Done: {} acquired, {} written, {} lost",
        counts.acquired,
        counts.written,
        counts.lost()
    );
    for fault in engine.faults() {
        println!("  {fault}");
    }
    engine.check()?;
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let summary = summarize(path).with_context(|| format!("reading {}", path.display()))?;
    println!("File:       {}", path.display());
    println!("Frames:     {}", summary.frames);
    if let Some((width, height, encoding)) = summary.geometry {
        println!("Geometry:   {width}x{height} {encoding}");
    }
    if let (Some(first), Some(last)) = (summary.first_sequence, summary.last_sequence) {
        println!("Sequences:  {first}..={last}");
    }
    println!("Contiguous: {}", if summary.contiguous { "yes" } else { "no" });
    println!("Payload:    {} bytes", summary.payload_bytes);
    Ok(())
}
