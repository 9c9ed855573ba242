//! pcmcap - raw PCM capture CLI

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pcmcap::audio::{CaptureController, ResidualPolicy};
use pcmcap::config::{Args, Command, RecorderConfig};
use pcmcap::device::{default_backend, enumerate_input_devices};
use pcmcap::sink::{self, wrap_raw_as_wav, RawFileSink, SharedSink};

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::load_default()?,
    };

    // Initialize logging
    init_logging(&args, &config)?;

    // Execute command
    match args.command.clone().unwrap_or_default() {
        Command::Record {
            output,
            duration,
            device,
            buffers,
            discard_residual,
            wav,
        } => {
            let mut config = config;
            if let Some(output) = output {
                config.output = output.to_string_lossy().into_owned();
            }
            if let Some(duration) = duration {
                config.duration_secs = duration;
            }
            if let Some(device) = device {
                config.device_index = device;
            }
            if let Some(buffers) = buffers {
                config.buffer_count = buffers;
            }
            if discard_residual {
                config.flush_residual = false;
            }
            if let Some(wav) = wav {
                config.wav_output = wav.to_string_lossy().into_owned();
            }
            config.validate()?;
            cmd_record(&config)
        }
        Command::List => cmd_list(),
        Command::SampleConfig => {
            print!("{}", RecorderConfig::sample_config());
            Ok(())
        }
    }
}

fn init_logging(args: &Args, config: &RecorderConfig) -> Result<()> {
    let level = args
        .log_level()
        .map(|level| level.to_string())
        .unwrap_or_else(|| config.log_level.clone());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args
        .log
        .clone()
        .or_else(|| (!config.log_file.is_empty()).then(|| config.log_file.clone()));

    if let Some(log_file) = log_file {
        let file = std::fs::File::create(&log_file)
            .with_context(|| format!("cannot create log file '{}'", log_file))?;
        subscriber.with_writer(file).with_ansi(false).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// List input devices
fn cmd_list() -> Result<()> {
    let backend = default_backend();
    let devices = enumerate_input_devices(backend.as_ref());

    if devices.is_empty() {
        println!("No input devices found.");
        return Ok(());
    }

    println!("Input devices:\n");
    for device in &devices {
        println!("  {}", device);
        println!("     formats: {}", device.caps.formats.names().join(" "));
    }
    println!();
    Ok(())
}

/// Record to a raw file
fn cmd_record(config: &RecorderConfig) -> Result<()> {
    let output = PathBuf::from(&config.output);
    let file_sink = sink::shared(
        RawFileSink::create(&output)
            .with_context(|| format!("cannot create output file '{}'", output.display()))?,
    );

    let mut controller = CaptureController::with_default_backend(config.to_controller_config());
    controller.set_sink(file_sink.clone() as SharedSink)?;

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Ctrl+C handler unavailable: {}", e);
    }

    if let Err(e) = controller.start() {
        error!("Failed to start recording: {}", e);
        anyhow::bail!(controller.error_message().unwrap_or_else(|| e.to_string()));
    }

    if let Some(format) = controller.format() {
        println!("Audio format: {}", format);
    }
    println!(
        "Recording to {} for {:.1}s. Press Ctrl+C to stop early.",
        output.display(),
        config.duration_secs
    );

    let deadline = Instant::now() + config.duration();
    while running.load(Ordering::SeqCst) && Instant::now() < deadline && !controller.failed() {
        std::thread::sleep(Duration::from_millis(50));
    }

    if let Err(e) = controller.stop() {
        warn!("Stop reported: {}", e);
    }

    if let Some(message) = controller.error_message() {
        anyhow::bail!(message);
    }

    let written = file_sink.lock().bytes_written();
    let format = controller
        .format()
        .context("recording finished without a negotiated format")?;
    println!(
        "Stopped. {} bytes ({} ms) written to {}",
        written,
        format.bytes_to_ms(written as usize),
        output.display()
    );
    if config.to_controller_config().residual == ResidualPolicy::Discard {
        info!("Residual samples at stop were discarded");
    }

    if !config.wav_output.is_empty() {
        let wav = PathBuf::from(&config.wav_output);
        let frames = wrap_raw_as_wav(&output, &wav, &format)
            .with_context(|| format!("cannot write WAV file '{}'", wav.display()))?;
        println!("Wrote {} frames to {}", frames, wav.display());
    }

    Ok(())
}
