//! Sonic Pi CLI - The `sonicpi` command.
//!
//! Drives a runtime from the terminal using the `sonicpi-api` control plane:
//! start a session, run a file and print what the runtime reports; inspect
//! port discovery; or preview the spectrum pipeline on a WAV file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use sonicpi_api::{
    discover_ports, ApiEvent, ApiOptions, AudioPipeline, ChannelClient, MessageType,
    Paths, ProcessSupervisor, SonicPiApi, StatusType,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sonic Pi - Live Coding Control Plane
#[derive(Parser, Debug)]
#[command(name = "sonicpi")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive the Sonic Pi runtime from the command line", long_about = None)]
struct Args {
    /// Options file (TOML) overriding timeouts, commands and audio settings
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the runtime and run a file
    Run {
        /// Code to run
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Application root of the Sonic Pi installation
        #[arg(short, long, value_name = "DIR")]
        root: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(short, long, value_name = "SECS")]
        duration: Option<u64>,

        /// Buffer name to run the code as
        #[arg(long, default_value = "workspace_zero")]
        buffer: String,
    },

    /// Run port discovery and print the assigned ports
    Ports {
        /// Application root of the Sonic Pi installation
        #[arg(short, long, value_name = "DIR")]
        root: PathBuf,
    },

    /// Feed a WAV file through the spectrum pipeline and print the buckets
    Spectrum {
        #[arg(value_name = "WAV")]
        file: PathBuf,

        /// Maximum number of buckets per frame
        #[arg(short, long, default_value_t = 16)]
        buckets: usize,

        /// Print every Nth frame
        #[arg(long, default_value_t = 1)]
        every: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let options = load_options(args.config.as_deref())?;

    match args.command {
        Commands::Run {
            file,
            root,
            duration,
            buffer,
        } => run_file(options, &file, &root, duration.map(Duration::from_secs), &buffer),
        Commands::Ports { root } => print_ports(&options, &root),
        Commands::Spectrum {
            file,
            buckets,
            every,
        } => print_spectrum(&options, &file, buckets, every.max(1)),
        Commands::Version => {
            println!("sonicpi {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Control plane for the Sonic Pi live-coding runtime");
            Ok(())
        }
    }
}

fn load_options(path: Option<&Path>) -> Result<ApiOptions> {
    match path {
        Some(path) => ApiOptions::load(path)
            .with_context(|| format!("Failed to load options from {}", path.display())),
        None => Ok(ApiOptions::default()),
    }
}

fn run_file(
    options: ApiOptions,
    file: &Path,
    root: &Path,
    duration: Option<Duration>,
    buffer: &str,
) -> Result<()> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("Failed to install Ctrl+C handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))
        .context("Failed to install SIGTERM handler")?;

    let (client, events) = ChannelClient::new();
    let mut api = SonicPiApi::with_options(Arc::new(client.without_audio()), options);

    log::info!("Starting runtime from {}", root.display());
    api.init(root).context("Failed to start session")?;
    api.wait_for_server()
        .with_context(|| format!("Runtime did not start\n{}", api.logs()))?;
    log::info!("Session {} ready", api.guid());

    api.run(buffer, &code).context("Failed to run file")?;
    log::info!("Running {} (Ctrl+C to stop)", file.display());

    let deadline = duration.map(|d| Instant::now() + d);
    while !interrupted.load(Ordering::Relaxed) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let exited = matches!(&event, ApiEvent::Status(s) if s.kind == StatusType::Exited);
                println!("{}", describe(&event));
                if exited {
                    log::error!("Runtime exited");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Stopping...");
    if let Err(e) = api.stop() {
        log::debug!("Stop request failed: {}", e);
    }
    api.shutdown();
    Ok(())
}

fn print_ports(options: &ApiOptions, root: &Path) -> Result<()> {
    let paths = Paths::resolve_for_current_user(root).context("Failed to resolve paths")?;
    let supervisor = ProcessSupervisor::new();
    let ports = discover_ports(&supervisor, &paths, options).context("Port discovery failed")?;
    for (id, port) in ports.iter() {
        println!("{:<24} {}", id.name(), port);
    }
    Ok(())
}

fn print_spectrum(options: &ApiOptions, file: &Path, buckets: usize, every: usize) -> Result<()> {
    let samples = read_stereo(file)?;
    let frame_size = options.audio_frame_size.max(2);

    let (client, events) = ChannelClient::new();
    let mut pipeline = AudioPipeline::new(frame_size, buckets, Some(Arc::new(client)));
    pipeline.enable_spectrum(true);
    pipeline.enable(true);

    println!(
        "{}: {} frames, {} samples per frame, {} buckets",
        file.display(),
        samples.len() / 2,
        frame_size,
        buckets
    );

    for (n, chunk) in samples.chunks(frame_size * 2).enumerate() {
        pipeline.feed(chunk);
        loop {
            match events.recv_timeout(Duration::from_secs(2)) {
                Ok(ApiEvent::AudioDataAvailable) => break,
                Ok(_) => continue,
                Err(_) => anyhow::bail!("Audio pipeline produced no output for frame {}", n),
            }
        }
        let Some(audio) = pipeline.latest() else {
            continue;
        };
        if n % every == 0 {
            let left = &audio.spectrum_quantized[0];
            let line: Vec<String> = left.iter().map(|m| format!("{:.3}", m)).collect();
            println!("{:>6} {}", n, line.join(" "));
        }
        drop(audio);
        pipeline.acknowledge_consumed();
    }

    if pipeline.dropped_frames() > 0 {
        log::warn!("{} frames dropped", pipeline.dropped_frames());
    }
    pipeline.stop();
    Ok(())
}

/// Read a WAV file as interleaved stereo f32. Mono is duplicated; extra
/// channels are ignored.
fn read_stereo(file: &Path) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(file)
        .with_context(|| format!("Failed to open WAV file: {}", file.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let raw: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("Failed to decode samples")?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .context("Failed to decode samples")?
        }
    };

    let mut out = Vec::with_capacity(raw.len() / channels * 2);
    for frame in raw.chunks(channels) {
        let left = frame[0];
        let right = frame.get(1).copied().unwrap_or(left);
        out.push(left);
        out.push(right);
    }
    Ok(out)
}

/// One line per event for terminal output.
fn describe(event: &ApiEvent) -> String {
    match event {
        ApiEvent::Report(info) => match info.kind {
            MessageType::Multi => {
                let lines: Vec<&str> = info.multi.iter().map(|m| m.text.as_str()).collect();
                format!("[run {}] {}", info.job_id, lines.join(" | "))
            }
            MessageType::RuntimeError => {
                format!("[error] job {} line {}: {}", info.job_id, info.line, info.text)
            }
            MessageType::SyntaxError => format!(
                "[syntax] job {} line {}: {} ({})",
                info.job_id, info.line, info.text, info.error_line_string
            ),
            MessageType::StartupError => format!("[boot error] {}", info.text),
            MessageType::Internal => format!("[api] {}", info.text),
            _ => format!("[info] {}", info.text),
        },
        ApiEvent::Status(status) => format!("[status] {:?} {}", status.kind, status.id),
        ApiEvent::Cue(cue) => format!("[cue #{}] {} {} {}", cue.index, cue.time, cue.address, cue.args),
        ApiEvent::Midi(midi) => format!("[midi {:?}] {}", midi.kind, midi.port_info),
        ApiEvent::Version(v) => format!(
            "[version] {} (latest {}) on {}",
            v.version, v.latest_version, v.platform
        ),
        ApiEvent::Buffer(b) => format!("[buffer {:?}] {}", b.kind, b.id),
        ApiEvent::AudioDataAvailable => "[audio] snapshot ready".to_string(),
    }
}
