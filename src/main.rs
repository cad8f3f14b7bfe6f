//! Still timelapse recorder

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lapse::capture::V4l2StillCamera;
use lapse::output::FileOutput;
use lapse::pipeline::cancel::{listen_for_keys, listen_for_signals};
use lapse::pipeline::{CancellationSource, LapseApp, RunOutcome, RunSummary, SystemClock};
use lapse::{utils, Codec, Config, LapseError, CONFIG};

#[derive(Parser, Debug)]
#[command(name = "lapse")]
#[command(about = "Capture a still timelapse and encode it as video")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Time between captures, e.g. 500ms, 10s, 2min (bare numbers are ms)
    #[arg(long)]
    interval: Option<String>,

    /// Total run time; 0 runs until stopped
    #[arg(short, long)]
    timeout: Option<String>,

    /// Encoded output file, or - for stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Write per-frame metadata as JSON lines to this file
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Run an autofocus scan before the first capture
    #[arg(long)]
    autofocus_on_capture: bool,

    /// Frame rate used for output timestamps
    #[arg(long)]
    framerate: Option<f64>,

    #[arg(long, value_enum)]
    codec: Option<Codec>,

    /// Capture device, auto-detected when omitted
    #[arg(short, long)]
    device: Option<String>,

    /// Stop when x is entered on stdin
    #[arg(short, long)]
    keypress: bool,

    /// SIGUSR2 stops the run, SIGUSR1 confirms
    #[arg(short, long)]
    signal: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(interval) = &self.interval {
            config.lapse.interval = interval.clone();
        }
        if let Some(timeout) = &self.timeout {
            config.lapse.timeout = timeout.clone();
        }
        if let Some(output) = &self.output {
            config.output.path = output.clone();
        }
        if let Some(metadata) = &self.metadata {
            config.output.metadata = Some(metadata.clone());
        }
        if let Some(framerate) = self.framerate {
            config.lapse.framerate = Some(framerate);
        }
        if let Some(codec) = self.codec {
            config.encoder.codec = codec;
        }
        if let Some(device) = &self.device {
            config.camera.device = device.clone();
        }
        config.lapse.autofocus_on_capture |= self.autofocus_on_capture;
        config.lapse.keypress |= self.keypress;
        config.lapse.signal |= self.signal;
    }
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = Args::parse();

    let level = match args.verbose {
        0 => "lapse=info",
        1 => "lapse=debug",
        _ => "lapse=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Lapse launching...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(args));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    if config.camera.device.is_empty() {
        config.camera.device = utils::auto_detect_device()?;
    }
    info!("Using capture device: {}", config.camera.device);
    CONFIG.store(Arc::new(config));
    let config = CONFIG.load_full();

    let cancel = CancellationSource::new(config.lapse.keypress, config.lapse.signal);
    let signals = tokio::spawn(listen_for_signals(cancel.handle()));
    if config.lapse.keypress {
        tokio::spawn(listen_for_keys(cancel.handle()));
    }

    let summary = tokio::task::spawn_blocking(move || -> lapse::Result<RunSummary> {
        let output = FileOutput::create(&config.output).map_err(LapseError::Output)?;
        let mut camera = V4l2StillCamera::new(config.camera.clone());
        LapseApp::new(&config, &mut camera, SystemClock, &cancel).run(Box::new(output))
    })
    .await??;
    signals.abort();

    match summary.outcome {
        RunOutcome::Failed(err) => Err(err.into()),
        RunOutcome::Completed | RunOutcome::Cancelled => {
            info!("Lapse shutting down");
            Ok(())
        }
    }
}
