use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use clap::Parser;
use indicatif::ProgressStyle;
use tracing::{info, info_span, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use speedyeye::capture::{CaptureDevice, SyntheticCamera};
use speedyeye::config::Config;
use speedyeye::frame::FPS;
use speedyeye::params::{CameraParam, CameraSettings};
use speedyeye::pipeline::Producer;
use speedyeye::reader::{FrameCursor, Poll, StoreReader};
use speedyeye::store::{SettingsStore, TrackingStore};

#[derive(Parser)]
#[clap(name = "speedyeye", about = "Shared-memory frame ring with sparse motion tracking")]
pub struct Args {
    /// Backing file of the tracking store
    #[clap(long, default_value = "/dev/shm/speedyeye")]
    pub store: PathBuf,
    /// Log per-frame details
    #[clap(short, long)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Capture, track and publish frames
    Run {
        /// `synthetic`, a camera index or a video file
        #[clap(long, default_value = "synthetic")]
        device: String,
        /// Stop after this many frames
        #[clap(long)]
        frames: Option<u64>,
        #[clap(flatten)]
        config: Config,
    },
    /// Follow published frames and report them
    Watch {
        /// Warn when no frame was published for this many seconds
        #[clap(long, default_value = "2")]
        stale_after: f64,
        #[clap(long)]
        frames: Option<u64>,
    },
    /// Inspect or change the tunables in the store header
    Params {
        #[clap(subcommand)]
        action: ParamsAction,
    },
}

#[derive(clap::Subcommand)]
pub enum ParamsAction {
    /// Print all tunables as JSON
    Show,
    Set { name: String, value: String },
    /// Apply every tunable from a JSON file
    Load { file: PathBuf },
}

#[cfg(feature = "opencv")]
fn open_video(source: &str) -> Result<Box<dyn CaptureDevice>> {
    Ok(Box::new(speedyeye::video::VideoInput::open(source)?))
}

#[cfg(not(feature = "opencv"))]
fn open_video(source: &str) -> Result<Box<dyn CaptureDevice>> {
    bail!("cannot open {}: built without the `opencv` feature", source)
}

fn open_device(device: &str, seed: u64) -> Result<Box<dyn CaptureDevice>> {
    if device == "synthetic" {
        return Ok(Box::new(SyntheticCamera::new(seed)));
    }
    open_video(device)
}

fn run(args: &Args, device: &str, frames: Option<u64>, config: &Config) -> Result<()> {
    let store = TrackingStore::open(&args.store)?;
    let device = open_device(device, config.seed)?;
    let mut producer = Producer::new(store, device, config)?;

    let run_span = info_span!("run");
    run_span.pb_set_style(&ProgressStyle::default_bar());
    if let Some(frames) = frames {
        run_span.pb_set_length(frames);
    }
    let run_span_enter = run_span.enter();

    let stop = AtomicBool::new(false);
    let produced = producer.run(&stop, frames).context("producer loop failed")?;

    std::mem::drop(run_span_enter);
    std::mem::drop(run_span);

    let header = producer.store().header();
    let motion = header.total_motion();
    info!(
        "{} frames, counter {}, total motion ({:.2}, {:.2})",
        produced,
        header.frame_counter(),
        motion.x,
        motion.y
    );
    producer.store().flush()?;
    Ok(())
}

fn watch(args: &Args, stale_after: f64, frames: Option<u64>) -> Result<()> {
    let reader = StoreReader::open(&args.store)
        .with_context(|| format!("no tracking store at {:?}", args.store))?;
    let mut cursor = FrameCursor::from_now(&reader.snapshot());
    let stale_after = Duration::from_secs_f64(stale_after);
    let idle_sleep = Duration::from_secs_f64(1. / FPS as f64);

    let watch_span = info_span!("watch");
    watch_span.pb_set_style(&ProgressStyle::default_bar());
    if let Some(frames) = frames {
        watch_span.pb_set_length(frames);
    }
    let watch_span_enter = watch_span.enter();

    let mut seen = 0;
    let mut last_fresh = Instant::now();
    let mut stalled = false;
    while frames.map_or(true, |n| seen < n) {
        let snapshot = reader.snapshot();
        let range = match cursor.poll(&snapshot) {
            Poll::Idle => {
                if !stalled && last_fresh.elapsed() > stale_after {
                    warn!("no frame published for {:?}", last_fresh.elapsed());
                    stalled = true;
                }
                std::thread::sleep(idle_sleep);
                continue;
            }
            Poll::Fresh(range) => range,
            Poll::Overrun { skipped, resume } => {
                warn!("fell behind, {} frames lost", skipped);
                resume
            }
        };
        last_fresh = Instant::now();
        stalled = false;
        for sequence in range {
            let frame = match snapshot.frame(sequence) {
                Ok(frame) => frame,
                Err(state) => {
                    warn!("frame {} not readable: {:?}", sequence, state);
                    continue;
                }
            };
            info!(
                "frame {}: t {:.3}, {} points, luma {:.1}",
                sequence,
                frame.timestamp,
                frame.num_points,
                frame.mean_luma()
            );
            Span::current().pb_inc(1);
            seen += 1;
        }
        let motion = reader.header().total_motion();
        info!("total motion ({:.2}, {:.2})", motion.x, motion.y);
    }

    std::mem::drop(watch_span_enter);
    std::mem::drop(watch_span);
    Ok(())
}

fn params(args: &Args, action: &ParamsAction) -> Result<()> {
    let settings = SettingsStore::open(&args.store)
        .with_context(|| format!("no tracking store at {:?}", args.store))?;
    match action {
        ParamsAction::Show => {
            println!("{}", serde_json::to_string_pretty(&settings.header().settings())?);
        }
        ParamsAction::Set { name, value } => match name.as_str() {
            "min_point_quality" => {
                let quality: f32 = value.parse().context("min_point_quality must be a number")?;
                settings.set_min_point_quality(quality);
            }
            "tracking_point_limit" => {
                let limit: u32 = value.parse().context("tracking_point_limit must be an integer")?;
                settings.set_tracking_point_limit(limit);
            }
            _ => {
                let param = CameraParam::from_name(name).ok_or(anyhow!("unknown parameter {}", name))?;
                let value: u8 = value
                    .parse()
                    .with_context(|| format!("{} takes a value in 0..=255", name))?;
                let spec = param.spec();
                if spec.clamp(value) != value {
                    warn!("{} = {} outside {}..={}, clamped", name, value, spec.min, spec.max);
                }
                settings.set_camera_param(param, value);
            }
        },
        ParamsAction::Load { file } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read {:?}", file))?;
            let values: CameraSettings = serde_json::from_str(&text)
                .with_context(|| format!("JSON deserialization failed for {:?}", file))?;
            settings.apply(&values);
            info!("applied settings from {:?}", file);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // setup logging
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stdout_writer()))
        .with(indicatif_layer)
        .with(level)
        .init();

    match &args.command {
        Command::Run {
            device,
            frames,
            config,
        } => run(&args, device, *frames, config),
        Command::Watch {
            stale_after,
            frames,
        } => {
            if *stale_after <= 0. {
                bail!("--stale-after must be positive");
            }
            watch(&args, *stale_after, *frames)
        }
        Command::Params { action } => params(&args, action),
    }
}
