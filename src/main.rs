use anyhow::{Context, Result};
use bytes::Bytes;
use castmix::capture::{SilentAudio, TestPattern};
use castmix::config::{SessionConfig, app_name, app_version};
use castmix::mixer::filter::Grayscale;
use castmix::mixer::{Mat4, Orientation, VideoFilter};
use castmix::pipeline::health::{HealthAlert, HealthMonitor};
use castmix::pipeline::sender::{BroadcastCoordinator, CaptureSource, NullTransport};
use castmix::pipeline::{BufferMetadata, EventSender, Output, SessionEvent, Source};
use castmix::utils::sos::SignalOfStop;
use clap::{Arg, ArgMatches, Command, value_parser};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use std::{panic, process};
use tokio_util::sync::CancellationToken;

/// Stand-in for a video encoder: counts composited frames
#[derive(Default)]
struct FrameCounter {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl Output for FrameCounter {
    fn accept_buffer(&self, data: Bytes, _metadata: &BufferMetadata) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
    }
}

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON session configuration.")
                .required(false),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds (0 runs until interrupted).")
                .value_parser(value_parser!(u64))
                .default_value("10"),
        )
        .arg(
            Arg::new("sources")
                .short('s')
                .long("sources")
                .value_name("COUNT")
                .help("Number of overlay test patterns composited above the main one.")
                .value_parser(value_parser!(u32).range(0..=4))
                .default_value("2"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_parser(value_parser!(u32))
                .help("Output frame rate, overrides the config file."),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_parser(value_parser!(u32))
                .help("Output width, overrides the config file."),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_parser(value_parser!(u32))
                .help("Output height, overrides the config file."),
        )
}

fn session_config(matches: &ArgMatches) -> Result<SessionConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(fps) = matches.get_one::<u32>("fps") {
        config.fps = *fps;
    }
    if let Some(width) = matches.get_one::<u32>("width") {
        config.width = *width;
    }
    if let Some(height) = matches.get_one::<u32>("height") {
        config.height = *height;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    let config = session_config(&matches)?;
    let duration = *matches.get_one::<u64>("duration").unwrap_or(&10);
    let overlays = *matches.get_one::<u32>("sources").unwrap_or(&0);

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let sos = SignalOfStop::new();
    let handler_sos = sos.clone();
    ctrlc::set_handler(move || {
        if handler_sos.cancelled() {
            process::exit(130);
        }
        handler_sos.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(run(config, overlays, duration, sos))
}

async fn run(config: SessionConfig, overlays: u32, duration: u64, sos: SignalOfStop) -> Result<()> {
    info!("{} {} starting", app_name(), app_version());

    let (events, mut event_rx) = EventSender::channel();
    let session = Arc::new(BroadcastCoordinator::new(config.clone(), events)?);
    let cancel = CancellationToken::new();

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::DetectedThroughput {
                    bytes_per_second,
                    video_rate,
                } => debug!("throughput {} B/s (video target {} bit/s)", bytes_per_second, video_rate),
                SessionEvent::ConnectionStatusChanged(state) => info!("session {}", state),
                other => warn!("{:?}", other),
            }
        }
    });

    let (alert_tx, mut alert_rx) = tokio::sync::mpsc::channel::<HealthAlert>(16);
    let monitor = HealthMonitor::new(session.health(), alert_tx);
    tokio::spawn(async move { monitor.run().await });
    tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            warn!("health: {}", alert);
        }
    });

    let encoder = Arc::new(FrameCounter::default());
    let encoder_output: Arc<dyn Output> = encoder.clone();
    session.set_video_output(&encoder_output);

    // Overlays stack in the top-right corner, the first one desaturated
    let grayscale: Arc<dyn VideoFilter> = Arc::new(Grayscale);
    let mut overlay_sources = Vec::new();
    for i in 0..overlays {
        let top = -0.95 + i as f32 * 0.45;
        let source = Arc::new(
            CaptureSource::new(format!("overlay-{}", i))
                .with_transform(Mat4::from_rect(0.45, top, 0.95, top + 0.4))
                .with_blends(true),
        );
        session.add_source(source.clone(), 0)?;
        if i == 0 {
            session
                .mixer()
                .set_source_filter(source.id(), Some(&grayscale))?;
        }
        overlay_sources.push(source);
    }

    session.start(Box::new(NullTransport::new()))?;

    let main_session = session.clone();
    TestPattern::new(config.width / 2, config.height / 2, config.fps).spawn(cancel.clone(), move |frame| {
        main_session.push_video_sample(frame, Orientation::Up);
    });
    for (i, source) in overlay_sources.iter().enumerate() {
        let source = source.clone();
        TestPattern::new(160, 90, config.fps)
            .with_tint([255, 128 + i as u8 * 40, 255, 200])
            .spawn(cancel.clone(), move |frame| {
                source.push_video(frame);
            });
    }
    let audio_session = session.clone();
    SilentAudio::new(config.audio_sample_rate, config.audio_channels).spawn(cancel.clone(), move |data, duration| {
        audio_session.push_audio_sample(data, duration);
    });

    let waiter = sos.clone();
    let limit = Duration::from_secs(duration);
    tokio::task::spawn_blocking(move || {
        if limit.is_zero() {
            waiter.wait_cancellation();
        } else if !waiter.wait_timeout(limit) {
            info!("duration elapsed");
        }
    })
    .await?;

    cancel.cancel();
    session.end().await?;

    info!(
        "{} frames ({} bytes) composited, {}",
        encoder.frames.load(Ordering::Relaxed),
        encoder.bytes.load(Ordering::Relaxed),
        session.health().summary()
    );
    Ok(())
}
