#![deny(warnings)]

use affect_sense_core::audio::AudioAnalysisResult;
use affect_sense_core::capture::{DeviceCapture, MediaKind, SyntheticCapture};
use affect_sense_core::config::{AnalysisConfig, ConfigOverrides, FacingMode, StdEnv};
use affect_sense_core::detector::{DetectorCache, SyntheticModelFactory};
use affect_sense_core::session::{AnalysisSession, StartError};
use affect_sense_core::video::VideoAnalysisResult;
use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "affect-sense")]
#[command(about = "Real-time facial and vocal affect analysis over synthetic devices")]
struct Args {
    /// How long to run before stopping; Ctrl-C stops early.
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,

    /// Print every result as a JSON line on stdout.
    #[arg(long)]
    json: bool,

    #[arg(long)]
    no_video: bool,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    video_interval_ms: Option<u64>,

    #[arg(long)]
    audio_interval_ms: Option<u64>,

    #[arg(long)]
    fft_size: Option<u32>,

    /// Request the environment-facing camera.
    #[arg(long)]
    rear_camera: bool,

    /// Disable echo cancellation and noise suppression on the microphone.
    #[arg(long)]
    raw_audio: bool,

    #[arg(long)]
    simulate_gpu_missing: bool,

    #[arg(long)]
    simulate_full_model_failure: bool,

    #[arg(long)]
    simulate_camera_denied: bool,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    if args.no_video && args.no_audio {
        anyhow::bail!("--no-video and --no-audio leave nothing to analyze");
    }

    let overrides = ConfigOverrides {
        video_interval_ms: args.video_interval_ms,
        audio_interval_ms: args.audio_interval_ms,
        fft_size: args.fft_size,
    };
    let mut cfg = AnalysisConfig::resolve(overrides, &StdEnv).context("invalid configuration")?;
    if args.rear_camera {
        cfg.video.facing = FacingMode::Environment;
    }
    if args.raw_audio {
        cfg.audio.echo_cancellation = false;
        cfg.audio.noise_suppression = false;
    }

    tracing::info!(
        video_interval_ms = cfg.video_interval.millis,
        audio_interval_ms = cfg.audio_interval.millis,
        fft_size = cfg.audio.fft_size.get(),
        facing = %cfg.video.facing,
        echo_cancellation = cfg.audio.echo_cancellation,
        noise_suppression = cfg.audio.noise_suppression,
        "config loaded"
    );

    let session = build_session(&args, cfg);
    let started = start_modalities(&session, &args).await?;
    if started == 0 {
        anyhow::bail!("no analysis could be started");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            tracing::info!("interrupted; stopping");
        }
    }

    session.stop_all();
    report(&session, args.json)?;
    Ok(())
}

fn build_session(args: &Args, cfg: AnalysisConfig) -> AnalysisSession {
    let mut capture = SyntheticCapture::new(args.seed);
    if args.simulate_camera_denied {
        capture = capture.deny(MediaKind::Video);
    }

    let mut factory = SyntheticModelFactory::new(args.seed);
    if args.simulate_gpu_missing {
        factory = factory.without_gpu();
    }
    if args.simulate_full_model_failure {
        factory = factory.failing_full();
    }

    let capture: Arc<dyn DeviceCapture> = Arc::new(capture);
    let detector = Arc::new(DetectorCache::new(Arc::new(factory)));
    AnalysisSession::new(cfg, capture, detector)
}

async fn start_modalities(session: &AnalysisSession, args: &Args) -> anyhow::Result<usize> {
    let mut started = 0;
    let json = args.json;

    if !args.no_video {
        let outcome = session
            .start_video_analysis(move |r| print_video(&r, json))
            .await;
        started += usize::from(accept_start(MediaKind::Video, outcome)?);
    }
    if !args.no_audio {
        let outcome = session
            .start_audio_analysis(move |r| print_audio(&r, json))
            .await;
        started += usize::from(accept_start(MediaKind::Audio, outcome)?);
    }
    Ok(started)
}

/// Device and model problems only disable that modality; anything else aborts.
fn accept_start(kind: MediaKind, outcome: Result<(), StartError>) -> anyhow::Result<bool> {
    match outcome {
        Ok(()) => {
            tracing::info!(%kind, "analysis started");
            Ok(true)
        }
        Err(
            err @ (StartError::PermissionDenied(_)
            | StartError::DeviceNotFound(_)
            | StartError::ModelUnavailable(_)),
        ) => {
            tracing::error!(%kind, error = %err, "analysis disabled");
            Ok(false)
        }
        Err(err) => Err(err).with_context(|| format!("failed to start {kind} analysis")),
    }
}

fn print_video(result: &VideoAnalysisResult, json: bool) {
    if json {
        println!("{}", json!({ "modality": "video", "result": result }));
        return;
    }
    let tags: Vec<&str> = result
        .environmental_context
        .iter()
        .map(|t| t.as_str())
        .collect();
    tracing::info!(
        dominant = result.emotions.dominant(),
        attentiveness = result.attentiveness,
        context = %tags.join(","),
        "video"
    );
}

fn print_audio(result: &AudioAnalysisResult, json: bool) {
    if json {
        println!("{}", json!({ "modality": "audio", "result": result }));
        return;
    }
    tracing::info!(
        dominant = result.emotions.dominant(),
        sentiment = result.sentiment,
        toxicity = result.toxicity,
        volume = result.volume,
        clarity = result.clarity,
        "audio"
    );
}

fn report(session: &AnalysisSession, json: bool) -> anyhow::Result<()> {
    let video = session.latency_summary(MediaKind::Video);
    let audio = session.latency_summary(MediaKind::Audio);

    if json {
        let summary = json!({
            "metrics": {
                "video": session.performance_metrics(MediaKind::Video),
                "audio": session.performance_metrics(MediaKind::Audio),
            },
            "latency": { "video": video, "audio": audio },
        });
        println!(
            "{}",
            serde_json::to_string(&summary).context("failed to encode metrics")?
        );
        return Ok(());
    }

    for (kind, s) in [(MediaKind::Video, video), (MediaKind::Audio, audio)] {
        tracing::info!(
            %kind,
            count = s.count,
            avg_ms = s.avg_ms,
            recent_max_ms = s.recent_max_ms.unwrap_or_default(),
            "performance"
        );
    }
    Ok(())
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
