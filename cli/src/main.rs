use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fer_core::{
    classifier::ModelVariant,
    config::{DemoConfig, Settings, DEFAULT_THRESHOLD},
    detection::{DetectionStrategy, DetectorBackend},
    pipeline::{
        check_extension, run_batch, DynEngine, FileOutcome, ImageDemo, VideoDemo,
        IMAGE_EXTENSIONS, VIDEO_EXTENSIONS,
    },
    runtime::{init_ort, Device},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "fer-demo",
    version,
    about = "Facial emotion recognition demo for images and videos",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Annotate faces and emotions in still images (.png, .jpg, .jpeg).
    Image {
        #[command(flatten)]
        shared: SharedArgs,

        /// Also write each accepted face crop
        #[arg(long)]
        save_faces: bool,

        /// Input images
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Annotate faces and emotions in videos (.mp4, .mov).
    Video {
        #[command(flatten)]
        shared: SharedArgs,

        /// Frames to skip between two analyzed frames
        #[arg(long, default_value_t = 0)]
        skip: u32,

        /// Input videos
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct SharedArgs {
    /// Emotion model
    #[arg(long, default_value = "affectnet_enet_b0")]
    model: ModelVariant,

    /// Face detector backend
    #[arg(long, default_value = "opencv")]
    detector: DetectorBackend,

    /// How detections become face crops: extract | box-crop
    #[arg(long, default_value = "extract")]
    strategy: DetectionStrategy,

    /// Minimum detection confidence (0–1)
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f32,

    /// Fail a file when no face is found
    #[arg(long)]
    enforce: bool,

    /// Rotate face crops so the eyes are level
    #[arg(long)]
    align: bool,

    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the ONNX models
    #[arg(long)]
    models_root: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Everything both subcommands need before the first file is touched.
struct Prepared {
    config: DemoConfig,
    engine: DynEngine,
    output_root: PathBuf,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Image {
            shared,
            save_faces,
            files,
        } => cmd_image(shared, save_faces, files),
        Commands::Video {
            shared,
            skip,
            files,
        } => cmd_video(shared, skip, files),
    }
}

fn prepare(shared: SharedArgs, files: &[PathBuf], allowed: &[&str]) -> Result<Prepared> {
    for file in files {
        check_extension(&file.to_string_lossy(), allowed)?;
    }

    let settings = Settings::load(shared.config.as_deref())?
        .with_overrides(shared.models_root, shared.output);

    let config = DemoConfig::new(
        shared.model,
        shared.detector,
        shared.strategy,
        shared.threshold,
        shared.enforce,
        shared.align,
    )?;

    init_ort(settings.ort_dylib.as_deref())?;
    let device = Device::detect();
    let models_root = settings.models_root();
    info!(
        model = %config.model(),
        detector = %config.detector(),
        strategy = %config.strategy(),
        threshold = config.threshold(),
        %device,
        models_root = %models_root.display(),
        "configuration"
    );

    let engine = DynEngine::load(&config, &models_root, device)
        .context("failed to load models")?;

    Ok(Prepared {
        config,
        engine,
        output_root: settings.output_dir(),
    })
}

// ── Images ───────────────────────────────────────────────────────────────────

fn cmd_image(shared: SharedArgs, save_faces: bool, files: Vec<PathBuf>) -> Result<()> {
    let Prepared {
        config,
        engine,
        output_root,
    } = prepare(shared, &files, IMAGE_EXTENSIONS)?;
    let mut demo = ImageDemo::new(config, engine, &output_root)?.with_save_faces(save_faces);

    let pb = spinner("Analyzing images…");
    let outcomes = run_batch(&files, |upload| {
        pb.set_message(format!("Analyzing {}…", upload.name));
        let report = demo.process(upload)?;
        info!(
            file = %report.source,
            faces = report.faces.len(),
            detect_secs = format!("{:.2}", report.timings.detection.as_secs_f64()),
            classify_secs = format!("{:.2}", report.timings.classification.as_secs_f64()),
            "image done"
        );
        for (j, face) in report.faces.iter().enumerate() {
            info!(face = j + 1, label = %face.label, confidence = face.confidence, "emotion");
        }
        Ok(())
    });
    pb.finish_and_clear();

    conclude(&outcomes, demo.output_dir())
}

// ── Videos ───────────────────────────────────────────────────────────────────

fn cmd_video(shared: SharedArgs, skip: u32, files: Vec<PathBuf>) -> Result<()> {
    let Prepared {
        config,
        engine,
        output_root,
    } = prepare(shared, &files, VIDEO_EXTENSIONS)?;
    let mut demo = VideoDemo::new(config, engine, &output_root, skip)?;

    let outcomes = run_batch(&files, |upload| {
        let pb = frame_bar(&upload.name);
        let result = demo.process(upload, |done, total| {
            if total > 0 && pb.length() != Some(total.max(done)) {
                pb.set_length(total.max(done));
            }
            pb.set_position(done);
        });
        pb.finish_and_clear();
        let report = result?;
        info!(
            file = %report.source,
            frames = report.frames,
            compute_frames = report.compute_frames,
            faces = report.counts.total(),
            fps = report.fps,
            "video done"
        );
        Ok(())
    });

    conclude(&outcomes, demo.output_dir())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn conclude(outcomes: &[FileOutcome<()>], output_dir: &Path) -> Result<()> {
    let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_ok()).collect();
    for outcome in &failed {
        if let (Err(e), Some(kind)) = (&outcome.result, outcome.failure_kind()) {
            error!(file = %outcome.path.display(), %kind, "{e:#}");
        }
    }
    info!(
        processed = outcomes.len() - failed.len(),
        failed = failed.len(),
        output = %output_dir.display(),
        "batch complete"
    );
    if !failed.is_empty() {
        bail!("{} of {} files failed", failed.len(), outcomes.len());
    }
    Ok(())
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

fn frame_bar(name: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} frames ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(name.to_string());
    pb
}
