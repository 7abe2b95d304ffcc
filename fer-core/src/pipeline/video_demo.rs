use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use image::RgbImage;
use serde::Serialize;
use tracing::info;

use super::image_demo::counts_as_f64;
use super::{
    check_extension, ensure_dir, write_json, ArtifactSet, FerEngine, Timings, Upload,
    VIDEO_EXTENSIONS,
};
use crate::classifier::EmotionClassify;
use crate::config::{format_float, DemoConfig};
use crate::detection::FaceDetect;
use crate::emotion::{EmotionCounts, EmotionLabel, NUM_EMOTIONS};
use crate::error::DemoError;
use crate::rendering::{caption, Annotator, BarChart, ChartRenderer};
use crate::tracking::{FrameSkipTracker, TrackedFace};
use crate::video;

/// Per-frame state for one video: tracker, counts and timings.
///
/// Decoupled from FFmpeg so the frame loop can be driven by any frame source.
pub struct VideoSession<'a, D, C> {
    engine: &'a mut FerEngine<D, C>,
    annotator: &'a Annotator,
    source_name: String,
    tracker: FrameSkipTracker,
    counts: EmotionCounts,
    timings: Timings,
}

/// What a finished [`VideoSession`] measured.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTally {
    pub counts: EmotionCounts,
    pub frames: u64,
    pub compute_frames: u64,
    pub timings: Timings,
}

impl VideoTally {
    /// Counts divided by the number of Compute frames.
    pub fn mean_frequencies(&self) -> [f64; NUM_EMOTIONS] {
        self.counts.normalized(self.compute_frames)
    }
}

impl<'a, D: FaceDetect, C: EmotionClassify> VideoSession<'a, D, C> {
    pub fn new(
        engine: &'a mut FerEngine<D, C>,
        annotator: &'a Annotator,
        source_name: impl Into<String>,
        skip: u32,
    ) -> Self {
        Self {
            engine,
            annotator,
            source_name: source_name.into(),
            tracker: FrameSkipTracker::new(skip),
            counts: EmotionCounts::new(),
            timings: Timings::default(),
        }
    }

    /// Analyze (Compute frame) or reuse (Reuse frame), then draw in place.
    pub fn process_frame(&mut self, index: u64, frame: &mut RgbImage) -> Result<()> {
        let Self {
            engine,
            annotator,
            source_name,
            tracker,
            counts,
            timings,
        } = self;

        let faces = tracker.step(index, || {
            let analysis = engine
                .analyze(frame, source_name)
                .with_context(|| format!("frame {index}"))?;
            timings.add(&analysis);
            Ok::<_, anyhow::Error>(
                analysis
                    .faces
                    .iter()
                    .map(|f| {
                        counts.increment(f.classification.label);
                        TrackedFace {
                            bbox: f.bbox,
                            label: f.classification.label,
                            confidence: f.classification.confidence(),
                        }
                    })
                    .collect(),
            )
        })?;

        for face in faces {
            annotator.annotate(frame, face.bbox, &caption(face.label, Some(face.confidence)));
        }
        Ok(())
    }

    pub fn finish(self) -> VideoTally {
        VideoTally {
            counts: self.counts,
            frames: self.tracker.frames_seen(),
            compute_frames: self.tracker.compute_frames(),
            timings: self.timings,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoReport {
    pub source: String,
    pub config: DemoConfig,
    pub skip: u32,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub frames: u64,
    pub compute_frames: u64,
    pub counts: EmotionCounts,
    pub mean_frequencies: BTreeMap<EmotionLabel, f64>,
    pub timings: Timings,
    pub artifacts: Vec<PathBuf>,
}

/// Video controller: annotated video + raw and mean frequency charts.
pub struct VideoDemo<D, C> {
    config: DemoConfig,
    engine: FerEngine<D, C>,
    annotator: Annotator,
    charts: ChartRenderer,
    output_dir: PathBuf,
    staging_dir: Option<PathBuf>,
    skip: u32,
}

impl<D: FaceDetect, C: EmotionClassify> VideoDemo<D, C> {
    /// Artifacts go to `<output_root>/videos`.
    pub fn new(
        config: DemoConfig,
        engine: FerEngine<D, C>,
        output_root: &Path,
        skip: u32,
    ) -> Result<Self> {
        let output_dir = output_root.join("videos");
        ensure_dir(&output_dir)?;
        Ok(Self {
            config,
            engine,
            annotator: Annotator::new()?,
            charts: ChartRenderer::new()?,
            output_dir,
            staging_dir: None,
            skip,
        })
    }

    /// Stage uploads in `dir` instead of the system temp directory.
    pub fn with_staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = Some(dir);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `progress(done, total)` is called after every encoded frame; `total`
    /// is the probed frame count (0 when unknown).
    pub fn process<P>(&mut self, upload: &Upload, mut progress: P) -> Result<VideoReport>
    where
        P: FnMut(u64, u64),
    {
        check_extension(&upload.name, VIDEO_EXTENSIONS)?;
        let started = Instant::now();

        // Removed on drop, whichever way this function exits.
        let staged = stage_upload(upload, self.staging_dir.as_deref())?;
        let info = video::probe(staged.path()).map_err(|e| DemoError::Decode {
            name: upload.name.clone(),
            reason: format!("{e:#}"),
        })?;
        info!(
            file = %upload.name,
            fps = info.fps,
            width = info.width,
            height = info.height,
            frames = info.frames,
            skip = self.skip,
            "video probed"
        );

        let base = video_artifact_base(&self.config, upload.stem(), info.fps, self.skip);
        let mut artifacts = ArtifactSet::new();
        let video_path = artifacts.track(self.output_dir.join(format!("{base}.mp4"))).to_path_buf();

        let mut session =
            VideoSession::new(&mut self.engine, &self.annotator, upload.name.clone(), self.skip);
        video::transcode(
            staged.path(),
            &video_path,
            |index, frame| session.process_frame(index, frame),
            |done| progress(done, info.frames),
        )?;
        let tally = session.finish();
        drop(staged);

        let raw_chart = BarChart::frequencies(counts_as_f64(&tally.counts), "Frequencies");
        self.charts.save(
            &raw_chart,
            artifacts.track(self.output_dir.join(format!("{base}_freq_plot.pdf"))),
        )?;
        let mean = tally.mean_frequencies();
        self.charts.save(
            &BarChart::mean_frequencies(mean),
            artifacts.track(self.output_dir.join(format!("{base}_mean_freq_plot.pdf"))),
        )?;

        info!(
            file = %upload.name,
            frames = tally.frames,
            compute_frames = tally.compute_frames,
            expected_compute_frames =
                FrameSkipTracker::expected_compute_frames(info.frames, self.skip),
            faces = tally.counts.total(),
            detect_secs = format!("{:.2}", tally.timings.detection.as_secs_f64()),
            classify_secs = format!("{:.2}", tally.timings.classification.as_secs_f64()),
            total_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
            "video analyzed"
        );

        let summary_path = artifacts
            .track(self.output_dir.join(format!("{base}_summary.json")))
            .to_path_buf();
        let mut report = VideoReport {
            source: upload.name.clone(),
            config: self.config,
            skip: self.skip,
            fps: info.fps,
            width: info.width,
            height: info.height,
            frames: tally.frames,
            compute_frames: tally.compute_frames,
            mean_frequencies: EmotionLabel::ALL.iter().copied().zip(mean).collect(),
            counts: tally.counts,
            timings: tally.timings,
            artifacts: artifacts.paths(),
        };
        write_json(&report, &summary_path)?;

        report.artifacts = artifacts.commit()?;
        Ok(report)
    }
}

/// Image naming scheme plus `_fps<fps>_skip<k>`.
pub fn video_artifact_base(config: &DemoConfig, stem: &str, fps: f64, skip: u32) -> String {
    format!(
        "{}_fps{}_skip{}",
        config.artifact_base(stem),
        format_float(fps),
        skip
    )
}

/// Copy the upload to a temporary file that keeps its extension so the
/// demuxer can probe it. `dir` defaults to the system temp directory.
fn stage_upload(upload: &Upload, dir: Option<&Path>) -> Result<tempfile::NamedTempFile> {
    let suffix = upload
        .extension()
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let mut builder = tempfile::Builder::new();
    builder.prefix("fer-upload-").suffix(&suffix);
    let file = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    };
    let mut file = file.context("failed to create temporary upload file")?;
    file.write_all(&upload.bytes)
        .and_then(|()| file.flush())
        .map_err(|e| DemoError::io(file.path(), e))?;
    Ok(file)
}
