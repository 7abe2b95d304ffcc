//! pipeline: per-file orchestration
//!
//! [`FerEngine`] runs detect → threshold → preprocess → classify on one
//! image or frame. [`ImageDemo`] and [`VideoDemo`] wrap it with decoding,
//! annotation, charts and artifact writing for one uploaded file each;
//! [`run_batch`] drives a list of files through either of them.

mod artifacts;
mod image_demo;
mod video_demo;

pub use artifacts::ArtifactSet;
pub use image_demo::{FaceReport, ImageDemo, ImageReport};
pub use video_demo::{video_artifact_base, VideoDemo, VideoReport, VideoSession, VideoTally};

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classifier::{EmotionClassify, OnnxEmotionClassifier};
use crate::config::DemoConfig;
use crate::detection::{BoundingBox, FaceDetect, FaceExtractor, OnnxFaceDetector};
use crate::emotion::Classification;
use crate::error::{DemoError, FailureKind};
use crate::preprocess::preprocess;
use crate::runtime::Device;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov"];

// ── Uploads ──────────────────────────────────────────────────────────────────

/// One uploaded file: its original name and raw contents.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| DemoError::io(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, bytes })
    }

    /// File name without its last extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }

    /// Lower-cased extension, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Reject names whose extension is not in `allowed`.
pub fn check_extension(name: &str, allowed: &[&str]) -> Result<()> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) if allowed.contains(&ext.as_str()) => Ok(()),
        _ => Err(DemoError::UnsupportedInput {
            name: name.to_string(),
            expected: allowed.join(", "),
        }
        .into()),
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// A detected face that passed the threshold and was classified.
#[derive(Debug, Clone)]
pub struct AnalyzedFace {
    pub bbox: BoundingBox,
    pub detection_confidence: f32,
    pub classification: Classification,
    pub pixels: RgbImage,
}

/// Result of analyzing one image or frame.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Accepted faces in detector order.
    pub faces: Vec<AnalyzedFace>,
    /// Faces the detector returned before thresholding.
    pub detected: usize,
    pub detect_time: Duration,
    pub classify_time: Duration,
}

/// Detection and classification wall time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub detection: Duration,
    pub classification: Duration,
}

impl Timings {
    pub fn add(&mut self, analysis: &Analysis) {
        self.detection += analysis.detect_time;
        self.classification += analysis.classify_time;
    }
}

impl Serialize for Timings {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Timings", 2)?;
        s.serialize_field("detection_secs", &self.detection.as_secs_f64())?;
        s.serialize_field("classification_secs", &self.classification.as_secs_f64())?;
        s.end()
    }
}

/// Face detector + emotion classifier + acceptance threshold.
pub struct FerEngine<D, C> {
    detector: D,
    classifier: C,
    threshold: f32,
}

/// Engine over the ONNX adapters selected by a [`DemoConfig`].
pub type DynEngine = FerEngine<Box<dyn FaceDetect>, Box<dyn EmotionClassify>>;

impl DynEngine {
    /// Load the configured detector and classifier. Either model failing to
    /// load is a [`DemoError::ModelLoad`].
    pub fn load(config: &DemoConfig, models_root: &Path, device: Device) -> Result<Self> {
        let locator = OnnxFaceDetector::load(config.detector(), models_root, device)?;
        let detector: Box<dyn FaceDetect> =
            Box::new(FaceExtractor::new(locator, config.extract_options()));
        let classifier: Box<dyn EmotionClassify> =
            Box::new(OnnxEmotionClassifier::load(config.model(), models_root, device)?);
        Ok(FerEngine::new(detector, classifier, config.threshold()))
    }
}

impl<D: FaceDetect, C: EmotionClassify> FerEngine<D, C> {
    pub fn new(detector: D, classifier: C, threshold: f32) -> Self {
        Self {
            detector,
            classifier,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Detect faces, keep those with `confidence >= threshold`, classify each.
    pub fn analyze(&mut self, image: &RgbImage, source_name: &str) -> Result<Analysis> {
        let detect_start = Instant::now();
        let detected = self.detector.detect(image, source_name)?;
        let detect_time = detect_start.elapsed();
        let detected_count = detected.len();

        let classify_start = Instant::now();
        let mut faces = Vec::with_capacity(detected_count);
        for face in detected {
            if face.confidence < self.threshold {
                debug!(
                    confidence = face.confidence,
                    threshold = self.threshold,
                    "face below threshold"
                );
                continue;
            }
            let tensor = preprocess(&face.pixels);
            let classification = self.classifier.classify(&tensor)?;
            faces.push(AnalyzedFace {
                bbox: face.bbox,
                detection_confidence: face.confidence,
                classification,
                pixels: face.pixels,
            });
        }
        let classify_time = classify_start.elapsed();

        Ok(Analysis {
            faces,
            detected: detected_count,
            detect_time,
            classify_time,
        })
    }
}

// ── Batch ────────────────────────────────────────────────────────────────────

/// What happened to one file of a batch.
#[derive(Debug)]
pub struct FileOutcome<R> {
    pub path: PathBuf,
    pub result: Result<R>,
}

impl<R> FileOutcome<R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.result.as_ref().err().map(FailureKind::of)
    }
}

/// Read and process each file in order. A failing file is logged and
/// recorded; the files after it are still processed.
pub fn run_batch<R, F>(paths: &[PathBuf], mut process: F) -> Vec<FileOutcome<R>>
where
    F: FnMut(&Upload) -> Result<R>,
{
    let mut outcomes = Vec::with_capacity(paths.len());
    for path in paths {
        let result = Upload::from_path(path).and_then(|upload| process(&upload));
        match &result {
            Ok(_) => info!(file = %path.display(), "processed"),
            Err(e) => warn!(
                file = %path.display(),
                kind = %FailureKind::of(e),
                "processing failed: {e:#}"
            ),
        }
        outcomes.push(FileOutcome {
            path: path.clone(),
            result,
        });
    }
    outcomes
}

/// Write `value` as pretty JSON to `path`.
pub(crate) fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).map_err(|e| DemoError::io(path, e))?;
    Ok(())
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| DemoError::io(dir, e))?;
    Ok(())
}
