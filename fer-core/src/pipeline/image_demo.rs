use std::path::{Path, PathBuf};

use anyhow::Result;
use image::RgbImage;
use serde::Serialize;
use tracing::info;

use super::{
    check_extension, ensure_dir, write_json, ArtifactSet, FerEngine, Timings, Upload,
    IMAGE_EXTENSIONS,
};
use crate::classifier::EmotionClassify;
use crate::config::DemoConfig;
use crate::detection::{BoundingBox, FaceDetect};
use crate::emotion::{EmotionCounts, EmotionLabel};
use crate::error::DemoError;
use crate::rendering::{caption, save_png, Annotator, BarChart, ChartRenderer};

/// One accepted face as reported to the user.
#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    pub bbox: BoundingBox,
    pub label: EmotionLabel,
    /// Winning class probability.
    pub confidence: f32,
    pub detection_confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub source: String,
    pub config: DemoConfig,
    /// Faces returned by the detector before thresholding.
    pub faces_detected: usize,
    pub faces: Vec<FaceReport>,
    pub counts: EmotionCounts,
    pub timings: Timings,
    pub artifacts: Vec<PathBuf>,
}

/// Image controller: one annotated image + one frequency chart per upload.
pub struct ImageDemo<D, C> {
    config: DemoConfig,
    engine: FerEngine<D, C>,
    annotator: Annotator,
    charts: ChartRenderer,
    output_dir: PathBuf,
    save_faces: bool,
}

impl<D: FaceDetect, C: EmotionClassify> ImageDemo<D, C> {
    /// Artifacts go to `<output_root>/images`.
    pub fn new(config: DemoConfig, engine: FerEngine<D, C>, output_root: &Path) -> Result<Self> {
        let output_dir = output_root.join("images");
        ensure_dir(&output_dir)?;
        Ok(Self {
            config,
            engine,
            annotator: Annotator::new()?,
            charts: ChartRenderer::new()?,
            output_dir,
            save_faces: false,
        })
    }

    /// Also write each accepted face crop as `<base>_face<j>.png`.
    pub fn with_save_faces(mut self, save_faces: bool) -> Self {
        self.save_faces = save_faces;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn process(&mut self, upload: &Upload) -> Result<ImageReport> {
        check_extension(&upload.name, IMAGE_EXTENSIONS)?;
        let image = image::load_from_memory(&upload.bytes)
            .map_err(|e| DemoError::Decode {
                name: upload.name.clone(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        info!(file = %upload.name, width = image.width(), height = image.height(), "image decoded");

        let analysis = self.engine.analyze(&image, &upload.name)?;
        let mut timings = Timings::default();
        timings.add(&analysis);

        let mut annotated: RgbImage = image.clone();
        let mut counts = EmotionCounts::new();
        let mut faces = Vec::with_capacity(analysis.faces.len());
        for face in &analysis.faces {
            let label = face.classification.label;
            self.annotator
                .annotate(&mut annotated, face.bbox, &caption(label, None));
            counts.increment(label);
            faces.push(FaceReport {
                bbox: face.bbox,
                label,
                confidence: face.classification.confidence(),
                detection_confidence: face.detection_confidence,
            });
        }

        info!(
            file = %upload.name,
            detected = analysis.detected,
            accepted = faces.len(),
            detect_secs = format!("{:.2}", timings.detection.as_secs_f64()),
            classify_secs = format!("{:.2}", timings.classification.as_secs_f64()),
            "image analyzed"
        );

        let base = self.config.artifact_base(upload.stem());
        let mut artifacts = ArtifactSet::new();

        save_png(&annotated, artifacts.track(self.output_dir.join(format!("{base}.png"))))?;

        let chart = BarChart::frequencies(counts_as_f64(&counts), "Frequency");
        self.charts.save(
            &chart,
            artifacts.track(self.output_dir.join(format!("{base}.pdf"))),
        )?;

        if self.save_faces {
            for (j, face) in analysis.faces.iter().enumerate() {
                let path = artifacts.track(self.output_dir.join(format!("{base}_face{}.png", j + 1)));
                save_png(&face.pixels, path)?;
            }
        }

        let summary_path = artifacts
            .track(self.output_dir.join(format!("{base}_summary.json")))
            .to_path_buf();
        let mut report = ImageReport {
            source: upload.name.clone(),
            config: self.config,
            faces_detected: analysis.detected,
            faces,
            counts,
            timings,
            artifacts: artifacts.paths(),
        };
        write_json(&report, &summary_path)?;

        report.artifacts = artifacts.commit()?;
        Ok(report)
    }
}

pub(crate) fn counts_as_f64(counts: &EmotionCounts) -> [f64; crate::emotion::NUM_EMOTIONS] {
    let mut out = [0f64; crate::emotion::NUM_EMOTIONS];
    for (o, (_, c)) in out.iter_mut().zip(counts.iter()) {
        *o = c as f64;
    }
    out
}
