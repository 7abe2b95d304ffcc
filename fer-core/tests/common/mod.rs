#![allow(dead_code)]

use std::collections::VecDeque;

use fer_core::classifier::{EmotionClassify, ModelVariant};
use fer_core::config::DemoConfig;
use fer_core::detection::{
    DetectionStrategy, DetectorBackend, FaceExtractor, FaceLocator, RawDetection,
};
use fer_core::emotion::{Classification, EmotionLabel, NUM_EMOTIONS};
use fer_core::pipeline::FerEngine;
use fer_core::preprocess::FaceTensor;
use fer_core::Result;
use image::{Rgb, RgbImage};

/// Returns the queued detections for each call, then nothing.
pub struct ScriptedLocator {
    pub frames: VecDeque<Vec<RawDetection>>,
    pub calls: usize,
}

impl ScriptedLocator {
    pub fn every_call(detections: Vec<RawDetection>, calls: usize) -> Self {
        Self {
            frames: std::iter::repeat(detections).take(calls).collect(),
            calls: 0,
        }
    }
}

impl FaceLocator for ScriptedLocator {
    fn locate(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        Ok(self.frames.pop_front().unwrap_or_default())
    }
}

/// Classifies every face as the next label in a fixed cycle.
pub struct CyclingClassifier {
    pub labels: Vec<EmotionLabel>,
    pub calls: usize,
}

impl CyclingClassifier {
    pub fn always(label: EmotionLabel) -> Self {
        Self {
            labels: vec![label],
            calls: 0,
        }
    }
}

impl EmotionClassify for CyclingClassifier {
    fn classify(&mut self, _tensor: &FaceTensor) -> Result<Classification> {
        let label = self.labels[self.calls % self.labels.len()];
        self.calls += 1;
        let mut logits = [0f32; NUM_EMOTIONS];
        logits[label.get_index()] = 3.0;
        Classification::from_logits(&logits)
    }
}

pub fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> RawDetection {
    RawDetection {
        x1,
        y1,
        x2,
        y2,
        confidence,
        landmarks: None,
    }
}

pub fn config(threshold: f32, enforce: bool) -> DemoConfig {
    DemoConfig::new(
        ModelVariant::AffectnetEnetB0,
        DetectorBackend::OpenCv,
        DetectionStrategy::Extract,
        threshold,
        enforce,
        false,
    )
    .unwrap()
}

pub fn engine(
    cfg: &DemoConfig,
    locator: ScriptedLocator,
    classifier: CyclingClassifier,
) -> FerEngine<FaceExtractor<ScriptedLocator>, CyclingClassifier> {
    FerEngine::new(
        FaceExtractor::new(locator, cfg.extract_options()),
        classifier,
        cfg.threshold(),
    )
}

/// A gray test picture with a lighter square where the "face" is.
pub fn picture(width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([90, 90, 90]));
    for y in height / 4..height / 2 {
        for x in width / 4..width / 2 {
            img.put_pixel(x, y, Rgb([200, 180, 160]));
        }
    }
    img
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}
