//! detection: face localization backends + face extraction
//!
//! Two layers:
//!
//! * [`FaceLocator`]: a raw model that returns boxes, scores and (for some
//!   backends) five-point landmarks. [`OnnxFaceDetector`] implements it for
//!   the six named backends, each with its own input spec and output layout.
//! * [`FaceDetect`]: the adapter contract the demos use. [`FaceExtractor`]
//!   turns raw detections into [`DetectedFace`] crops according to the
//!   configured [`DetectionStrategy`], alignment and enforcement flags.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::error::DemoError;
use crate::runtime::{self, Device};

// ── Constants ────────────────────────────────────────────────────────────────

/// IoU threshold for NMS on dense-anchor backends.
const IOU_THRESHOLD: f32 = 0.4;
/// Number of facial landmarks the landmark-capable backends emit.
pub const NUM_LANDMARKS: usize = 5;

// ── Public types ─────────────────────────────────────────────────────────────

/// Face rectangle in pixel coordinates of the source image: top-left corner
/// plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Round float corners to pixels and clip to a `width × height` image.
    /// Returns `None` when nothing of the box is left.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Option<Self> {
        let cx1 = x1.max(0.0).min(width as f32).round() as u32;
        let cy1 = y1.max(0.0).min(height as f32).round() as u32;
        let cx2 = x2.max(0.0).min(width as f32).round() as u32;
        let cy2 = y2.max(0.0).min(height as f32).round() as u32;
        if cx2 <= cx1 || cy2 <= cy1 {
            return None;
        }
        Some(Self::new(cx1, cy1, cx2 - cx1, cy2 - cy1))
    }
}

/// Raw detector output in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    /// Eyes, nose tip, mouth corners (subject's right eye first).
    pub landmarks: Option<[(f32, f32); NUM_LANDMARKS]>,
}

impl RawDetection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn iou(&self, other: &RawDetection) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }
}

/// One face found in an image or frame, ready for classification.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub pixels: RgbImage,
}

/// Raw face localization: boxes + confidences (+ landmarks).
pub trait FaceLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>>;
}

impl<T: FaceLocator + ?Sized> FaceLocator for Box<T> {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        (**self).locate(image)
    }
}

/// Face detection as the demos consume it: crops with boxes and confidences.
pub trait FaceDetect {
    /// `source_name` is only used to label a detection failure.
    fn detect(&mut self, image: &RgbImage, source_name: &str) -> Result<Vec<DetectedFace>>;
}

impl<T: FaceDetect + ?Sized> FaceDetect for Box<T> {
    fn detect(&mut self, image: &RgbImage, source_name: &str) -> Result<Vec<DetectedFace>> {
        (**self).detect(image, source_name)
    }
}

// ── Backend registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorBackend {
    OpenCv,
    Ssd,
    Dlib,
    YoloV8,
    Mtcnn,
    RetinaFace,
}

/// Channel order the backend model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// How a backend wants its input: `(pixel - mean[c]) * scale`, NCHW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
    pub mean: [f32; 3],
    pub scale: f32,
}

/// How a backend encodes its detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[1, 1, N, 7]`: `(image_id, label, conf, x1, y1, x2, y2)`, corners in 0..1.
    SsdRows,
    /// `scores [1, N, 2]`, `boxes [1, N, 4]` corners in 0..1, optionally
    /// `landmarks [1, N, 10]` in 0..1.
    CornerBoxes { landmarks: bool },
    /// `[1, C, N]` with rows `cx, cy, w, h, conf` in input pixels and, when
    /// `C >= 20`, five `(x, y, visibility)` keypoints.
    YoloV8,
}

impl DetectorBackend {
    pub const ALL: [DetectorBackend; 6] = [
        DetectorBackend::OpenCv,
        DetectorBackend::Ssd,
        DetectorBackend::Dlib,
        DetectorBackend::YoloV8,
        DetectorBackend::Mtcnn,
        DetectorBackend::RetinaFace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DetectorBackend::OpenCv => "opencv",
            DetectorBackend::Ssd => "ssd",
            DetectorBackend::Dlib => "dlib",
            DetectorBackend::YoloV8 => "yolov8",
            DetectorBackend::Mtcnn => "mtcnn",
            DetectorBackend::RetinaFace => "retinaface",
        }
    }

    pub fn weights_path(self, models_root: &Path) -> PathBuf {
        models_root
            .join("detectors")
            .join(format!("{}.onnx", self.as_str()))
    }

    pub fn input_spec(self) -> InputSpec {
        match self {
            DetectorBackend::OpenCv | DetectorBackend::Ssd => InputSpec {
                width: 300,
                height: 300,
                order: ChannelOrder::Bgr,
                mean: [104.0, 177.0, 123.0],
                scale: 1.0,
            },
            DetectorBackend::Dlib => InputSpec {
                width: 320,
                height: 240,
                order: ChannelOrder::Rgb,
                mean: [127.0, 127.0, 127.0],
                scale: 1.0 / 128.0,
            },
            DetectorBackend::YoloV8 => InputSpec {
                width: 640,
                height: 640,
                order: ChannelOrder::Rgb,
                mean: [0.0, 0.0, 0.0],
                scale: 1.0 / 255.0,
            },
            DetectorBackend::Mtcnn => InputSpec {
                width: 640,
                height: 480,
                order: ChannelOrder::Rgb,
                mean: [127.5, 127.5, 127.5],
                scale: 1.0 / 128.0,
            },
            DetectorBackend::RetinaFace => InputSpec {
                width: 640,
                height: 640,
                order: ChannelOrder::Bgr,
                mean: [104.0, 117.0, 123.0],
                scale: 1.0,
            },
        }
    }

    pub fn output_layout(self) -> OutputLayout {
        match self {
            DetectorBackend::OpenCv | DetectorBackend::Ssd => OutputLayout::SsdRows,
            DetectorBackend::Dlib => OutputLayout::CornerBoxes { landmarks: false },
            DetectorBackend::Mtcnn | DetectorBackend::RetinaFace => {
                OutputLayout::CornerBoxes { landmarks: true }
            }
            DetectorBackend::YoloV8 => OutputLayout::YoloV8,
        }
    }

    /// Raw candidates below this score are never reported by the backend.
    pub fn score_floor(self) -> f32 {
        match self {
            DetectorBackend::OpenCv | DetectorBackend::Ssd => 0.15,
            DetectorBackend::Dlib => 0.3,
            DetectorBackend::YoloV8 => 0.25,
            DetectorBackend::Mtcnn => 0.3,
            DetectorBackend::RetinaFace => 0.2,
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DetectorBackend {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown detector backend `{0}` (expected one of: opencv, ssd, dlib, yolov8, mtcnn, retinaface)")]
pub struct UnknownBackend(String);

impl FromStr for DetectorBackend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| UnknownBackend(s.to_string()))
    }
}

/// How raw detections become face crops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionStrategy {
    /// Backend extraction: every raw face is cropped (and optionally
    /// aligned); the confidence threshold is left to the caller.
    #[default]
    Extract,
    /// Plain bounding-box detection: boxes under the threshold are dropped
    /// up front and crops are cut straight from the frame, never aligned.
    BoxCrop,
}

impl DetectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionStrategy::Extract => "extract",
            DetectionStrategy::BoxCrop => "box-crop",
        }
    }
}

impl fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DetectionStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown detection strategy `{0}` (expected extract or box-crop)")]
pub struct UnknownStrategy(String);

impl FromStr for DetectionStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract" => Ok(DetectionStrategy::Extract),
            "box-crop" | "boxcrop" => Ok(DetectionStrategy::BoxCrop),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

// ── ONNX detector ────────────────────────────────────────────────────────────

/// Wraps one face-detector ORT session.
pub struct OnnxFaceDetector {
    backend: DetectorBackend,
    session: Session,
}

impl OnnxFaceDetector {
    pub fn load(backend: DetectorBackend, models_root: &Path, device: Device) -> Result<Self> {
        let path = backend.weights_path(models_root);
        let what = format!("face detector {backend}");
        let session = runtime::build_session(&path, &what, device)?;
        tracing::info!(detector = %backend, path = %path.display(), "face detector loaded");
        Ok(Self { backend, session })
    }
}

impl FaceLocator for OnnxFaceDetector {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let spec = self.backend.input_spec();
        let layout = self.backend.output_layout();
        let floor = self.backend.score_floor();
        let (width, height) = image.dimensions();

        let data = input_tensor_data(image, &spec);
        let shape = [1usize, 3, spec.height as usize, spec.width as usize];
        let input = Tensor::from_array((shape, data))
            .context("failed to create detector input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .with_context(|| format!("{} inference failed", self.backend))?;

        let detections = match layout {
            OutputLayout::SsdRows => {
                let (_shape, rows) = runtime::output_f32(&outputs, 0)?;
                decode_ssd_rows(&rows, width, height, floor)
            }
            OutputLayout::CornerBoxes { landmarks } => {
                let (_s, scores) = runtime::output_f32(&outputs, 0)?;
                let (_b, boxes) = runtime::output_f32(&outputs, 1)?;
                let marks = if landmarks {
                    Some(runtime::output_f32(&outputs, 2)?.1)
                } else {
                    None
                };
                nms(
                    decode_corner_boxes(&scores, &boxes, marks.as_deref(), width, height, floor),
                    IOU_THRESHOLD,
                )
            }
            OutputLayout::YoloV8 => {
                let (shape, data) = runtime::output_f32(&outputs, 0)?;
                let (channels, proposals) = match shape.as_slice() {
                    [_, c, n] => (*c as usize, *n as usize),
                    other => anyhow::bail!("unexpected YOLOv8 output shape {other:?}"),
                };
                nms(
                    decode_yolov8(&data, channels, proposals, &spec, width, height, floor),
                    IOU_THRESHOLD,
                )
            }
        };

        debug!(detector = %self.backend, faces = detections.len(), "faces located");
        Ok(detections)
    }
}

/// Resize to the backend input size and lay out as a normalized NCHW buffer.
pub fn input_tensor_data(image: &RgbImage, spec: &InputSpec) -> Vec<f32> {
    let resized = imageops::resize(image, spec.width, spec.height, imageops::FilterType::Triangle);
    let raw = resized.as_raw();
    let size = (spec.width * spec.height) as usize;
    let mut data = vec![0f32; 3 * size];

    for idx in 0..size {
        for c in 0..3 {
            let src_c = match spec.order {
                ChannelOrder::Rgb => c,
                ChannelOrder::Bgr => 2 - c,
            };
            data[c * size + idx] = (raw[idx * 3 + src_c] as f32 - spec.mean[c]) * spec.scale;
        }
    }
    data
}

// ── Output decoders ──────────────────────────────────────────────────────────

/// Decode SSD `DetectionOutput` rows.
pub fn decode_ssd_rows(rows: &[f32], width: u32, height: u32, floor: f32) -> Vec<RawDetection> {
    let (w, h) = (width as f32, height as f32);
    rows.chunks_exact(7)
        .filter(|r| r[2] >= floor)
        .map(|r| RawDetection {
            x1: r[3] * w,
            y1: r[4] * h,
            x2: r[5] * w,
            y2: r[6] * h,
            confidence: r[2].clamp(0.0, 1.0),
            landmarks: None,
        })
        .collect()
}

/// Decode anchor-decoded score/box(/landmark) tensors.
pub fn decode_corner_boxes(
    scores: &[f32],
    boxes: &[f32],
    landmarks: Option<&[f32]>,
    width: u32,
    height: u32,
    floor: f32,
) -> Vec<RawDetection> {
    let (w, h) = (width as f32, height as f32);
    let n = (scores.len() / 2).min(boxes.len() / 4);

    (0..n)
        .filter_map(|i| {
            let confidence = scores[i * 2 + 1];
            if confidence < floor {
                return None;
            }
            let b = &boxes[i * 4..i * 4 + 4];
            let marks = landmarks.and_then(|lm| {
                let pts = lm.get(i * 10..i * 10 + 10)?;
                let mut out = [(0f32, 0f32); NUM_LANDMARKS];
                for (k, p) in out.iter_mut().enumerate() {
                    *p = (pts[k * 2] * w, pts[k * 2 + 1] * h);
                }
                Some(out)
            });
            Some(RawDetection {
                x1: b[0] * w,
                y1: b[1] * h,
                x2: b[2] * w,
                y2: b[3] * h,
                confidence: confidence.clamp(0.0, 1.0),
                landmarks: marks,
            })
        })
        .collect()
}

/// Decode a YOLOv8-face head. Data is channel-major: `data[c * n + i]`.
pub fn decode_yolov8(
    data: &[f32],
    channels: usize,
    proposals: usize,
    spec: &InputSpec,
    width: u32,
    height: u32,
    floor: f32,
) -> Vec<RawDetection> {
    if channels < 5 || data.len() < channels * proposals {
        return Vec::new();
    }
    let sx = width as f32 / spec.width as f32;
    let sy = height as f32 / spec.height as f32;
    let at = |c: usize, i: usize| data[c * proposals + i];

    (0..proposals)
        .filter_map(|i| {
            let confidence = at(4, i);
            if confidence < floor {
                return None;
            }
            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            let landmarks = (channels >= 5 + NUM_LANDMARKS * 3).then(|| {
                let mut out = [(0f32, 0f32); NUM_LANDMARKS];
                for (k, p) in out.iter_mut().enumerate() {
                    let base = 5 + k * 3;
                    *p = (at(base, i) * sx, at(base + 1, i) * sy);
                }
                out
            });
            Some(RawDetection {
                x1: (cx - w / 2.0) * sx,
                y1: (cy - h / 2.0) * sy,
                x2: (cx + w / 2.0) * sx,
                y2: (cy + h / 2.0) * sy,
                confidence: confidence.clamp(0.0, 1.0),
                landmarks,
            })
        })
        .collect()
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy NMS: sort by confidence descending, suppress overlapping boxes.
pub fn nms(mut boxes: Vec<RawDetection>, iou_thresh: f32) -> Vec<RawDetection> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].iou(&boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}

// ── Face extraction ──────────────────────────────────────────────────────────

/// Flags that shape how faces are extracted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractOptions {
    pub strategy: DetectionStrategy,
    pub enforce_detection: bool,
    pub align: bool,
    /// Only used by [`DetectionStrategy::BoxCrop`].
    pub threshold: f32,
}

/// Turns a [`FaceLocator`] into a [`FaceDetect`].
pub struct FaceExtractor<L> {
    locator: L,
    options: ExtractOptions,
}

impl<L: FaceLocator> FaceExtractor<L> {
    pub fn new(locator: L, options: ExtractOptions) -> Self {
        Self { locator, options }
    }
}

impl<L: FaceLocator> FaceDetect for FaceExtractor<L> {
    fn detect(&mut self, image: &RgbImage, source_name: &str) -> Result<Vec<DetectedFace>> {
        let raw = self.locator.locate(image)?;
        let (width, height) = image.dimensions();

        let faces: Vec<DetectedFace> = raw
            .into_iter()
            .filter(|r| match self.options.strategy {
                DetectionStrategy::Extract => true,
                DetectionStrategy::BoxCrop => r.confidence >= self.options.threshold,
            })
            .filter_map(|r| {
                let Some(bbox) = BoundingBox::from_corners(r.x1, r.y1, r.x2, r.y2, width, height)
                else {
                    debug!(?r, "dropping degenerate face box");
                    return None;
                };
                let crop = crop(image, bbox);
                let pixels = match (self.options.strategy, self.options.align) {
                    (DetectionStrategy::Extract, true) => match r.landmarks {
                        Some(marks) => align_face(&crop, marks),
                        None => {
                            debug!("backend has no landmarks; skipping alignment");
                            crop
                        }
                    },
                    _ => crop,
                };
                Some(DetectedFace {
                    bbox,
                    confidence: r.confidence,
                    pixels,
                })
            })
            .collect();

        if faces.is_empty() && self.options.enforce_detection {
            return Err(DemoError::DetectionFailure {
                source_name: source_name.to_string(),
            }
            .into());
        }

        Ok(faces)
    }
}

/// Copy the pixels under `bbox` (already clipped to the image).
pub fn crop(image: &RgbImage, bbox: BoundingBox) -> RgbImage {
    imageops::crop_imm(image, bbox.x, bbox.y, bbox.w, bbox.h).to_image()
}

/// Angle of the eye line, in radians, in image coordinates (y down).
pub fn eye_angle(landmarks: &[(f32, f32); NUM_LANDMARKS]) -> f32 {
    let (rx, ry) = landmarks[0];
    let (lx, ly) = landmarks[1];
    let (left, right) = if rx <= lx {
        ((rx, ry), (lx, ly))
    } else {
        ((lx, ly), (rx, ry))
    };
    (right.1 - left.1).atan2(right.0 - left.0)
}

/// Rotate a face crop so the eyes lie on a horizontal line.
pub fn align_face(face: &RgbImage, landmarks: [(f32, f32); NUM_LANDMARKS]) -> RgbImage {
    let angle = eye_angle(&landmarks);
    if angle.abs() < 1e-3 {
        return face.clone();
    }
    rotate_about_center(face, -angle, Interpolation::Bilinear, Rgb([0, 0, 0]))
}
