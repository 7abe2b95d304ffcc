//! classifier: pretrained emotion models behind one capability
//!
//! Each [`ModelVariant`] is an EfficientNet export stored as
//! `<models-root>/<family>/<name>.onnx`, where the family is the part of the
//! name before its first underscore.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::emotion::Classification;
use crate::preprocess::FaceTensor;
use crate::runtime::{self, Device};

/// Anything that can turn a preprocessed face into a 7-class verdict.
pub trait EmotionClassify {
    fn classify(&mut self, tensor: &FaceTensor) -> Result<Classification>;
}

impl<T: EmotionClassify + ?Sized> EmotionClassify for Box<T> {
    fn classify(&mut self, tensor: &FaceTensor) -> Result<Classification> {
        (**self).classify(tensor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    AffectnetEnetB0,
    AffectnetEnetB2,
    RafEnetB0,
    RafEnetB2,
    RafEnetB0Epochs6,
    RafEnetB0Epochs10,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 6] = [
        ModelVariant::AffectnetEnetB0,
        ModelVariant::AffectnetEnetB2,
        ModelVariant::RafEnetB0,
        ModelVariant::RafEnetB2,
        ModelVariant::RafEnetB0Epochs6,
        ModelVariant::RafEnetB0Epochs10,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::AffectnetEnetB0 => "affectnet_enet_b0",
            ModelVariant::AffectnetEnetB2 => "affectnet_enet_b2",
            ModelVariant::RafEnetB0 => "raf_enet_b0",
            ModelVariant::RafEnetB2 => "raf_enet_b2",
            ModelVariant::RafEnetB0Epochs6 => "raf_enet_b0_6epochs",
            ModelVariant::RafEnetB0Epochs10 => "raf_enet_b0_10epochs",
        }
    }

    /// Training-set family: the name up to its first underscore.
    pub fn family(self) -> &'static str {
        let name = self.as_str();
        name.split('_').next().unwrap_or(name)
    }

    pub fn weights_path(self, models_root: &Path) -> PathBuf {
        models_root
            .join(self.family())
            .join(format!("{}.onnx", self.as_str()))
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ModelVariant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown model `{0}` (expected one of: affectnet_enet_b0, affectnet_enet_b2, raf_enet_b0, raf_enet_b2, raf_enet_b0_6epochs, raf_enet_b0_10epochs)")]
pub struct UnknownModel(String);

impl FromStr for ModelVariant {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}

// ── ONNX adapter ─────────────────────────────────────────────────────────────

/// Wraps one emotion-model ORT session.
pub struct OnnxEmotionClassifier {
    variant: ModelVariant,
    session: Session,
}

impl OnnxEmotionClassifier {
    pub fn load(variant: ModelVariant, models_root: &Path, device: Device) -> Result<Self> {
        let path = variant.weights_path(models_root);
        let what = format!("emotion model {variant}");
        let session = runtime::build_session(&path, &what, device)?;
        tracing::info!(model = %variant, path = %path.display(), %device, "emotion model loaded");
        Ok(Self { variant, session })
    }
}

impl EmotionClassify for OnnxEmotionClassifier {
    fn classify(&mut self, tensor: &FaceTensor) -> Result<Classification> {
        let input = Tensor::from_array((tensor.shape(), tensor.as_slice().to_vec()))
            .context("failed to create emotion input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .with_context(|| format!("{} inference failed", self.variant))?;

        // [1, 7] logits
        let (_shape, logits) = runtime::output_f32(&outputs, 0)?;
        Classification::from_logits(&logits)
            .with_context(|| format!("unexpected output from {}", self.variant))
    }
}
