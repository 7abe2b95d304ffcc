//! config: per-run demo configuration and the optional settings file

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::classifier::ModelVariant;
use crate::detection::{DetectionStrategy, DetectorBackend, ExtractOptions};
use crate::error::DemoError;

pub const DEFAULT_MODELS_ROOT: &str = "models";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Everything one demo invocation is configured with. Built once, never
/// mutated while files are processed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DemoConfig {
    model: ModelVariant,
    detector: DetectorBackend,
    strategy: DetectionStrategy,
    threshold: f32,
    enforce_detection: bool,
    align_faces: bool,
}

impl DemoConfig {
    /// Fails when `threshold` is not a number in `[0, 1]`.
    pub fn new(
        model: ModelVariant,
        detector: DetectorBackend,
        strategy: DetectionStrategy,
        threshold: f32,
        enforce_detection: bool,
        align_faces: bool,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("detection threshold must be within [0, 1], got {threshold}");
        }
        Ok(Self {
            model,
            detector,
            strategy,
            threshold,
            enforce_detection,
            align_faces,
        })
    }

    pub fn model(&self) -> ModelVariant {
        self.model
    }
    pub fn detector(&self) -> DetectorBackend {
        self.detector
    }
    pub fn strategy(&self) -> DetectionStrategy {
        self.strategy
    }
    pub fn threshold(&self) -> f32 {
        self.threshold
    }
    pub fn enforce_detection(&self) -> bool {
        self.enforce_detection
    }
    pub fn align_faces(&self) -> bool {
        self.align_faces
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            strategy: self.strategy,
            enforce_detection: self.enforce_detection,
            align: self.align_faces,
            threshold: self.threshold,
        }
    }

    /// `<stem>_<model>_<detector>_threshold<t>_enforce-<bool>_align-<bool>`
    pub fn artifact_base(&self, stem: &str) -> String {
        format!(
            "{stem}_{}_{}_threshold{}_enforce-{}_align-{}",
            self.model,
            self.detector,
            format_float(self.threshold),
            self.enforce_detection,
            self.align_faces
        )
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            model: ModelVariant::AffectnetEnetB0,
            detector: DetectorBackend::OpenCv,
            strategy: DetectionStrategy::Extract,
            threshold: DEFAULT_THRESHOLD,
            enforce_detection: false,
            align_faces: false,
        }
    }
}

/// Shortest decimal form of `v` that always carries a fractional part:
/// `0.5`, `1.0`, `29.97`.
pub fn format_float(v: impl fmt::Display) -> String {
    let s = v.to_string();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        format!("{s}.0")
    } else {
        s
    }
}

// ── Settings file ────────────────────────────────────────────────────────────

/// Optional TOML settings. Every key may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub models_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub ort_dylib: Option<PathBuf>,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid settings file")
    }

    /// Read the settings file at `path`; `None` yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| DemoError::io(path, e))?;
        let settings = Self::from_toml_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::debug!(path = %path.display(), ?settings, "settings loaded");
        Ok(settings)
    }

    /// Command-line values win over file values.
    pub fn with_overrides(mut self, models_root: Option<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        if models_root.is_some() {
            self.models_root = models_root;
        }
        if output_dir.is_some() {
            self.output_dir = output_dir;
        }
        self
    }

    pub fn models_root(&self) -> PathBuf {
        self.models_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_ROOT))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let make = |t| {
            DemoConfig::new(
                ModelVariant::RafEnetB0,
                DetectorBackend::Ssd,
                DetectionStrategy::Extract,
                t,
                false,
                false,
            )
        };
        assert!(make(0.0).is_ok());
        assert!(make(1.0).is_ok());
        assert!(make(-0.1).is_err());
        assert!(make(1.5).is_err());
        assert!(make(f32::NAN).is_err());
    }

    #[test]
    fn artifact_base_matches_naming_scheme() {
        let cfg = DemoConfig::new(
            ModelVariant::AffectnetEnetB2,
            DetectorBackend::RetinaFace,
            DetectionStrategy::Extract,
            0.5,
            true,
            false,
        )
        .unwrap();
        assert_eq!(
            cfg.artifact_base("party"),
            "party_affectnet_enet_b2_retinaface_threshold0.5_enforce-true_align-false"
        );
    }

    #[test]
    fn floats_always_show_a_fraction() {
        assert_eq!(format_float(1.0f64), "1.0");
        assert_eq!(format_float(0.5f64), "0.5");
        assert_eq!(format_float(29.97f64), "29.97");
        assert_eq!(format_float(30.0f64), "30.0");
        assert_eq!(format_float(0.7f32), "0.7");
        assert_eq!(format_float(0.05f32), "0.05");
    }

    #[test]
    fn settings_parse_partial_files() {
        let s = Settings::from_toml_str("models_root = \"/srv/models\"\n").unwrap();
        assert_eq!(s.models_root(), PathBuf::from("/srv/models"));
        assert_eq!(s.output_dir(), PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert!(s.ort_dylib.is_none());
        assert!(Settings::from_toml_str("model_root = 1").is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let s = Settings::from_toml_str("output_dir = \"a\"\nmodels_root = \"m\"").unwrap();
        let s = s.with_overrides(None, Some(PathBuf::from("b")));
        assert_eq!(s.output_dir(), PathBuf::from("b"));
        assert_eq!(s.models_root(), PathBuf::from("m"));
    }

    #[test]
    fn missing_settings_file_is_an_io_failure() {
        let err = Settings::load(Some(Path::new("/nonexistent/fer.toml"))).unwrap_err();
        assert_eq!(
            crate::error::FailureKind::of(&err),
            crate::error::FailureKind::Io
        );
        assert_eq!(Settings::load(None).unwrap(), Settings::default());
    }
}
