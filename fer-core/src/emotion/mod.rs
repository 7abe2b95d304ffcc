//! emotion: label registry, classifier output and per-input counts
//!
//! The classifier emits one logit per label in the fixed order below; the
//! index of a label is its position in that order.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Number of emotion classes the models are trained on.
pub const NUM_EMOTIONS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmotionLabel {
    Surprise,
    Fear,
    Disgust,
    Happiness,
    Sadness,
    Anger,
    Neutral,
}

impl EmotionLabel {
    /// All labels in model-output order.
    pub const ALL: [EmotionLabel; NUM_EMOTIONS] = [
        EmotionLabel::Surprise,
        EmotionLabel::Fear,
        EmotionLabel::Disgust,
        EmotionLabel::Happiness,
        EmotionLabel::Sadness,
        EmotionLabel::Anger,
        EmotionLabel::Neutral,
    ];

    pub fn get_label(index: usize) -> Option<EmotionLabel> {
        Self::ALL.get(index).copied()
    }

    pub fn get_index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Surprise => "Surprise",
            EmotionLabel::Fear => "Fear",
            EmotionLabel::Disgust => "Disgust",
            EmotionLabel::Happiness => "Happiness",
            EmotionLabel::Sadness => "Sadness",
            EmotionLabel::Anger => "Anger",
            EmotionLabel::Neutral => "Neutral",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownLabel(String);

impl FromStr for EmotionLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

impl Serialize for EmotionLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ── Classification ───────────────────────────────────────────────────────────

/// Classifier verdict for one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: EmotionLabel,
    pub probabilities: [f32; NUM_EMOTIONS],
}

impl Classification {
    /// Build a classification from raw model logits (softmax + argmax).
    pub fn from_logits(logits: &[f32]) -> Result<Self> {
        if logits.len() != NUM_EMOTIONS {
            bail!(
                "expected {NUM_EMOTIONS} class scores from the emotion model, got {}",
                logits.len()
            );
        }
        let probs = softmax(logits);
        let mut probabilities = [0f32; NUM_EMOTIONS];
        probabilities.copy_from_slice(&probs);
        let index = argmax(&probabilities);
        let label = EmotionLabel::ALL[index];
        Ok(Self {
            label,
            probabilities,
        })
    }

    /// Probability of the winning class.
    pub fn confidence(&self) -> f32 {
        self.probabilities[self.label.get_index()]
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

// ── Counts ───────────────────────────────────────────────────────────────────

/// Per-label counts for one processed input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmotionCounts {
    counts: [u64; NUM_EMOTIONS],
}

impl EmotionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, label: EmotionLabel) {
        self.counts[label.get_index()] += 1;
    }

    pub fn get(&self, label: EmotionLabel) -> u64 {
        self.counts[label.get_index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EmotionLabel, u64)> + '_ {
        EmotionLabel::ALL.iter().map(|&l| (l, self.get(l)))
    }

    /// Counts divided by `evaluated` frames. Zero frames yields all zeros.
    pub fn normalized(&self, evaluated: u64) -> [f64; NUM_EMOTIONS] {
        let mut out = [0f64; NUM_EMOTIONS];
        if evaluated == 0 {
            return out;
        }
        for (o, &c) in out.iter_mut().zip(self.counts.iter()) {
            *o = c as f64 / evaluated as f64;
        }
        out
    }
}

impl Serialize for EmotionCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(NUM_EMOTIONS))?;
        for (label, count) in self.iter() {
            map.serialize_entry(label.as_str(), &count)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_label_bijection() {
        for i in 0..NUM_EMOTIONS {
            let label = EmotionLabel::get_label(i).unwrap();
            assert_eq!(label.get_index(), i);
        }
        for label in EmotionLabel::ALL {
            assert_eq!(EmotionLabel::get_label(label.get_index()), Some(label));
        }
        assert_eq!(EmotionLabel::get_label(NUM_EMOTIONS), None);
    }

    #[test]
    fn labels_keep_model_order() {
        let names: Vec<&str> = EmotionLabel::ALL.iter().map(|l| l.as_str()).collect();
        assert_eq!(
            names,
            ["Surprise", "Fear", "Disgust", "Happiness", "Sadness", "Anger", "Neutral"]
        );
    }

    #[test]
    fn labels_parse_from_display() {
        for label in EmotionLabel::ALL {
            assert_eq!(label.to_string().parse::<EmotionLabel>().unwrap(), label);
        }
        assert!("Contempt".parse::<EmotionLabel>().is_err());
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(&[2.0, -1.0, 0.5, 10.0, 3.3, -7.0, 0.0]);
        assert_eq!(probs.len(), 7);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn softmax_survives_large_logits() {
        let probs = softmax(&[1000.0, 999.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn argmax_breaks_ties_on_first_occurrence() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), 1);
        assert_eq!(argmax(&[0.25, 0.25, 0.25, 0.25]), 0);
        assert_eq!(argmax(&[0.0, 0.0, 0.9]), 2);
    }

    #[test]
    fn classification_from_logits() {
        let c = Classification::from_logits(&[0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(c.label, EmotionLabel::Happiness);
        let sum: f32 = c.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(c.confidence() > 0.9);
    }

    #[test]
    fn classification_rejects_wrong_class_count() {
        assert!(Classification::from_logits(&[0.0; 8]).is_err());
        assert!(Classification::from_logits(&[]).is_err());
    }

    #[test]
    fn counts_accumulate_and_normalize() {
        let mut counts = EmotionCounts::new();
        counts.increment(EmotionLabel::Anger);
        counts.increment(EmotionLabel::Anger);
        counts.increment(EmotionLabel::Neutral);
        assert_eq!(counts.get(EmotionLabel::Anger), 2);
        assert_eq!(counts.total(), 3);

        let norm = counts.normalized(4);
        assert_eq!(norm[EmotionLabel::Anger.get_index()], 0.5);
        assert_eq!(norm[EmotionLabel::Neutral.get_index()], 0.25);
        assert_eq!(counts.normalized(0), [0.0; NUM_EMOTIONS]);
    }

    #[test]
    fn counts_serialize_as_ordered_map() {
        let mut counts = EmotionCounts::new();
        counts.increment(EmotionLabel::Fear);
        let json = serde_json::to_string(&counts).unwrap();
        assert!(json.starts_with("{\"Surprise\":0,\"Fear\":1"));
    }
}
