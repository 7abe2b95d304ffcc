//! tracking: frame-skip cache for the video demo
//!
//! Full detection + classification runs on every `skip + 1`-th frame (a
//! Compute frame). The frames in between (Reuse frames) redraw the most
//! recent Compute results unchanged: no detection, no classification, no
//! counting, no decay.

use tracing::trace;

use crate::detection::BoundingBox;
use crate::emotion::EmotionLabel;

/// One annotation carried from a Compute frame to the Reuse frames after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedFace {
    pub bbox: BoundingBox,
    pub label: EmotionLabel,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Compute,
    Reuse,
}

/// Compute/Reuse state machine plus the cache of the last Compute frame.
#[derive(Debug, Clone)]
pub struct FrameSkipTracker {
    skip: u32,
    cache: Vec<TrackedFace>,
    compute_frames: u64,
    frames_seen: u64,
}

impl FrameSkipTracker {
    pub fn new(skip: u32) -> Self {
        Self {
            skip,
            cache: Vec::new(),
            compute_frames: 0,
            frames_seen: 0,
        }
    }

    /// Mode of the 0-based frame `index`. Frame 0 is always Compute.
    pub fn mode_for(&self, index: u64) -> FrameMode {
        if index % (self.skip as u64 + 1) == 0 {
            FrameMode::Compute
        } else {
            FrameMode::Reuse
        }
    }

    /// Advance to frame `index`. On a Compute frame the cache is cleared and
    /// refilled from `compute`; on a Reuse frame `compute` is not called.
    /// Returns the annotations to draw on this frame.
    pub fn step<F, E>(&mut self, index: u64, compute: F) -> Result<&[TrackedFace], E>
    where
        F: FnOnce() -> Result<Vec<TrackedFace>, E>,
    {
        self.frames_seen += 1;
        match self.mode_for(index) {
            FrameMode::Compute => {
                self.cache.clear();
                self.compute_frames += 1;
                self.cache = compute()?;
                trace!(frame = index, faces = self.cache.len(), "compute frame");
            }
            FrameMode::Reuse => {
                trace!(frame = index, faces = self.cache.len(), "reuse frame");
            }
        }
        Ok(&self.cache)
    }

    /// Annotations of the most recent Compute frame.
    pub fn cached(&self) -> &[TrackedFace] {
        &self.cache
    }

    /// Number of Compute frames executed so far.
    pub fn compute_frames(&self) -> u64 {
        self.compute_frames
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Compute frames a video of `total` frames will have.
    pub fn expected_compute_frames(total: u64, skip: u32) -> u64 {
        total.div_ceil(skip as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: u32, label: EmotionLabel) -> TrackedFace {
        TrackedFace {
            bbox: BoundingBox::new(x, 0, 10, 10),
            label,
            confidence: 0.9,
        }
    }

    #[test]
    fn zero_skip_computes_every_frame() {
        let t = FrameSkipTracker::new(0);
        assert!((0..20).all(|i| t.mode_for(i) == FrameMode::Compute));
    }

    #[test]
    fn skip_k_computes_every_k_plus_one() {
        let t = FrameSkipTracker::new(2);
        let compute: Vec<u64> = (0..10).filter(|&i| t.mode_for(i) == FrameMode::Compute).collect();
        assert_eq!(compute, [0, 3, 6, 9]);
    }

    #[test]
    fn ten_frames_skip_one() {
        let mut t = FrameSkipTracker::new(1);
        let mut calls = Vec::new();
        let mut drawn = Vec::new();

        for i in 0..10u64 {
            let faces = t
                .step(i, || {
                    calls.push(i);
                    Ok::<_, ()>(vec![face(i as u32, EmotionLabel::Happiness)])
                })
                .unwrap();
            drawn.push(faces[0].bbox.x);
        }

        assert_eq!(calls, [0, 2, 4, 6, 8]);
        assert_eq!(drawn, [0, 0, 2, 2, 4, 4, 6, 6, 8, 8]);
        assert_eq!(t.compute_frames(), 5);
        assert_eq!(t.frames_seen(), 10);
        assert_eq!(FrameSkipTracker::expected_compute_frames(10, 1), 5);
    }

    #[test]
    fn empty_compute_frame_clears_cache() {
        let mut t = FrameSkipTracker::new(1);
        t.step(0, || Ok::<_, ()>(vec![face(1, EmotionLabel::Anger)]))
            .unwrap();
        assert_eq!(t.cached().len(), 1);

        t.step(2, || Ok::<_, ()>(Vec::new())).unwrap();
        let reused = t.step(3, || Ok::<_, ()>(vec![face(9, EmotionLabel::Fear)])).unwrap();
        assert!(reused.is_empty());
    }

    #[test]
    fn reuse_copies_annotations_unchanged() {
        let mut t = FrameSkipTracker::new(3);
        let original = face(5, EmotionLabel::Sadness);
        t.step(0, || Ok::<_, ()>(vec![original])).unwrap();
        for i in 1..4 {
            let faces = t.step(i, || Ok::<_, ()>(Vec::new())).unwrap();
            assert_eq!(faces, [original]);
        }
    }

    #[test]
    fn compute_error_propagates() {
        let mut t = FrameSkipTracker::new(0);
        let err = t.step(0, || Err::<Vec<TrackedFace>, _>("boom")).unwrap_err();
        assert_eq!(err, "boom");
        assert!(t.cached().is_empty());
    }

    #[test]
    fn expected_compute_frames_rounds_up() {
        assert_eq!(FrameSkipTracker::expected_compute_frames(0, 4), 0);
        assert_eq!(FrameSkipTracker::expected_compute_frames(11, 1), 6);
        assert_eq!(FrameSkipTracker::expected_compute_frames(7, 0), 7);
    }
}
