//! preprocess: face crop → normalized NCHW tensor for the emotion models
//!
//! Resize to 224×224 (bilinear), scale to [0, 1], then normalize each RGB
//! channel with the ImageNet statistics the EfficientNet models were trained
//! with.

use image::{imageops, RgbImage};
use rayon::prelude::*;

/// Classifier input size (square).
pub const INPUT_SIZE: u32 = 224;
/// Per-channel mean (RGB).
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation (RGB).
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A `[1, 3, 224, 224]` float tensor in row-major NCHW layout.
#[derive(Debug, Clone)]
pub struct FaceTensor {
    data: Vec<f32>,
}

impl FaceTensor {
    pub const SHAPE: [usize; 4] = [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];

    pub fn shape(&self) -> [usize; 4] {
        Self::SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

}

#[cfg(test)]
impl FaceTensor {
    /// Value at `(channel, y, x)` of the single batch entry.
    fn at(&self, channel: usize, y: usize, x: usize) -> f32 {
        let side = INPUT_SIZE as usize;
        self.data[channel * side * side + y * side + x]
    }
}

/// Convert a face crop of any (non-zero) size into a classifier input tensor.
pub fn preprocess(face: &RgbImage) -> FaceTensor {
    let resized = if face.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
        face.clone()
    } else {
        imageops::resize(face, INPUT_SIZE, INPUT_SIZE, imageops::FilterType::Triangle)
    };
    let raw = resized.as_raw();

    let size = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0f32; 3 * size];

    data.par_chunks_mut(size)
        .enumerate()
        .for_each(|(channel, plane)| {
            let mean = MEAN[channel];
            let std = STD[channel];
            for (idx, out) in plane.iter_mut().enumerate() {
                let v = raw[idx * 3 + channel] as f32 / 255.0;
                *out = (v - mean) / std;
            }
        });

    FaceTensor { data }
}
