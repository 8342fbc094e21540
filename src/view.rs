use std::path::{Path, PathBuf};

use ndarray::{s, Array2};

use crate::error::Result;

/// Where slice pixels come from. The DICOM reader is the production source;
/// tests substitute in-memory grids.
pub trait SliceSource: Send + Sync {
    /// Calibrated pixels of the slice at `path`, row-major `[rows, columns]`.
    fn read_slice(&self, path: &Path) -> Result<Array2<f32>>;
}

/// One displayed slice together with the transforms applied to it.
///
/// Transforms return a new value instead of editing in place. The grid is
/// stored rotated but never inverted: inversion is applied on read against
/// the grid maximum, which rotation does not change, so a double toggle is
/// always exact.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceView {
    source: PathBuf,
    pixels: Array2<f32>,
    quarter_turns: u8,
    contrast_inverted: bool,
}

impl SliceView {
    pub fn load(source: &dyn SliceSource, path: &Path) -> Result<Self> {
        let pixels = source.read_slice(path)?;
        Ok(Self::new(path.to_path_buf(), pixels))
    }

    pub fn new(source: PathBuf, pixels: Array2<f32>) -> Self {
        Self {
            source,
            pixels,
            quarter_turns: 0,
            contrast_inverted: false,
        }
    }

    /// Rotate by `degrees / 90` quarter turns (truncated), counter-clockwise
    /// for positive values.
    pub fn rotated(&self, degrees: i32) -> Self {
        let turns = (degrees / 90).rem_euclid(4) as u8;
        let mut pixels = self.pixels.clone();
        for _ in 0..turns {
            pixels = rotate_quarter_ccw(&pixels);
        }
        Self {
            source: self.source.clone(),
            pixels,
            quarter_turns: (self.quarter_turns + turns) % 4,
            contrast_inverted: self.contrast_inverted,
        }
    }

    pub fn with_contrast_toggled(&self) -> Self {
        Self {
            contrast_inverted: !self.contrast_inverted,
            ..self.clone()
        }
    }

    /// The grid as it should be drawn: rotated and, when toggled,
    /// `max(data) - data`.
    pub fn displayed(&self) -> Array2<f32> {
        if !self.contrast_inverted {
            return self.pixels.clone();
        }
        let max = grid_max(&self.pixels);
        self.pixels.mapv(|value| max - value)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn rotation_degrees(&self) -> u16 {
        u16::from(self.quarter_turns) * 90
    }

    pub fn is_contrast_inverted(&self) -> bool {
        self.contrast_inverted
    }

    pub fn is_transformed(&self) -> bool {
        self.quarter_turns != 0 || self.contrast_inverted
    }

    /// `[columns, rows]` of the displayed grid.
    pub fn size(&self) -> [usize; 2] {
        let (rows, columns) = self.pixels.dim();
        [columns, rows]
    }
}

fn rotate_quarter_ccw(pixels: &Array2<f32>) -> Array2<f32> {
    pixels.t().slice(s![..;-1, ..]).to_owned()
}

pub fn grid_max(pixels: &Array2<f32>) -> f32 {
    pixels.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}
