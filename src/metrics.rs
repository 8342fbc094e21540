//! Overlap scores between a reference mask and a predicted mask.
//!
//! These are the evaluation functions the lung model was trained with. Inputs
//! are flattened; both grids must have the same shape. Values are expected in
//! [0, 1] (probabilities or binary masks).

use anyhow::{ensure, Result};
use ndarray::ArrayView2;

/// Weight of false negatives in the Tversky index; false positives get
/// `1 - TVERSKY_ALPHA`.
pub const TVERSKY_ALPHA: f64 = 0.6;
pub const FOCAL_TVERSKY_GAMMA: f64 = 0.75;
/// Same fuzz factor as the training backend.
pub const EPSILON: f64 = 1e-7;

/// Soft true positive, false negative and false positive sums.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Confusion {
    true_pos: f64,
    false_neg: f64,
    false_pos: f64,
}

fn confusion(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> Confusion {
    let mut sums = Confusion {
        true_pos: 0.0,
        false_neg: 0.0,
        false_pos: 0.0,
    };
    for (&t, &p) in truth.iter().zip(predicted.iter()) {
        let (t, p) = (f64::from(t), f64::from(p));
        sums.true_pos += t * p;
        sums.false_neg += t * (1.0 - p);
        sums.false_pos += (1.0 - t) * p;
    }
    sums
}

/// Smoothed Tversky index:
///   (TP + 1) / (TP + α·FN + (1 - α)·FP + 1)
pub fn tversky_index(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    let c = confusion(truth, predicted);
    (c.true_pos + 1.0)
        / (c.true_pos + TVERSKY_ALPHA * c.false_neg + (1.0 - TVERSKY_ALPHA) * c.false_pos + 1.0)
}

pub fn tversky_loss(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    1.0 - tversky_index(truth, predicted)
}

/// `(1 - TI)^γ`, the training loss of the lung model.
pub fn focal_tversky(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    (1.0 - tversky_index(truth, predicted)).powf(FOCAL_TVERSKY_GAMMA)
}

/// Smoothed Jaccard index: (TP + 1) / (TP + FN + FP + 1)
pub fn iou(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    let c = confusion(truth, predicted);
    (c.true_pos + 1.0) / (c.true_pos + c.false_neg + c.false_pos + 1.0)
}

pub fn iou_loss(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    1.0 - iou(truth, predicted)
}

/// Share of reference-positive pixels that the prediction also marks.
pub fn sensitivity(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    let mut hits = 0.0;
    let mut positives = 0.0;
    for (&t, &p) in truth.iter().zip(predicted.iter()) {
        let (t, p) = (f64::from(t), f64::from(p));
        hits += round_clipped(t * p);
        positives += round_clipped(t);
    }
    hits / (positives + EPSILON)
}

/// Share of reference-negative pixels that the prediction also leaves out.
pub fn specificity(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> f64 {
    let mut hits = 0.0;
    let mut negatives = 0.0;
    for (&t, &p) in truth.iter().zip(predicted.iter()) {
        let (t, p) = (f64::from(t), f64::from(p));
        hits += round_clipped((1.0 - t) * (1.0 - p));
        negatives += round_clipped(1.0 - t);
    }
    hits / (negatives + EPSILON)
}

// Ties round to even, like the backend's round().
fn round_clipped(value: f64) -> f64 {
    value.clamp(0.0, 1.0).round_ties_even()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskScores {
    pub iou: f64,
    pub iou_loss: f64,
    pub tversky: f64,
    pub tversky_loss: f64,
    pub focal_tversky: f64,
    pub sensitivity: f64,
    pub specificity: f64,
}

impl MaskScores {
    pub fn compare(truth: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> Result<Self> {
        ensure!(
            truth.dim() == predicted.dim(),
            "Reference mask is {:?} but prediction is {:?}",
            truth.dim(),
            predicted.dim()
        );
        Ok(Self {
            iou: iou(truth, predicted),
            iou_loss: iou_loss(truth, predicted),
            tversky: tversky_index(truth, predicted),
            tversky_loss: tversky_loss(truth, predicted),
            focal_tversky: focal_tversky(truth, predicted),
            sensitivity: sensitivity(truth, predicted),
            specificity: specificity(truth, predicted),
        })
    }
}
