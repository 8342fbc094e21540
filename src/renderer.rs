use eframe::egui::{Color32, ColorImage};
use ndarray::ArrayView2;

/// Min-max scales a grid to 8-bit gray. A flat grid renders black.
pub fn render_gray(pixels: ArrayView2<'_, f32>) -> ColorImage {
    let (rows, columns) = pixels.dim();
    let (low, high) = value_range(pixels);
    let range = high - low;

    let mut out = Vec::with_capacity(rows * columns);
    for &sample in pixels.iter() {
        out.push(Color32::from_gray(scale_to_u8(sample, low, range)));
    }

    ColorImage {
        size: [columns, rows],
        pixels: out,
    }
}

/// Renders a grid already in [0, 1] without rescaling, so an all-zero or
/// all-one mask keeps its meaning.
pub fn render_unit_gray(pixels: ArrayView2<'_, f32>) -> ColorImage {
    let (rows, columns) = pixels.dim();
    let out = pixels
        .iter()
        .map(|&sample| Color32::from_gray(scale_to_u8(sample, 0.0, 1.0)))
        .collect();
    ColorImage {
        size: [columns, rows],
        pixels: out,
    }
}

fn value_range(pixels: ArrayView2<'_, f32>) -> (f32, f32) {
    let (low, high) = pixels
        .iter()
        .filter(|value| value.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if low > high {
        (0.0, 0.0)
    } else {
        (low, high)
    }
}

fn scale_to_u8(sample: f32, low: f32, range: f32) -> u8 {
    if range <= 0.0 {
        return 0;
    }
    let normalized = ((sample - low) / range).clamp(0.0, 1.0);
    (normalized * 255.0).round() as u8
}
