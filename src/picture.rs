use std::path::Path;

use anyhow::{Context, Result};
use eframe::egui::ColorImage;
use image::{GrayImage, ImageFormat, Luma};
use ndarray::{Array2, ArrayView2};

/// Decodes any raster format `image` understands into an RGBA texture.
pub fn load_picture(path: &Path) -> Result<ColorImage> {
    let rgba = image::open(path)
        .with_context(|| format!("Could not open image {}", path.display()))?
        .to_rgba8();
    let size = [rgba.width() as usize, rgba.height() as usize];
    log::info!("Opened image {} ({}x{})", path.display(), size[0], size[1]);
    Ok(ColorImage::from_rgba_unmultiplied(size, rgba.as_raw()))
}

/// Writes a [0, 1] grid as an 8-bit grayscale PNG. Values outside the range
/// are clipped.
pub fn save_gray_png(path: &Path, pixels: ArrayView2<'_, f32>) -> Result<()> {
    let (rows, columns) = pixels.dim();
    let mut img = GrayImage::new(columns as u32, rows as u32);
    for ((row, column), &value) in pixels.indexed_iter() {
        let gray = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
        img.put_pixel(column as u32, row as u32, Luma([gray]));
    }
    img.save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Could not write {}", path.display()))?;
    Ok(())
}

/// Reads a reference mask image; any nonzero pixel is foreground.
pub fn load_reference_mask(path: &Path) -> Result<Array2<f32>> {
    let gray = image::open(path)
        .with_context(|| format!("Could not open reference mask {}", path.display()))?
        .to_luma8();
    let (columns, rows) = gray.dimensions();
    let values = gray
        .pixels()
        .map(|pixel| if pixel[0] > 0 { 1.0 } else { 0.0 })
        .collect();
    Ok(Array2::from_shape_vec((rows as usize, columns as usize), values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::path::PathBuf;

    fn temp_png(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "lungview-picture-{tag}-{}.png",
            std::process::id()
        ))
    }

    #[test]
    fn gray_png_reads_back_as_mask() {
        let path = temp_png("mask");
        let grid = array![[0.0f32, 1.0, 0.0], [0.2, 0.0, 1.5]];
        save_gray_png(&path, grid.view()).expect("png should be written");

        let mask = load_reference_mask(&path).expect("png should load");
        assert_eq!(mask, array![[0.0, 1.0, 0.0], [1.0, 0.0, 1.0]]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn picture_keeps_dimensions() {
        let path = temp_png("picture");
        save_gray_png(&path, Array2::<f32>::zeros((3, 5)).view()).expect("png should be written");

        let picture = load_picture(&path).expect("picture should load");
        assert_eq!(picture.size, [5, 3]);
        assert_eq!(picture.pixels.len(), 15);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_picture_is_an_error() {
        assert!(load_picture(Path::new("/nonexistent/lungview.png")).is_err());
    }
}
