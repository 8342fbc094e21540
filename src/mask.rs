use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};

use crate::error::ViewerError;
use crate::view::SliceSource;

/// A loaded segmentation network.
pub trait SegmentationModel: Send {
    /// Per-pixel foreground probabilities for a normalized square slice.
    fn predict(&mut self, input: ArrayView2<'_, f32>) -> Result<Array2<f32>>;
}

/// Produces a ready-to-run model, typically by reading a file from disk.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn SegmentationModel>>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct MaskPrediction {
    pub source: PathBuf,
    /// The model input: resized and normalized to [0, 1].
    pub input: Array2<f32>,
    /// 0/1 grid, same shape as `input`.
    pub mask: Array2<f32>,
    /// `input * mask`.
    pub overlay: Array2<f32>,
}

impl MaskPrediction {
    pub fn foreground_fraction(&self) -> f32 {
        let total = self.mask.len().max(1) as f32;
        self.mask.sum() / total
    }
}

pub struct MaskOverlayService {
    source: Arc<dyn SliceSource>,
    loader: Box<dyn ModelLoader>,
    input_size: usize,
    threshold: f32,
    cached: Option<Mutex<Option<Box<dyn SegmentationModel>>>>,
}

impl MaskOverlayService {
    /// With `cache_model` false the model is loaded again for every
    /// prediction.
    pub fn new(
        source: Arc<dyn SliceSource>,
        loader: Box<dyn ModelLoader>,
        input_size: usize,
        threshold: f32,
        cache_model: bool,
    ) -> Self {
        Self {
            source,
            loader,
            input_size: input_size.max(1),
            threshold,
            cached: cache_model.then(|| Mutex::new(None)),
        }
    }

    pub fn predict(&self, path: &Path) -> crate::error::Result<MaskPrediction> {
        self.predict_cancellable(path, &AtomicBool::new(false))
    }

    /// Like [`Self::predict`], but gives up with [`ViewerError::Cancelled`]
    /// as soon as `cancel` is observed between stages.
    pub fn predict_cancellable(
        &self,
        path: &Path,
        cancel: &AtomicBool,
    ) -> crate::error::Result<MaskPrediction> {
        let started = Instant::now();
        let pixels = self.source.read_slice(path)?;
        let input = normalize(&resize_area(pixels.view(), self.input_size, self.input_size));
        check_cancel(cancel)?;

        let probabilities = match &self.cached {
            Some(slot) => {
                let mut guard = slot
                    .lock()
                    .map_err(|err| ViewerError::Model(format!("model cache lock poisoned: {err}")))?;
                if guard.is_none() {
                    *guard = Some(self.load_model()?);
                    check_cancel(cancel)?;
                }
                match guard.as_mut() {
                    Some(model) => model.predict(input.view()).map_err(ViewerError::model)?,
                    None => return Err(ViewerError::Model("model cache is empty".to_string())),
                }
            }
            None => {
                let mut model = self.load_model()?;
                check_cancel(cancel)?;
                model.predict(input.view()).map_err(ViewerError::model)?
            }
        };
        check_cancel(cancel)?;

        if probabilities.dim() != input.dim() {
            return Err(ViewerError::Model(format!(
                "model returned a {:?} grid for a {:?} input",
                probabilities.dim(),
                input.dim()
            )));
        }

        let threshold = self.threshold;
        let mask = probabilities.mapv(|p| if p > threshold { 1.0 } else { 0.0 });
        let overlay = &input * &mask;
        let prediction = MaskPrediction {
            source: path.to_path_buf(),
            input,
            mask,
            overlay,
        };
        log::info!(
            "Predicted mask for {} in {:.2?} ({:.1}% foreground)",
            path.display(),
            started.elapsed(),
            prediction.foreground_fraction() * 100.0
        );
        Ok(prediction)
    }

    fn load_model(&self) -> crate::error::Result<Box<dyn SegmentationModel>> {
        log::info!("Loading segmentation model {}", self.loader.describe());
        self.loader.load().map_err(ViewerError::model)
    }
}

fn check_cancel(cancel: &AtomicBool) -> crate::error::Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(ViewerError::Cancelled);
    }
    Ok(())
}

/// Area-averaging resample: every output pixel is the mean of the input area
/// it covers, weighted by overlap.
pub fn resize_area(pixels: ArrayView2<'_, f32>, rows: usize, columns: usize) -> Array2<f32> {
    let (src_rows, src_columns) = pixels.dim();
    if src_rows == 0 || src_columns == 0 || rows == 0 || columns == 0 {
        return Array2::zeros((rows, columns));
    }
    if (src_rows, src_columns) == (rows, columns) {
        return pixels.to_owned();
    }

    let row_weights = area_weights(src_rows, rows);
    let column_weights = area_weights(src_columns, columns);

    let mut vertical = Array2::<f32>::zeros((rows, src_columns));
    for (out_row, weights) in row_weights.iter().enumerate() {
        let mut target = vertical.index_axis_mut(Axis(0), out_row);
        for &(src_row, weight) in weights {
            target.scaled_add(weight, &pixels.index_axis(Axis(0), src_row));
        }
    }

    let mut resized = Array2::<f32>::zeros((rows, columns));
    for (out_column, weights) in column_weights.iter().enumerate() {
        let mut target = resized.index_axis_mut(Axis(1), out_column);
        for &(src_column, weight) in weights {
            target.scaled_add(weight, &vertical.index_axis(Axis(1), src_column));
        }
    }
    resized
}

fn area_weights(source: usize, target: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = source as f64 / target as f64;
    (0..target)
        .map(|out| {
            let start = out as f64 * scale;
            let end = start + scale;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(source);
            (first..last)
                .filter_map(|index| {
                    let overlap = end.min(index as f64 + 1.0) - start.max(index as f64);
                    (overlap > 1e-9).then(|| (index, (overlap / scale) as f32))
                })
                .collect()
        })
        .collect()
}

/// Min-max scale into [0, 1]. A flat grid maps to all zeros.
pub fn normalize(pixels: &Array2<f32>) -> Array2<f32> {
    let (min, max) = pixels
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Array2::zeros(pixels.dim());
    }
    pixels.mapv(|value| (value - min) / range)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::viewer::tests::MemorySource;
    use ndarray::array;
    use std::sync::atomic::AtomicUsize;

    /// Echoes its input as probabilities and counts loads.
    pub(crate) struct EchoLoader {
        pub(crate) loads: Arc<AtomicUsize>,
    }

    struct EchoModel;

    impl SegmentationModel for EchoModel {
        fn predict(&mut self, input: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
            Ok(input.to_owned())
        }
    }

    impl ModelLoader for EchoLoader {
        fn load(&self) -> Result<Box<dyn SegmentationModel>> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(EchoModel))
        }

        fn describe(&self) -> String {
            "echo".to_string()
        }
    }

    struct BrokenLoader;

    impl ModelLoader for BrokenLoader {
        fn load(&self) -> Result<Box<dyn SegmentationModel>> {
            anyhow::bail!("no such model file")
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    pub(crate) fn echo_service(cache: bool) -> (MaskOverlayService, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = MaskOverlayService::new(
            Arc::new(MemorySource::with(&["a.dcm", "b.dcm"])),
            Box::new(EchoLoader {
                loads: Arc::clone(&loads),
            }),
            4,
            0.5,
            cache,
        );
        (service, loads)
    }

    #[test]
    fn area_resize_averages_blocks() {
        let pixels = array![
            [1.0, 3.0, 10.0, 10.0],
            [1.0, 3.0, 10.0, 10.0],
            [0.0, 0.0, 4.0, 8.0],
            [0.0, 0.0, 8.0, 4.0]
        ];
        let resized = resize_area(pixels.view(), 2, 2);
        assert_eq!(resized, array![[2.0, 10.0], [0.0, 6.0]]);
    }

    #[test]
    fn area_resize_upsamples_by_repetition() {
        let pixels = array![[1.0, 2.0]];
        let resized = resize_area(pixels.view(), 2, 4);
        assert_eq!(resized, array![[1.0, 1.0, 2.0, 2.0], [1.0, 1.0, 2.0, 2.0]]);
    }

    #[test]
    fn area_resize_handles_uneven_ratio() {
        let pixels = array![[0.0, 3.0, 6.0]];
        let resized = resize_area(pixels.view(), 1, 2);
        assert!((resized[[0, 0]] - 1.0).abs() < 1e-5);
        assert!((resized[[0, 1]] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn normalize_spans_unit_interval() {
        let normalized = normalize(&array![[-1000.0, 0.0], [500.0, 1000.0]]);
        assert_eq!(normalized, array![[0.0, 0.5], [0.75, 1.0]]);
        assert_eq!(normalize(&array![[7.0, 7.0]]), array![[0.0, 0.0]]);
    }

    #[test]
    fn prediction_thresholds_and_overlays() {
        let (service, _) = echo_service(false);
        let prediction = service
            .predict(Path::new("a.dcm"))
            .expect("prediction should succeed");

        assert_eq!(prediction.input.dim(), (4, 4));
        assert!(prediction.mask.iter().all(|&v| v == 0.0 || v == 1.0));
        for ((&input, &mask), &overlay) in prediction
            .input
            .iter()
            .zip(prediction.mask.iter())
            .zip(prediction.overlay.iter())
        {
            assert_eq!(mask, if input > 0.5 { 1.0 } else { 0.0 });
            assert_eq!(overlay, input * mask);
        }
        assert!(prediction.foreground_fraction() > 0.0);
    }

    #[test]
    fn model_reloaded_per_call_unless_cached() {
        let (service, loads) = echo_service(false);
        service.predict(Path::new("a.dcm")).expect("first");
        service.predict(Path::new("b.dcm")).expect("second");
        assert_eq!(loads.load(Ordering::Relaxed), 2);

        let (service, loads) = echo_service(true);
        service.predict(Path::new("a.dcm")).expect("first");
        service.predict(Path::new("b.dcm")).expect("second");
        assert_eq!(loads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn undecodable_file_and_broken_model_are_reported() {
        let (service, _) = echo_service(false);
        let err = service.predict(Path::new("missing.dcm")).unwrap_err();
        assert!(matches!(err, ViewerError::Decode { .. }));

        let service = MaskOverlayService::new(
            Arc::new(MemorySource::with(&["a.dcm"])),
            Box::new(BrokenLoader),
            4,
            0.5,
            false,
        );
        let err = service.predict(Path::new("a.dcm")).unwrap_err();
        assert!(matches!(err, ViewerError::Model(ref message) if message.contains("no such model")));
    }

    #[test]
    fn raised_cancel_flag_stops_prediction() {
        let (service, loads) = echo_service(false);
        let cancel = AtomicBool::new(true);
        let err = service
            .predict_cancellable(Path::new("a.dcm"), &cancel)
            .unwrap_err();
        assert!(matches!(err, ViewerError::Cancelled));
        assert_eq!(loads.load(Ordering::Relaxed), 0);
    }
}
