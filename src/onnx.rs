use std::path::PathBuf;

use anyhow::Result;

use crate::mask::{ModelLoader, SegmentationModel};
use crate::settings::{InputLayout, ModelSettings};

/// Loads the lung segmentation network from an ONNX export.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    pub path: PathBuf,
    pub input_size: usize,
    pub layout: InputLayout,
}

impl OnnxModelLoader {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            path: settings.path.clone(),
            input_size: settings.input_size,
            layout: settings.layout,
        }
    }

    #[cfg_attr(not(feature = "onnx"), allow(dead_code))]
    fn input_shape(&self) -> [usize; 4] {
        let size = self.input_size;
        match self.layout {
            InputLayout::Nhwc => [1, size, size, 1],
            InputLayout::Nchw => [1, 1, size, size],
        }
    }
}

#[cfg(feature = "onnx")]
mod runtime {
    use anyhow::{ensure, Context, Result};
    use ndarray::{Array2, ArrayView2};
    use tract_onnx::prelude::*;

    use super::OnnxModelLoader;
    use crate::mask::SegmentationModel;

    pub(super) struct OnnxModel {
        plan: TypedRunnableModel<TypedModel>,
        shape: [usize; 4],
        size: usize,
    }

    pub(super) fn load(loader: &OnnxModelLoader) -> Result<OnnxModel> {
        let shape = loader.input_shape();
        let plan = tract_onnx::onnx()
            .model_for_path(&loader.path)
            .with_context(|| format!("Could not read model {}", loader.path.display()))?
            .with_input_fact(0, f32::fact(shape).into())?
            .into_optimized()?
            .into_runnable()?;
        Ok(OnnxModel {
            plan,
            shape,
            size: loader.input_size,
        })
    }

    impl SegmentationModel for OnnxModel {
        fn predict(&mut self, input: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
            ensure!(
                input.dim() == (self.size, self.size),
                "Model expects a {0}x{0} input, got {1:?}",
                self.size,
                input.dim()
            );
            let values = input.iter().copied().collect::<Vec<_>>();
            let [n, a, b, c] = self.shape;
            let tensor: Tensor = tract_ndarray::Array4::from_shape_vec((n, a, b, c), values)?.into();
            let outputs = self.plan.run(tvec!(tensor.into()))?;
            let output = outputs
                .first()
                .context("Model produced no output")?
                .to_array_view::<f32>()?;
            ensure!(
                output.len() == self.size * self.size,
                "Model output has {} values, expected {}",
                output.len(),
                self.size * self.size
            );
            let probabilities = output.iter().copied().collect::<Vec<_>>();
            Ok(Array2::from_shape_vec((self.size, self.size), probabilities)?)
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    #[cfg(feature = "onnx")]
    fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        Ok(Box::new(runtime::load(self)?))
    }

    #[cfg(not(feature = "onnx"))]
    fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        anyhow::bail!(
            "Cannot load {}: built without the onnx feature",
            self.path.display()
        )
    }

    fn describe(&self) -> String {
        format!("{} ({:?}, {}px)", self.path.display(), self.layout, self.input_size)
    }
}
