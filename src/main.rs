mod app;
mod collection;
mod dicom;
mod error;
mod job;
mod launch;
mod mask;
mod metrics;
mod onnx;
mod picture;
mod renderer;
mod settings;
mod view;
mod viewer;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use crate::dicom::DicomSource;
use crate::launch::LaunchRequest;
use crate::mask::MaskOverlayService;
use crate::metrics::MaskScores;
use crate::onnx::OnnxModelLoader;
use crate::settings::Settings;
use crate::viewer::ViewerOptions;

fn main() -> Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .map_err(|err| anyhow!("Could not start logging: {err}"))?;

    let settings = Settings::load();
    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => {
            log::error!("{err} {}", launch::USAGE);
            (None, Some(format!("Launch args error: {err}")))
        }
    };

    let mask_service = Arc::new(build_mask_service(&settings));
    if let Some(LaunchRequest::Predict {
        input,
        output_dir,
        truth,
    }) = &initial_request
    {
        return predict_headless(&mask_service, input, output_dir, truth.as_deref());
    }

    let options = ViewerOptions {
        extension: settings.dicom_extension.clone(),
        sort_files: settings.sort_files,
    };
    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 860.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "LungView",
        native_options,
        Box::new(move |_cc| {
            Ok(Box::new(app::LungViewApp::new(
                options,
                mask_service,
                initial_request,
                initial_status,
            )))
        }),
    )
    .map_err(|err| anyhow!("{err}"))
}

fn build_mask_service(settings: &Settings) -> MaskOverlayService {
    MaskOverlayService::new(
        Arc::new(DicomSource),
        Box::new(OnnxModelLoader::from_settings(&settings.model)),
        settings.model.input_size,
        settings.model.threshold,
        settings.model.cache,
    )
}

fn predict_headless(
    service: &MaskOverlayService,
    input: &Path,
    output_dir: &Path,
    truth: Option<&Path>,
) -> Result<()> {
    let prediction = service.predict(input)?;

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Could not create {}", output_dir.display()))?;
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "slice".to_string());
    for (suffix, grid) in [
        ("input", &prediction.input),
        ("mask", &prediction.mask),
        ("overlay", &prediction.overlay),
    ] {
        let path = output_dir.join(format!("{stem}_{suffix}.png"));
        picture::save_gray_png(&path, grid.view())?;
        log::info!("Wrote {}", path.display());
    }

    if let Some(truth) = truth {
        let reference = picture::load_reference_mask(truth)?;
        let scores = MaskScores::compare(reference.view(), prediction.mask.view())?;
        log::info!(
            "IoU {:.4} (loss {:.4}), Tversky {:.4} (loss {:.4}), focal Tversky {:.4}, sensitivity {:.4}, specificity {:.4}",
            scores.iou,
            scores.iou_loss,
            scores.tversky,
            scores.tversky_loss,
            scores.focal_tversky,
            scores.sensitivity,
            scores.specificity
        );
    }
    Ok(())
}
