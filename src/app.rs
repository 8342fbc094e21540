use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eframe::egui::{self, Sense, TextureHandle, TextureOptions};

use crate::dicom::DicomSource;
use crate::error::ViewerError;
use crate::job::{MaskJob, MaskStatus};
use crate::launch::LaunchRequest;
use crate::mask::{MaskOverlayService, MaskPrediction};
use crate::picture::load_picture;
use crate::renderer::{render_gray, render_unit_gray};
use crate::view::SliceView;
use crate::viewer::{Command, Effect, Viewer, ViewerOptions};

const APP_TITLE: &str = "LungView";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const INVALID_FOLDER_WARNING: &str = "Invalid folder - please select again.";
const MASK_PANEL_SIZE: f32 = 256.0;
const PICTURE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff"];

struct MaskTextures {
    source: PathBuf,
    input: TextureHandle,
    mask: TextureHandle,
    overlay: TextureHandle,
}

pub struct LungViewApp {
    viewer: Viewer<DicomSource>,
    mask_service: Arc<MaskOverlayService>,
    mask_job: MaskJob,
    texture: Option<TextureHandle>,
    picture: Option<(PathBuf, TextureHandle)>,
    mask_textures: Option<MaskTextures>,
    show_mask_window: bool,
    warning: Option<String>,
    status_line: String,
    pending_launch_request: Option<LaunchRequest>,
    wheel_scroll_accum: f32,
}

impl LungViewApp {
    pub fn new(
        options: ViewerOptions,
        mask_service: Arc<MaskOverlayService>,
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
    ) -> Self {
        Self {
            viewer: Viewer::new(DicomSource, options),
            mask_service,
            mask_job: MaskJob::default(),
            texture: None,
            picture: None,
            mask_textures: None,
            show_mask_window: false,
            warning: None,
            status_line: initial_status.unwrap_or_default(),
            pending_launch_request: initial_request,
            wheel_scroll_accum: 0.0,
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line_base = egui::Color32::from_gray(28);

        visuals.panel_fill = egui::Color32::BLACK;
        visuals.extreme_bg_color = egui::Color32::BLACK;
        visuals.window_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, line_base);
        ctx.set_visuals(visuals);
    }

    fn handle_launch_request(&mut self, request: LaunchRequest, ctx: &egui::Context) {
        match request {
            LaunchRequest::Folder(folder) => self.apply(Command::OpenFolder(Some(folder)), ctx),
            LaunchRequest::Picture(path) => self.open_picture(path, ctx),
            LaunchRequest::Predict { input, .. } => {
                self.status_line = format!(
                    "Headless prediction of {} is only available from the command line.",
                    input.display()
                );
            }
        }
    }

    /// Slice tools act on the DICOM view, which a picture hides.
    fn slice_tools_enabled(&self) -> bool {
        self.picture.is_none() && self.viewer.view().is_some()
    }

    /// Runs a command through the viewer and carries out its effect.
    fn apply(&mut self, command: Command, ctx: &egui::Context) {
        if command.targets_slice() && !self.slice_tools_enabled() {
            log::debug!("Ignoring {command:?} without a displayed slice");
            return;
        }
        match self.viewer.dispatch(command) {
            Ok(Effect::None) => {}
            Ok(Effect::Redraw) => {
                self.picture = None;
                self.status_line.clear();
                self.rebuild_texture(ctx);
            }
            Ok(Effect::StartMask(path)) => self.start_mask(path, ctx),
            Ok(Effect::CancelMask) => {
                if self.mask_job.is_busy() {
                    self.mask_job.cancel();
                    self.status_line = "Mask prediction cancelled.".to_string();
                }
            }
            Err(ViewerError::EmptySelection) => {}
            Err(err) if err.is_selection_warning() => {
                log::warn!("{err}");
                self.warning = Some(INVALID_FOLDER_WARNING.to_string());
            }
            Err(err) => {
                log::error!("{err}");
                self.status_line = err.to_string();
                self.rebuild_texture(ctx);
            }
        }
    }

    fn rebuild_texture(&mut self, ctx: &egui::Context) {
        let Some(view) = self.viewer.view() else {
            self.texture = None;
            return;
        };
        let color_image = render_gray(view.displayed().view());
        if let Some(texture) = self.texture.as_mut() {
            texture.set(color_image, TextureOptions::LINEAR);
        } else {
            self.texture = Some(ctx.load_texture("slice", color_image, TextureOptions::LINEAR));
        }
    }

    fn open_folder_dialog(&mut self, ctx: &egui::Context) {
        let picked = rfd::FileDialog::new().pick_folder();
        self.apply(Command::OpenFolder(picked), ctx);
    }

    fn open_picture_dialog(&mut self, ctx: &egui::Context) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("Images", PICTURE_EXTENSIONS)
            .pick_file()
        {
            self.open_picture(path, ctx);
        }
    }

    fn open_picture(&mut self, path: PathBuf, ctx: &egui::Context) {
        match load_picture(&path) {
            Ok(color_image) => {
                let texture = ctx.load_texture("picture", color_image, TextureOptions::LINEAR);
                self.picture = Some((path, texture));
                self.status_line.clear();
            }
            Err(err) => {
                log::error!("{err:#}");
                self.status_line = format!("{err:#}");
            }
        }
    }

    fn start_mask(&mut self, path: PathBuf, ctx: &egui::Context) {
        let repaint = ctx.clone();
        self.mask_textures = None;
        self.mask_job
            .start(Arc::clone(&self.mask_service), path, move || {
                repaint.request_repaint()
            });
        self.show_mask_window = true;
    }

    fn poll_mask_job(&mut self, ctx: &egui::Context) {
        if self.mask_job.poll() {
            match self.mask_job.status() {
                MaskStatus::Ready(prediction) => {
                    self.mask_textures = Some(Self::build_mask_textures(prediction, ctx));
                }
                MaskStatus::Failed { message, .. } => {
                    self.status_line = message.clone();
                }
                MaskStatus::Idle | MaskStatus::Busy { .. } => {}
            }
        }
        if self.mask_job.is_busy() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }
    }

    fn build_mask_textures(prediction: &MaskPrediction, ctx: &egui::Context) -> MaskTextures {
        let load = |name: &str, grid: &ndarray::Array2<f32>| {
            ctx.load_texture(name, render_unit_gray(grid.view()), TextureOptions::NEAREST)
        };
        MaskTextures {
            source: prediction.source.clone(),
            input: load("mask-input", &prediction.input),
            mask: load("mask-binary", &prediction.mask),
            overlay: load("mask-overlay", &prediction.overlay),
        }
    }

    /// Whole wheel steps from accumulated scroll; positive is wheel-up.
    fn wheel_steps_from_scroll(scroll_accum: &mut f32, scroll: f32) -> i32 {
        const DEAD_ZONE: f32 = 0.5;
        const PIXELS_PER_SLICE_STEP: f32 = 30.0;

        if scroll.abs() <= DEAD_ZONE {
            return 0;
        }

        // Drop leftovers when the direction reverses.
        if *scroll_accum != 0.0 && scroll.signum() != scroll_accum.signum() {
            *scroll_accum = 0.0;
        }
        *scroll_accum += scroll;

        let steps = (*scroll_accum / PIXELS_PER_SLICE_STEP).trunc() as i32;
        *scroll_accum -= steps as f32 * PIXELS_PER_SLICE_STEP;
        steps
    }

    /// Only the wheel's vertical axis navigates; sideways scrolling is ignored.
    fn vertical_scroll(raw_scroll: egui::Vec2, smooth_scroll: egui::Vec2) -> f32 {
        if smooth_scroll.y != 0.0 {
            smooth_scroll.y
        } else {
            raw_scroll.y
        }
    }

    fn paint_fitted(ui: &mut egui::Ui, texture: &TextureHandle) -> egui::Response {
        let available = ui.available_size();
        let (canvas_rect, response) = ui.allocate_exact_size(available, Sense::hover());
        let image_size = texture.size_vec2();
        if image_size.x > 0.0 && image_size.y > 0.0 && canvas_rect.is_positive() {
            let fit_scale = (canvas_rect.width() / image_size.x)
                .min(canvas_rect.height() / image_size.y)
                .max(0.01);
            let image_rect =
                egui::Rect::from_center_size(canvas_rect.center(), image_size * fit_scale);
            ui.painter().image(
                texture.id(),
                image_rect,
                egui::Rect::from_min_max(egui::Pos2::ZERO, egui::pos2(1.0, 1.0)),
                egui::Color32::WHITE,
            );
        }
        response
    }

    fn show_mask_window(&mut self, ctx: &egui::Context) {
        if !self.show_mask_window {
            return;
        }
        let mut open = true;
        let mut cancel_clicked = false;
        let current = self.viewer.view().map(|view| view.source().to_path_buf());

        egui::Window::new("Lung mask")
            .open(&mut open)
            .resizable(false)
            .collapsible(true)
            .show(ctx, |ui| {
                match self.mask_job.status() {
                    MaskStatus::Idle => {
                        ui.label("No mask predicted yet.");
                    }
                    MaskStatus::Busy { path, started } => {
                        ui.horizontal(|ui| {
                            ui.spinner();
                            ui.label(format!(
                                "Predicting {} ({:.0}s)",
                                file_label(path),
                                started.elapsed().as_secs_f32()
                            ));
                        });
                        if ui.button("Cancel").clicked() {
                            cancel_clicked = true;
                        }
                    }
                    MaskStatus::Failed { path, message } => {
                        ui.label(format!("Prediction for {} failed:", file_label(path)));
                        ui.colored_label(egui::Color32::LIGHT_RED, message);
                    }
                    MaskStatus::Ready(prediction) => {
                        ui.label(format!(
                            "{}: {:.1}% of the slice marked",
                            file_label(&prediction.source),
                            prediction.foreground_fraction() * 100.0
                        ));
                    }
                }

                if let Some(textures) = self.mask_textures.as_ref() {
                    if current.as_deref() != Some(textures.source.as_path()) {
                        ui.weak("Mask belongs to a different slice.");
                    }
                    let size = egui::vec2(MASK_PANEL_SIZE, MASK_PANEL_SIZE);
                    ui.horizontal(|ui| {
                        for (caption, texture) in [
                            ("Input", &textures.input),
                            ("Mask", &textures.mask),
                            ("Overlay", &textures.overlay),
                        ] {
                            ui.vertical(|ui| {
                                ui.label(caption);
                                ui.image((texture.id(), size));
                            });
                        }
                    });
                }
            });

        if !open {
            self.mask_job.cancel();
            self.mask_job.dismiss();
        }
        self.show_mask_window = open;
        if cancel_clicked {
            self.apply(Command::CancelMask, ctx);
        }
    }

    fn show_warning(&mut self, ctx: &egui::Context) {
        let Some(message) = self.warning.clone() else {
            return;
        };
        let mut dismissed = false;
        egui::Window::new("Warning")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, egui::Vec2::ZERO)
            .show(ctx, |ui| {
                ui.label(&message);
                ui.add_space(6.0);
                if ui.button("OK").clicked() {
                    dismissed = true;
                }
            });
        if dismissed {
            self.warning = None;
        }
    }
}

/// "columns x rows" plus any active transforms.
fn describe_view(view: &SliceView) -> String {
    let [columns, rows] = view.size();
    let mut text = format!("{columns}x{rows}");
    if view.rotation_degrees() != 0 {
        text.push_str(&format!(", rotated {}°", view.rotation_degrees()));
    }
    if view.is_contrast_inverted() {
        text.push_str(", inverted");
    }
    text
}

fn file_label(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

impl eframe::App for LungViewApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_black_background(ctx);

        if let Some(request) = self.pending_launch_request.take() {
            self.handle_launch_request(request, ctx);
        }
        self.poll_mask_job(ctx);

        let mut commands = Vec::new();
        let modal_open = self.warning.is_some();
        if !modal_open {
            ctx.input_mut(|input| {
                if input.consume_key(egui::Modifiers::NONE, egui::Key::ArrowLeft) {
                    commands.push(Command::Previous);
                }
                if input.consume_key(egui::Modifiers::NONE, egui::Key::ArrowRight) {
                    commands.push(Command::Next);
                }
            });
        }

        let has_slice = self.slice_tools_enabled();
        let has_files = !self.viewer.files().is_empty();
        let mask_busy = self.mask_job.is_busy();
        let mut open_folder_clicked = false;
        let mut open_image_clicked = false;

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.add_enabled_ui(!modal_open, |ui| {
                ui.horizontal(|ui| {
                    ui.label(egui::RichText::new(format!("{APP_TITLE} v{APP_VERSION}")).strong());
                    if let Some(folder) = self.viewer.files().folder() {
                        ui.weak(folder.display().to_string());
                    }
                    ui.separator();
                    if ui.button("Open Folder").clicked() {
                        open_folder_clicked = true;
                    }
                    if ui.button("Open Image").clicked() {
                        open_image_clicked = true;
                    }
                    ui.separator();
                    if ui.add_enabled(has_files, egui::Button::new("Prev")).clicked() {
                        commands.push(Command::Previous);
                    }
                    if ui.add_enabled(has_files, egui::Button::new("Next")).clicked() {
                        commands.push(Command::Next);
                    }
                    ui.separator();
                    if ui
                        .add_enabled(has_slice, egui::Button::new("Rotate Left"))
                        .clicked()
                    {
                        commands.push(Command::Rotate { degrees: 90 });
                    }
                    if ui
                        .add_enabled(has_slice, egui::Button::new("Rotate Right"))
                        .clicked()
                    {
                        commands.push(Command::Rotate { degrees: -90 });
                    }
                    if ui
                        .add_enabled(has_slice, egui::Button::new("Contrast"))
                        .clicked()
                    {
                        commands.push(Command::ToggleContrast);
                    }
                    if ui.add_enabled(has_slice, egui::Button::new("Reset")).clicked() {
                        commands.push(Command::Reset);
                    }
                    ui.separator();
                    if mask_busy {
                        if ui.button("Cancel Mask").clicked() {
                            commands.push(Command::CancelMask);
                        }
                    } else if ui
                        .add_enabled(has_slice, egui::Button::new("Predict Mask"))
                        .clicked()
                    {
                        commands.push(Command::PredictMask);
                    }
                });
            });
        });

        egui::TopBottomPanel::bottom("navigation").show(ctx, |ui| {
            ui.add_enabled_ui(!modal_open, |ui| {
                ui.horizontal(|ui| {
                    let files = self.viewer.files();
                    if let Some(label) = files.position_label() {
                        let mut index = files.index();
                        let last = files.len().saturating_sub(1);
                        let slider_width = (ui.available_width() - 160.0).max(120.0);
                        ui.spacing_mut().slider_width = slider_width;
                        let response =
                            ui.add(egui::Slider::new(&mut index, 0..=last).show_value(false));
                        if response.changed() {
                            commands.push(Command::ScrollTo(index));
                        }
                        ui.monospace(label);
                    }
                    if let Some((path, _)) = self.picture.as_ref() {
                        ui.separator();
                        ui.label(file_label(path));
                    } else if let Some(view) = self.viewer.view() {
                        ui.separator();
                        ui.label(file_label(view.source()));
                        let summary = describe_view(view);
                        if view.is_transformed() {
                            ui.strong(summary);
                        } else {
                            ui.weak(summary);
                        }
                    }
                    if !self.status_line.is_empty() {
                        ui.separator();
                        ui.label(&self.status_line);
                    }
                });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            if let Some((_, texture)) = self.picture.as_ref() {
                Self::paint_fitted(ui, texture);
            } else if let Some(texture) = self.texture.clone() {
                let response = Self::paint_fitted(ui, &texture);
                if response.hovered() && !modal_open {
                    let (raw_scroll, smooth_scroll) = ui
                        .input(|input| (input.raw_scroll_delta, input.smooth_scroll_delta));
                    let scroll = Self::vertical_scroll(raw_scroll, smooth_scroll);
                    let steps = Self::wheel_steps_from_scroll(&mut self.wheel_scroll_accum, scroll);
                    for _ in 0..steps.unsigned_abs() {
                        commands.push(Command::Wheel {
                            delta_y: steps.signum() as f32,
                        });
                    }
                }
            } else {
                ui.allocate_ui_with_layout(
                    ui.available_size(),
                    egui::Layout::centered_and_justified(egui::Direction::TopDown),
                    |ui| {
                        if has_files {
                            ui.label("This slice could not be displayed.");
                        } else {
                            ui.label("Open a folder of DICOM slices to start.");
                        }
                    },
                );
            }
        });

        self.show_mask_window(ctx);
        self.show_warning(ctx);

        if open_folder_clicked {
            self.open_folder_dialog(ctx);
        }
        if open_image_clicked {
            self.open_picture_dialog(ctx);
        }
        for command in commands {
            self.apply(command, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom::tests::{temp_path, write_test_slice};
    use crate::mask::tests::echo_service;

    #[test]
    fn small_scroll_is_ignored() {
        let mut accum = 0.0;
        assert_eq!(LungViewApp::wheel_steps_from_scroll(&mut accum, 0.3), 0);
        assert_eq!(accum, 0.0);
    }

    #[test]
    fn scroll_accumulates_into_whole_steps() {
        let mut accum = 0.0;
        assert_eq!(LungViewApp::wheel_steps_from_scroll(&mut accum, 20.0), 0);
        assert_eq!(LungViewApp::wheel_steps_from_scroll(&mut accum, 20.0), 1);
        assert_eq!(accum, 10.0);
        assert_eq!(LungViewApp::wheel_steps_from_scroll(&mut accum, 65.0), 2);
    }

    #[test]
    fn reversing_direction_drops_leftovers() {
        let mut accum = 0.0;
        LungViewApp::wheel_steps_from_scroll(&mut accum, 25.0);
        assert_eq!(LungViewApp::wheel_steps_from_scroll(&mut accum, -31.0), -1);
        assert_eq!(accum, -1.0);
    }

    #[test]
    fn only_vertical_scroll_navigates() {
        let raw = egui::vec2(0.0, 40.0);
        assert_eq!(LungViewApp::vertical_scroll(raw, egui::Vec2::ZERO), 40.0);
        assert_eq!(LungViewApp::vertical_scroll(raw, egui::vec2(-12.0, 3.0)), 3.0);
        assert_eq!(
            LungViewApp::vertical_scroll(egui::vec2(55.0, 0.0), egui::vec2(-12.0, 0.0)),
            0.0
        );
    }

    fn app_with_slice(tag: &str) -> (LungViewApp, egui::Context, PathBuf) {
        let folder = temp_path(tag);
        std::fs::create_dir_all(&folder).expect("should create temp folder");
        for name in ["s1.dcm", "s2.dcm"] {
            write_test_slice(&folder.join(name), 2, 2, &[1, 2, 3, 4], (None, None));
        }
        let (service, _) = echo_service(false);
        let options = ViewerOptions {
            extension: "dcm".to_string(),
            sort_files: true,
        };
        let mut app = LungViewApp::new(options, Arc::new(service), None, None);
        let ctx = egui::Context::default();
        app.apply(Command::OpenFolder(Some(folder.clone())), &ctx);
        assert!(app.viewer.view().is_some());
        (app, ctx, folder)
    }

    #[test]
    fn picture_disables_slice_tools() {
        let (mut app, ctx, folder) = app_with_slice("picture-mode");
        assert!(app.slice_tools_enabled());

        let texture = ctx.load_texture(
            "picture",
            egui::ColorImage::new([2, 2], egui::Color32::WHITE),
            TextureOptions::LINEAR,
        );
        app.picture = Some((PathBuf::from("chest.png"), texture));
        assert!(!app.slice_tools_enabled());

        for command in [
            Command::Rotate { degrees: 90 },
            Command::ToggleContrast,
            Command::Reset,
            Command::PredictMask,
        ] {
            app.apply(command, &ctx);
        }
        assert!(app.picture.is_some());
        assert!(!app.mask_job.is_busy());
        let view = app.viewer.view().expect("slice should still be loaded");
        assert!(!view.is_transformed());

        app.apply(Command::Next, &ctx);
        assert!(app.picture.is_none());
        assert!(app.slice_tools_enabled());

        let _ = std::fs::remove_dir_all(folder);
    }

    #[test]
    fn cancel_reports_only_a_running_job() {
        let (mut app, ctx, folder) = app_with_slice("cancel-mask");
        app.apply(Command::CancelMask, &ctx);
        assert!(app.status_line.is_empty());

        app.apply(Command::PredictMask, &ctx);
        assert!(app.mask_job.is_busy());
        app.apply(Command::CancelMask, &ctx);
        assert!(!app.mask_job.is_busy());
        assert_eq!(app.status_line, "Mask prediction cancelled.");

        let _ = std::fs::remove_dir_all(folder);
    }

    #[test]
    fn view_summary_lists_transforms() {
        let view = SliceView::new(PathBuf::from("a.dcm"), ndarray::Array2::zeros((2, 3)));
        assert_eq!(describe_view(&view), "3x2");
        let turned = view.rotated(90).with_contrast_toggled();
        assert_eq!(describe_view(&turned), "2x3, rotated 90°, inverted");
    }

    #[test]
    fn file_label_uses_file_name() {
        assert_eq!(file_label(std::path::Path::new("/scans/p01/slice-003.dcm")), "slice-003.dcm");
    }
}
