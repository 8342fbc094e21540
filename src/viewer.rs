use std::path::PathBuf;

use crate::collection::FileCollection;
use crate::error::Result;
use crate::view::{SliceSource, SliceView};

/// Everything the UI can ask the viewer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `None` when the folder dialog was cancelled.
    OpenFolder(Option<PathBuf>),
    Next,
    Previous,
    /// Positive is wheel-up (previous slice), negative is wheel-down.
    Wheel { delta_y: f32 },
    /// The scroll bar moved to a new slice index.
    ScrollTo(usize),
    Rotate { degrees: i32 },
    ToggleContrast,
    Reset,
    PredictMask,
    CancelMask,
}

impl Command {
    /// Commands that act on the displayed slice rather than on the collection.
    pub fn targets_slice(&self) -> bool {
        matches!(
            self,
            Self::Rotate { .. } | Self::ToggleContrast | Self::Reset | Self::PredictMask
        )
    }
}

/// What the presentation layer has to do after a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    Redraw,
    StartMask(PathBuf),
    CancelMask,
}

pub struct ViewerOptions {
    pub extension: String,
    pub sort_files: bool,
}

/// Folder navigation plus the displayed slice, driven only through
/// [`Viewer::dispatch`].
pub struct Viewer<S: SliceSource> {
    source: S,
    options: ViewerOptions,
    files: FileCollection,
    view: Option<SliceView>,
}

impl<S: SliceSource> Viewer<S> {
    pub fn new(source: S, options: ViewerOptions) -> Self {
        Self {
            source,
            options,
            files: FileCollection::default(),
            view: None,
        }
    }

    pub fn files(&self) -> &FileCollection {
        &self.files
    }

    pub fn view(&self) -> Option<&SliceView> {
        self.view.as_ref()
    }

    pub fn dispatch(&mut self, command: Command) -> Result<Effect> {
        log::debug!("dispatch {command:?}");
        match command {
            Command::OpenFolder(selection) => {
                self.files.set_folder(
                    selection.as_deref(),
                    &self.options.extension,
                    self.options.sort_files,
                )?;
                self.load_current()
            }
            Command::Next => {
                if self.files.is_empty() {
                    return Ok(Effect::None);
                }
                self.files.next();
                self.load_current()
            }
            Command::Previous => {
                if self.files.is_empty() {
                    return Ok(Effect::None);
                }
                self.files.prev();
                self.load_current()
            }
            Command::Wheel { delta_y } => {
                if delta_y > 0.0 {
                    self.dispatch(Command::Previous)
                } else if delta_y < 0.0 {
                    self.dispatch(Command::Next)
                } else {
                    Ok(Effect::None)
                }
            }
            Command::ScrollTo(index) => {
                if !self.files.set_index(index) {
                    return Ok(Effect::None);
                }
                self.load_current()
            }
            Command::Rotate { degrees } => Ok(self.transform(|view| view.rotated(degrees))),
            Command::ToggleContrast => Ok(self.transform(SliceView::with_contrast_toggled)),
            Command::Reset => {
                let Some(path) = self.view.as_ref().map(|view| view.source().to_path_buf()) else {
                    return Ok(Effect::None);
                };
                self.view = Some(SliceView::load(&self.source, &path)?);
                Ok(Effect::Redraw)
            }
            Command::PredictMask => Ok(self
                .view
                .as_ref()
                .map(|view| Effect::StartMask(view.source().to_path_buf()))
                .unwrap_or(Effect::None)),
            Command::CancelMask => Ok(Effect::CancelMask),
        }
    }

    fn transform(&mut self, apply: impl FnOnce(&SliceView) -> SliceView) -> Effect {
        match self.view.as_ref() {
            Some(view) => {
                self.view = Some(apply(view));
                Effect::Redraw
            }
            None => Effect::None,
        }
    }

    /// Replace the displayed slice with the collection's current file. A
    /// slice that fails to decode leaves nothing displayed.
    fn load_current(&mut self) -> Result<Effect> {
        let Some(path) = self.files.current().map(|path| path.to_path_buf()) else {
            return Ok(Effect::None);
        };
        match SliceView::load(&self.source, &path) {
            Ok(view) => {
                log::info!(
                    "Showing {} ({})",
                    path.display(),
                    self.files.position_label().unwrap_or_default()
                );
                self.view = Some(view);
                Ok(Effect::Redraw)
            }
            Err(err) => {
                self.view = None;
                Err(err)
            }
        }
    }
}
