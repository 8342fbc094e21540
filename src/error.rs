use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("No folder selected")]
    EmptySelection,

    #[error("No .{extension} files found in {}", folder.display())]
    NoMatchingFiles { folder: PathBuf, extension: String },

    #[error("Could not decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("Segmentation model error: {0}")]
    Model(String),

    #[error("Mask prediction cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ViewerError {
    pub fn decode(path: &Path, err: anyhow::Error) -> Self {
        Self::Decode {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        }
    }

    pub fn model(err: anyhow::Error) -> Self {
        Self::Model(format!("{err:#}"))
    }

    /// Shown as a modal warning rather than on the status line.
    pub fn is_selection_warning(&self) -> bool {
        matches!(self, Self::NoMatchingFiles { .. })
    }
}

pub type Result<T> = std::result::Result<T, ViewerError>;
