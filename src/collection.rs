use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ViewerError};

/// The DICOM files of one folder plus the slice currently shown.
///
/// Order is the directory listing order unless sorting was requested. The
/// index is always valid while the collection is non-empty.
#[derive(Debug, Clone, Default)]
pub struct FileCollection {
    folder: Option<PathBuf>,
    paths: Vec<PathBuf>,
    index: usize,
}

impl FileCollection {
    /// Replace the collection with the matching files of `selection`.
    ///
    /// On error the previous collection is left untouched.
    pub fn set_folder(
        &mut self,
        selection: Option<&Path>,
        extension: &str,
        sort: bool,
    ) -> Result<()> {
        let folder = selection.ok_or(ViewerError::EmptySelection)?;
        let mut paths = scan_folder(folder, extension)?;
        if paths.is_empty() {
            return Err(ViewerError::NoMatchingFiles {
                folder: folder.to_path_buf(),
                extension: extension.to_string(),
            });
        }
        if sort {
            paths.sort();
        }

        log::info!("Found {} .{extension} files in {}", paths.len(), folder.display());
        self.folder = Some(folder.to_path_buf());
        self.paths = paths;
        self.index = 0;
        Ok(())
    }

    pub fn next(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        self.index = (self.index + 1) % self.paths.len();
    }

    pub fn prev(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        self.index = self.index.checked_sub(1).unwrap_or(self.paths.len() - 1);
    }

    /// Jump straight to `index`. Returns false when it is out of range or
    /// already current.
    pub fn set_index(&mut self, index: usize) -> bool {
        if index >= self.paths.len() || index == self.index {
            return false;
        }
        self.index = index;
        true
    }

    pub fn current(&self) -> Option<&Path> {
        self.paths.get(self.index).map(PathBuf::as_path)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    /// "current/total", 1-based.
    pub fn position_label(&self) -> Option<String> {
        if self.paths.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.index + 1, self.paths.len()))
    }
}

fn scan_folder(folder: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if has_extension(&path, extension) {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case(extension))
}
