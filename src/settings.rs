use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_FILE: &str = "lung_unet_256px_focaltversky_alpha=0.6_dicomformat.onnx";
const MODEL_OVERRIDE_VAR: &str = "LUNGVIEW_MODEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Matched case-insensitively, without the leading dot.
    pub dicom_extension: String,
    /// Keep directory listing order when false.
    pub sort_files: bool,
    pub model: ModelSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dicom_extension: "dcm".to_string(),
            sort_files: false,
            model: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub path: PathBuf,
    /// Side length of the square network input.
    pub input_size: usize,
    pub threshold: f32,
    pub layout: InputLayout,
    /// Keep the model loaded between predictions.
    pub cache: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_MODEL_FILE),
            input_size: 256,
            threshold: 0.5,
            layout: InputLayout::Nhwc,
            cache: false,
        }
    }
}

/// Tensor layout of the single network input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    /// `[1, S, S, 1]`
    Nhwc,
    /// `[1, 1, S, S]`
    Nchw,
}

impl Settings {
    /// Reads the user settings file, writing a default one when none exists.
    /// Never fails: problems are logged and defaults are used.
    pub fn load() -> Self {
        let mut settings = match settings_file_path() {
            Some(path) => Self::load_or_create(&path),
            None => {
                log::warn!("No configuration directory found; using default settings");
                Self::default()
            }
        };
        settings.apply_overrides(env::var_os(MODEL_OVERRIDE_VAR));
        settings
    }

    /// Applies the `LUNGVIEW_MODEL` value, if set and non-empty.
    fn apply_overrides(&mut self, model: Option<OsString>) {
        let Some(model) = model.filter(|value| !value.is_empty()) else {
            return;
        };
        self.model.path = PathBuf::from(model);
        log::info!(
            "Model path overridden by {MODEL_OVERRIDE_VAR}: {}",
            self.model.path.display()
        );
    }

    fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            let settings = Self::default();
            if let Err(err) = settings.save(path) {
                log::warn!("{err:#}");
            }
            return settings;
        }
        match Self::read(path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(err) => {
                log::warn!("{err:#}; using default settings");
                Self::default()
            }
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Could not create settings directory {}", parent.display())
            })?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)
            .with_context(|| format!("Could not write settings file {}", path.display()))?;
        log::info!("Wrote default settings to {}", path.display());
        Ok(())
    }
}

pub fn settings_file_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        return env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|base| base.join("lungview").join("settings.toml"));
    }

    #[cfg(target_os = "macos")]
    {
        return env::var_os("HOME").map(PathBuf::from).map(|home| {
            home.join("Library")
                .join("Application Support")
                .join("lungview")
                .join("settings.toml")
        });
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("lungview").join("settings.toml"));
        }
        env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config").join("lungview").join("settings.toml"))
    }
}
