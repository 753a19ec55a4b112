//! Configuration management for svgbatch

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SvgBatchError};

pub mod profiles;
pub use profiles::*;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Named conversion profiles
    pub profiles: BTreeMap<String, ConversionProfile>,

    /// Defaults used when no profile is selected
    pub convert: ConvertConfig,

    /// Upload intake limits
    pub limits: LimitsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("logo".to_string(), ConversionProfile::logo());
        profiles.insert("photo".to_string(), ConversionProfile::photo());

        Self {
            profiles,
            convert: ConvertConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Default conversion mode and settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Mode assigned to newly added files
    pub mode: ConversionMode,

    /// Settings snapshot handed to the scheduler
    #[serde(flatten)]
    pub settings: ConversionSettings,
}

/// How files are vectorized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    /// Two colors, crisp shapes (logos, line art, scans)
    #[default]
    BlackWhite,
    /// Four grayscale levels, for tonal photographs
    Posterize,
}

impl ConversionMode {
    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlackWhite => "blackwhite",
            Self::Posterize => "posterize",
        }
    }
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the concurrency bound applies.
///
/// With [`ConcurrencyScope::PerFolder`] every folder runs its own waves of up
/// to `concurrency` files and folders run side by side, so the number of
/// conversions in flight across the whole run can reach
/// `concurrency * active_folders`. [`ConcurrencyScope::Global`] keeps the same
/// wave structure but additionally caps in-flight conversions system-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyScope {
    #[default]
    PerFolder,
    Global,
}

/// Settings snapshot taken at the start of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    /// Curve-fit tolerance multiplier (0.1-2.0)
    pub smoothness: f32,

    /// Blur radius applied before tracing (0-3)
    pub noise_reduction: u8,

    /// Files converted concurrently per wave (1-8)
    pub concurrency: usize,

    /// Downscale wide images before tracing
    pub downscale_enabled: bool,

    /// Width limit used when downscaling is enabled
    pub downscale_max_width: u32,

    /// Whether `concurrency` bounds each folder or the whole run
    pub concurrency_scope: ConcurrencyScope,
}

pub const MIN_SMOOTHNESS: f32 = 0.1;
pub const MAX_SMOOTHNESS: f32 = 2.0;
pub const MAX_NOISE_REDUCTION: u8 = 3;
pub const MAX_CONCURRENCY: usize = 8;

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            smoothness: 1.0,
            noise_reduction: 1,
            concurrency: 4,
            downscale_enabled: false,
            downscale_max_width: 1920,
            concurrency_scope: ConcurrencyScope::PerFolder,
        }
    }
}

impl ConversionSettings {
    /// Create settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set smoothness
    pub fn smoothness(mut self, smoothness: f32) -> Self {
        self.smoothness = smoothness;
        self
    }

    /// Set noise reduction level
    pub fn noise_reduction(mut self, level: u8) -> Self {
        self.noise_reduction = level;
        self
    }

    /// Set concurrency
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enable downscaling to the given maximum width
    pub fn downscale(mut self, max_width: u32) -> Self {
        self.downscale_enabled = true;
        self.downscale_max_width = max_width;
        self
    }

    /// Set the concurrency scope
    pub fn scope(mut self, scope: ConcurrencyScope) -> Self {
        self.concurrency_scope = scope;
        self
    }

    /// The downscale limit, if downscaling is enabled
    pub fn downscale_limit(&self) -> Option<u32> {
        self.downscale_enabled.then_some(self.downscale_max_width)
    }

    /// Validate ranges
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SMOOTHNESS..=MAX_SMOOTHNESS).contains(&self.smoothness) {
            return Err(SvgBatchError::invalid_settings(format!(
                "Smoothness must be between {}-{}, got {}",
                MIN_SMOOTHNESS, MAX_SMOOTHNESS, self.smoothness
            )));
        }

        if self.noise_reduction > MAX_NOISE_REDUCTION {
            return Err(SvgBatchError::invalid_settings(format!(
                "Noise reduction must be between 0-{}, got {}",
                MAX_NOISE_REDUCTION, self.noise_reduction
            )));
        }

        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(SvgBatchError::invalid_settings(format!(
                "Concurrency must be between 1-{}, got {}",
                MAX_CONCURRENCY, self.concurrency
            )));
        }

        if self.downscale_enabled && self.downscale_max_width == 0 {
            return Err(SvgBatchError::invalid_settings(
                "Downscale width must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Upload intake limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum folders held at once
    pub max_folders: usize,

    /// Files beyond this count are dropped from a folder upload
    pub max_files_per_folder: usize,

    /// Maximum files across all folders
    pub max_total_files: usize,

    /// Maximum decoded image size (width * height)
    pub max_image_pixels: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_folders: 3,
            max_files_per_folder: 120,
            max_total_files: 360,
            max_image_pixels: 100_000_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SvgBatchError::config(format!(
                "Failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        match config_extension(path.as_ref()).as_str() {
            "toml" => toml::from_str(&content).map_err(Into::into),
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(Into::into),
            _ => Err(SvgBatchError::config(
                "Unsupported config file format. Use .toml or .yaml",
            )),
        }
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = match config_extension(path.as_ref()).as_str() {
            "toml" => toml::to_string_pretty(self)
                .map_err(|e| SvgBatchError::config(format!("TOML serialization failed: {}", e)))?,
            "yaml" | "yml" => serde_yaml::to_string(self)?,
            _ => {
                return Err(SvgBatchError::config(
                    "Unsupported config file format. Use .toml or .yaml",
                ))
            }
        };

        std::fs::write(&path, content).map_err(|e| {
            SvgBatchError::config(format!(
                "Failed to write config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        Ok(())
    }

    /// Get a conversion profile by name
    pub fn get_profile(&self, name: &str) -> Result<&ConversionProfile> {
        self.profiles.get(name).ok_or_else(|| {
            SvgBatchError::config(format!(
                "Profile '{}' not found. Available profiles: {:?}",
                name,
                self.profiles.keys().collect::<Vec<_>>()
            ))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in &self.profiles {
            profile.validate().map_err(|e| {
                SvgBatchError::config(format!("Invalid profile '{}': {}", name, e))
            })?;
        }

        self.convert.settings.validate()?;

        let limits = &self.limits;
        if limits.max_folders == 0 || limits.max_files_per_folder == 0 {
            return Err(SvgBatchError::config(
                "Folder and per-folder file limits must be greater than 0",
            ));
        }
        if limits.max_total_files < limits.max_files_per_folder {
            return Err(SvgBatchError::config(format!(
                "max_total_files ({}) is smaller than max_files_per_folder ({})",
                limits.max_total_files, limits.max_files_per_folder
            )));
        }

        Ok(())
    }
}

fn config_extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Default location for a generated example configuration
pub fn default_config_path() -> PathBuf {
    PathBuf::from("svgbatch.toml")
}
