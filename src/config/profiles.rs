//! Named conversion profiles for common inputs

use serde::{Deserialize, Serialize};

use crate::config::{ConversionMode, ConversionSettings};
use crate::error::Result;

/// A conversion profile bundles a mode with a settings snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionProfile {
    /// Short human description
    #[serde(default)]
    pub description: String,

    /// Tracing mode for files converted with this profile
    pub mode: ConversionMode,

    /// Settings used for the run
    #[serde(default)]
    pub settings: ConversionSettings,
}

impl ConversionProfile {
    /// Create a profile with default settings for a mode
    pub fn new(mode: ConversionMode) -> Self {
        Self {
            description: String::new(),
            mode,
            settings: ConversionSettings::default(),
        }
    }

    /// Crisp two-color output for logos and line art
    pub fn logo() -> Self {
        Self::new(ConversionMode::BlackWhite)
            .description("Logos and line art (black & white, no blur)")
            .settings(ConversionSettings::new().noise_reduction(0).smoothness(0.8))
    }

    /// Four-level posterized output for photographs
    pub fn photo() -> Self {
        Self::new(ConversionMode::Posterize)
            .description("Photographs (4 gray levels, downscaled to 1920px)")
            .settings(ConversionSettings::new().smoothness(1.2).downscale(1920))
    }

    /// Set the description
    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Set the settings snapshot
    pub fn settings(mut self, settings: ConversionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validate the profile configuration
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()
    }
}
