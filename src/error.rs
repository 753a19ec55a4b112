//! Error types and handling for svgbatch

use thiserror::Error;

/// Result type alias for svgbatch operations
pub type Result<T> = std::result::Result<T, SvgBatchError>;

/// Main error type for svgbatch operations
#[derive(Debug, Error)]
pub enum SvgBatchError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Image could not be decoded (corrupt or truncated data)
    #[error("Failed to decode image: {message} (file: {file:?})")]
    DecodeError {
        message: String,
        file: Option<String>,
    },

    /// Input is not a PNG or JPEG image
    #[error("Unsupported image format: {format} (file: {file:?})")]
    UnsupportedFormat {
        format: String,
        file: Option<String>,
    },

    /// Image dimensions exceed the configured pixel limit
    #[error("Image too large: {width}x{height} pixels (limit: {limit} pixels, file: {file:?})")]
    ImageTooLarge {
        width: u32,
        height: u32,
        limit: u64,
        file: Option<String>,
    },

    /// The vectorization routine failed; the message is the tracer's own
    #[error("{message}")]
    TracingError { message: String },

    /// A worker channel faulted without producing a structured result
    #[error("Conversion worker faulted: {message}")]
    ChannelFault { message: String },

    /// The run was cancelled before this work settled
    #[error("Conversion cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Conversion settings out of range
    #[error("Invalid conversion settings: {message}")]
    InvalidSettings { message: String },

    /// Upload limits exceeded
    #[error("Limit exceeded: {message}")]
    LimitExceeded { message: String },

    /// Folder id not present in the state store
    #[error("Unknown folder: {id}")]
    UnknownFolder { id: String },

    /// A run is already in progress
    #[error("A conversion run is already in progress")]
    AlreadyRunning,

    /// Archive writing errors
    #[error("Archive error: {0}")]
    ArchiveError(#[from] zip::result::ZipError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerdeError(String),
}

impl SvgBatchError {
    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S, file: Option<String>) -> Self {
        Self::DecodeError {
            message: message.into(),
            file,
        }
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(format: S, file: Option<String>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
            file,
        }
    }

    /// Create a new image too large error
    pub fn image_too_large(width: u32, height: u32, limit: u64, file: Option<String>) -> Self {
        Self::ImageTooLarge {
            width,
            height,
            limit,
            file,
        }
    }

    /// Create a new tracing error
    pub fn tracing<S: Into<String>>(message: S) -> Self {
        Self::TracingError {
            message: message.into(),
        }
    }

    /// Create a new channel fault
    pub fn channel_fault<S: Into<String>>(message: S) -> Self {
        Self::ChannelFault {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a new invalid settings error
    pub fn invalid_settings<S: Into<String>>(message: S) -> Self {
        Self::InvalidSettings {
            message: message.into(),
        }
    }

    /// Create a new limit error
    pub fn limit<S: Into<String>>(message: S) -> Self {
        Self::LimitExceeded {
            message: message.into(),
        }
    }

    /// Create a new unknown folder error
    pub fn unknown_folder(id: impl std::fmt::Display) -> Self {
        Self::UnknownFolder { id: id.to_string() }
    }

    /// Check if this error is recoverable (the batch can continue)
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Per-file failures: recorded on the file, siblings keep going
            Self::IoError(_)
            | Self::DecodeError { .. }
            | Self::UnsupportedFormat { .. }
            | Self::ImageTooLarge { .. }
            | Self::TracingError { .. }
            | Self::ChannelFault { .. } => true,

            // Expected early exit, not a failure
            Self::Cancelled => true,

            Self::ConfigError { .. }
            | Self::InvalidSettings { .. }
            | Self::LimitExceeded { .. }
            | Self::UnknownFolder { .. }
            | Self::AlreadyRunning
            | Self::ArchiveError(_)
            | Self::SerdeError(_) => false,
        }
    }

    /// Whether this is the cancellation signal rather than a real failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get the associated file name if available
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::DecodeError { file, .. }
            | Self::UnsupportedFormat { file, .. }
            | Self::ImageTooLarge { file, .. } => file.as_deref(),
            _ => None,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::DecodeError { message, .. } => format!("Could not read image: {}", message),
            Self::UnsupportedFormat { format, .. } => {
                format!("Unsupported image format: {}. Supported formats: PNG, JPEG", format)
            }
            Self::ImageTooLarge { width, height, limit, .. } => {
                format!(
                    "Image is too large ({}x{} = {} pixels). Maximum supported: {} pixels",
                    width,
                    height,
                    u64::from(*width) * u64::from(*height),
                    limit
                )
            }
            Self::TracingError { message } => message.clone(),
            Self::ChannelFault { message } => format!("Conversion crashed: {}", message),
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for SvgBatchError {
    fn from(err: toml::de::Error) -> Self {
        Self::SerdeError(format!("TOML parsing error: {}", err))
    }
}

impl From<serde_yaml::Error> for SvgBatchError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SerdeError(format!("YAML parsing error: {}", err))
    }
}

/// Error context extension for attaching the offending file name
pub trait ErrorContext<T> {
    /// Add file context to an error
    fn with_file_context(self, file: &str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<SvgBatchError>,
{
    fn with_file_context(self, file: &str) -> Result<T> {
        self.map_err(|e| {
            let mut error = e.into();

            match &mut error {
                SvgBatchError::DecodeError { file: ref mut f, .. }
                | SvgBatchError::UnsupportedFormat { file: ref mut f, .. }
                | SvgBatchError::ImageTooLarge { file: ref mut f, .. } => {
                    if f.is_none() {
                        *f = Some(file.to_string());
                    }
                }
                _ => {}
            }

            error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SvgBatchError::config("test message");
        assert!(matches!(err, SvgBatchError::ConfigError { .. }));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SvgBatchError::decode("bad header", None).is_recoverable());
        assert!(SvgBatchError::channel_fault("panicked").is_recoverable());
        assert!(!SvgBatchError::invalid_settings("concurrency 0").is_recoverable());
        assert!(!SvgBatchError::AlreadyRunning.is_recoverable());
    }

    #[test]
    fn test_tracing_message_is_verbatim() {
        let err = SvgBatchError::tracing("path fitting diverged");
        assert_eq!(err.to_string(), "path fitting diverged");
        assert_eq!(err.user_message(), "path fitting diverged");
    }

    #[test]
    fn test_user_messages() {
        let err = SvgBatchError::unsupported_format("gif", None);
        let msg = err.user_message();
        assert!(msg.contains("Unsupported image format"));
        assert!(msg.contains("PNG, JPEG"));
    }

    #[test]
    fn test_file_context() {
        let result: Result<()> = Err(SvgBatchError::decode("truncated", None));
        let err = result.with_file_context("logo.png").unwrap_err();
        assert_eq!(err.file_name(), Some("logo.png"));

        let result: Result<()> = Err(SvgBatchError::config("test"));
        let err = result.with_file_context("logo.png").unwrap_err();
        assert_eq!(err.file_name(), None);
    }
}
