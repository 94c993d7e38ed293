use std::fmt;

use thiserror::Error;

/// Main error type for the tandem crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TandemError {
    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Invalid hyperparameters or configuration values
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Non-finite values where the numeric policy forbids them
    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    /// Device-related errors
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl TandemError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        TandemError::ShapeError(message)
    }

    /// Create a configuration error naming the offending field
    pub fn config_error(field: &str, message: &str) -> Self {
        TandemError::ConfigurationError(format!("{}: {}", field, message))
    }

    /// Create a device error with helpful context
    pub fn device_error(device: &str, message: &str) -> Self {
        TandemError::DeviceError(format!("Device '{}': {}", device, message))
    }
}

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        TandemError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        TandemError::SerializationError(err.to_string())
    }
}

/// Result type for tandem operations
pub type TandemResult<T> = Result<T, TandemError>;

/// Where an error surfaced: the loss or op name and the operands involved
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub shapes: Vec<String>,
    pub device: Option<String>,
    pub hint: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Self::default()
        }
    }

    pub fn with_shape(mut self, shape: impl fmt::Display) -> Self {
        self.shapes.push(shape.to_string());
        self
    }

    pub fn with_device(mut self, device: impl fmt::Display) -> Self {
        self.device = Some(device.to_string());
        self
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in {}", self.operation)?;
        if !self.shapes.is_empty() {
            write!(f, " (operands {})", self.shapes.join(" and "))?;
        }
        if let Some(device) = &self.device {
            write!(f, " on {}", device)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "; {}", hint)?;
        }
        Ok(())
    }
}

/// Attach an [`ErrorContext`] to caller-facing errors as they propagate
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> TandemResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for TandemResult<T> {
    fn with_context<F>(self, f: F) -> TandemResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| e.annotate(f()))
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    ConfigInvalid,
    NumericInstability,
    DeviceMismatch,
    InvalidOperation,
    IoFailed,
    SerializationFailed,
}

impl TandemError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            TandemError::ShapeError(_) => ErrorCode::ShapeMismatch,
            TandemError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            TandemError::NumericInstability(_) => ErrorCode::NumericInstability,
            TandemError::DeviceError(_) => ErrorCode::DeviceMismatch,
            TandemError::InvalidInput(_) => ErrorCode::InvalidOperation,
            TandemError::InvalidState(_) => ErrorCode::InvalidOperation,
            TandemError::IoError(_) => ErrorCode::IoFailed,
            TandemError::SerializationError(_) => ErrorCode::SerializationFailed,
        }
    }

    /// Append `context` to shape and device errors; others pass through unchanged
    pub fn annotate(self, context: ErrorContext) -> Self {
        match self {
            TandemError::ShapeError(msg) => TandemError::ShapeError(format!("{} [{}]", msg, context)),
            TandemError::DeviceError(msg) => TandemError::DeviceError(format!("{} [{}]", msg, context)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error() {
        let error = TandemError::shape_error("[32, 128]", "[16, 128]", Some("Rebuild the loss with batch_size = 16"));
        assert!(error.to_string().contains("Expected [32, 128], got [16, 128]"));
        assert!(error.to_string().contains("Rebuild the loss with batch_size = 16"));
    }

    #[test]
    fn test_error_context_display() {
        let context = ErrorContext::new("SimClrLoss")
            .with_shape("[4, 8]")
            .with_shape("[3, 8]")
            .with_device("cpu")
            .with_hint("both views must have the same batch size");
        assert_eq!(
            context.to_string(),
            "in SimClrLoss (operands [4, 8] and [3, 8]) on cpu; both views must have the same batch size"
        );
        assert_eq!(ErrorContext::new("matmul").to_string(), "in matmul");
    }

    #[test]
    fn test_with_context_keeps_variant() {
        let result: TandemResult<()> = Err(TandemError::ShapeError("bad".to_string()));
        let err = result
            .with_context(|| ErrorContext::new("VicRegLoss").with_shape("[2, 2]"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShapeMismatch);
        assert!(err.to_string().contains("in VicRegLoss (operands [2, 2])"));

        let result: TandemResult<()> = Err(TandemError::IoError("disk".to_string()));
        let err = result.with_context(|| ErrorContext::new("config")).unwrap_err();
        assert_eq!(err, TandemError::IoError("disk".to_string()));
    }

    #[test]
    fn test_error_codes() {
        let shape_error = TandemError::ShapeError("test".to_string());
        assert_eq!(shape_error.code(), ErrorCode::ShapeMismatch);

        let config_error = TandemError::config_error("temperature", "must be positive");
        assert_eq!(config_error.code(), ErrorCode::ConfigInvalid);
        assert!(config_error.to_string().contains("temperature: must be positive"));

        let io_error: TandemError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(io_error.code(), ErrorCode::IoFailed);
    }
}
