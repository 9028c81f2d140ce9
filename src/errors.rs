use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while loading a model, predicting on an image or showing the result.
///
/// Each stage of the harness owns one variant, so callers can tell a bad checkpoint from a
/// missing image or a headless host without parsing messages.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Failed to load model artifact {path:?}: {reason}")]
    ArtifactLoad {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Input not found: {source_name}")]
    InputNotFound {
        source_name: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Display unavailable: {reason}")]
    DisplayUnavailable { reason: String },

    #[error("Display error: {operation} failed")]
    Display {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    pub fn artifact_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArtifactLoad {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn input_not_found(source_name: impl Into<String>) -> Self {
        Self::InputNotFound {
            source_name: source_name.into(),
            source: None,
        }
    }

    pub fn inference(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Inference {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Runtime failures surfacing after a session exists belong to the forward pass.
///
/// Load-time failures are wrapped explicitly as [`HarnessError::ArtifactLoad`] at the call site.
impl From<ort::Error> for HarnessError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors only occur while reshaping output tensors.
impl From<ndarray::ShapeError> for HarnessError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Inference {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<image::ImageError> for HarnessError {
    fn from(err: image::ImageError) -> Self {
        Self::Display {
            operation: "image encoding".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_stage() {
        let err = HarnessError::artifact_load("best.onnx", "file not found");
        assert_eq!(
            err.to_string(),
            "Failed to load model artifact \"best.onnx\": file not found"
        );

        let err = HarnessError::input_not_found("missing.png");
        assert_eq!(err.to_string(), "Input not found: missing.png");

        let err = HarnessError::inference("forward pass", "boom");
        assert_eq!(err.to_string(), "Inference error: forward pass failed");
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("boom".to_string())
        );
    }

    #[test]
    fn test_shape_error_maps_to_inference() {
        let err = ndarray::Array1::<f32>::zeros(4)
            .into_shape_with_order((3, 2))
            .unwrap_err();
        assert!(matches!(
            HarnessError::from(err),
            HarnessError::Inference { .. }
        ));
    }
}
