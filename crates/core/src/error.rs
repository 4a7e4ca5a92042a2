//! Error taxonomy for the upscaling pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::Device;

pub type Result<T, E = UpscaleError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum UpscaleError {
    /// Missing or malformed command-line / config input.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Weights file missing, unreadable, not ONNX, or not an RRDBNet x4 parameter set.
    #[error("failed to load model weights from {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    /// Requested execution provider cannot be used on this machine.
    #[error("device {device} is unavailable: {reason}")]
    Device { device: Device, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot process {}: {reason}", .path.display())]
    Discovery { path: PathBuf, reason: String },

    #[error("failed to decode image {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode image to {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("inference failed for {}: {reason}", .path.display())]
    Inference { path: PathBuf, reason: String },
}

impl UpscaleError {
    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn inference(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Inference {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Initialization-class errors abort the run regardless of failure policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Argument(_) | Self::Load { .. } | Self::Device { .. } | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_display_includes_path_and_reason() {
        let err = UpscaleError::load("models/x4.onnx", "missing key model.0.weight");
        assert_eq!(
            err.to_string(),
            "failed to load model weights from models/x4.onnx: missing key model.0.weight"
        );
    }

    #[test]
    fn device_error_display() {
        let err = UpscaleError::Device {
            device: Device::Cuda { device_id: 1 },
            reason: "CUDA execution provider not available".into(),
        };
        assert_eq!(
            err.to_string(),
            "device cuda:1 is unavailable: CUDA execution provider not available"
        );
    }

    #[test]
    fn init_errors_are_fatal_and_item_errors_are_not() {
        assert!(UpscaleError::Argument("model path".into()).is_fatal());
        assert!(UpscaleError::load("m.onnx", "x").is_fatal());
        assert!(UpscaleError::Config("bad".into()).is_fatal());
        assert!(!UpscaleError::inference("LR/a.png", "shape").is_fatal());
        assert!(!UpscaleError::Discovery {
            path: PathBuf::from("/tmp/a.png"),
            reason: "outside input root".into(),
        }
        .is_fatal());
    }
}
