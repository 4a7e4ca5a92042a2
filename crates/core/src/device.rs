//! Device selection and `ort::Session` construction.
//!
//! [`Device`] is an explicit value threaded from config/CLI into
//! [`build_session`]; an accelerator that cannot be registered is a hard
//! [`UpscaleError::Device`], never a silent CPU fallback.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, UpscaleError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda {
        device_id: i32,
    },
    /// TensorRT EP with CUDA EP registered behind it for unsupported ops.
    Tensorrt {
        device_id: i32,
    },
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
            Self::Tensorrt { device_id } => write!(f, "tensorrt:{device_id}"),
        }
    }
}

impl FromStr for Device {
    type Err = UpscaleError;

    /// Accepts `cpu`, `gpu`, `cuda`, `cuda:N`, `tensorrt`, `trt`, `tensorrt:N`
    /// (case-insensitive).
    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        let (kind, id) = match lowered.split_once(':') {
            Some((kind, id)) => {
                let id = id.parse::<i32>().ok().filter(|id| *id >= 0).ok_or_else(|| {
                    UpscaleError::Argument(format!("invalid device ordinal in '{s}'"))
                })?;
                (kind.to_string(), Some(id))
            }
            None => (lowered, None),
        };

        match (kind.as_str(), id) {
            ("cpu", None) => Ok(Self::Cpu),
            ("gpu" | "cuda", id) => Ok(Self::Cuda {
                device_id: id.unwrap_or(0),
            }),
            ("tensorrt" | "trt", id) => Ok(Self::Tensorrt {
                device_id: id.unwrap_or(0),
            }),
            _ => Err(UpscaleError::Argument(format!(
                "unknown device '{s}' (expected cpu, gpu, cuda[:N] or tensorrt[:N])"
            ))),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = UpscaleError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: Device,
    pub trt_cache_dir: Option<&'a Path>,
}

fn ensure_available(device: Device, provider: &impl ExecutionProvider, name: &str) -> Result<()> {
    match provider.is_available() {
        Ok(true) => Ok(()),
        Ok(false) => Err(UpscaleError::Device {
            device,
            reason: format!("{name} execution provider is not available in this ONNX Runtime build"),
        }),
        Err(error) => Err(UpscaleError::Device {
            device,
            reason: format!("failed to query {name} execution provider: {error}"),
        }),
    }
}

/// Build an `ort::Session` on the requested device.
///
/// * `Cpu` uses the default CPU EP.
/// * `Cuda` registers the CUDA EP with `error_on_failure`, so a missing driver
///   or runtime surfaces as [`UpscaleError::Device`].
/// * `Tensorrt` registers TRT (engine cache under `trt_cache_dir`) then CUDA.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let device = config.device;
    let load_err = |error: ort::Error| UpscaleError::load(config.model_path, error.to_string());
    let device_err = |error: ort::Error| UpscaleError::Device {
        device,
        reason: error.to_string(),
    };

    let builder = Session::builder()
        .map_err(load_err)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_err)?;

    let started = Instant::now();
    let session = match device {
        Device::Cpu => {
            debug!(device = %device, "Building session with CPU EP");
            builder.commit_from_file(config.model_path).map_err(load_err)?
        }
        Device::Cuda { device_id } => {
            let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
            ensure_available(device, &cuda, "CUDA")?;

            debug!(device = %device, "Building session with CUDA EP");
            builder
                .with_execution_providers([cuda.build().error_on_failure()])
                .map_err(device_err)?
                .commit_from_file(config.model_path)
                .map_err(load_err)?
        }
        Device::Tensorrt { device_id } => {
            let trt = TensorRTExecutionProvider::default().with_device_id(device_id);
            ensure_available(device, &trt, "TensorRT")?;

            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );

            builder
                .with_execution_providers([
                    trt.with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .build()
                        .error_on_failure(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ])
                .map_err(device_err)?
                .commit_from_file(config.model_path)
                .map_err(load_err)?
        }
    };

    info!(
        device = %device,
        elapsed_secs = started.elapsed().as_secs_f64(),
        model = %config.model_path.display(),
        "Session ready"
    );

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_and_gpu_aliases() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(
            "gpu".parse::<Device>().unwrap(),
            Device::Cuda { device_id: 0 }
        );
        assert_eq!(
            "cuda".parse::<Device>().unwrap(),
            Device::Cuda { device_id: 0 }
        );
        assert_eq!(
            "cuda:2".parse::<Device>().unwrap(),
            Device::Cuda { device_id: 2 }
        );
        assert_eq!(
            "TRT".parse::<Device>().unwrap(),
            Device::Tensorrt { device_id: 0 }
        );
        assert_eq!(
            "tensorrt:1".parse::<Device>().unwrap(),
            Device::Tensorrt { device_id: 1 }
        );
    }

    #[test]
    fn rejects_unknown_devices() {
        assert!("metal".parse::<Device>().is_err());
        assert!("cpu:0".parse::<Device>().is_err());
        assert!("cuda:-1".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("".parse::<Device>().is_err());
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for device in [
            Device::Cpu,
            Device::Cuda { device_id: 3 },
            Device::Tensorrt { device_id: 0 },
        ] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn default_is_cpu() {
        assert_eq!(Device::default(), Device::Cpu);
        assert!(!Device::Cpu.is_accelerator());
        assert!(Device::Cuda { device_id: 0 }.is_accelerator());
    }

    /// Requires a CUDA-enabled ONNX Runtime. Run: `cargo test -p esrgan-core -- --ignored`
    #[test]
    #[ignore]
    fn cuda_session_rejects_missing_model_as_load_error() {
        let config = SessionConfig {
            model_path: Path::new("does-not-exist.onnx"),
            device: Device::Cuda { device_id: 0 },
            trt_cache_dir: None,
        };
        let err = build_session(&config).unwrap_err();
        assert!(matches!(err, UpscaleError::Load { .. }));
    }
}
