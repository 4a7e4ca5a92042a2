//! RRDBNet x4 super-resolution: model loading, image I/O and the batch driver.

pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod logging;
pub mod model_inspect;
pub mod network;
pub mod onnx_proto;
pub mod runtime;
pub mod tensor;

pub use device::Device;
pub use driver::{Driver, FailurePolicy, RunOptions, RunSummary, WorkItem};
pub use error::{Result, UpscaleError};
pub use network::{NetworkModel, OnnxNetwork, RrdbNetConfig};
