//! RRDBNet x4 as an opaque ONNX Runtime session.
//!
//! The architecture is fixed by [`RrdbNetConfig`]; the ONNX export's
//! initializers are checked against the parameter set that configuration
//! exposes before any session is created.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context};
use half::f16;
use ndarray::Ix4;
use ort::{session::Session, tensor::TensorElementType, value::Tensor, value::ValueType};
use tracing::{debug, info, warn};

use crate::device::{build_session, Device, SessionConfig};
use crate::error::{Result, UpscaleError};
use crate::model_inspect::{inspect_onnx, ModelInspection};
use crate::tensor::{self, ImageTensor, CHANNELS};

/// Architecture hyperparameters of the residual-in-residual dense network.
///
/// Normalization is none, activation is LeakyReLU(0.2), blocks are
/// conv-then-activation, the residual scale is 1 and upsampling is
/// nearest-neighbour followed by a convolution. Those are not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrdbNetConfig {
    pub in_nc: i64,
    pub out_nc: i64,
    /// Feature channels of the trunk.
    pub nf: i64,
    /// Number of RRDB blocks.
    pub nb: usize,
    /// Growth channels inside each dense block.
    pub gc: i64,
    pub upscale: usize,
}

impl Default for RrdbNetConfig {
    fn default() -> Self {
        Self {
            in_nc: 3,
            out_nc: 3,
            nf: 64,
            nb: 23,
            gc: 32,
            upscale: 4,
        }
    }
}

impl RrdbNetConfig {
    /// Number of upsample-then-conv stages in the tail.
    pub fn upconv_blocks(&self) -> usize {
        if self.upscale == 3 {
            1
        } else {
            self.upscale.max(1).ilog2() as usize
        }
    }

    /// Parameter names and shapes in state-dict order.
    pub fn expected_parameters(&self) -> Vec<(String, Vec<i64>)> {
        let Self {
            in_nc,
            out_nc,
            nf,
            nb,
            gc,
            ..
        } = *self;
        let mut params = Vec::new();
        let mut conv = |prefix: String, out: i64, inp: i64| {
            params.push((format!("{prefix}.weight"), vec![out, inp, 3, 3]));
            params.push((format!("{prefix}.bias"), vec![out]));
        };

        conv("model.0".into(), nf, in_nc);
        for block in 0..nb {
            for rdb in 1..=3 {
                for k in 1..=5i64 {
                    let out = if k == 5 { nf } else { gc };
                    conv(
                        format!("model.1.sub.{block}.RDB{rdb}.conv{k}.0"),
                        out,
                        nf + (k - 1) * gc,
                    );
                }
            }
        }
        conv(format!("model.1.sub.{nb}"), nf, nf);

        let n = self.upconv_blocks();
        for i in 0..n {
            conv(format!("model.{}", 3 + 3 * i), nf, nf);
        }
        conv(format!("model.{}", 2 + 3 * n), nf, nf);
        conv(format!("model.{}", 2 + 3 * n + 2), out_nc, nf);

        params
    }
}

/// Outcome of comparing an export's initializers with the expected set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParameterReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    /// `(name, expected, found)`
    pub mismatched: Vec<(String, Vec<i64>, Vec<i64>)>,
}

impl ParameterReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    /// One-line summary naming the first offending key of each kind.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(first) = self.missing.first() {
            parts.push(format!("{} missing key(s), e.g. {first}", self.missing.len()));
        }
        if let Some(first) = self.unexpected.first() {
            parts.push(format!(
                "{} unexpected key(s), e.g. {first}",
                self.unexpected.len()
            ));
        }
        if let Some((name, expected, found)) = self.mismatched.first() {
            parts.push(format!(
                "{} shape mismatch(es), e.g. {name}: expected {expected:?}, found {found:?}",
                self.mismatched.len()
            ));
        }
        if parts.is_empty() {
            "parameters match".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Strict state-dict style comparison. Initializers that are not
/// `*.weight`/`*.bias` (folded constants, shape tensors) are not parameters
/// and are ignored.
pub fn verify_parameters(inspection: &ModelInspection, config: &RrdbNetConfig) -> ParameterReport {
    let found: HashMap<&str, &[i64]> = inspection
        .initializers
        .iter()
        .map(|t| (t.name.as_str(), t.shape.as_slice()))
        .collect();
    let expected = config.expected_parameters();

    let mut report = ParameterReport::default();
    for (name, shape) in &expected {
        match found.get(name.as_str()) {
            None => report.missing.push(name.clone()),
            Some(actual) if *actual != shape.as_slice() => {
                report
                    .mismatched
                    .push((name.clone(), shape.clone(), actual.to_vec()))
            }
            Some(_) => {}
        }
    }

    let expected_names: std::collections::HashSet<&str> =
        expected.iter().map(|(name, _)| name.as_str()).collect();
    report.unexpected = inspection
        .initializers
        .iter()
        .map(|t| t.name.as_str())
        .filter(|name| name.ends_with(".weight") || name.ends_with(".bias"))
        .filter(|name| !expected_names.contains(name))
        .map(str::to_string)
        .collect();

    report
}

/// The graph must take exactly one image-shaped float input and produce one
/// output of the same element type.
pub fn verify_signature(inspection: &ModelInspection) -> anyhow::Result<()> {
    let feeds = inspection.feed_inputs();
    let [input] = feeds.as_slice() else {
        bail!("expected exactly one graph input, found {}", feeds.len());
    };
    let [output] = inspection.outputs.as_slice() else {
        bail!(
            "expected exactly one graph output, found {}",
            inspection.outputs.len()
        );
    };

    for tensor in [*input, output] {
        if tensor.shape.len() != 4 {
            bail!(
                "'{}' must be rank 4 (N, C, H, W), found shape {:?}",
                tensor.name,
                tensor.shape
            );
        }
        let channels = tensor.shape[1];
        if channels != CHANNELS as i64 && channels != -1 {
            bail!("'{}' must have 3 channels, found {channels}", tensor.name);
        }
    }

    if !matches!(input.data_type.as_str(), "float32" | "float16") {
        bail!(
            "input '{}' must be float32 or float16, found {}",
            input.name,
            input.data_type
        );
    }
    if output.data_type != input.data_type {
        bail!(
            "output type {} does not match input type {}",
            output.data_type,
            input.data_type
        );
    }

    Ok(())
}

/// Forward pass capability. Implementations are shared read-only across
/// workers.
pub trait NetworkModel: Send + Sync {
    /// Spatial scale factor between input and output.
    fn scale(&self) -> usize;

    /// `1 x 3 x H x W` in, `1 x 3 x sH x sW` out, both RGB in `[0, 1]` nominally.
    fn forward(&self, input: &ImageTensor) -> anyhow::Result<ImageTensor>;
}

pub struct OnnxNetwork {
    session: Mutex<Session>,
    model_path: PathBuf,
    device: Device,
    scale: usize,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxNetwork {
    /// Validate the export against `config`, then build the session on `device`.
    ///
    /// With `strict` off a parameter mismatch is logged instead of rejected;
    /// the graph signature is always enforced.
    pub fn load(
        model_path: &Path,
        device: Device,
        config: &RrdbNetConfig,
        strict: bool,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        if !model_path.is_file() {
            return Err(UpscaleError::load(model_path, "file does not exist"));
        }

        let inspection =
            inspect_onnx(model_path).map_err(|e| UpscaleError::load(model_path, format!("{e:#}")))?;
        debug!(
            model = %model_path.display(),
            initializers = inspection.initializers.len(),
            params = inspection.param_count,
            opset = inspection.opset_version,
            "Inspected ONNX export"
        );

        verify_signature(&inspection)
            .map_err(|e| UpscaleError::load(model_path, format!("{e:#}")))?;

        let report = verify_parameters(&inspection, config);
        if !report.is_exact() {
            if strict {
                return Err(UpscaleError::load(model_path, report.summary()));
            }
            warn!(
                model = %model_path.display(),
                summary = %report.summary(),
                "Parameter set does not match RRDBNet; continuing because strict matching is off"
            );
        }

        let session = build_session(&SessionConfig {
            model_path,
            device,
            trt_cache_dir,
        })?;

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| UpscaleError::load(model_path, "session has no inputs"))?;
        let input_name = input.name().to_string();
        let is_fp16 = match input.dtype() {
            ValueType::Tensor { ty, .. } => *ty == TensorElementType::Float16,
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .ok_or_else(|| UpscaleError::load(model_path, "session has no outputs"))?
            .name()
            .to_string();

        info!(
            model = %model_path.display(),
            %device,
            %input_name,
            %output_name,
            is_fp16,
            "Network ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            model_path: model_path.to_path_buf(),
            device,
            scale: config.upscale,
            input_name,
            output_name,
            is_fp16,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run_fp32(&self, session: &mut Session, input: &ImageTensor) -> anyhow::Result<ImageTensor> {
        let input_tensor = Tensor::from_array(input.clone())?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned().into_dimensionality::<Ix4>()?)
    }

    fn run_fp16(&self, session: &mut Session, input: &ImageTensor) -> anyhow::Result<ImageTensor> {
        let input_tensor = Tensor::from_array(tensor::to_f16(input)?)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        tensor::from_f16(output_view.to_owned())
    }
}

impl NetworkModel for OnnxNetwork {
    fn scale(&self) -> usize {
        self.scale
    }

    fn forward(&self, input: &ImageTensor) -> anyhow::Result<ImageTensor> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned by a panicked worker"))?;
        let output = if self.is_fp16 {
            self.run_fp16(&mut session, input)
        } else {
            self.run_fp32(&mut session, input)
        };
        output.context("ONNX Runtime forward pass failed")
    }
}
