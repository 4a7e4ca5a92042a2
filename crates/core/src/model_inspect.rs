use std::path::Path;

use anyhow::{Context, Result};
use prost::Message;

use crate::onnx_proto;

/// ONNX `TensorProto.DataType` values the pipeline cares about.
pub const ONNX_FLOAT: i32 = 1;
pub const ONNX_FLOAT16: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    /// Human-readable data type, e.g. "float32", "float16", "int64".
    pub data_type: String,
    /// Dimensions. `-1` represents a dynamic/symbolic dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ModelInspection {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub graph_name: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    /// Graph initializers: the parameter name -> shape manifest of the weights.
    pub initializers: Vec<TensorInfo>,
    /// Sum of all initializer tensor element counts.
    pub param_count: u64,
    /// Number of graph nodes (operations).
    pub op_count: usize,
}

impl ModelInspection {
    /// Inputs that are real feeds, i.e. not initializers listed as graph inputs
    /// (older exporters emit `keep_initializers_as_inputs=True`).
    pub fn feed_inputs(&self) -> Vec<&TensorInfo> {
        self.inputs
            .iter()
            .filter(|input| !self.initializers.iter().any(|init| init.name == input.name))
            .collect()
    }
}

/// Map ONNX `TensorProto.DataType` enum value to a human-readable string.
fn data_type_name(dt: i32) -> String {
    match dt {
        ONNX_FLOAT => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        4 => "uint16".into(),
        5 => "int16".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        8 => "string".into(),
        9 => "bool".into(),
        ONNX_FLOAT16 => "float16".into(),
        11 => "float64".into(),
        12 => "uint32".into(),
        13 => "uint64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &onnx_proto::ValueInfoProto) -> TensorInfo {
    let (data_type, shape) = vi
        .r#type
        .as_ref()
        .and_then(|tp| tp.value.as_ref())
        .map(|val| match val {
            onnx_proto::type_proto::Value::TensorType(t) => {
                let dims = t
                    .shape
                    .as_ref()
                    .map(|s| {
                        s.dim
                            .iter()
                            .map(|d| match &d.value {
                                Some(
                                    onnx_proto::tensor_shape_proto::dimension::Value::DimValue(v),
                                ) => *v,
                                _ => -1,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (data_type_name(t.elem_type), dims)
            }
        })
        .unwrap_or_else(|| ("unknown".into(), vec![]));

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}

fn tensor_element_count(dims: &[i64]) -> u64 {
    if dims.is_empty() {
        return 1;
    }
    dims.iter()
        .map(|&d| if d > 0 { d as u64 } else { 1 })
        .product()
}

/// Inspect an ONNX model file without loading it into a runtime. Does NOT
/// require a GPU.
pub fn inspect_onnx(path: &Path) -> Result<ModelInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read ONNX file: {}", path.display()))?;

    inspect_onnx_bytes(&bytes)
}

pub fn inspect_onnx_bytes(bytes: &[u8]) -> Result<ModelInspection> {
    let model = onnx_proto::ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;

    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty() || op.domain == "ai.onnx")
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    let initializers: Vec<TensorInfo> = graph
        .initializer
        .iter()
        .map(|t| TensorInfo {
            name: t.name.clone(),
            data_type: data_type_name(t.data_type),
            shape: t.dims.clone(),
        })
        .collect();

    let param_count = graph
        .initializer
        .iter()
        .map(|t| tensor_element_count(&t.dims))
        .sum();

    Ok(ModelInspection {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name.clone(),
        producer_version: model.producer_version.clone(),
        graph_name: graph.name.clone(),
        inputs: graph.input.iter().map(value_info_to_tensor).collect(),
        outputs: graph.output.iter().map(value_info_to_tensor).collect(),
        initializers,
        param_count,
        op_count: graph.node.len(),
    })
}
