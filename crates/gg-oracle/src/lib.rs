#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use gg_graph::{Graph, TensorDecl};
use gg_onnx::{ModelMetadata, decode_named_tensor, encode_model, encode_named_tensor};
use gg_tensor::NamedTensor;
use serde::{Deserialize, Serialize};

pub const ORACLE_PYTHON_ENV: &str = "GOLDGEN_ORACLE_PYTHON";

pub const ORACLE_REASON_CODES: [&str; 6] = [
    "oracle_launch_failed",
    "oracle_rejected",
    "oracle_protocol_invalid",
    "oracle_output_contract_violation",
    "oracle_input_contract_violation",
    "oracle_io_failed",
];

const PY_ORACLE_SCRIPT: &str = r#"
import base64
import json
import sys

request_path = sys.argv[1]
response_path = sys.argv[2]

def respond(payload):
    with open(response_path, 'w', encoding='utf-8') as fh:
        json.dump(payload, fh)

with open(request_path, 'r', encoding='utf-8') as fh:
    request = json.load(fh)

import onnx
from onnx import numpy_helper

model_bytes = base64.b64decode(request['model'])
try:
    model = onnx.load_from_string(model_bytes)
    onnx.checker.check_model(model)
except Exception as exc:
    respond({'status': 'rejected', 'detail': f'checker: {exc}'})
    sys.exit(0)

if request['mode'] == 'check':
    respond({'status': 'ok', 'outputs': []})
    sys.exit(0)

import onnxruntime as ort

try:
    session = ort.InferenceSession(model_bytes, providers=['CPUExecutionProvider'])
    feeds = {}
    for item in request['inputs']:
        proto = onnx.TensorProto()
        proto.ParseFromString(base64.b64decode(item['tensor']))
        feeds[item['name']] = numpy_helper.to_array(proto)
    names = [out.name for out in session.get_outputs()]
    results = session.run(names, feeds)
except Exception as exc:
    respond({'status': 'rejected', 'detail': f'runtime: {exc}'})
    sys.exit(0)

outputs = []
for name, value in zip(names, results):
    proto = numpy_helper.from_array(value, name)
    outputs.append({
        'name': name,
        'tensor': base64.b64encode(proto.SerializeToString()).decode('ascii'),
    })
respond({'status': 'ok', 'outputs': outputs})
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    Launch { interpreter: String, detail: String },
    Rejected { stage: &'static str, detail: String },
    Protocol(String),
    OutputContract(String),
    InputContract(String),
    Io { path: PathBuf, detail: String },
}

impl OracleError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "oracle_launch_failed",
            Self::Rejected { .. } => "oracle_rejected",
            Self::Protocol(_) => "oracle_protocol_invalid",
            Self::OutputContract(_) => "oracle_output_contract_violation",
            Self::InputContract(_) => "oracle_input_contract_violation",
            Self::Io { .. } => "oracle_io_failed",
        }
    }

    /// True when an external checker refused the graph itself.
    #[must_use]
    pub fn is_schema_rejection(&self) -> bool {
        matches!(self, Self::Rejected { stage: "check", .. })
    }
}

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch {
                interpreter,
                detail,
            } => write!(f, "oracle interpreter {interpreter} failed: {detail}"),
            Self::Rejected { stage, detail } => write!(f, "oracle {stage} rejected: {detail}"),
            Self::Protocol(detail) => write!(f, "oracle protocol error: {detail}"),
            Self::OutputContract(detail) => write!(f, "oracle output contract: {detail}"),
            Self::InputContract(detail) => write!(f, "oracle input contract: {detail}"),
            Self::Io { path, detail } => write!(f, "{}: {detail}", path.display()),
        }
    }
}

impl std::error::Error for OracleError {}

/// Accepts or rejects a graph definition.
pub trait SchemaChecker {
    fn check(&self, graph: &Graph) -> Result<(), OracleError>;
}

/// Trusted engine that produces the golden outputs for a graph.
///
/// `inputs` are ordered like `graph.inputs`; outputs come back ordered like
/// `graph.outputs`.
pub trait ReferenceOracle {
    fn evaluate(&self, graph: &Graph, inputs: &[NamedTensor])
    -> Result<Vec<NamedTensor>, OracleError>;
}

/// Fed tensors must line up with the declared inputs by position, name, type and shape.
pub fn check_input_contract(graph: &Graph, inputs: &[NamedTensor]) -> Result<(), OracleError> {
    check_contract(&graph.inputs, inputs).map_err(OracleError::InputContract)
}

/// Returned tensors must line up with the declared outputs.
pub fn check_output_contract(graph: &Graph, outputs: &[NamedTensor]) -> Result<(), OracleError> {
    check_contract(&graph.outputs, outputs).map_err(OracleError::OutputContract)
}

fn check_contract(declared: &[TensorDecl], actual: &[NamedTensor]) -> Result<(), String> {
    if declared.len() != actual.len() {
        return Err(format!(
            "expected {} tensors, got {}",
            declared.len(),
            actual.len()
        ));
    }
    for (position, (decl, named)) in declared.iter().zip(actual).enumerate() {
        if decl.name != named.name {
            return Err(format!(
                "position {position}: expected {}, got {}",
                decl.name, named.name
            ));
        }
        if decl.element_type != named.tensor.element_type() {
            return Err(format!(
                "{}: expected {}, got {}",
                decl.name,
                decl.element_type,
                named.tensor.element_type()
            ));
        }
        if !decl.admits(named.tensor.shape()) {
            return Err(format!(
                "{}: shape {:?} does not match declared dims {:?}",
                decl.name,
                named.tensor.shape(),
                decl.dims
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Check,
    Evaluate,
}

impl RequestMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Evaluate => "evaluate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTensor {
    pub name: String,
    /// Base64 of the serialized `TensorProto`.
    pub tensor: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OracleRequest {
    pub mode: String,
    /// Base64 of the serialized `ModelProto`.
    pub model: String,
    pub inputs: Vec<WireTensor>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OracleResponse {
    pub status: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub outputs: Vec<WireTensor>,
}

pub fn encode_request(
    mode: RequestMode,
    graph: &Graph,
    inputs: &[NamedTensor],
    metadata: &ModelMetadata,
) -> Result<OracleRequest, OracleError> {
    let protocol = |err: gg_onnx::WireError| OracleError::Protocol(err.to_string());
    let model = encode_model(graph, metadata).map_err(protocol)?;
    let inputs = inputs
        .iter()
        .map(|named| {
            Ok(WireTensor {
                name: named.name.clone(),
                tensor: BASE64.encode(encode_named_tensor(named).map_err(protocol)?),
            })
        })
        .collect::<Result<Vec<_>, OracleError>>()?;
    Ok(OracleRequest {
        mode: mode.as_str().to_string(),
        model: BASE64.encode(model),
        inputs,
    })
}

/// Interpret a response for `mode`; evaluated outputs are checked against the graph.
pub fn decode_response(
    mode: RequestMode,
    graph: &Graph,
    raw: &str,
) -> Result<Vec<NamedTensor>, OracleError> {
    let response: OracleResponse = serde_json::from_str(raw)
        .map_err(|err| OracleError::Protocol(format!("invalid response json: {err}")))?;
    match response.status.as_str() {
        "ok" => {}
        "rejected" => {
            return Err(OracleError::Rejected {
                stage: mode.as_str(),
                detail: response.detail,
            });
        }
        other => return Err(OracleError::Protocol(format!("unknown status {other}"))),
    }
    if mode == RequestMode::Check {
        return Ok(Vec::new());
    }

    let outputs = response
        .outputs
        .iter()
        .map(|wire| {
            let bytes = BASE64
                .decode(&wire.tensor)
                .map_err(|err| OracleError::Protocol(format!("{}: bad base64: {err}", wire.name)))?;
            let mut named = decode_named_tensor(&bytes)
                .map_err(|err| OracleError::Protocol(format!("{}: {err}", wire.name)))?;
            named.name.clone_from(&wire.name);
            Ok(named)
        })
        .collect::<Result<Vec<_>, OracleError>>()?;
    check_output_contract(graph, &outputs)?;
    Ok(outputs)
}

/// Look up the interpreter: explicit value, then `GOLDGEN_ORACLE_PYTHON`, then `python3`.
#[must_use]
pub fn resolve_oracle_python(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(ORACLE_PYTHON_ENV).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "python3".to_string())
}

/// Runs `onnx.checker` and `onnxruntime` in a Python subprocess.
///
/// Requests and responses go through JSON files in `scratch_dir`; tensors
/// travel as serialized `TensorProto`s so bit patterns are preserved.
#[derive(Debug, Clone)]
pub struct OnnxRuntimeOracle {
    python: String,
    scratch_dir: PathBuf,
    metadata: ModelMetadata,
}

impl OnnxRuntimeOracle {
    pub fn new(python: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            scratch_dir: scratch_dir.into(),
            metadata: ModelMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ModelMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn python(&self) -> &str {
        &self.python
    }

    fn run(
        &self,
        mode: RequestMode,
        graph: &Graph,
        inputs: &[NamedTensor],
    ) -> Result<Vec<NamedTensor>, OracleError> {
        fs::create_dir_all(&self.scratch_dir).map_err(|err| io_error(&self.scratch_dir, err))?;
        let stem = scratch_stem(&graph.name, mode);
        let request_path = self.scratch_dir.join(format!("{stem}.request.json"));
        let response_path = self.scratch_dir.join(format!("{stem}.response.json"));
        // A stale response from an earlier run must not be mistaken for this one.
        if response_path.exists() {
            fs::remove_file(&response_path).map_err(|err| io_error(&response_path, err))?;
        }

        let request = encode_request(mode, graph, inputs, &self.metadata)?;
        let raw = serde_json::to_string(&request)
            .map_err(|err| OracleError::Protocol(format!("failed to serialize request: {err}")))?;
        fs::write(&request_path, raw).map_err(|err| io_error(&request_path, err))?;

        let output = Command::new(&self.python)
            .arg("-c")
            .arg(PY_ORACLE_SCRIPT)
            .arg(&request_path)
            .arg(&response_path)
            .output()
            .map_err(|err| OracleError::Launch {
                interpreter: self.python.clone(),
                detail: format!("failed to invoke: {err}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(OracleError::Launch {
                interpreter: self.python.clone(),
                detail: format!(
                    "status={} stdout={} stderr={}",
                    output.status,
                    stdout.trim(),
                    stderr.trim()
                ),
            });
        }

        let raw = fs::read_to_string(&response_path).map_err(|err| {
            OracleError::Protocol(format!("missing response {}: {err}", response_path.display()))
        })?;
        let result = decode_response(mode, graph, &raw);
        for path in [&request_path, &response_path] {
            let _ = fs::remove_file(path);
        }
        result
    }
}

impl SchemaChecker for OnnxRuntimeOracle {
    fn check(&self, graph: &Graph) -> Result<(), OracleError> {
        self.run(RequestMode::Check, graph, &[]).map(|_| ())
    }
}

impl ReferenceOracle for OnnxRuntimeOracle {
    fn evaluate(
        &self,
        graph: &Graph,
        inputs: &[NamedTensor],
    ) -> Result<Vec<NamedTensor>, OracleError> {
        check_input_contract(graph, inputs)?;
        self.run(RequestMode::Evaluate, graph, inputs)
    }
}

fn io_error(path: &Path, err: std::io::Error) -> OracleError {
    OracleError::Io {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}

fn scratch_stem(graph_name: &str, mode: RequestMode) -> String {
    let safe: String = graph_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("{safe}.{}.{}", mode.as_str(), std::process::id())
}
