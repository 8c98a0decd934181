#![forbid(unsafe_code)]

pub mod catalog;
pub mod layout;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use gg_graph::{Graph, GraphError};
use gg_onnx::ModelMetadata;
use gg_oracle::{
    OracleError, ReferenceOracle, SchemaChecker, check_input_contract, check_output_contract,
};
use gg_synth::{DEFAULT_SEED, SynthError};
use gg_tensor::{NamedTensor, TensorError};
use serde::Serialize;

pub use catalog::{CaseRecipe, CaseSpec, CorpusPlan, PreparedCase, builtin_catalog, prepare_case};
pub use layout::{CorpusLayout, DatasetSlot, LayoutError, LoadedDataset, PersistedCase};

pub const CASE_CATEGORIES: [&str; 6] = [
    "configuration",
    "shape_mismatch",
    "schema",
    "oracle",
    "serialization",
    "layout",
];

/// Explicit per-run settings; nothing is read from process-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub output_root: PathBuf,
    pub seed: u64,
    pub dataset: DatasetSlot,
    pub metadata: ModelMetadata,
    /// JSON-lines case log; nothing is logged when unset.
    pub log_path: Option<PathBuf>,
}

impl GenerationConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            output_root: repo_root.join("artifacts/golden"),
            seed: DEFAULT_SEED,
            dataset: DatasetSlot::default(),
            metadata: ModelMetadata::default(),
            log_path: None,
        }
    }

    #[must_use]
    pub fn layout(&self) -> CorpusLayout {
        CorpusLayout::new(&self.output_root, self.metadata.clone())
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// A graph with its fed inputs and the oracle's outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub graph: Graph,
    pub inputs: Vec<NamedTensor>,
    pub outputs: Vec<NamedTensor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseError {
    Recipe { case: String, detail: String },
    Synth(SynthError),
    Tensor(TensorError),
    Graph(GraphError),
    Schema(OracleError),
    Oracle(OracleError),
    Layout(LayoutError),
}

impl CaseError {
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Recipe { .. } | Self::Synth(_) | Self::Tensor(_) => "configuration",
            Self::Graph(err) if err.is_shape_failure() => "shape_mismatch",
            Self::Graph(_) | Self::Schema(_) => "schema",
            Self::Oracle(_) => "oracle",
            Self::Layout(LayoutError::Wire { .. }) => "serialization",
            Self::Layout(_) => "layout",
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Recipe { .. } => "case_recipe_invalid",
            Self::Synth(err) => err.reason_code(),
            Self::Tensor(err) => err.reason_code(),
            Self::Graph(err) => err.reason_code(),
            Self::Schema(err) | Self::Oracle(err) => err.reason_code(),
            Self::Layout(err) => err.reason_code(),
        }
    }
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recipe { case, detail } => write!(f, "case {case}: {detail}"),
            Self::Synth(err) => write!(f, "{err}"),
            Self::Tensor(err) => write!(f, "{err}"),
            Self::Graph(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "schema check failed: {err}"),
            Self::Oracle(err) => write!(f, "{err}"),
            Self::Layout(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CaseError {}

impl From<SynthError> for CaseError {
    fn from(value: SynthError) -> Self {
        Self::Synth(value)
    }
}

impl From<TensorError> for CaseError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Check, evaluate and persist one prepared case.
pub fn generate_case(
    prepared: PreparedCase,
    config: &GenerationConfig,
    checker: &dyn SchemaChecker,
    oracle: &dyn ReferenceOracle,
) -> Result<PersistedCase, CaseError> {
    checker.check(&prepared.graph).map_err(CaseError::Schema)?;
    let outputs = oracle
        .evaluate(&prepared.graph, &prepared.inputs)
        .map_err(CaseError::Oracle)?;
    check_output_contract(&prepared.graph, &outputs).map_err(CaseError::Oracle)?;
    let case = TestCase {
        name: prepared.name,
        graph: prepared.graph,
        inputs: prepared.inputs,
        outputs,
    };
    config
        .layout()
        .persist(&case, config.dataset)
        .map_err(CaseError::Layout)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseFailure {
    pub case: String,
    pub op_type: String,
    pub category: &'static str,
    pub reason_code: &'static str,
    pub detail: String,
}

impl CaseFailure {
    fn new(case: &str, op_type: &str, err: &CaseError) -> Self {
        Self {
            case: case.to_string(),
            op_type: op_type.to_string(),
            category: err.category(),
            reason_code: err.reason_code(),
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationReport {
    pub case_count: usize,
    pub generated: Vec<PersistedCase>,
    pub failures: Vec<CaseFailure>,
}

impl GenerationReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty() && self.generated.len() == self.case_count
    }
}

#[derive(Debug, Serialize)]
struct LoggedFile {
    path: String,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct CaseLogEntry {
    suite: &'static str,
    case: String,
    op_type: String,
    seed: u64,
    status: &'static str,
    category: Option<&'static str>,
    reason_code: String,
    detail: String,
    dataset: Option<usize>,
    files: Vec<LoggedFile>,
}

/// Run every case of `plan`; a failed case is recorded and the batch moves on.
///
/// Only a failure to write the case log aborts the run.
pub fn generate_corpus(
    plan: &CorpusPlan,
    config: &GenerationConfig,
    checker: &dyn SchemaChecker,
    oracle: &dyn ReferenceOracle,
) -> Result<GenerationReport, String> {
    let mut report = GenerationReport {
        case_count: plan.cases.len(),
        ..GenerationReport::default()
    };
    for spec in &plan.cases {
        let op_type = spec.recipe.op_type();
        let seed = spec.seed.unwrap_or(config.seed);
        let outcome = prepare_case(spec, config.seed, config.metadata.default_opset)
            .and_then(|prepared| generate_case(prepared, config, checker, oracle));

        let entry = match &outcome {
            Ok(persisted) => CaseLogEntry {
                suite: "goldgen_corpus",
                case: spec.name.clone(),
                op_type: op_type.to_string(),
                seed,
                status: "generated",
                category: None,
                reason_code: "ok".to_string(),
                detail: format!("{} files", persisted.files.len()),
                dataset: Some(persisted.dataset),
                files: persisted
                    .files
                    .iter()
                    .map(|file| LoggedFile {
                        path: file.path.display().to_string(),
                        sha256: file.sha256.clone(),
                    })
                    .collect(),
            },
            Err(err) => CaseLogEntry {
                suite: "goldgen_corpus",
                case: spec.name.clone(),
                op_type: op_type.to_string(),
                seed,
                status: "failed",
                category: Some(err.category()),
                reason_code: err.reason_code().to_string(),
                detail: err.to_string(),
                dataset: None,
                files: Vec::new(),
            },
        };
        if let Some(path) = &config.log_path {
            append_case_log(path, &entry)?;
        }

        match outcome {
            Ok(persisted) => report.generated.push(persisted),
            Err(err) => report
                .failures
                .push(CaseFailure::new(&spec.name, op_type, &err)),
        }
    }
    Ok(report)
}

fn append_case_log(path: &Path, entry: &CaseLogEntry) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing case log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending case log {}: {err}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseVerification {
    pub case: String,
    pub datasets: usize,
    pub mismatches: Vec<String>,
}

impl CaseVerification {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Re-evaluate every stored dataset of a case and compare outputs bit for bit.
pub fn verify_case(
    layout: &CorpusLayout,
    name: &str,
    oracle: &dyn ReferenceOracle,
) -> Result<CaseVerification, CaseError> {
    let (graph, _) = layout.load_case_model(name).map_err(CaseError::Layout)?;
    verify_datasets(layout, name, &graph, oracle)
}

fn verify_datasets(
    layout: &CorpusLayout,
    name: &str,
    graph: &Graph,
    oracle: &dyn ReferenceOracle,
) -> Result<CaseVerification, CaseError> {
    let indices = layout.dataset_indices(name).map_err(CaseError::Layout)?;
    let mut mismatches = Vec::new();
    for &index in &indices {
        let dataset = layout.load_dataset(name, index).map_err(CaseError::Layout)?;
        if dataset.inputs.len() != graph.inputs.len() {
            mismatches.push(format!(
                "dataset {index}: {} stored inputs for {} declared",
                dataset.inputs.len(),
                graph.inputs.len()
            ));
            continue;
        }
        let feeds: Vec<NamedTensor> = graph
            .inputs
            .iter()
            .zip(dataset.inputs)
            .map(|(decl, tensor)| NamedTensor::new(decl.name.clone(), tensor))
            .collect();
        if let Err(err) = check_input_contract(graph, &feeds) {
            mismatches.push(format!("dataset {index}: {err}"));
            continue;
        }
        let fresh = oracle.evaluate(graph, &feeds).map_err(CaseError::Oracle)?;
        if fresh.len() != dataset.outputs.len() {
            mismatches.push(format!(
                "dataset {index}: oracle produced {} outputs, {} stored",
                fresh.len(),
                dataset.outputs.len()
            ));
            continue;
        }
        for (position, (named, stored)) in fresh.iter().zip(&dataset.outputs).enumerate() {
            if &named.tensor != stored {
                mismatches.push(format!(
                    "dataset {index}: output_{position} ({}) differs from the stored tensor",
                    named.name
                ));
            }
        }
    }
    Ok(CaseVerification {
        case: name.to_string(),
        datasets: indices.len(),
        mismatches,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerificationReport {
    pub cases: Vec<CaseVerification>,
    pub failures: Vec<CaseFailure>,
}

impl VerificationReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty() && self.cases.iter().all(CaseVerification::passed)
    }
}

pub fn verify_corpus(
    layout: &CorpusLayout,
    oracle: &dyn ReferenceOracle,
) -> Result<VerificationReport, String> {
    let names = layout.list_cases().map_err(|err| err.to_string())?;
    let mut report = VerificationReport::default();
    for name in names {
        let graph = match layout.load_case_model(&name) {
            Ok((graph, _)) => graph,
            Err(err) => {
                report
                    .failures
                    .push(CaseFailure::new(&name, "", &CaseError::Layout(err)));
                continue;
            }
        };
        match verify_datasets(layout, &name, &graph, oracle) {
            Ok(verification) => report.cases.push(verification),
            Err(err) => {
                report
                    .failures
                    .push(CaseFailure::new(&name, graph.primary_op_type(), &err));
            }
        }
    }
    Ok(report)
}
