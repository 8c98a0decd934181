use std::fmt::Write as _;
use std::fs;
use std::path::{Component, Path, PathBuf};

use gg_graph::Graph;
use gg_onnx::{ModelMetadata, WireError, decode_model, decode_tensor, encode_model, encode_tensor};
use gg_tensor::Tensor;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::TestCase;

pub const MODEL_FILE_NAME: &str = "model.onnx";
pub const DATASET_DIR_PREFIX: &str = "test_data_set_";

pub const LAYOUT_REASON_CODES: [&str; 6] = [
    "layout_case_name_invalid",
    "layout_model_conflict",
    "layout_io_failed",
    "layout_wire_invalid",
    "layout_case_missing",
    "layout_dataset_missing",
];

/// Which `test_data_set_<n>` directory a persist call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetSlot {
    /// Write exactly this dataset, replacing its tensors.
    Index(usize),
    /// One past the highest existing dataset, or 0 for a fresh case.
    Next,
}

impl Default for DatasetSlot {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl DatasetSlot {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw == "next" {
            return Ok(Self::Next);
        }
        raw.parse::<usize>()
            .map(Self::Index)
            .map_err(|err| format!("invalid dataset slot {raw}: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    InvalidCaseName(String),
    ModelConflict { case: String, path: PathBuf },
    Io { path: PathBuf, detail: String },
    Wire { path: PathBuf, source: WireError },
    MissingCase(PathBuf),
    MissingDataset { case: String, index: usize },
}

impl LayoutError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidCaseName(_) => "layout_case_name_invalid",
            Self::ModelConflict { .. } => "layout_model_conflict",
            Self::Io { .. } => "layout_io_failed",
            Self::Wire { .. } => "layout_wire_invalid",
            Self::MissingCase(_) => "layout_case_missing",
            Self::MissingDataset { .. } => "layout_dataset_missing",
        }
    }
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCaseName(name) => {
                write!(f, "case name {name:?} is not a single path component")
            }
            Self::ModelConflict { case, path } => write!(
                f,
                "case {case} has other datasets recorded against a different model at {}",
                path.display()
            ),
            Self::Io { path, detail } => write!(f, "{}: {detail}", path.display()),
            Self::Wire { path, source } => write!(f, "{}: {source}", path.display()),
            Self::MissingCase(path) => write!(f, "no persisted model at {}", path.display()),
            Self::MissingDataset { case, index } => {
                write!(f, "case {case} has no {DATASET_DIR_PREFIX}{index}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedCase {
    pub name: String,
    pub dataset: usize,
    pub directory: PathBuf,
    /// `model.onnx` first, then inputs and outputs in order.
    pub files: Vec<PersistedFile>,
}

/// Tensors read back from one `test_data_set_<n>` directory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDataset {
    pub index: usize,
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
}

/// The on-disk corpus rooted at one directory.
///
/// ```text
/// <root>/<case>/model.onnx
/// <root>/<case>/test_data_set_<n>/input_<i>.pb
/// <root>/<case>/test_data_set_<n>/output_<i>.pb
/// ```
#[derive(Debug, Clone)]
pub struct CorpusLayout {
    root: PathBuf,
    metadata: ModelMetadata,
}

impl CorpusLayout {
    pub fn new(root: impl Into<PathBuf>, metadata: ModelMetadata) -> Self {
        Self {
            root: root.into(),
            metadata,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn case_dir(&self, name: &str) -> Result<PathBuf, LayoutError> {
        validate_case_name(name)?;
        Ok(self.root.join(name))
    }

    /// Write the model and one dataset for `case`.
    ///
    /// Re-persisting the same case into the same dataset produces identical
    /// bytes. A changed model is refused while any other dataset of the case
    /// exists. Files are written in place; a failure part-way leaves the
    /// earlier files behind.
    pub fn persist(&self, case: &TestCase, slot: DatasetSlot) -> Result<PersistedCase, LayoutError> {
        let directory = self.case_dir(&case.name)?;
        let model_path = directory.join(MODEL_FILE_NAME);
        let model_bytes =
            encode_model(&case.graph, &self.metadata).map_err(|source| LayoutError::Wire {
                path: model_path.clone(),
                source,
            })?;

        let existing = self.dataset_indices(&case.name)?;
        let dataset = match slot {
            DatasetSlot::Index(index) => index,
            DatasetSlot::Next => existing.last().map_or(0, |last| last + 1),
        };
        if existing.iter().any(|&index| index != dataset)
            && model_path.is_file()
            && read_file(&model_path)? != model_bytes
        {
            return Err(LayoutError::ModelConflict {
                case: case.name.clone(),
                path: model_path,
            });
        }

        create_dir(&directory)?;
        let mut files = Vec::with_capacity(1 + case.inputs.len() + case.outputs.len());
        files.push(write_file(&model_path, &model_bytes)?);

        let dataset_dir = directory.join(format!("{DATASET_DIR_PREFIX}{dataset}"));
        create_dir(&dataset_dir)?;
        remove_stale_tensors(&dataset_dir)?;
        for (prefix, tensors) in [("input", &case.inputs), ("output", &case.outputs)] {
            for (index, named) in tensors.iter().enumerate() {
                let path = dataset_dir.join(format!("{prefix}_{index}.pb"));
                let bytes = encode_tensor(&named.tensor).map_err(|source| LayoutError::Wire {
                    path: path.clone(),
                    source,
                })?;
                files.push(write_file(&path, &bytes)?);
            }
        }

        Ok(PersistedCase {
            name: case.name.clone(),
            dataset,
            directory,
            files,
        })
    }

    /// Sorted indices of the existing dataset directories of a case.
    pub fn dataset_indices(&self, name: &str) -> Result<Vec<usize>, LayoutError> {
        let directory = self.case_dir(name)?;
        if !directory.is_dir() {
            return Ok(Vec::new());
        }
        let mut indices: Vec<usize> = list_dir(&directory)?
            .into_iter()
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.strip_prefix(DATASET_DIR_PREFIX))
                    .and_then(|suffix| suffix.parse().ok())
            })
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    pub fn load_case_model(&self, name: &str) -> Result<(Graph, ModelMetadata), LayoutError> {
        let path = self.case_dir(name)?.join(MODEL_FILE_NAME);
        if !path.is_file() {
            return Err(LayoutError::MissingCase(path));
        }
        let bytes = read_file(&path)?;
        decode_model(&bytes).map_err(|source| LayoutError::Wire { path, source })
    }

    pub fn load_dataset(&self, name: &str, index: usize) -> Result<LoadedDataset, LayoutError> {
        let dataset_dir = self
            .case_dir(name)?
            .join(format!("{DATASET_DIR_PREFIX}{index}"));
        if !dataset_dir.is_dir() {
            return Err(LayoutError::MissingDataset {
                case: name.to_string(),
                index,
            });
        }
        Ok(LoadedDataset {
            index,
            inputs: read_tensor_sequence(&dataset_dir, "input")?,
            outputs: read_tensor_sequence(&dataset_dir, "output")?,
        })
    }

    /// Names of the case directories under the root that hold a model.
    pub fn list_cases(&self) -> Result<Vec<String>, LayoutError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = list_dir(&self.root)?
            .into_iter()
            .filter(|path| path.join(MODEL_FILE_NAME).is_file())
            .filter_map(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

pub fn validate_case_name(name: &str) -> Result<(), LayoutError> {
    let invalid = || LayoutError::InvalidCaseName(name.to_string());
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(invalid());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid()),
    }
}

fn read_tensor_sequence(dataset_dir: &Path, prefix: &str) -> Result<Vec<Tensor>, LayoutError> {
    let mut tensors = Vec::new();
    loop {
        let path = dataset_dir.join(format!("{prefix}_{}.pb", tensors.len()));
        if !path.is_file() {
            return Ok(tensors);
        }
        let bytes = read_file(&path)?;
        tensors.push(decode_tensor(&bytes).map_err(|source| LayoutError::Wire { path, source })?);
    }
}

fn remove_stale_tensors(dataset_dir: &Path) -> Result<(), LayoutError> {
    for path in list_dir(dataset_dir)? {
        let stale = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                (name.starts_with("input_") || name.starts_with("output_")) && name.ends_with(".pb")
            });
        if stale && path.is_file() {
            fs::remove_file(&path).map_err(|err| io_error(&path, "failed removing", err))?;
        }
    }
    Ok(())
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, LayoutError> {
    let entries = fs::read_dir(dir).map_err(|err| io_error(dir, "failed listing", err))?;
    entries
        .map(|entry| {
            entry
                .map(|entry| entry.path())
                .map_err(|err| io_error(dir, "failed listing", err))
        })
        .collect()
}

fn create_dir(dir: &Path) -> Result<(), LayoutError> {
    fs::create_dir_all(dir).map_err(|err| io_error(dir, "failed creating", err))
}

fn read_file(path: &Path) -> Result<Vec<u8>, LayoutError> {
    fs::read(path).map_err(|err| io_error(path, "failed reading", err))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<PersistedFile, LayoutError> {
    fs::write(path, bytes).map_err(|err| io_error(path, "failed writing", err))?;
    Ok(PersistedFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len(),
    })
}

fn io_error(path: &Path, action: &str, err: std::io::Error) -> LayoutError {
    LayoutError::Io {
        path: path.to_path_buf(),
        detail: format!("{action}: {err}"),
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        CorpusLayout, DATASET_DIR_PREFIX, DatasetSlot, LayoutError, MODEL_FILE_NAME, sha256_hex,
        validate_case_name,
    };
    use crate::TestCase;
    use gg_dtype::ElementType;
    use gg_graph::{Attribute, BuildRequest, Operand, TensorDecl, build};
    use gg_onnx::ModelMetadata;
    use gg_tensor::{NamedTensor, Tensor};
    use std::fs;

    fn gather_case(name: &str, axis: i64) -> TestCase {
        let graph = build(
            &BuildRequest::new(name, "Gather")
                .operand(Operand::Declared(TensorDecl::fixed(
                    "data",
                    ElementType::Float32,
                    &[3],
                )))
                .operand(Operand::Declared(TensorDecl::fixed(
                    "indices",
                    ElementType::Int32,
                    &[],
                )))
                .attribute(Attribute::int("axis", axis)),
        )
        .expect("gather graph");
        let data = Tensor::from_values(vec![3], &[1.0_f32, 2.0, 3.0]).expect("data");
        TestCase {
            name: name.to_string(),
            graph,
            inputs: vec![
                NamedTensor::new("data", data),
                NamedTensor::new("indices", Tensor::scalar(2_i32)),
            ],
            outputs: vec![NamedTensor::new("output", Tensor::scalar(3.0_f32))],
        }
    }

    #[test]
    fn case_names_must_be_single_components() {
        for good in ["test_gather_basic", "a.b", "x-1"] {
            validate_case_name(good).expect("valid name");
        }
        for bad in ["", ".", "..", "a/b", "../up", "a\\b", "/abs"] {
            let err = validate_case_name(bad).expect_err("invalid name");
            assert_eq!(err.reason_code(), "layout_case_name_invalid", "{bad:?}");
        }
    }

    #[test]
    fn dataset_slot_parses_index_and_next() {
        assert_eq!(DatasetSlot::parse("3").expect("index"), DatasetSlot::Index(3));
        assert_eq!(DatasetSlot::parse("next").expect("next"), DatasetSlot::Next);
        assert!(DatasetSlot::parse("-1").is_err());
        assert_eq!(DatasetSlot::default(), DatasetSlot::Index(0));
    }

    #[test]
    fn persist_writes_canonical_files_with_digests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CorpusLayout::new(dir.path(), ModelMetadata::default());
        let case = gather_case("test_gather_tiny", 0);
        let persisted = layout
            .persist(&case, DatasetSlot::Index(0))
            .expect("persist");

        let case_dir = dir.path().join("test_gather_tiny");
        let expected = [
            case_dir.join(MODEL_FILE_NAME),
            case_dir.join("test_data_set_0/input_0.pb"),
            case_dir.join("test_data_set_0/input_1.pb"),
            case_dir.join("test_data_set_0/output_0.pb"),
        ];
        let paths: Vec<_> = persisted.files.iter().map(|file| file.path.clone()).collect();
        assert_eq!(paths, expected);
        for file in &persisted.files {
            let bytes = fs::read(&file.path).expect("read back");
            assert_eq!(file.sha256, sha256_hex(&bytes));
            assert_eq!(file.bytes, bytes.len());
        }

        let loaded = layout.load_dataset("test_gather_tiny", 0).expect("load");
        assert_eq!(loaded.inputs.len(), 2);
        assert_eq!(loaded.inputs[0], case.inputs[0].tensor);
        assert_eq!(loaded.outputs, vec![Tensor::scalar(3.0_f32)]);
        let (graph, _) = layout.load_case_model("test_gather_tiny").expect("model");
        assert_eq!(graph.primary_op_type(), "Gather");
        assert_eq!(layout.list_cases().expect("list"), vec!["test_gather_tiny"]);
    }

    #[test]
    fn persisting_twice_is_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CorpusLayout::new(dir.path(), ModelMetadata::default());
        let case = gather_case("test_gather_twice", 0);
        let first = layout.persist(&case, DatasetSlot::Index(1)).expect("first");
        let second = layout.persist(&case, DatasetSlot::Index(1)).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn overwriting_a_dataset_drops_stale_tensors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CorpusLayout::new(dir.path(), ModelMetadata::default());
        let mut case = gather_case("test_gather_stale", 0);
        case.outputs.push(NamedTensor::new("extra", Tensor::scalar(0.0_f32)));
        layout.persist(&case, DatasetSlot::Index(0)).expect("first");
        case.outputs.pop();
        layout.persist(&case, DatasetSlot::Index(0)).expect("second");
        let stale = dir
            .path()
            .join("test_gather_stale")
            .join(format!("{DATASET_DIR_PREFIX}0"))
            .join("output_1.pb");
        assert!(!stale.exists());
    }

    #[test]
    fn next_slot_appends_and_refuses_conflicting_models() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CorpusLayout::new(dir.path(), ModelMetadata::default());
        let case = gather_case("test_gather_next", 0);
        assert_eq!(
            layout.persist(&case, DatasetSlot::Next).expect("first").dataset,
            0
        );
        assert_eq!(
            layout.persist(&case, DatasetSlot::Next).expect("second").dataset,
            1
        );
        assert_eq!(
            layout.dataset_indices("test_gather_next").expect("indices"),
            vec![0, 1]
        );

        let changed = gather_case("test_gather_next", -1);
        let err = layout
            .persist(&changed, DatasetSlot::Next)
            .expect_err("different model");
        assert!(matches!(err, LayoutError::ModelConflict { .. }));
        assert_eq!(err.reason_code(), "layout_model_conflict");
    }

    #[test]
    fn indexed_slot_refuses_a_changed_model_beside_other_datasets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CorpusLayout::new(dir.path(), ModelMetadata::default());
        let case = gather_case("test_gather_indexed", 0);
        layout.persist(&case, DatasetSlot::Index(0)).expect("dataset 0");
        let model_path = dir.path().join("test_gather_indexed").join(MODEL_FILE_NAME);
        let original = fs::read(&model_path).expect("model");

        let changed = gather_case("test_gather_indexed", -1);
        layout
            .persist(&changed, DatasetSlot::Index(0))
            .expect("sole dataset may be regenerated with a new model");
        layout.persist(&case, DatasetSlot::Index(0)).expect("restore");
        layout.persist(&case, DatasetSlot::Index(1)).expect("dataset 1");

        let err = layout
            .persist(&changed, DatasetSlot::Index(0))
            .expect_err("dataset 1 would be orphaned");
        assert_eq!(err.reason_code(), "layout_model_conflict");
        assert_eq!(fs::read(&model_path).expect("model"), original);
    }

    #[test]
    fn missing_case_and_dataset_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CorpusLayout::new(dir.path(), ModelMetadata::default());
        let err = layout.load_case_model("test_absent").expect_err("missing");
        assert_eq!(err.reason_code(), "layout_case_missing");
        let err = layout.load_dataset("test_absent", 0).expect_err("missing");
        assert_eq!(err.reason_code(), "layout_dataset_missing");
        assert!(layout.list_cases().expect("list").is_empty());
    }
}
