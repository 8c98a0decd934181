use std::fs;
use std::path::Path;

use gg_corpus::layout::MODEL_FILE_NAME;
use gg_corpus::{
    CaseRecipe, CaseSpec, CorpusPlan, DatasetSlot, GenerationConfig, generate_corpus,
    verify_corpus,
};
use gg_dtype::ElementType;
use gg_graph::{AttributeValue, Graph, gather_output_shape};
use gg_onnx::encode_tensor;
use gg_oracle::{OracleError, ReferenceOracle, SchemaChecker};
use gg_tensor::{NamedTensor, Tensor};

struct AcceptAll;

impl SchemaChecker for AcceptAll {
    fn check(&self, _graph: &Graph) -> Result<(), OracleError> {
        Ok(())
    }
}

struct RejectAll;

impl SchemaChecker for RejectAll {
    fn check(&self, graph: &Graph) -> Result<(), OracleError> {
        Err(OracleError::Rejected {
            stage: "check",
            detail: format!("{} is not allowed", graph.name),
        })
    }
}

impl ReferenceOracle for RejectAll {
    fn evaluate(
        &self,
        graph: &Graph,
        _inputs: &[NamedTensor],
    ) -> Result<Vec<NamedTensor>, OracleError> {
        Err(OracleError::Rejected {
            stage: "evaluate",
            detail: format!("{} is not allowed", graph.name),
        })
    }
}

/// Evaluates float32 Gather in-process; every other operator is refused.
struct GatherOracle;

impl ReferenceOracle for GatherOracle {
    fn evaluate(
        &self,
        graph: &Graph,
        inputs: &[NamedTensor],
    ) -> Result<Vec<NamedTensor>, OracleError> {
        let node = &graph.nodes[0];
        if node.op_type != "Gather" {
            return Err(OracleError::Rejected {
                stage: "evaluate",
                detail: format!("stub cannot run {}", node.op_type),
            });
        }
        let axis = match node.attribute("axis") {
            Some(AttributeValue::Int(axis)) => *axis,
            _ => 0,
        };
        let data = &inputs[0].tensor;
        let indices = &inputs[1].tensor;
        let shape = gather_output_shape(data.shape(), indices.shape(), axis)
            .map_err(|err| OracleError::Protocol(err.to_string()))?;

        let rank = data.rank() as i64;
        let axis = (if axis < 0 { axis + rank } else { axis }) as usize;
        let outer: usize = data.shape()[..axis].iter().product();
        let axis_dim = data.shape()[axis];
        let inner: usize = data.shape()[axis + 1..].iter().product();
        let values = data
            .values::<f32>()
            .map_err(|err| OracleError::Protocol(err.to_string()))?;
        let picks = indices
            .to_i64_values()
            .map_err(|err| OracleError::Protocol(err.to_string()))?;

        let mut out = Vec::with_capacity(outer * picks.len() * inner);
        for block in 0..outer {
            for &pick in &picks {
                let pick = (if pick < 0 { pick + axis_dim as i64 } else { pick }) as usize;
                let start = (block * axis_dim + pick) * inner;
                out.extend_from_slice(&values[start..start + inner]);
            }
        }
        let tensor = Tensor::from_values(shape, &out)
            .map_err(|err| OracleError::Protocol(err.to_string()))?;
        Ok(vec![NamedTensor::new(graph.outputs[0].name.clone(), tensor)])
    }
}

fn gather_spec(name: &str, data: &[usize], indices: &[usize], axis: i64) -> CaseSpec {
    CaseSpec::new(
        name,
        CaseRecipe::Gather {
            data: data.to_vec(),
            indices: indices.to_vec(),
            axis,
            int64_indices: false,
        },
    )
}

fn config_for(root: &Path) -> GenerationConfig {
    GenerationConfig {
        output_root: root.join("corpus"),
        log_path: Some(root.join("logs/cases.jsonl")),
        ..GenerationConfig::default_paths()
    }
}

fn log_lines(config: &GenerationConfig) -> Vec<serde_json::Value> {
    let path = config.log_path.as_ref().expect("log path configured");
    fs::read_to_string(path)
        .expect("log written")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

#[test]
fn gather_case_round_trips_through_the_corpus() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_basic", &[2, 3, 4], &[4, 5], 1)],
    };

    let report = generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("batch runs");
    assert!(report.all_passed(), "{:?}", report.failures);
    let persisted = &report.generated[0];
    let names: Vec<_> = persisted
        .files
        .iter()
        .map(|file| {
            file.path
                .strip_prefix(&config.output_root)
                .expect("under root")
                .to_path_buf()
        })
        .collect();
    assert_eq!(
        names,
        [
            Path::new("test_gather_basic").join(MODEL_FILE_NAME),
            Path::new("test_gather_basic/test_data_set_0/input_0.pb").to_path_buf(),
            Path::new("test_gather_basic/test_data_set_0/input_1.pb").to_path_buf(),
            Path::new("test_gather_basic/test_data_set_0/output_0.pb").to_path_buf(),
        ]
    );

    let layout = config.layout();
    let dataset = layout
        .load_dataset("test_gather_basic", 0)
        .expect("dataset loads");
    assert_eq!(dataset.inputs[0].shape(), &[2, 3, 4]);
    assert_eq!(dataset.inputs[0].element_type(), ElementType::Float32);
    assert_eq!(dataset.inputs[1].shape(), &[4, 5]);
    assert_eq!(dataset.inputs[1].element_type(), ElementType::Int32);
    let indices = dataset.inputs[1].to_i64_values().expect("indices");
    assert!(indices.iter().all(|&index| (0..3).contains(&index)));
    assert_eq!(dataset.outputs[0].shape(), &[2, 4, 5, 4]);

    let (graph, _) = layout
        .load_case_model("test_gather_basic")
        .expect("model loads");
    let feeds: Vec<NamedTensor> = graph
        .inputs
        .iter()
        .zip(&dataset.inputs)
        .map(|(decl, tensor)| NamedTensor::new(decl.name.clone(), tensor.clone()))
        .collect();
    let fresh = GatherOracle
        .evaluate(&graph, &feeds)
        .expect("re-evaluation");
    assert_eq!(fresh[0].tensor, dataset.outputs[0]);

    let verification = verify_corpus(&layout, &GatherOracle).expect("verify runs");
    assert!(verification.all_passed(), "{verification:?}");
    assert_eq!(verification.cases.len(), 1);
    assert_eq!(verification.cases[0].datasets, 1);

    let lines = log_lines(&config);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["status"], "generated");
    assert_eq!(lines[0]["op_type"], "Gather");
    assert_eq!(lines[0]["files"].as_array().map(Vec::len), Some(4));
}

#[test]
fn regenerating_a_dataset_is_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_scalar_axis1", &[2, 3, 4], &[], 1)],
    };

    let first = generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("first");
    let snapshot: Vec<Vec<u8>> = first.generated[0]
        .files
        .iter()
        .map(|file| fs::read(&file.path).expect("read"))
        .collect();
    let second = generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("second");
    assert_eq!(first.generated, second.generated);
    for (file, bytes) in second.generated[0].files.iter().zip(&snapshot) {
        assert_eq!(&fs::read(&file.path).expect("reread"), bytes);
    }
}

#[test]
fn batch_records_failures_and_keeps_going() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let plan = CorpusPlan {
        cases: vec![
            gather_spec("test_gather_bad_axis", &[2, 3, 4], &[2], 5),
            CaseSpec::new(
                "test_matmul_2x3_4x5",
                CaseRecipe::MatMul {
                    a: vec![2, 3],
                    b: vec![4, 5],
                    rank_only_outputs: false,
                    policy: None,
                },
            ),
            CaseSpec::new(
                "test_matmul_2x3_3x4",
                CaseRecipe::MatMul {
                    a: vec![2, 3],
                    b: vec![3, 4],
                    rank_only_outputs: true,
                    policy: None,
                },
            ),
            gather_spec("../escape", &[3], &[2], 0),
            gather_spec("test_gather_output_scalar", &[10], &[], 0),
        ],
    };

    let report = generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("batch runs");
    assert!(!report.all_passed());
    assert_eq!(report.case_count, 5);
    assert_eq!(report.generated.len(), 1);
    assert_eq!(report.generated[0].name, "test_gather_output_scalar");

    let categories: Vec<_> = report
        .failures
        .iter()
        .map(|failure| (failure.case.as_str(), failure.category))
        .collect();
    assert_eq!(
        categories,
        vec![
            ("test_gather_bad_axis", "schema"),
            ("test_matmul_2x3_4x5", "shape_mismatch"),
            ("test_matmul_2x3_3x4", "oracle"),
            ("../escape", "layout"),
        ]
    );
    assert!(!dir.path().join("escape").exists());

    let lines = log_lines(&config);
    assert_eq!(lines.len(), 5);
    let statuses: Vec<_> = lines
        .iter()
        .map(|line| line["status"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(statuses, ["failed", "failed", "failed", "failed", "generated"]);
    assert_eq!(lines[1]["reason_code"], "graph_shape_mismatch");
}

#[test]
fn schema_rejection_writes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_rejected", &[3], &[2], 0)],
    };
    let report = generate_corpus(&plan, &config, &RejectAll, &GatherOracle).expect("batch runs");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].category, "schema");
    assert_eq!(report.failures[0].reason_code, "oracle_rejected");
    assert!(!config.output_root.join("test_gather_rejected").exists());
}

#[test]
fn next_dataset_appends_until_the_model_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = GenerationConfig {
        dataset: DatasetSlot::Next,
        ..config_for(dir.path())
    };
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_growing", &[2, 3, 4], &[2], 1)],
    };
    let first = generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("first");
    assert_eq!(first.generated[0].dataset, 0);

    let reseeded = GenerationConfig {
        seed: 99,
        ..config.clone()
    };
    let second = generate_corpus(&plan, &reseeded, &AcceptAll, &GatherOracle).expect("second");
    assert_eq!(second.generated[0].dataset, 1);
    assert_ne!(
        first.generated[0].files[1].sha256,
        second.generated[0].files[1].sha256
    );

    let changed = CorpusPlan {
        cases: vec![gather_spec("test_gather_growing", &[2, 3, 4], &[2], -2)],
    };
    let third = generate_corpus(&changed, &config, &AcceptAll, &GatherOracle).expect("third");
    assert_eq!(third.failures.len(), 1);
    assert_eq!(third.failures[0].reason_code, "layout_model_conflict");

    let layout = config.layout();
    assert_eq!(
        layout.dataset_indices("test_gather_growing").expect("indices"),
        vec![0, 1]
    );
    let verification = verify_corpus(&layout, &GatherOracle).expect("verify");
    assert!(verification.all_passed());
    assert_eq!(verification.cases[0].datasets, 2);
}

#[test]
fn indexed_regeneration_cannot_orphan_other_datasets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = GenerationConfig {
        dataset: DatasetSlot::Next,
        ..config_for(dir.path())
    };
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_pinned", &[2, 3, 4], &[2], 1)],
    };
    generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("dataset 0");
    let reseeded = GenerationConfig {
        seed: 7,
        ..config.clone()
    };
    generate_corpus(&plan, &reseeded, &AcceptAll, &GatherOracle).expect("dataset 1");

    let wider = CorpusPlan {
        cases: vec![gather_spec("test_gather_pinned", &[2, 3, 4], &[3], 1)],
    };
    let overwrite = GenerationConfig {
        dataset: DatasetSlot::Index(0),
        ..config.clone()
    };
    let report = generate_corpus(&wider, &overwrite, &AcceptAll, &GatherOracle).expect("batch runs");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].reason_code, "layout_model_conflict");

    let layout = config.layout();
    let verification = verify_corpus(&layout, &GatherOracle).expect("verify");
    assert!(verification.all_passed());
    assert_eq!(verification.cases[0].datasets, 2);

    let input_path = config
        .output_root
        .join("test_gather_pinned/test_data_set_1/input_1.pb");
    let foreign = Tensor::from_values(vec![3], &[0_i32, 1, 2]).expect("indices");
    fs::write(&input_path, encode_tensor(&foreign).expect("encode")).expect("overwrite");

    let verification = verify_corpus(&layout, &GatherOracle).expect("verify");
    assert!(!verification.all_passed());
    assert!(verification.failures.is_empty());
    let mismatches = &verification.cases[0].mismatches;
    assert_eq!(mismatches.len(), 1);
    assert!(mismatches[0].starts_with("dataset 1:"), "{}", mismatches[0]);
    assert!(mismatches[0].contains("input contract"), "{}", mismatches[0]);
}

#[test]
fn verification_failures_name_the_operator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_refused", &[4], &[3], 0)],
    };
    generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("generate");

    let verification = verify_corpus(&config.layout(), &RejectAll).expect("verify");
    assert!(!verification.all_passed());
    assert!(verification.cases.is_empty());
    assert_eq!(verification.failures.len(), 1);
    assert_eq!(verification.failures[0].op_type, "Gather");
    assert_eq!(verification.failures[0].category, "oracle");
}

#[test]
fn verification_flags_tampered_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let plan = CorpusPlan {
        cases: vec![gather_spec("test_gather_tampered", &[4], &[3], 0)],
    };
    generate_corpus(&plan, &config, &AcceptAll, &GatherOracle).expect("generate");

    let output_path = config
        .output_root
        .join("test_gather_tampered/test_data_set_0/output_0.pb");
    let forged = Tensor::from_values(vec![3], &[-1.0_f32, -1.0, -1.0]).expect("forged");
    fs::write(&output_path, encode_tensor(&forged).expect("encode")).expect("overwrite");

    let verification = verify_corpus(&config.layout(), &GatherOracle).expect("verify");
    assert!(!verification.all_passed());
    assert_eq!(verification.cases[0].mismatches.len(), 1);
    assert!(verification.cases[0].mismatches[0].contains("output_0"));
}
