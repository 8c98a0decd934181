use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use gg_dtype::ElementType;
use gg_graph::{
    Attribute, BuildRequest, Graph, LstmGate, Operand, OutputDims, TensorDecl, build,
    lstm_directions, normalize_axis, scatternd_updates_shape,
};
use gg_synth::{
    DeterministicRng, GateBlockLayout, QuantizedType, SynthesisPolicy, encode_floats,
    encode_integers, quantization_params, quantized_scalar_inputs, synthesize,
    synthesize_gate_blocks,
};
use gg_tensor::{NamedTensor, Tensor, element_count};
use serde::{Deserialize, Serialize};

use crate::CaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QLinearOp {
    Add,
    Mul,
}

impl QLinearOp {
    #[must_use]
    pub const fn op_type(self) -> &'static str {
        match self {
            Self::Add => "QLinearAdd",
            Self::Mul => "QLinearMul",
        }
    }
}

fn default_direction() -> String {
    "forward".to_string()
}

fn default_lstm_outputs() -> Vec<String> {
    vec!["Y".to_string()]
}

/// Shape and wiring of one LSTM case.
///
/// `X` is always fed. The other tensors are fed too unless
/// `constants_as_initializers` bakes them into the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmRecipe {
    pub seq_length: usize,
    pub batch: usize,
    pub input_size: usize,
    pub hidden_size: usize,
    #[serde(default = "default_direction")]
    pub direction: String,
    /// Fill `W` and `R` with one value; random gate blocks otherwise.
    #[serde(default)]
    pub weight_fill: Option<f32>,
    /// Fill `X` with one value; uniform in `[0, 1)` otherwise.
    #[serde(default)]
    pub input_fill: Option<f32>,
    #[serde(default)]
    pub constants_as_initializers: bool,
    #[serde(default)]
    pub bias: bool,
    /// Pins the forget-gate block of `Wb` when `bias` is set.
    #[serde(default)]
    pub forget_bias: Option<f32>,
    #[serde(default)]
    pub initial_h: Option<f32>,
    #[serde(default)]
    pub initial_c: Option<f32>,
    #[serde(default = "default_lstm_outputs")]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CaseRecipe {
    MatMul {
        a: Vec<usize>,
        b: Vec<usize>,
        /// Declare the output with its rank only, every dim dynamic.
        #[serde(default)]
        rank_only_outputs: bool,
        /// Policy for both operands; uniform in `[0, 1)` otherwise.
        #[serde(default)]
        policy: Option<SynthesisPolicy>,
    },
    Gather {
        data: Vec<usize>,
        indices: Vec<usize>,
        axis: i64,
        #[serde(default)]
        int64_indices: bool,
    },
    ScatterNd {
        data: Vec<usize>,
        indices_shape: Vec<usize>,
        /// Explicit index tuples; unique random tuples otherwise.
        #[serde(default)]
        indices: Option<Vec<i64>>,
        #[serde(default)]
        updates: Option<Vec<f32>>,
        /// Overrides the derived `updates` shape.
        #[serde(default)]
        updates_shape: Option<Vec<usize>>,
    },
    QLinear {
        operation: QLinearOp,
        shape: Vec<usize>,
        quantized: QuantizedType,
    },
    Lstm(LstmRecipe),
    Cast {
        source: ElementType,
        target: ElementType,
        len: usize,
    },
    Gemm {
        m: usize,
        k: usize,
        n: usize,
        alpha: f32,
        beta: f32,
        #[serde(default)]
        trans_a: bool,
        #[serde(default)]
        trans_b: bool,
        c_shape: Vec<usize>,
    },
    Conv {
        x: Vec<usize>,
        w: Vec<usize>,
        #[serde(default)]
        pads: Option<Vec<i64>>,
        #[serde(default)]
        strides: Option<Vec<i64>>,
        #[serde(default)]
        with_bias: bool,
    },
    MaxPool {
        x: Vec<usize>,
        kernel: Vec<i64>,
        #[serde(default)]
        strides: Option<Vec<i64>>,
        #[serde(default)]
        pads: Option<Vec<i64>>,
        #[serde(default)]
        ceil_mode: bool,
        #[serde(default)]
        with_indices: bool,
    },
    Slice {
        data: Vec<usize>,
        starts: Vec<i64>,
        ends: Vec<i64>,
        #[serde(default)]
        axes: Option<Vec<i64>>,
        #[serde(default)]
        steps: Option<Vec<i64>>,
    },
    Resize {
        x: Vec<usize>,
        #[serde(default)]
        scales: Option<Vec<f32>>,
        #[serde(default)]
        sizes: Option<Vec<i64>>,
        mode: String,
        #[serde(default)]
        coordinate_transformation_mode: Option<String>,
        /// Pass an empty `roi` constant instead of omitting it.
        #[serde(default)]
        empty_roi: bool,
    },
    /// `Shape` of a float input feeding `Expand` of that same input.
    ShapeExpand { data: Vec<usize> },
}

impl CaseRecipe {
    #[must_use]
    pub fn op_type(&self) -> &'static str {
        match self {
            Self::MatMul { .. } => "MatMul",
            Self::Gather { .. } => "Gather",
            Self::ScatterNd { .. } => "ScatterND",
            Self::QLinear { operation, .. } => operation.op_type(),
            Self::Lstm(_) => "LSTM",
            Self::Cast { .. } => "Cast",
            Self::Gemm { .. } => "Gemm",
            Self::Conv { .. } => "Conv",
            Self::MaxPool { .. } => "MaxPool",
            Self::Slice { .. } => "Slice",
            Self::Resize { .. } => "Resize",
            Self::ShapeExpand { .. } => "Shape",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSpec {
    /// Directory name under the corpus root, conventionally `test_<op>_<variant>`.
    pub name: String,
    /// Overrides the run seed for this case.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Default-domain opset; the generation default when absent.
    #[serde(default)]
    pub opset: Option<i64>,
    pub recipe: CaseRecipe,
}

impl CaseSpec {
    pub fn new(name: impl Into<String>, recipe: CaseRecipe) -> Self {
        Self {
            name: name.into(),
            seed: None,
            opset: None,
            recipe,
        }
    }

    #[must_use]
    pub fn with_opset(mut self, opset: i64) -> Self {
        self.opset = Some(opset);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusPlan {
    pub cases: Vec<CaseSpec>,
}

impl CorpusPlan {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            cases: builtin_catalog(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|err| format!("invalid corpus plan {}: {err}", path.display()))
    }

    /// Keep only the named case; errors when the plan has no such case.
    pub fn only(self, name: &str) -> Result<Self, String> {
        let cases: Vec<CaseSpec> = self
            .cases
            .into_iter()
            .filter(|spec| spec.name == name)
            .collect();
        if cases.is_empty() {
            return Err(format!("plan has no case named {name}"));
        }
        Ok(Self { cases })
    }
}

/// A built graph with its synthesized feeds, ordered like `graph.inputs`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCase {
    pub name: String,
    pub seed: u64,
    pub graph: Graph,
    pub inputs: Vec<NamedTensor>,
}

/// Synthesize the inputs of `spec` and build its graph.
pub fn prepare_case(spec: &CaseSpec, run_seed: u64, default_opset: i64) -> Result<PreparedCase, CaseError> {
    let seed = spec.seed.unwrap_or(run_seed);
    let mut rng = DeterministicRng::for_case(seed, &spec.name);
    let assembly = assemble(&spec.name, &spec.recipe, &mut rng)?;
    let request = assembly.request.opset(spec.opset.unwrap_or(default_opset));
    let graph = build(&request).map_err(CaseError::Graph)?;

    let mut inputs = Vec::with_capacity(graph.inputs.len());
    for decl in &graph.inputs {
        let fed = assembly
            .feeds
            .iter()
            .find(|named| named.name == decl.name)
            .ok_or_else(|| CaseError::Recipe {
                case: spec.name.clone(),
                detail: format!("no tensor synthesized for input {}", decl.name),
            })?;
        inputs.push(fed.clone());
    }
    Ok(PreparedCase {
        name: spec.name.clone(),
        seed,
        graph,
        inputs,
    })
}

struct Assembly {
    request: BuildRequest,
    feeds: Vec<NamedTensor>,
}

impl Assembly {
    fn new(name: &str, op_type: &str) -> Self {
        Self {
            request: BuildRequest::new(name, op_type),
            feeds: Vec::new(),
        }
    }

    fn feed(mut self, name: &str, tensor: Tensor) -> Self {
        self.request = self
            .request
            .operand(Operand::Declared(TensorDecl::for_tensor(name, &tensor)));
        self.feeds.push(NamedTensor::new(name, tensor));
        self
    }

    fn constant(mut self, name: &str, tensor: Tensor) -> Self {
        self.request = self
            .request
            .operand(Operand::Initializer(NamedTensor::new(name, tensor)));
        self
    }

    fn operand(self, name: &str, tensor: Tensor, as_constant: bool) -> Self {
        if as_constant {
            self.constant(name, tensor)
        } else {
            self.feed(name, tensor)
        }
    }

    fn omit(mut self) -> Self {
        self.request = self.request.operand(Operand::Omitted);
        self
    }

    fn attribute(mut self, attribute: Attribute) -> Self {
        self.request = self.request.attribute(attribute);
        self
    }

    fn outputs(mut self, names: &[&str]) -> Self {
        self.request = self.request.outputs(names);
        self
    }

    fn then(mut self, next: BuildRequest) -> Self {
        self.request = self.request.then(next);
        self
    }
}

fn uniform_f32(shape: &[usize], rng: &mut DeterministicRng) -> Result<Tensor, CaseError> {
    Ok(synthesize(
        shape,
        ElementType::Float32,
        &SynthesisPolicy::UniformUnit,
        rng,
    )?)
}

fn filled_f32(shape: &[usize], value: f32, rng: &mut DeterministicRng) -> Result<Tensor, CaseError> {
    Ok(synthesize(
        shape,
        ElementType::Float32,
        &SynthesisPolicy::Fill {
            value: f64::from(value),
        },
        rng,
    )?)
}

fn int64_vector(values: &[i64]) -> Result<Tensor, CaseError> {
    Ok(Tensor::from_values(vec![values.len()], values)?)
}

fn assemble(name: &str, recipe: &CaseRecipe, rng: &mut DeterministicRng) -> Result<Assembly, CaseError> {
    let op_type = recipe.op_type();
    let assembly = match recipe {
        CaseRecipe::MatMul {
            a,
            b,
            rank_only_outputs,
            policy,
        } => {
            let policy = policy.as_ref().unwrap_or(&SynthesisPolicy::UniformUnit);
            let mut assembly = Assembly::new(name, op_type)
                .feed("A", synthesize(a, ElementType::Float32, policy, rng)?)
                .feed("B", synthesize(b, ElementType::Float32, policy, rng)?);
            if *rank_only_outputs {
                assembly.request = assembly.request.output_dims(OutputDims::RankOnly);
            }
            assembly
        }
        CaseRecipe::Gather {
            data,
            indices,
            axis,
            int64_indices,
        } => {
            let axis_index = normalize_axis(op_type, *axis, data.len()).map_err(CaseError::Graph)?;
            let index_type = if *int64_indices {
                ElementType::Int64
            } else {
                ElementType::Int32
            };
            let index_tensor = synthesize(
                indices,
                index_type,
                &SynthesisPolicy::UniformInt {
                    low: 0,
                    high: data[axis_index] as i64,
                },
                rng,
            )?;
            Assembly::new(name, op_type)
                .feed("data", uniform_f32(data, rng)?)
                .feed("indices", index_tensor)
                .attribute(Attribute::int("axis", *axis))
        }
        CaseRecipe::ScatterNd {
            data,
            indices_shape,
            indices,
            updates,
            updates_shape,
        } => {
            let index_values = match indices {
                Some(values) => values.clone(),
                None => unique_index_tuples(name, data, indices_shape, rng)?,
            };
            let index_tensor = encode_integers(indices_shape, ElementType::Int64, &index_values)?;
            let updates_shape = match updates_shape {
                Some(shape) => shape.clone(),
                None => scatternd_updates_shape(data, indices_shape).map_err(CaseError::Graph)?,
            };
            let updates_tensor = match updates {
                Some(values) => Tensor::from_values(updates_shape, values)?,
                None => uniform_f32(&updates_shape, rng)?,
            };
            Assembly::new(name, op_type)
                .feed("data", uniform_f32(data, rng)?)
                .feed("indices", index_tensor)
                .feed("updates", updates_tensor)
        }
        CaseRecipe::QLinear {
            shape, quantized, ..
        } => {
            let a = quantized_scalar_inputs(shape, *quantized, rng)?;
            let b = quantized_scalar_inputs(shape, *quantized, rng)?;
            let (c_scale, c_zero_point) = quantization_params(*quantized, rng)?;
            Assembly::new(name, op_type)
                .feed("a", a.value)
                .feed("a_scale", a.scale)
                .feed("a_zero_point", a.zero_point)
                .feed("b", b.value)
                .feed("b_scale", b.scale)
                .feed("b_zero_point", b.zero_point)
                .feed("c_scale", c_scale)
                .feed("c_zero_point", c_zero_point)
                .outputs(&["c"])
        }
        CaseRecipe::Lstm(lstm) => assemble_lstm(name, lstm, rng)?,
        CaseRecipe::Cast {
            source,
            target,
            len,
        } => {
            let data = synthesize(&[*len], *source, &SynthesisPolicy::EdgeCases, rng)?;
            Assembly::new(name, op_type)
                .constant("data", data)
                .attribute(Attribute::int("to", i64::from(target.onnx_tag())))
                .outputs(&["output"])
        }
        CaseRecipe::Gemm {
            m,
            k,
            n,
            alpha,
            beta,
            trans_a,
            trans_b,
            c_shape,
        } => {
            let a_shape = if *trans_a { [*k, *m] } else { [*m, *k] };
            let b_shape = if *trans_b { [*n, *k] } else { [*k, *n] };
            Assembly::new(name, op_type)
                .feed("A", uniform_f32(&a_shape, rng)?)
                .feed("B", uniform_f32(&b_shape, rng)?)
                .feed("C", uniform_f32(c_shape, rng)?)
                .attribute(Attribute::float("alpha", *alpha))
                .attribute(Attribute::float("beta", *beta))
                .attribute(Attribute::int("transA", i64::from(*trans_a)))
                .attribute(Attribute::int("transB", i64::from(*trans_b)))
        }
        CaseRecipe::Conv {
            x,
            w,
            pads,
            strides,
            with_bias,
        } => {
            let mut assembly = Assembly::new(name, op_type)
                .feed("X", uniform_f32(x, rng)?)
                .feed("W", uniform_f32(w, rng)?);
            if *with_bias {
                let channels = w.first().copied().unwrap_or(0);
                assembly = assembly.feed("B", uniform_f32(&[channels], rng)?);
            }
            if let Some(pads) = pads {
                assembly = assembly.attribute(Attribute::ints("pads", pads));
            }
            if let Some(strides) = strides {
                assembly = assembly.attribute(Attribute::ints("strides", strides));
            }
            assembly
        }
        CaseRecipe::MaxPool {
            x,
            kernel,
            strides,
            pads,
            ceil_mode,
            with_indices,
        } => {
            // Two-decimal values in [-1, 1) keep ties between window elements likely.
            let hundredths = synthesize(
                x,
                ElementType::Int32,
                &SynthesisPolicy::UniformInt {
                    low: -100,
                    high: 100,
                },
                rng,
            )?;
            let values: Vec<f64> = hundredths
                .to_f64_values()?
                .into_iter()
                .map(|value| value / 100.0)
                .collect();
            let mut assembly = Assembly::new(name, op_type)
                .feed("X", encode_floats(x, ElementType::Float32, &values)?)
                .attribute(Attribute::ints("kernel_shape", kernel));
            if let Some(strides) = strides {
                assembly = assembly.attribute(Attribute::ints("strides", strides));
            }
            if let Some(pads) = pads {
                assembly = assembly.attribute(Attribute::ints("pads", pads));
            }
            if *ceil_mode {
                assembly = assembly.attribute(Attribute::int("ceil_mode", 1));
            }
            if *with_indices {
                assembly.outputs(&["Y", "indices"])
            } else {
                assembly.outputs(&["Y"])
            }
        }
        CaseRecipe::Slice {
            data,
            starts,
            ends,
            axes,
            steps,
        } => {
            let mut assembly = Assembly::new(name, op_type)
                .feed("data", uniform_f32(data, rng)?)
                .constant("starts", int64_vector(starts)?)
                .constant("ends", int64_vector(ends)?);
            assembly = match axes {
                Some(axes) => assembly.constant("axes", int64_vector(axes)?),
                None => assembly.omit(),
            };
            if let Some(steps) = steps {
                assembly = assembly.constant("steps", int64_vector(steps)?);
            }
            assembly.outputs(&["Y"])
        }
        CaseRecipe::Resize {
            x,
            scales,
            sizes,
            mode,
            coordinate_transformation_mode,
            empty_roi,
        } => {
            let mut assembly = Assembly::new(name, op_type).feed("X", uniform_f32(x, rng)?);
            assembly = if *empty_roi {
                let roi: &[f32] = &[];
                assembly.constant("roi", Tensor::from_values(vec![0], roi)?)
            } else {
                assembly.omit()
            };
            assembly = match scales {
                Some(scales) => {
                    assembly.constant("scales", Tensor::from_values(vec![scales.len()], scales)?)
                }
                None => assembly.omit(),
            };
            if let Some(sizes) = sizes {
                assembly = assembly.constant("sizes", int64_vector(sizes)?);
            }
            assembly = assembly.attribute(Attribute::string("mode", mode.as_str()));
            if let Some(transform) = coordinate_transformation_mode {
                assembly = assembly.attribute(Attribute::string(
                    "coordinate_transformation_mode",
                    transform.as_str(),
                ));
            }
            assembly
        }
        CaseRecipe::ShapeExpand { data } => {
            let tensor = uniform_f32(data, rng)?;
            let decl = TensorDecl::for_tensor("data", &tensor);
            Assembly::new(name, op_type)
                .feed("data", tensor)
                .outputs(&["Y"])
                .then(
                    BuildRequest::new("expand", "Expand")
                        .operand(Operand::Declared(decl))
                        .operand(Operand::Chained("Y".to_string()))
                        .outputs(&["O"]),
                )
        }
    };
    Ok(assembly)
}

fn assemble_lstm(name: &str, lstm: &LstmRecipe, rng: &mut DeterministicRng) -> Result<Assembly, CaseError> {
    let directions = lstm_directions(&lstm.direction).map_err(CaseError::Graph)?;
    let gates = 4;
    let hidden = lstm.hidden_size;
    let baked = lstm.constants_as_initializers;

    let x_shape = [lstm.seq_length, lstm.batch, lstm.input_size];
    let x = match lstm.input_fill {
        Some(value) => filled_f32(&x_shape, value, rng)?,
        None => uniform_f32(&x_shape, rng)?,
    };
    let mut gate_weights = |cols: usize| -> Result<Tensor, CaseError> {
        let layout = GateBlockLayout {
            directions,
            gates,
            block_rows: hidden,
            cols: Some(cols),
        };
        match lstm.weight_fill {
            Some(value) => filled_f32(&layout.shape(), value, rng),
            None => Ok(synthesize_gate_blocks(layout, &[], rng)?),
        }
    };
    let w = gate_weights(lstm.input_size)?;
    let r = gate_weights(hidden)?;

    let mut assembly = Assembly::new(name, "LSTM")
        .feed("X", x)
        .operand("W", w, baked)
        .operand("R", r, baked);
    assembly = if lstm.bias {
        let layout = GateBlockLayout {
            directions,
            gates: 2 * gates,
            block_rows: hidden,
            cols: None,
        };
        let pinned: Vec<(usize, f32)> = lstm
            .forget_bias
            .map(|value| (LstmGate::Forget.index(), value))
            .into_iter()
            .collect();
        assembly.operand("B", synthesize_gate_blocks(layout, &pinned, rng)?, baked)
    } else {
        assembly.omit()
    };
    // sequence_lens
    assembly = assembly.omit();
    let state_shape = [directions, lstm.batch, hidden];
    for (label, fill) in [("initial_h", lstm.initial_h), ("initial_c", lstm.initial_c)] {
        assembly = match fill {
            Some(value) => assembly.operand(label, filled_f32(&state_shape, value, rng)?, baked),
            None => assembly.omit(),
        };
    }

    assembly = assembly.attribute(Attribute::int("hidden_size", hidden as i64));
    if lstm.direction != "forward" {
        assembly = assembly.attribute(Attribute::string("direction", lstm.direction.as_str()));
    }
    let outputs: Vec<&str> = lstm.outputs.iter().map(String::as_str).collect();
    Ok(assembly.outputs(&outputs))
}

/// Distinct index tuples for ScatterND; duplicates make the result order-dependent.
fn unique_index_tuples(
    name: &str,
    data: &[usize],
    indices_shape: &[usize],
    rng: &mut DeterministicRng,
) -> Result<Vec<i64>, CaseError> {
    let invalid = |detail: String| CaseError::Recipe {
        case: name.to_string(),
        detail,
    };
    let Some((&depth, leading)) = indices_shape.split_last() else {
        return Err(invalid("indices must have rank >= 1".to_string()));
    };
    if depth == 0 || depth > data.len() {
        return Err(invalid(format!(
            "index depth {depth} does not fit data of rank {}",
            data.len()
        )));
    }
    let tuples = element_count(leading)?;
    let available = element_count(&data[..depth])?;
    if tuples > available {
        return Err(invalid(format!(
            "{tuples} distinct index tuples requested but only {available} exist"
        )));
    }

    let mut seen = BTreeSet::new();
    let mut values = Vec::with_capacity(tuples * depth);
    while seen.len() < tuples {
        let tuple: Vec<i64> = data[..depth]
            .iter()
            .map(|&dim| rng.range_i64(0, dim as i64))
            .collect();
        if seen.insert(tuple.clone()) {
            values.extend(tuple);
        }
    }
    Ok(values)
}

fn matmul_case(a: &[usize], b: &[usize]) -> CaseSpec {
    let join = |shape: &[usize]| {
        shape
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("x")
    };
    CaseSpec::new(
        format!("test_matmul_{}_{}", join(a), join(b)),
        CaseRecipe::MatMul {
            a: a.to_vec(),
            b: b.to_vec(),
            rank_only_outputs: true,
            policy: None,
        },
    )
}

fn gather_case(variant: &str, data: &[usize], indices: &[usize], axis: i64) -> CaseSpec {
    CaseSpec::new(
        format!("test_gather_{variant}"),
        CaseRecipe::Gather {
            data: data.to_vec(),
            indices: indices.to_vec(),
            axis,
            int64_indices: false,
        },
    )
}

fn simple_lstm(name: &str, initial_h: Option<f32>) -> CaseSpec {
    CaseSpec::new(
        name,
        CaseRecipe::Lstm(LstmRecipe {
            seq_length: 1,
            batch: 1,
            input_size: 1,
            hidden_size: 1,
            direction: default_direction(),
            weight_fill: Some(1.0),
            input_fill: Some(1.0),
            constants_as_initializers: false,
            bias: false,
            forget_bias: None,
            initial_h,
            initial_c: None,
            outputs: default_lstm_outputs(),
        }),
    )
}

/// The regression cases the downstream compiler's test harness expects.
#[must_use]
pub fn builtin_catalog() -> Vec<CaseSpec> {
    let matmul_pairs: [(&[usize], &[usize]); 11] = [
        (&[2, 3], &[3, 4]),
        (&[5, 2, 3], &[5, 3, 4]),
        (&[4, 5, 2, 3], &[4, 5, 3, 4]),
        (&[2, 3, 4], &[4, 5]),
        (&[3, 4], &[2, 4, 5]),
        (&[3], &[3]),
        (&[3, 4], &[4]),
        (&[2, 3, 4], &[4]),
        (&[2, 3, 4, 5], &[5]),
        (&[3], &[3, 4]),
        (&[3], &[2, 3, 4]),
    ];
    let mut cases: Vec<CaseSpec> = matmul_pairs
        .iter()
        .map(|(a, b)| matmul_case(a, b))
        .collect();
    cases.push(CaseSpec::new(
        "test_matmul_precision",
        CaseRecipe::MatMul {
            a: vec![2, 2],
            b: vec![2, 2],
            rank_only_outputs: false,
            policy: Some(SynthesisPolicy::Values {
                values: vec![10.10, 11.11, 12.12, 13.13],
            }),
        },
    ));

    cases.extend([
        gather_case("basic", &[2, 3, 4], &[4, 5], 1),
        gather_case("scalar_axis0", &[2, 3, 4], &[], 0),
        gather_case("scalar_axis1", &[2, 3, 4], &[], 1),
        gather_case("output_scalar", &[10], &[], 0),
    ]);

    cases.extend([
        CaseSpec::new(
            "test_scatternd_indices_3x2",
            CaseRecipe::ScatterNd {
                data: vec![4, 4, 4],
                indices_shape: vec![3, 2],
                indices: Some(vec![0, 0, 1, 1, 2, 3]),
                updates: Some(vec![
                    0.0, 0.0, 1.0, 0.0, 42.0, 42.0, 0.0, 42.0, 66.0, 0.0, 0.0, 66.0,
                ]),
                updates_shape: None,
            },
        ),
        CaseSpec::new(
            "test_scatternd_indices_1x1x2",
            CaseRecipe::ScatterNd {
                data: vec![4, 4, 4],
                indices_shape: vec![1, 1, 2],
                indices: Some(vec![0, 2]),
                updates: Some(vec![0.0, 0.0, 42.0, 0.0]),
                updates_shape: None,
            },
        ),
    ]);

    for operation in [QLinearOp::Add, QLinearOp::Mul] {
        for (label, quantized) in [("int8", QuantizedType::INT8), ("uint8", QuantizedType::UINT8)] {
            cases.push(CaseSpec::new(
                format!("test_{}_{label}", operation.op_type().to_ascii_lowercase()),
                CaseRecipe::QLinear {
                    operation,
                    shape: vec![2, 3, 4],
                    quantized,
                },
            ));
        }
    }

    cases.push(simple_lstm("test_lstm_simple", None));
    cases.push(simple_lstm("test_lstm_missing_inputs", Some(4.0)));
    cases.push(
        CaseSpec::new(
            "test_lstm_bidirectional",
            CaseRecipe::Lstm(LstmRecipe {
                seq_length: 5,
                batch: 1,
                input_size: 4,
                hidden_size: 3,
                direction: "bidirectional".to_string(),
                weight_fill: None,
                input_fill: None,
                constants_as_initializers: true,
                bias: true,
                forget_bias: None,
                initial_h: Some(0.0),
                initial_c: Some(0.0),
                outputs: vec!["Y".to_string(), "Y_h".to_string(), "Y_c".to_string()],
            }),
        )
        .with_opset(18),
    );

    for (label, source) in [("float16", ElementType::Float16), ("bfloat16", ElementType::BFloat16)] {
        cases.push(CaseSpec::new(
            format!("test_cast_{label}_to_float"),
            CaseRecipe::Cast {
                source,
                target: ElementType::Float32,
                len: 20,
            },
        ));
    }

    cases.extend([
        CaseSpec::new(
            "test_gemm_CN_transA_transB",
            CaseRecipe::Gemm {
                m: 2,
                k: 3,
                n: 4,
                alpha: 1.0,
                beta: 3.2,
                trans_a: true,
                trans_b: true,
                c_shape: vec![4],
            },
        ),
        CaseSpec::new(
            "test_slice_end_INT64_MAX",
            CaseRecipe::Slice {
                data: vec![5, 12],
                starts: vec![1],
                ends: vec![i64::MAX],
                axes: Some(vec![1]),
                steps: Some(vec![2]),
            },
        ),
        CaseSpec::new(
            "test_resize_downsample_scales_linear_align",
            CaseRecipe::Resize {
                x: vec![1, 1, 2, 4],
                scales: Some(vec![1.0, 1.0, 0.6, 0.6]),
                sizes: None,
                mode: "linear".to_string(),
                coordinate_transformation_mode: Some("align_corners".to_string()),
                empty_roi: true,
            },
        ),
        CaseSpec::new(
            "test_maxpool_stride_1",
            CaseRecipe::MaxPool {
                x: vec![1, 3, 12, 12],
                kernel: vec![1, 1],
                strides: Some(vec![1, 1]),
                pads: None,
                ceil_mode: false,
                with_indices: true,
            },
        ),
        CaseSpec::new(
            "test_conv_pads_strides",
            CaseRecipe::Conv {
                x: vec![1, 2, 6, 6],
                w: vec![4, 2, 3, 3],
                pads: Some(vec![1, 1, 1, 1]),
                strides: Some(vec![2, 2]),
                with_bias: true,
            },
        ),
        CaseSpec::new(
            "test_shape_const_out",
            CaseRecipe::ShapeExpand { data: vec![5, 12] },
        ),
    ]);
    cases
}

#[cfg(test)]
mod tests {
    use super::{
        CaseRecipe, CaseSpec, CorpusPlan, LstmRecipe, builtin_catalog, prepare_case,
    };
    use gg_dtype::ElementType;
    use gg_graph::{DEFAULT_OPSET, Dim, MICROSOFT_DOMAIN};
    use std::collections::BTreeSet;

    fn prepare(spec: &CaseSpec) -> super::PreparedCase {
        prepare_case(spec, 0, DEFAULT_OPSET).expect("case prepares")
    }

    fn find(name: &str) -> CaseSpec {
        builtin_catalog()
            .into_iter()
            .find(|spec| spec.name == name)
            .expect("builtin case")
    }

    #[test]
    fn builtin_catalog_names_are_unique_and_prepare() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.len(), 33);
        let names: BTreeSet<_> = catalog.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names.len(), catalog.len());
        for spec in &catalog {
            let prepared = prepare(spec);
            assert_eq!(prepared.graph.primary_op_type(), spec.recipe.op_type());
            assert_eq!(prepared.inputs.len(), prepared.graph.inputs.len(), "{}", spec.name);
            for (decl, named) in prepared.graph.inputs.iter().zip(&prepared.inputs) {
                assert_eq!(decl.name, named.name);
                assert!(decl.admits(named.tensor.shape()), "{}", spec.name);
            }
        }
    }

    #[test]
    fn matmul_names_follow_shapes_and_declare_rank_only_outputs() {
        let catalog = builtin_catalog();
        assert_eq!(catalog[0].name, "test_matmul_2x3_3x4");
        let dot = find("test_matmul_3_3");
        let prepared = prepare(&dot);
        assert!(prepared.graph.outputs[0].dims.is_empty());
        let batched = prepare(&find("test_matmul_3_2x3x4"));
        assert_eq!(batched.graph.outputs[0].dims, vec![Dim::Dynamic, Dim::Dynamic]);
    }

    #[test]
    fn preparation_is_reproducible_and_seed_sensitive() {
        let spec = find("test_gather_basic");
        assert_eq!(prepare(&spec), prepare(&spec));
        let other = prepare_case(&spec, 7, DEFAULT_OPSET).expect("seeded");
        assert_ne!(other.inputs, prepare(&spec).inputs);
        let mut pinned = spec.clone();
        pinned.seed = Some(7);
        assert_eq!(prepare(&pinned).inputs, other.inputs);
    }

    #[test]
    fn gather_indices_stay_inside_the_axis() {
        let prepared = prepare(&find("test_gather_basic"));
        let indices = prepared.inputs[1].tensor.to_i64_values().expect("indices");
        assert_eq!(prepared.inputs[1].tensor.element_type(), ElementType::Int32);
        assert_eq!(indices.len(), 20);
        assert!(indices.iter().all(|&index| (0..3).contains(&index)));
        assert_eq!(prepared.graph.outputs[0].fixed_shape(), Some(vec![2, 4, 5, 4]));
    }

    #[test]
    fn random_scatternd_indices_are_distinct() {
        let spec = CaseSpec::new(
            "test_scatternd_random",
            CaseRecipe::ScatterNd {
                data: vec![2, 3, 4],
                indices_shape: vec![6, 2],
                indices: None,
                updates: None,
                updates_shape: None,
            },
        );
        let prepared = prepare(&spec);
        let values = prepared.inputs[1].tensor.to_i64_values().expect("indices");
        let tuples: BTreeSet<_> = values.chunks(2).map(<[i64]>::to_vec).collect();
        assert_eq!(tuples.len(), 6);
        assert_eq!(prepared.inputs[2].tensor.shape(), &[6, 4]);

        let crowded = CaseSpec::new(
            "test_scatternd_crowded",
            CaseRecipe::ScatterNd {
                data: vec![2, 3],
                indices_shape: vec![3, 1],
                indices: None,
                updates: None,
                updates_shape: None,
            },
        );
        let err = prepare_case(&crowded, 0, DEFAULT_OPSET).expect_err("too many tuples");
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn leading_axis_updates_shape_is_a_shape_mismatch() {
        let spec = CaseSpec::new(
            "test_scatternd_leading_axis",
            CaseRecipe::ScatterNd {
                data: vec![4, 4, 4],
                indices_shape: vec![1, 1, 2],
                indices: Some(vec![0, 2]),
                updates: None,
                updates_shape: Some(vec![1, 4]),
            },
        );
        let err = prepare_case(&spec, 0, DEFAULT_OPSET).expect_err("bad updates");
        assert_eq!(err.category(), "shape_mismatch");
        assert!(err.to_string().contains("leading-axis"));
    }

    #[test]
    fn lstm_placeholders_and_initializers() {
        let missing = prepare(&find("test_lstm_missing_inputs"));
        assert_eq!(missing.graph.nodes[0].inputs, vec!["X", "W", "R", "", "", "initial_h"]);
        assert_eq!(missing.inputs.len(), 4);
        let initial_h = missing.inputs[3].tensor.values::<f32>().expect("f32");
        assert_eq!(initial_h, vec![4.0]);

        let bidirectional = prepare(&find("test_lstm_bidirectional"));
        let graph = &bidirectional.graph;
        assert_eq!(
            graph.nodes[0].inputs,
            vec!["X", "W", "R", "B", "", "initial_h", "initial_c"]
        );
        assert_eq!(graph.inputs.len(), 1);
        assert_eq!(graph.initializers.len(), 5);
        assert_eq!(graph.outputs.len(), 3);
        assert_eq!(graph.opset_version(""), Some(18));
        let w = graph.initializer("W").expect("W initializer");
        assert_eq!(w.shape(), &[2, 12, 4]);
    }

    #[test]
    fn forget_bias_pins_its_gate_block() {
        let spec = CaseSpec::new(
            "test_lstm_forget_bias",
            CaseRecipe::Lstm(LstmRecipe {
                seq_length: 2,
                batch: 1,
                input_size: 2,
                hidden_size: 2,
                direction: "forward".to_string(),
                weight_fill: None,
                input_fill: None,
                constants_as_initializers: true,
                bias: true,
                forget_bias: Some(1.0),
                initial_h: None,
                initial_c: None,
                outputs: vec!["Y".to_string()],
            }),
        );
        let prepared = prepare(&spec);
        let bias = prepared
            .graph
            .initializer("B")
            .expect("bias")
            .values::<f32>()
            .expect("f32");
        assert_eq!(bias.len(), 16);
        assert_eq!(&bias[4..6], &[1.0, 1.0]);
    }

    #[test]
    fn qlinear_cases_feed_every_operand() {
        let prepared = prepare(&find("test_qlinearadd_uint8"));
        assert_eq!(prepared.inputs.len(), 8);
        assert_eq!(prepared.graph.opset_version(MICROSOFT_DOMAIN), Some(1));
        assert_eq!(prepared.graph.opset_version(""), Some(DEFAULT_OPSET));
        let zero_point = prepared.inputs[2].tensor.values::<u8>().expect("u8");
        assert_eq!(zero_point, vec![128]);
        assert_eq!(prepared.graph.outputs[0].name, "c");
    }

    #[test]
    fn cast_cases_bake_the_edge_values() {
        let prepared = prepare(&find("test_cast_float16_to_float"));
        assert!(prepared.inputs.is_empty());
        let data = prepared.graph.initializer("data").expect("data");
        assert_eq!(data.element_type(), ElementType::Float16);
        let values = data.to_f64_values().expect("values");
        assert!(values[0].is_nan());
        assert_eq!(values[6], 2f64.powi(-14));
        assert_eq!(prepared.graph.outputs[0].element_type, ElementType::Float32);
    }

    #[test]
    fn maxpool_values_are_hundredths() {
        let prepared = prepare(&find("test_maxpool_stride_1"));
        let values = prepared.inputs[0].tensor.values::<f32>().expect("f32");
        assert_eq!(values.len(), 432);
        assert!(values.iter().all(|v| (-1.0..1.0).contains(v)));
        assert_eq!(prepared.graph.outputs.len(), 2);
        assert_eq!(prepared.graph.outputs[1].element_type, ElementType::Int64);
    }

    #[test]
    fn plan_json_roundtrips_recipes() {
        let unknown = r#"{"cases": [{"name": "test_softmax", "recipe": {"op": "softmax"}}]}"#;
        assert!(serde_json::from_str::<CorpusPlan>(unknown).is_err());

        let raw = r#"{"cases": [
            {"name": "test_gather_json", "recipe": {"op": "gather", "data": [3], "indices": [2], "axis": 0}},
            {"name": "test_cast_json", "opset": 17, "recipe": {"op": "cast", "source": "bfloat16", "target": "float32", "len": 12}}
        ]}"#;
        let plan: CorpusPlan = serde_json::from_str(raw).expect("plan parses");
        assert_eq!(plan.cases.len(), 2);
        assert_eq!(plan.cases[1].opset, Some(17));
        let prepared = prepare(&plan.cases[1]);
        assert_eq!(prepared.graph.opset_version(""), Some(17));

        let only = plan.clone().only("test_gather_json").expect("present");
        assert_eq!(only.cases.len(), 1);
        assert!(plan.only("test_missing").is_err());
    }

    #[test]
    fn shape_const_out_chains_shape_into_expand() {
        let prepared = prepare(&find("test_shape_const_out"));
        let graph = &prepared.graph;
        let ops: Vec<&str> = graph.nodes.iter().map(|node| node.op_type.as_str()).collect();
        assert_eq!(ops, ["Shape", "Expand"]);
        assert_eq!(graph.nodes[0].outputs, ["Y"]);
        assert_eq!(graph.nodes[1].inputs, ["data", "Y"]);
        assert_eq!(prepared.inputs.len(), 1);
        assert_eq!(prepared.inputs[0].tensor.shape(), &[5, 12]);
        assert_eq!(graph.outputs.len(), 1);
        assert_eq!(graph.outputs[0].name, "O");
        assert_eq!(graph.outputs[0].fixed_shape(), Some(vec![5, 12]));

        let raw = r#"{"name": "test_shape_json", "recipe": {"op": "shape_expand", "data": [2, 3]}}"#;
        let spec: CaseSpec = serde_json::from_str(raw).expect("shape_expand parses");
        assert_eq!(prepare(&spec).graph.outputs[0].fixed_shape(), Some(vec![2, 3]));
    }

    #[test]
    fn matmul_precision_uses_literal_operands() {
        let prepared = prepare(&find("test_matmul_precision"));
        let expected = vec![10.10_f32, 11.11, 12.12, 13.13];
        for named in &prepared.inputs {
            assert_eq!(named.tensor.values::<f32>().expect("f32"), expected);
        }
        assert_eq!(prepared.graph.outputs[0].fixed_shape(), Some(vec![2, 2]));

        let raw = r#"{"name": "test_matmul_literal", "recipe": {"op": "mat_mul", "a": [2], "b": [2],
            "policy": {"kind": "values", "values": [1.0, 2.0]}}}"#;
        let spec: CaseSpec = serde_json::from_str(raw).expect("literal matmul parses");
        let prepared = prepare(&spec);
        assert_eq!(prepared.inputs[1].tensor.values::<f32>().expect("f32"), vec![1.0, 2.0]);
        assert!(prepared.graph.outputs[0].dims.is_empty());
    }
}
