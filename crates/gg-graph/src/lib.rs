#![forbid(unsafe_code)]

use core::fmt;
use std::collections::BTreeSet;

use gg_dtype::ElementType;
use gg_tensor::{NamedTensor, Tensor, broadcast_shape, broadcasts_to};

pub const DEFAULT_DOMAIN: &str = "";
pub const MICROSOFT_DOMAIN: &str = "com.microsoft";
pub const DEFAULT_OPSET: i64 = 13;

pub const GRAPH_REASON_CODES: [&str; 7] = [
    "graph_shape_mismatch",
    "graph_element_type_mismatch",
    "graph_operand_not_constant",
    "graph_attribute_schema",
    "graph_unknown_operator",
    "graph_arity",
    "graph_dangling_input",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    ShapeMismatch {
        op_type: String,
        detail: String,
        shapes: Vec<Vec<usize>>,
    },
    ElementTypeMismatch {
        op_type: String,
        operand: String,
        expected: String,
        actual: ElementType,
    },
    NonConstantOperand {
        op_type: String,
        operand: String,
    },
    AttributeSchema {
        op_type: String,
        attribute: String,
        detail: String,
    },
    UnknownOperator {
        op_type: String,
    },
    Arity {
        op_type: String,
        detail: String,
    },
    DanglingInput {
        node: String,
        input: String,
    },
}

impl GraphError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ShapeMismatch { .. } => "graph_shape_mismatch",
            Self::ElementTypeMismatch { .. } => "graph_element_type_mismatch",
            Self::NonConstantOperand { .. } => "graph_operand_not_constant",
            Self::AttributeSchema { .. } => "graph_attribute_schema",
            Self::UnknownOperator { .. } => "graph_unknown_operator",
            Self::Arity { .. } => "graph_arity",
            Self::DanglingInput { .. } => "graph_dangling_input",
        }
    }

    /// Shape-category failures; everything else is a schema failure.
    #[must_use]
    pub fn is_shape_failure(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. }
                | Self::ElementTypeMismatch { .. }
                | Self::NonConstantOperand { .. }
        )
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                op_type,
                detail,
                shapes,
            } => write!(f, "{op_type}: {detail} (shapes {shapes:?})"),
            Self::ElementTypeMismatch {
                op_type,
                operand,
                expected,
                actual,
            } => write!(
                f,
                "{op_type}: operand {operand} has element type {actual}, expected {expected}"
            ),
            Self::NonConstantOperand { op_type, operand } => {
                write!(f, "{op_type}: operand {operand} must be an initializer")
            }
            Self::AttributeSchema {
                op_type,
                attribute,
                detail,
            } => write!(f, "{op_type}: attribute {attribute}: {detail}"),
            Self::UnknownOperator { op_type } => write!(f, "no shape rule for operator {op_type}"),
            Self::Arity { op_type, detail } => write!(f, "{op_type}: {detail}"),
            Self::DanglingInput { node, input } => {
                write!(f, "node {node} reads {input}, which nothing produces")
            }
        }
    }
}

impl std::error::Error for GraphError {}

fn shape_mismatch(op_type: &str, detail: impl Into<String>, shapes: &[&[usize]]) -> GraphError {
    GraphError::ShapeMismatch {
        op_type: op_type.to_string(),
        detail: detail.into(),
        shapes: shapes.iter().map(|shape| shape.to_vec()).collect(),
    }
}

fn attribute_error(op_type: &str, attribute: &str, detail: impl Into<String>) -> GraphError {
    GraphError::AttributeSchema {
        op_type: op_type.to_string(),
        attribute: attribute.to_string(),
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Int,
    Float,
    String,
    Ints,
    Floats,
    Tensor,
}

impl AttributeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Ints => "ints",
            Self::Floats => "floats",
            Self::Tensor => "tensor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Tensor(Tensor),
}

impl AttributeValue {
    #[must_use]
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::Int(_) => AttributeKind::Int,
            Self::Float(_) => AttributeKind::Float,
            Self::String(_) => AttributeKind::String,
            Self::Ints(_) => AttributeKind::Ints,
            Self::Floats(_) => AttributeKind::Floats,
            Self::Tensor(_) => AttributeKind::Tensor,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, AttributeValue::Int(value))
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self::new(name, AttributeValue::Float(value))
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, AttributeValue::String(value.into()))
    }

    pub fn ints(name: impl Into<String>, values: &[i64]) -> Self {
        Self::new(name, AttributeValue::Ints(values.to_vec()))
    }

    pub fn floats(name: impl Into<String>, values: &[f32]) -> Self {
        Self::new(name, AttributeValue::Floats(values.to_vec()))
    }

    pub fn tensor(name: impl Into<String>, value: Tensor) -> Self {
        Self::new(name, AttributeValue::Tensor(value))
    }

    fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One operator invocation. Input names are positional; `""` marks an omitted
/// optional input.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op_type: String,
    pub domain: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<Attribute>,
}

impl Node {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| &attribute.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(usize),
    Dynamic,
}

/// Declared graph input or output: name, element type and (possibly symbolic) dims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDecl {
    pub name: String,
    pub element_type: ElementType,
    pub dims: Vec<Dim>,
}

impl TensorDecl {
    pub fn fixed(name: impl Into<String>, element_type: ElementType, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            element_type,
            dims: shape.iter().map(|&dim| Dim::Fixed(dim)).collect(),
        }
    }

    pub fn dynamic(name: impl Into<String>, element_type: ElementType, rank: usize) -> Self {
        Self {
            name: name.into(),
            element_type,
            dims: vec![Dim::Dynamic; rank],
        }
    }

    pub fn for_tensor(name: impl Into<String>, tensor: &Tensor) -> Self {
        Self::fixed(name, tensor.element_type(), tensor.shape())
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Concrete shape, or `None` if any dim is dynamic.
    #[must_use]
    pub fn fixed_shape(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|dim| match dim {
                Dim::Fixed(value) => Some(*value),
                Dim::Dynamic => None,
            })
            .collect()
    }

    /// True when `shape` is compatible with every fixed dim.
    #[must_use]
    pub fn admits(&self, shape: &[usize]) -> bool {
        self.dims.len() == shape.len()
            && self.dims.iter().zip(shape).all(|(dim, &actual)| match dim {
                Dim::Fixed(expected) => *expected == actual,
                Dim::Dynamic => true,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsetImport {
    pub domain: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
    pub inputs: Vec<TensorDecl>,
    pub outputs: Vec<TensorDecl>,
    pub initializers: Vec<NamedTensor>,
    pub opset_imports: Vec<OpsetImport>,
}

impl Graph {
    /// Every non-empty node input must be a declared input, an initializer or
    /// some node's output; every declared output must be produced.
    pub fn validate_references(&self) -> Result<(), GraphError> {
        let mut known: BTreeSet<&str> = self
            .inputs
            .iter()
            .map(|decl| decl.name.as_str())
            .chain(self.initializers.iter().map(|init| init.name.as_str()))
            .collect();
        let produced: BTreeSet<&str> = self
            .nodes
            .iter()
            .flat_map(|node| node.outputs.iter())
            .filter(|name| !name.is_empty())
            .map(String::as_str)
            .collect();
        known.extend(produced.iter().copied());

        for node in &self.nodes {
            if let Some(input) = node
                .inputs
                .iter()
                .find(|input| !input.is_empty() && !known.contains(input.as_str()))
            {
                return Err(GraphError::DanglingInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
        }
        if let Some(output) = self
            .outputs
            .iter()
            .find(|decl| !known.contains(decl.name.as_str()))
        {
            return Err(GraphError::DanglingInput {
                node: self.name.clone(),
                input: output.name.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers
            .iter()
            .find(|init| init.name == name)
            .map(|init| &init.tensor)
    }

    #[must_use]
    pub fn opset_version(&self, domain: &str) -> Option<i64> {
        self.opset_imports
            .iter()
            .find(|import| import.domain == domain)
            .map(|import| import.version)
    }

    /// Op type of the first node, used to label cases.
    #[must_use]
    pub fn primary_op_type(&self) -> &str {
        self.nodes.first().map_or("", |node| node.op_type.as_str())
    }
}

/// One positional operand of the node being built.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Fed at evaluation time; becomes a graph input.
    Declared(TensorDecl),
    /// Baked into the model as an initializer.
    Initializer(NamedTensor),
    /// Optional input left out; encoded as `""` unless trailing.
    Omitted,
    /// Output of an earlier node of a chained build.
    Chained(String),
}

impl Operand {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Declared(decl) => &decl.name,
            Self::Initializer(init) => &init.name,
            Self::Omitted => "",
            Self::Chained(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputDims {
    /// Declare outputs with the inferred concrete shape.
    #[default]
    Inferred,
    /// Declare outputs with the inferred rank only, every dim dynamic.
    RankOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub graph_name: String,
    pub op_type: String,
    pub operands: Vec<Operand>,
    pub attributes: Vec<Attribute>,
    /// Positional output names; empty selects the operator's default names.
    pub output_names: Vec<String>,
    pub default_opset: i64,
    pub output_dims: OutputDims,
    /// Nodes appended after this one. Graph outputs come from the last node;
    /// opset and output dims come from the first request.
    pub chain: Vec<BuildRequest>,
}

impl BuildRequest {
    pub fn new(graph_name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            op_type: op_type.into(),
            operands: Vec::new(),
            attributes: Vec::new(),
            output_names: Vec::new(),
            default_opset: DEFAULT_OPSET,
            output_dims: OutputDims::Inferred,
            chain: Vec::new(),
        }
    }

    #[must_use]
    pub fn operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.output_names = names.iter().map(|name| (*name).to_string()).collect();
        self
    }

    #[must_use]
    pub fn opset(mut self, version: i64) -> Self {
        self.default_opset = version;
        self
    }

    #[must_use]
    pub fn output_dims(mut self, output_dims: OutputDims) -> Self {
        self.output_dims = output_dims;
        self
    }

    /// Append a node that may read this chain's outputs via `Operand::Chained`.
    #[must_use]
    pub fn then(mut self, next: BuildRequest) -> Self {
        self.chain.push(next);
        self
    }

    fn stages(&self) -> Vec<&BuildRequest> {
        let mut stages = vec![self];
        for next in &self.chain {
            stages.extend(next.stages());
        }
        stages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub kind: AttributeKind,
    pub required: bool,
}

const fn optional(name: &'static str, kind: AttributeKind) -> AttributeSpec {
    AttributeSpec {
        name,
        kind,
        required: false,
    }
}

const fn required(name: &'static str, kind: AttributeKind) -> AttributeSpec {
    AttributeSpec {
        name,
        kind,
        required: true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDecl {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    /// Contents, when the rule can compute them without evaluation.
    pub value: Option<Tensor>,
}

impl OutputDecl {
    #[must_use]
    pub fn new(element_type: ElementType, shape: Vec<usize>) -> Self {
        Self {
            element_type,
            shape,
            value: None,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: Tensor) -> Self {
        self.value = Some(value);
        self
    }
}

/// An operand as seen by a shape rule.
#[derive(Debug, Clone)]
pub struct ResolvedOperand<'a> {
    pub name: &'a str,
    pub element_type: ElementType,
    pub dims: Vec<Dim>,
    pub constant: Option<&'a Tensor>,
}

pub struct RuleContext<'a> {
    pub op_type: &'a str,
    operands: Vec<Option<ResolvedOperand<'a>>>,
    attributes: &'a [Attribute],
}

impl<'a> RuleContext<'a> {
    #[must_use]
    pub fn operand(&self, index: usize) -> Option<&ResolvedOperand<'a>> {
        self.operands.get(index).and_then(Option::as_ref)
    }

    pub fn required(&self, index: usize, label: &str) -> Result<&ResolvedOperand<'a>, GraphError> {
        self.operand(index).ok_or_else(|| GraphError::Arity {
            op_type: self.op_type.to_string(),
            detail: format!("missing required input {label} at position {index}"),
        })
    }

    pub fn shape(&self, index: usize, label: &str) -> Result<Vec<usize>, GraphError> {
        let operand = self.required(index, label)?;
        self.concrete(operand, label)
    }

    pub fn optional_shape(&self, index: usize, label: &str) -> Result<Option<Vec<usize>>, GraphError> {
        self.operand(index)
            .map(|operand| self.concrete(operand, label))
            .transpose()
    }

    fn concrete(&self, operand: &ResolvedOperand<'_>, label: &str) -> Result<Vec<usize>, GraphError> {
        operand
            .dims
            .iter()
            .map(|dim| match dim {
                Dim::Fixed(value) => Some(*value),
                Dim::Dynamic => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                shape_mismatch(
                    self.op_type,
                    format!("operand {label} ({}) has dynamic dims", operand.name),
                    &[],
                )
            })
    }

    pub fn element_type(&self, index: usize, label: &str) -> Result<ElementType, GraphError> {
        Ok(self.required(index, label)?.element_type)
    }

    /// Checks an operand, if present, against a set of admissible types.
    pub fn expect_type(
        &self,
        index: usize,
        label: &str,
        allowed: &[ElementType],
    ) -> Result<(), GraphError> {
        let Some(operand) = self.operand(index) else {
            return Ok(());
        };
        if allowed.contains(&operand.element_type) {
            return Ok(());
        }
        Err(GraphError::ElementTypeMismatch {
            op_type: self.op_type.to_string(),
            operand: label.to_string(),
            expected: allowed
                .iter()
                .map(|dtype| dtype.name())
                .collect::<Vec<_>>()
                .join(" or "),
            actual: operand.element_type,
        })
    }

    /// Checks an operand, if present, against an exact shape.
    pub fn expect_shape(&self, index: usize, label: &str, expected: &[usize]) -> Result<(), GraphError> {
        match self.optional_shape(index, label)? {
            Some(actual) if actual != expected => Err(shape_mismatch(
                self.op_type,
                format!("operand {label} must have shape {expected:?}"),
                &[&actual],
            )),
            _ => Ok(()),
        }
    }

    fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| &attribute.value)
    }

    #[must_use]
    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attribute(name) {
            Some(AttributeValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn float_attr(&self, name: &str) -> Option<f32> {
        match self.attribute(name) {
            Some(AttributeValue::Float(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn string_attr<'s>(&'s self, name: &str, default: &'s str) -> &'s str {
        match self.attribute(name) {
            Some(AttributeValue::String(value)) => value.as_str(),
            _ => default,
        }
    }

    #[must_use]
    pub fn ints_attr(&self, name: &str) -> Option<&[i64]> {
        match self.attribute(name) {
            Some(AttributeValue::Ints(values)) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Boolean-valued int attribute (0 or 1).
    pub fn flag_attr(&self, name: &str) -> Result<bool, GraphError> {
        match self.int_attr(name).unwrap_or(0) {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(attribute_error(
                self.op_type,
                name,
                format!("must be 0 or 1, got {other}"),
            )),
        }
    }

    /// Integer contents of a constant operand; `None` when omitted or empty.
    pub fn constant_ints(&self, index: usize, label: &str) -> Result<Option<Vec<i64>>, GraphError> {
        let Some(tensor) = self.constant(index, label)? else {
            return Ok(None);
        };
        self.expect_type(index, label, &[ElementType::Int32, ElementType::Int64])?;
        let values = tensor
            .to_i64_values()
            .map_err(|err| shape_mismatch(self.op_type, err.to_string(), &[tensor.shape()]))?;
        Ok((!values.is_empty()).then_some(values))
    }

    /// Float contents of a constant operand; `None` when omitted or empty.
    pub fn constant_floats(&self, index: usize, label: &str) -> Result<Option<Vec<f64>>, GraphError> {
        let Some(tensor) = self.constant(index, label)? else {
            return Ok(None);
        };
        self.expect_type(
            index,
            label,
            &[ElementType::Float32, ElementType::Float16, ElementType::BFloat16],
        )?;
        let values = tensor
            .to_f64_values()
            .map_err(|err| shape_mismatch(self.op_type, err.to_string(), &[tensor.shape()]))?;
        Ok((!values.is_empty()).then_some(values))
    }

    fn constant(&self, index: usize, label: &str) -> Result<Option<&'a Tensor>, GraphError> {
        match self.operand(index) {
            None => Ok(None),
            Some(ResolvedOperand {
                constant: Some(tensor),
                ..
            }) => Ok(Some(*tensor)),
            Some(_) => Err(GraphError::NonConstantOperand {
                op_type: self.op_type.to_string(),
                operand: label.to_string(),
            }),
        }
    }

    fn mismatch(&self, detail: impl Into<String>, shapes: &[&[usize]]) -> GraphError {
        shape_mismatch(self.op_type, detail, shapes)
    }

    fn attribute_error(&self, attribute: &str, detail: impl Into<String>) -> GraphError {
        attribute_error(self.op_type, attribute, detail)
    }
}

pub type ShapeRule = fn(&RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError>;

/// Per-operator entry of the rule table.
#[derive(Debug, Clone, Copy)]
pub struct OperatorRule {
    pub op_type: &'static str,
    pub domain: &'static str,
    /// Opset version for a non-default domain; default-domain rules follow the request.
    pub domain_version: Option<i64>,
    pub inputs: &'static [&'static str],
    pub min_inputs: usize,
    pub attributes: &'static [AttributeSpec],
    pub outputs: &'static [&'static str],
    pub min_outputs: usize,
    pub infer: ShapeRule,
}

use AttributeKind as K;

const WINDOW_ATTRIBUTES_CONV: &[AttributeSpec] = &[
    optional("auto_pad", K::String),
    optional("dilations", K::Ints),
    optional("group", K::Int),
    optional("kernel_shape", K::Ints),
    optional("pads", K::Ints),
    optional("strides", K::Ints),
];

const WINDOW_ATTRIBUTES_MAXPOOL: &[AttributeSpec] = &[
    optional("auto_pad", K::String),
    optional("ceil_mode", K::Int),
    optional("dilations", K::Ints),
    required("kernel_shape", K::Ints),
    optional("pads", K::Ints),
    optional("storage_order", K::Int),
    optional("strides", K::Ints),
];

const QLINEAR_INPUTS: &[&str] = &[
    "A",
    "A_scale",
    "A_zero_point",
    "B",
    "B_scale",
    "B_zero_point",
    "C_scale",
    "C_zero_point",
];

pub static OPERATOR_RULES: [OperatorRule; 14] = [
    OperatorRule {
        op_type: "MatMul",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["A", "B"],
        min_inputs: 2,
        attributes: &[],
        outputs: &["Y"],
        min_outputs: 1,
        infer: infer_matmul,
    },
    OperatorRule {
        op_type: "Gather",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["data", "indices"],
        min_inputs: 2,
        attributes: &[optional("axis", K::Int)],
        outputs: &["output"],
        min_outputs: 1,
        infer: infer_gather,
    },
    OperatorRule {
        op_type: "ScatterND",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["data", "indices", "updates"],
        min_inputs: 3,
        attributes: &[optional("reduction", K::String)],
        outputs: &["output"],
        min_outputs: 1,
        infer: infer_scatternd,
    },
    OperatorRule {
        op_type: "LSTM",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &[
            "X",
            "W",
            "R",
            "B",
            "sequence_lens",
            "initial_h",
            "initial_c",
            "P",
        ],
        min_inputs: 3,
        attributes: &[
            optional("clip", K::Float),
            optional("direction", K::String),
            optional("hidden_size", K::Int),
            optional("input_forget", K::Int),
            optional("layout", K::Int),
        ],
        outputs: &["Y", "Y_h", "Y_c"],
        min_outputs: 0,
        infer: infer_lstm,
    },
    OperatorRule {
        op_type: "QLinearAdd",
        domain: MICROSOFT_DOMAIN,
        domain_version: Some(1),
        inputs: QLINEAR_INPUTS,
        min_inputs: 8,
        attributes: &[],
        outputs: &["C"],
        min_outputs: 1,
        infer: infer_qlinear,
    },
    OperatorRule {
        op_type: "QLinearMul",
        domain: MICROSOFT_DOMAIN,
        domain_version: Some(1),
        inputs: QLINEAR_INPUTS,
        min_inputs: 8,
        attributes: &[],
        outputs: &["C"],
        min_outputs: 1,
        infer: infer_qlinear,
    },
    OperatorRule {
        op_type: "Cast",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["input"],
        min_inputs: 1,
        attributes: &[required("to", K::Int)],
        outputs: &["output"],
        min_outputs: 1,
        infer: infer_cast,
    },
    OperatorRule {
        op_type: "Gemm",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["A", "B", "C"],
        min_inputs: 2,
        attributes: &[
            optional("alpha", K::Float),
            optional("beta", K::Float),
            optional("transA", K::Int),
            optional("transB", K::Int),
        ],
        outputs: &["Y"],
        min_outputs: 1,
        infer: infer_gemm,
    },
    OperatorRule {
        op_type: "Conv",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["X", "W", "B"],
        min_inputs: 2,
        attributes: WINDOW_ATTRIBUTES_CONV,
        outputs: &["Y"],
        min_outputs: 1,
        infer: infer_conv,
    },
    OperatorRule {
        op_type: "MaxPool",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["X"],
        min_inputs: 1,
        attributes: WINDOW_ATTRIBUTES_MAXPOOL,
        outputs: &["Y", "Indices"],
        min_outputs: 1,
        infer: infer_maxpool,
    },
    OperatorRule {
        op_type: "Slice",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["data", "starts", "ends", "axes", "steps"],
        min_inputs: 3,
        attributes: &[],
        outputs: &["output"],
        min_outputs: 1,
        infer: infer_slice,
    },
    OperatorRule {
        op_type: "Resize",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["X", "roi", "scales", "sizes"],
        min_inputs: 1,
        attributes: &[
            optional("coordinate_transformation_mode", K::String),
            optional("cubic_coeff_a", K::Float),
            optional("exclude_outside", K::Int),
            optional("extrapolation_value", K::Float),
            optional("mode", K::String),
            optional("nearest_mode", K::String),
        ],
        outputs: &["Y"],
        min_outputs: 1,
        infer: infer_resize,
    },
    OperatorRule {
        op_type: "Shape",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["data"],
        min_inputs: 1,
        attributes: &[],
        outputs: &["shape"],
        min_outputs: 1,
        infer: infer_shape,
    },
    OperatorRule {
        op_type: "Expand",
        domain: DEFAULT_DOMAIN,
        domain_version: None,
        inputs: &["input", "shape"],
        min_inputs: 2,
        attributes: &[],
        outputs: &["output"],
        min_outputs: 1,
        infer: infer_expand,
    },
];

#[must_use]
pub fn rule_for(op_type: &str) -> Option<&'static OperatorRule> {
    OPERATOR_RULES.iter().find(|rule| rule.op_type == op_type)
}

/// Output of one node, visible to the nodes after it.
struct Produced {
    name: String,
    decl: OutputDecl,
}

/// Build the graph for `request` and any nodes chained after it.
pub fn build(request: &BuildRequest) -> Result<Graph, GraphError> {
    let mut inputs: Vec<TensorDecl> = Vec::new();
    let mut initializers: Vec<NamedTensor> = Vec::new();
    let mut produced: Vec<Produced> = Vec::new();
    let mut nodes = Vec::new();
    let mut opset_imports = vec![OpsetImport {
        domain: DEFAULT_DOMAIN.to_string(),
        version: request.default_opset,
    }];
    let mut last_outputs = Vec::new();

    for stage in request.stages() {
        let (rule, node, outputs) = build_node(stage, &produced, &mut inputs, &mut initializers)?;
        if rule.domain != DEFAULT_DOMAIN
            && !opset_imports.iter().any(|import| import.domain == rule.domain)
        {
            opset_imports.push(OpsetImport {
                domain: rule.domain.to_string(),
                version: rule.domain_version.unwrap_or(1),
            });
        }
        for (name, decl) in &outputs {
            let taken = inputs.iter().any(|input| input.name == *name)
                || initializers.iter().any(|init| init.name == *name)
                || produced.iter().any(|value| value.name == *name);
            if taken {
                return Err(GraphError::Arity {
                    op_type: rule.op_type.to_string(),
                    detail: format!("output name {name} is already in use"),
                });
            }
            produced.push(Produced {
                name: name.clone(),
                decl: decl.clone(),
            });
        }
        nodes.push(node);
        last_outputs = outputs;
    }

    let outputs = last_outputs
        .into_iter()
        .map(|(name, decl)| match request.output_dims {
            OutputDims::Inferred => TensorDecl::fixed(name, decl.element_type, &decl.shape),
            OutputDims::RankOnly => TensorDecl::dynamic(name, decl.element_type, decl.shape.len()),
        })
        .collect();

    let graph = Graph {
        name: request.graph_name.clone(),
        nodes,
        inputs,
        outputs,
        initializers,
        opset_imports,
    };
    graph.validate_references()?;
    Ok(graph)
}

/// Resolve one request into a node and its named, inferred outputs.
fn build_node<'a>(
    request: &'a BuildRequest,
    produced: &'a [Produced],
    inputs: &mut Vec<TensorDecl>,
    initializers: &mut Vec<NamedTensor>,
) -> Result<(&'static OperatorRule, Node, Vec<(String, OutputDecl)>), GraphError> {
    let op_type = request.op_type.as_str();
    let rule = rule_for(op_type).ok_or_else(|| GraphError::UnknownOperator {
        op_type: op_type.to_string(),
    })?;

    let used = request
        .operands
        .iter()
        .rposition(|operand| !matches!(operand, Operand::Omitted))
        .map_or(0, |last| last + 1);
    if used > rule.inputs.len() {
        return Err(GraphError::Arity {
            op_type: op_type.to_string(),
            detail: format!("takes at most {} inputs, got {used}", rule.inputs.len()),
        });
    }
    let operands = &request.operands[..used];
    for (index, label) in rule.inputs.iter().enumerate().take(rule.min_inputs) {
        if matches!(operands.get(index), None | Some(Operand::Omitted)) {
            return Err(GraphError::Arity {
                op_type: op_type.to_string(),
                detail: format!("missing required input {label} at position {index}"),
            });
        }
    }
    validate_attributes(rule, &request.attributes)?;

    let mut resolved = Vec::with_capacity(operands.len());
    for operand in operands {
        match operand {
            Operand::Declared(decl) => {
                register_unique(inputs, decl, |d| &d.name, op_type)?;
                resolved.push(Some(ResolvedOperand {
                    name: &decl.name,
                    element_type: decl.element_type,
                    dims: decl.dims.clone(),
                    constant: None,
                }));
            }
            Operand::Initializer(init) => {
                register_unique(initializers, init, |i| &i.name, op_type)?;
                resolved.push(Some(ResolvedOperand {
                    name: &init.name,
                    element_type: init.tensor.element_type(),
                    dims: init.tensor.shape().iter().map(|&d| Dim::Fixed(d)).collect(),
                    constant: Some(&init.tensor),
                }));
            }
            Operand::Chained(name) => {
                let source = produced
                    .iter()
                    .find(|value| value.name == *name)
                    .ok_or_else(|| GraphError::DanglingInput {
                        node: request.graph_name.clone(),
                        input: name.clone(),
                    })?;
                resolved.push(Some(ResolvedOperand {
                    name: &source.name,
                    element_type: source.decl.element_type,
                    dims: source.decl.shape.iter().map(|&d| Dim::Fixed(d)).collect(),
                    constant: source.decl.value.as_ref(),
                }));
            }
            Operand::Omitted => resolved.push(None),
        }
    }
    if let Some(clash) = inputs.iter().find(|decl| {
        initializers.iter().any(|init| init.name == decl.name)
            || produced.iter().any(|value| value.name == decl.name)
    }) {
        return Err(GraphError::Arity {
            op_type: op_type.to_string(),
            detail: format!("{} names more than one kind of value", clash.name),
        });
    }

    let context = RuleContext {
        op_type,
        operands: resolved,
        attributes: &request.attributes,
    };
    let inferred = (rule.infer)(&context)?;

    let mut output_names: Vec<String> = if request.output_names.is_empty() {
        rule.outputs.iter().map(|name| (*name).to_string()).collect()
    } else {
        request.output_names.clone()
    };
    while output_names.last().is_some_and(String::is_empty) {
        output_names.pop();
    }
    if output_names.len() > rule.outputs.len() || output_names.len() < rule.min_outputs {
        return Err(GraphError::Arity {
            op_type: op_type.to_string(),
            detail: format!(
                "produces {}..={} outputs, {} requested",
                rule.min_outputs,
                rule.outputs.len(),
                output_names.len()
            ),
        });
    }
    if output_names.iter().all(String::is_empty) {
        return Err(GraphError::Arity {
            op_type: op_type.to_string(),
            detail: "at least one output must be named".to_string(),
        });
    }
    if let Some(position) = output_names[..rule.min_outputs]
        .iter()
        .position(String::is_empty)
    {
        return Err(GraphError::Arity {
            op_type: op_type.to_string(),
            detail: format!("required output {} cannot be omitted", rule.outputs[position]),
        });
    }

    let outputs = output_names
        .iter()
        .zip(inferred)
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, decl)| (name.clone(), decl))
        .collect();

    let node = Node {
        op_type: op_type.to_string(),
        domain: rule.domain.to_string(),
        name: request.graph_name.clone(),
        inputs: operands.iter().map(|o| o.name().to_string()).collect(),
        outputs: output_names,
        attributes: request.attributes.clone(),
    };
    Ok((rule, node, outputs))
}

fn register_unique<T: Clone + PartialEq>(
    items: &mut Vec<T>,
    item: &T,
    name_of: impl Fn(&T) -> &String,
    op_type: &str,
) -> Result<(), GraphError> {
    match items.iter().find(|existing| name_of(existing) == name_of(item)) {
        Some(existing) if existing == item => Ok(()),
        Some(_) => Err(GraphError::Arity {
            op_type: op_type.to_string(),
            detail: format!("operand name {} reused with a different value", name_of(item)),
        }),
        None => {
            items.push(item.clone());
            Ok(())
        }
    }
}

fn validate_attributes(rule: &OperatorRule, attributes: &[Attribute]) -> Result<(), GraphError> {
    for (position, attribute) in attributes.iter().enumerate() {
        let name = attribute.name.as_str();
        if attributes[..position].iter().any(|seen| seen.name == name) {
            return Err(attribute_error(rule.op_type, name, "given more than once"));
        }
        let spec = rule
            .attributes
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| attribute_error(rule.op_type, name, "not defined for this operator"))?;
        let kind = attribute.value.kind();
        if kind != spec.kind {
            return Err(attribute_error(
                rule.op_type,
                name,
                format!("expected {}, got {}", spec.kind.as_str(), kind.as_str()),
            ));
        }
    }
    if let Some(missing) = rule
        .attributes
        .iter()
        .find(|spec| spec.required && !attributes.iter().any(|attr| attr.name == spec.name))
    {
        return Err(attribute_error(rule.op_type, missing.name, "required but missing"));
    }
    Ok(())
}

const FLOAT_TYPES: &[ElementType] = &[
    ElementType::Float32,
    ElementType::Float16,
    ElementType::BFloat16,
];
const INDEX_TYPES: &[ElementType] = &[ElementType::Int32, ElementType::Int64];
const QUANTIZED_TYPES: &[ElementType] = &[ElementType::Int8, ElementType::Uint8];
const MATMUL_TYPES: &[ElementType] = &[
    ElementType::Float32,
    ElementType::Float16,
    ElementType::BFloat16,
    ElementType::Int32,
    ElementType::Int64,
];

/// Normalize an axis in `[-rank, rank - 1]`.
pub fn normalize_axis(op_type: &str, axis: i64, rank: usize) -> Result<usize, GraphError> {
    let signed_rank = rank as i64;
    if axis < -signed_rank || axis >= signed_rank {
        return Err(attribute_error(
            op_type,
            "axis",
            format!("{axis} is outside [-{rank}, {}]", signed_rank - 1),
        ));
    }
    let normalized = if axis < 0 { axis + signed_rank } else { axis };
    Ok(normalized as usize)
}

/// numpy `matmul` result shape.
///
/// 1-D operands are promoted (left to a row, right to a column) and the
/// promoted axis is dropped from the result.
pub fn matmul_output_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, GraphError> {
    if lhs.is_empty() || rhs.is_empty() {
        return Err(shape_mismatch("MatMul", "operands must have rank >= 1", &[lhs, rhs]));
    }
    let a = if lhs.len() == 1 {
        vec![1, lhs[0]]
    } else {
        lhs.to_vec()
    };
    let b = if rhs.len() == 1 {
        vec![rhs[0], 1]
    } else {
        rhs.to_vec()
    };
    let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
    let (k_rhs, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k != k_rhs {
        return Err(shape_mismatch(
            "MatMul",
            format!("inner dimensions differ: {k} vs {k_rhs}"),
            &[lhs, rhs],
        ));
    }
    let mut out = broadcast_shape(&a[..a.len() - 2], &b[..b.len() - 2]).ok_or_else(|| {
        shape_mismatch("MatMul", "batch dimensions do not broadcast", &[lhs, rhs])
    })?;
    if lhs.len() != 1 {
        out.push(m);
    }
    if rhs.len() != 1 {
        out.push(n);
    }
    Ok(out)
}

pub fn gather_output_shape(data: &[usize], indices: &[usize], axis: i64) -> Result<Vec<usize>, GraphError> {
    if data.is_empty() {
        return Err(shape_mismatch("Gather", "data must have rank >= 1", &[data, indices]));
    }
    let axis = normalize_axis("Gather", axis, data.len())?;
    let mut out = data[..axis].to_vec();
    out.extend_from_slice(indices);
    out.extend_from_slice(&data[axis + 1..]);
    Ok(out)
}

/// Required ScatterND `updates` shape: `indices.shape[:-1] + data.shape[k:]`.
pub fn scatternd_updates_shape(data: &[usize], indices: &[usize]) -> Result<Vec<usize>, GraphError> {
    let Some(&k) = indices.last() else {
        return Err(shape_mismatch(
            "ScatterND",
            "indices must have rank >= 1",
            &[data, indices],
        ));
    };
    if k == 0 || k > data.len() {
        return Err(shape_mismatch(
            "ScatterND",
            format!("indices.shape[-1] = {k} must be in [1, {}]", data.len()),
            &[data, indices],
        ));
    }
    let mut out = indices[..indices.len() - 1].to_vec();
    out.extend_from_slice(&data[k..]);
    Ok(out)
}

/// Gate order along the `4 * hidden_size` axis of LSTM weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LstmGate {
    Input,
    Output,
    Forget,
    Cell,
}

pub const LSTM_GATE_ORDER: [LstmGate; 4] = [
    LstmGate::Input,
    LstmGate::Output,
    LstmGate::Forget,
    LstmGate::Cell,
];

impl LstmGate {
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::Forget => 2,
            Self::Cell => 3,
        }
    }
}

/// Number of directions for an LSTM `direction` attribute value.
pub fn lstm_directions(direction: &str) -> Result<usize, GraphError> {
    match direction {
        "forward" | "reverse" => Ok(1),
        "bidirectional" => Ok(2),
        other => Err(attribute_error(
            "LSTM",
            "direction",
            format!("unknown direction {other}"),
        )),
    }
}

/// Slice result shape with ONNX clamping rules. Bounds are clamped per axis,
/// so `i64::MAX` ends mean "to the end".
pub fn slice_output_shape(
    data: &[usize],
    starts: &[i64],
    ends: &[i64],
    axes: &[i64],
    steps: &[i64],
) -> Result<Vec<usize>, GraphError> {
    let count = starts.len();
    if ends.len() != count || axes.len() != count || steps.len() != count {
        return Err(shape_mismatch(
            "Slice",
            format!(
                "starts/ends/axes/steps lengths differ: {}/{}/{}/{}",
                count,
                ends.len(),
                axes.len(),
                steps.len()
            ),
            &[data],
        ));
    }
    let mut out = data.to_vec();
    let mut seen = BTreeSet::new();
    for position in 0..count {
        let axis = normalize_axis("Slice", axes[position], data.len())?;
        if !seen.insert(axis) {
            return Err(shape_mismatch("Slice", format!("axis {axis} repeated"), &[data]));
        }
        let step = i128::from(steps[position]);
        if step == 0 {
            return Err(shape_mismatch("Slice", "steps must be non-zero", &[data]));
        }
        let dim = data[axis] as i128;
        let mut start = i128::from(starts[position]);
        let mut end = i128::from(ends[position]);
        if start < 0 {
            start += dim;
        }
        if end < 0 {
            end += dim;
        }
        let len = if dim == 0 {
            0
        } else if step > 0 {
            let start = start.clamp(0, dim);
            let end = end.clamp(0, dim);
            if end > start {
                (end - start + step - 1) / step
            } else {
                0
            }
        } else {
            let start = start.clamp(0, dim - 1);
            let end = end.clamp(-1, dim - 1);
            if start > end {
                (start - end - step - 1) / -step
            } else {
                0
            }
        };
        out[axis] = len as usize;
    }
    Ok(out)
}

fn infer_matmul(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let a_type = ctx.element_type(0, "A")?;
    ctx.expect_type(0, "A", MATMUL_TYPES)?;
    ctx.expect_type(1, "B", &[a_type])?;
    let shape = matmul_output_shape(&ctx.shape(0, "A")?, &ctx.shape(1, "B")?)?;
    Ok(vec![OutputDecl::new(a_type, shape)])
}

fn infer_gather(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    ctx.expect_type(1, "indices", INDEX_TYPES)?;
    let axis = ctx.int_attr("axis").unwrap_or(0);
    let shape = gather_output_shape(&ctx.shape(0, "data")?, &ctx.shape(1, "indices")?, axis)?;
    Ok(vec![OutputDecl::new(ctx.element_type(0, "data")?, shape)])
}

fn infer_scatternd(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let data_type = ctx.element_type(0, "data")?;
    ctx.expect_type(1, "indices", &[ElementType::Int64])?;
    ctx.expect_type(2, "updates", &[data_type])?;
    let reduction = ctx.string_attr("reduction", "none");
    if !matches!(reduction, "none" | "add" | "mul" | "max" | "min") {
        return Err(ctx.attribute_error("reduction", format!("unknown reduction {reduction}")));
    }

    let data = ctx.shape(0, "data")?;
    let indices = ctx.shape(1, "indices")?;
    let updates = ctx.shape(2, "updates")?;
    let required = scatternd_updates_shape(&data, &indices)?;
    if updates != required {
        let mut detail = format!("updates must have shape {required:?}");
        // Some runtimes accept indices.shape[0] + data.shape[k:] instead.
        let k = indices.last().copied().unwrap_or(0);
        let mut leading: Vec<usize> = indices.first().copied().into_iter().collect();
        leading.extend_from_slice(&data[k.min(data.len())..]);
        if leading == updates {
            detail.push_str("; given shape only matches the leading-axis variant");
        }
        return Err(ctx.mismatch(detail, &[&data, &indices, &updates]));
    }
    Ok(vec![OutputDecl::new(data_type, data)])
}

fn infer_lstm(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let float_type = ctx.element_type(0, "X")?;
    ctx.expect_type(0, "X", FLOAT_TYPES)?;
    for (index, label) in [(1, "W"), (2, "R"), (3, "B"), (5, "initial_h"), (6, "initial_c"), (7, "P")] {
        ctx.expect_type(index, label, &[float_type])?;
    }
    ctx.expect_type(4, "sequence_lens", &[ElementType::Int32])?;

    if ctx.int_attr("layout").unwrap_or(0) != 0 {
        return Err(ctx.attribute_error("layout", "only layout 0 (sequence-major) is supported"));
    }
    ctx.flag_attr("input_forget")?;
    let directions = lstm_directions(ctx.string_attr("direction", "forward"))?;

    let x = ctx.shape(0, "X")?;
    let w = ctx.shape(1, "W")?;
    let r = ctx.shape(2, "R")?;
    if x.len() != 3 || w.len() != 3 || r.len() != 3 {
        return Err(ctx.mismatch("X, W and R must be rank 3", &[&x, &w, &r]));
    }
    let hidden = match ctx.int_attr("hidden_size") {
        Some(value) if value > 0 => value as usize,
        Some(value) => {
            return Err(ctx.attribute_error("hidden_size", format!("must be positive, got {value}")));
        }
        None => r[2],
    };
    let (seq_length, batch, input_size) = (x[0], x[1], x[2]);
    let gates = LSTM_GATE_ORDER.len();

    ctx.expect_shape(1, "W", &[directions, gates * hidden, input_size])?;
    ctx.expect_shape(2, "R", &[directions, gates * hidden, hidden])?;
    ctx.expect_shape(3, "B", &[directions, 2 * gates * hidden])?;
    ctx.expect_shape(4, "sequence_lens", &[batch])?;
    ctx.expect_shape(5, "initial_h", &[directions, batch, hidden])?;
    ctx.expect_shape(6, "initial_c", &[directions, batch, hidden])?;
    ctx.expect_shape(7, "P", &[directions, 3 * hidden])?;

    let state = vec![directions, batch, hidden];
    Ok(vec![
        OutputDecl::new(float_type, vec![seq_length, directions, batch, hidden]),
        OutputDecl::new(float_type, state.clone()),
        OutputDecl::new(float_type, state),
    ])
}

fn infer_qlinear(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let quantized = ctx.element_type(0, "A")?;
    ctx.expect_type(0, "A", QUANTIZED_TYPES)?;
    ctx.expect_type(3, "B", &[quantized])?;
    for index in [1, 4, 6] {
        ctx.expect_type(index, QLINEAR_INPUTS[index], &[ElementType::Float32])?;
    }
    for index in [2, 5, 7] {
        ctx.expect_type(index, QLINEAR_INPUTS[index], &[quantized])?;
    }
    for index in [1, 2, 4, 5, 6, 7] {
        let shape = ctx.shape(index, QLINEAR_INPUTS[index])?;
        if !(shape.is_empty() || shape == [1]) {
            return Err(ctx.mismatch(
                format!("{} must be a scalar", QLINEAR_INPUTS[index]),
                &[&shape],
            ));
        }
    }
    let a = ctx.shape(0, "A")?;
    let b = ctx.shape(3, "B")?;
    let shape = broadcast_shape(&a, &b)
        .ok_or_else(|| ctx.mismatch("A and B do not broadcast", &[&a, &b]))?;
    Ok(vec![OutputDecl::new(quantized, shape)])
}

fn infer_cast(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let tag = ctx.int_attr("to").unwrap_or_default();
    let target = i32::try_from(tag)
        .ok()
        .and_then(|tag| ElementType::from_onnx_tag(tag).ok())
        .ok_or_else(|| ctx.attribute_error("to", format!("unsupported target type tag {tag}")))?;
    Ok(vec![OutputDecl::new(target, ctx.shape(0, "input")?)])
}

fn infer_gemm(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let float_type = ctx.element_type(0, "A")?;
    ctx.expect_type(0, "A", MATMUL_TYPES)?;
    ctx.expect_type(1, "B", &[float_type])?;
    ctx.expect_type(2, "C", &[float_type])?;

    let a = ctx.shape(0, "A")?;
    let b = ctx.shape(1, "B")?;
    if a.len() != 2 || b.len() != 2 {
        return Err(ctx.mismatch("A and B must be rank 2", &[&a, &b]));
    }
    let (m, k) = if ctx.flag_attr("transA")? {
        (a[1], a[0])
    } else {
        (a[0], a[1])
    };
    let (k_b, n) = if ctx.flag_attr("transB")? {
        (b[1], b[0])
    } else {
        (b[0], b[1])
    };
    if k != k_b {
        return Err(ctx.mismatch(format!("inner dimensions differ: {k} vs {k_b}"), &[&a, &b]));
    }
    if let Some(c) = ctx.optional_shape(2, "C")? {
        if !broadcasts_to(&c, &[m, n]) {
            return Err(ctx.mismatch(format!("C does not broadcast to [{m}, {n}]"), &[&c]));
        }
    }
    Ok(vec![OutputDecl::new(float_type, vec![m, n])])
}

fn window_params(
    ctx: &RuleContext<'_>,
    name: &str,
    spatial: usize,
    default: i64,
    min: i64,
) -> Result<Vec<i64>, GraphError> {
    let Some(values) = ctx.ints_attr(name) else {
        let len = if name == "pads" { 2 * spatial } else { spatial };
        return Ok(vec![default; len]);
    };
    let expected = if name == "pads" { 2 * spatial } else { spatial };
    if values.len() != expected {
        return Err(ctx.attribute_error(
            name,
            format!("expected {expected} values, got {}", values.len()),
        ));
    }
    if let Some(bad) = values.iter().find(|&&value| value < min) {
        return Err(ctx.attribute_error(name, format!("value {bad} is below {min}")));
    }
    Ok(values.to_vec())
}

/// Spatial output dims of a sliding-window operator (Conv, MaxPool).
fn window_output_dims(
    ctx: &RuleContext<'_>,
    input: &[usize],
    kernel: &[usize],
    ceil_mode: bool,
) -> Result<Vec<usize>, GraphError> {
    let spatial = input.len();
    let strides = window_params(ctx, "strides", spatial, 1, 1)?;
    let dilations = window_params(ctx, "dilations", spatial, 1, 1)?;
    let pads = window_params(ctx, "pads", spatial, 0, 0)?;
    let auto_pad = ctx.string_attr("auto_pad", "NOTSET");

    let mut out = Vec::with_capacity(spatial);
    for axis in 0..spatial {
        let stride = strides[axis] as usize;
        let effective = (kernel[axis].saturating_sub(1)) * dilations[axis] as usize + 1;
        let (pad_begin, pad_end) = match auto_pad {
            "NOTSET" => (pads[axis] as usize, pads[axis + spatial] as usize),
            "VALID" => (0, 0),
            other => {
                return Err(ctx.attribute_error(
                    "auto_pad",
                    format!("mode {other} is not supported, expected NOTSET or VALID"),
                ));
            }
        };
        let padded = input[axis] + pad_begin + pad_end;
        if padded < effective {
            return Err(ctx.mismatch(
                format!("window {effective} exceeds padded extent {padded} on axis {axis}"),
                &[input, kernel],
            ));
        }
        let span = padded - effective;
        let mut dim = if ceil_mode {
            span.div_ceil(stride)
        } else {
            span / stride
        } + 1;
        // The last window must start inside the input or the leading padding.
        if ceil_mode && (dim - 1) * stride >= input[axis] + pad_begin {
            dim -= 1;
        }
        out.push(dim);
    }
    Ok(out)
}

fn kernel_from_attribute(ctx: &RuleContext<'_>, spatial: usize) -> Result<Option<Vec<usize>>, GraphError> {
    let Some(kernel) = ctx.ints_attr("kernel_shape") else {
        return Ok(None);
    };
    if kernel.len() != spatial || kernel.iter().any(|&k| k < 1) {
        return Err(ctx.attribute_error(
            "kernel_shape",
            format!("expected {spatial} positive values, got {kernel:?}"),
        ));
    }
    Ok(Some(kernel.iter().map(|&k| k as usize).collect()))
}

fn infer_conv(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let float_type = ctx.element_type(0, "X")?;
    ctx.expect_type(0, "X", FLOAT_TYPES)?;
    ctx.expect_type(1, "W", &[float_type])?;
    ctx.expect_type(2, "B", &[float_type])?;

    let x = ctx.shape(0, "X")?;
    let w = ctx.shape(1, "W")?;
    if x.len() < 3 || w.len() != x.len() {
        return Err(ctx.mismatch("X must be [N, C, D...] and W must match its rank", &[&x, &w]));
    }
    let group = ctx.int_attr("group").unwrap_or(1);
    if group < 1 {
        return Err(ctx.attribute_error("group", format!("must be positive, got {group}")));
    }
    let group = group as usize;
    if x[1] != w[1] * group || w[0] % group != 0 {
        return Err(ctx.mismatch(
            format!("channels do not split into {group} groups"),
            &[&x, &w],
        ));
    }
    let spatial = x.len() - 2;
    let kernel = match kernel_from_attribute(ctx, spatial)? {
        Some(kernel) if kernel != w[2..] => {
            return Err(ctx.mismatch("kernel_shape disagrees with W", &[&kernel, &w]));
        }
        Some(kernel) => kernel,
        None => w[2..].to_vec(),
    };
    ctx.expect_shape(2, "B", &[w[0]])?;

    let mut shape = vec![x[0], w[0]];
    shape.extend(window_output_dims(ctx, &x[2..], &kernel, false)?);
    Ok(vec![OutputDecl::new(float_type, shape)])
}

fn infer_maxpool(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let element_type = ctx.element_type(0, "X")?;
    ctx.expect_type(
        0,
        "X",
        &[
            ElementType::Float32,
            ElementType::Float16,
            ElementType::Int8,
            ElementType::Uint8,
        ],
    )?;
    let x = ctx.shape(0, "X")?;
    if x.len() < 3 {
        return Err(ctx.mismatch("X must be [N, C, D...]", &[&x]));
    }
    let spatial = x.len() - 2;
    let kernel = kernel_from_attribute(ctx, spatial)?
        .ok_or_else(|| ctx.attribute_error("kernel_shape", "required but missing"))?;
    ctx.flag_attr("storage_order")?;
    let ceil_mode = ctx.flag_attr("ceil_mode")?;

    let mut shape = vec![x[0], x[1]];
    shape.extend(window_output_dims(ctx, &x[2..], &kernel, ceil_mode)?);
    Ok(vec![
        OutputDecl::new(element_type, shape.clone()),
        OutputDecl::new(ElementType::Int64, shape),
    ])
}

fn infer_slice(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let data = ctx.shape(0, "data")?;
    let starts = ctx.constant_ints(1, "starts")?.unwrap_or_default();
    let ends = ctx.constant_ints(2, "ends")?.unwrap_or_default();
    let axes = ctx
        .constant_ints(3, "axes")?
        .unwrap_or_else(|| (0..starts.len() as i64).collect());
    let steps = ctx
        .constant_ints(4, "steps")?
        .unwrap_or_else(|| vec![1; starts.len()]);
    let shape = slice_output_shape(&data, &starts, &ends, &axes, &steps)?;
    Ok(vec![OutputDecl::new(ctx.element_type(0, "data")?, shape)])
}

fn infer_resize(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let mode = ctx.string_attr("mode", "nearest");
    if !matches!(mode, "nearest" | "linear" | "cubic") {
        return Err(ctx.attribute_error("mode", format!("unknown mode {mode}")));
    }
    let transform = ctx.string_attr("coordinate_transformation_mode", "half_pixel");
    if !matches!(
        transform,
        "half_pixel"
            | "half_pixel_symmetric"
            | "pytorch_half_pixel"
            | "align_corners"
            | "asymmetric"
            | "tf_crop_and_resize"
    ) {
        return Err(ctx.attribute_error(
            "coordinate_transformation_mode",
            format!("unknown mode {transform}"),
        ));
    }

    let x = ctx.shape(0, "X")?;
    let scales = ctx.constant_floats(2, "scales")?;
    let sizes = ctx.constant_ints(3, "sizes")?;
    let shape: Vec<usize> = match (scales, sizes) {
        (Some(_), Some(_)) => {
            return Err(ctx.mismatch("only one of scales and sizes may be given", &[&x]));
        }
        (None, None) => {
            return Err(GraphError::Arity {
                op_type: ctx.op_type.to_string(),
                detail: "one of scales or sizes is required".to_string(),
            });
        }
        (None, Some(sizes)) => {
            if sizes.len() != x.len() || sizes.iter().any(|&size| size < 0) {
                return Err(ctx.mismatch(format!("invalid sizes {sizes:?}"), &[&x]));
            }
            sizes.iter().map(|&size| size as usize).collect()
        }
        (Some(scales), None) => {
            if scales.len() != x.len() || scales.iter().any(|&scale| scale <= 0.0) {
                return Err(ctx.mismatch(format!("invalid scales {scales:?}"), &[&x]));
            }
            x.iter()
                .zip(&scales)
                .map(|(&dim, &scale)| (dim as f64 * scale).floor() as usize)
                .collect()
        }
    };
    Ok(vec![OutputDecl::new(ctx.element_type(0, "X")?, shape)])
}

fn infer_shape(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    let data = ctx.shape(0, "data")?;
    let dims = data
        .iter()
        .map(|&dim| {
            i64::try_from(dim).map_err(|_| ctx.mismatch("dim exceeds int64", &[&data]))
        })
        .collect::<Result<Vec<i64>, _>>()?;
    let value = Tensor::from_values(vec![dims.len()], &dims)
        .map_err(|err| ctx.mismatch(err.to_string(), &[&data]))?;
    Ok(vec![
        OutputDecl::new(ElementType::Int64, vec![data.len()]).with_value(value),
    ])
}

fn infer_expand(ctx: &RuleContext<'_>) -> Result<Vec<OutputDecl>, GraphError> {
    ctx.expect_type(1, "shape", &[ElementType::Int64])?;
    let input = ctx.shape(0, "input")?;
    let shape_operand = ctx.shape(1, "shape")?;
    if shape_operand.len() != 1 {
        return Err(ctx.mismatch("shape must be 1-D", &[&shape_operand]));
    }
    let requested = ctx.constant_ints(1, "shape")?.unwrap_or_default();
    if requested.iter().any(|&dim| dim < 0) {
        return Err(ctx.mismatch(format!("negative dims in shape {requested:?}"), &[&input]));
    }
    let requested: Vec<usize> = requested.iter().map(|&dim| dim as usize).collect();
    let shape = broadcast_shape(&input, &requested).ok_or_else(|| {
        ctx.mismatch("input does not broadcast with shape", &[&input, &requested])
    })?;
    Ok(vec![OutputDecl::new(ctx.element_type(0, "input")?, shape)])
}
