#![forbid(unsafe_code)]

use core::fmt;

use gg_dtype::ElementType;
use gg_graph::{
    Attribute, AttributeValue, DEFAULT_DOMAIN, DEFAULT_OPSET, Dim, Graph, Node, OpsetImport,
    TensorDecl,
};
use gg_tensor::{NamedTensor, Tensor, TensorError, element_count};
use prost::Message;

pub const DEFAULT_IR_VERSION: i64 = 8;
pub const DEFAULT_PRODUCER_NAME: &str = "goldgen";

/// `TensorProto.DataLocation.EXTERNAL`.
const DATA_LOCATION_EXTERNAL: i32 = 1;

pub const WIRE_REASON_CODES: [&str; 10] = [
    "wire_element_type_unsupported",
    "wire_negative_dim",
    "wire_external_data",
    "wire_payload_mismatch",
    "wire_value_out_of_range",
    "wire_protobuf_malformed",
    "wire_tensor_invalid",
    "wire_graph_missing",
    "wire_value_info_incomplete",
    "wire_attribute_unsupported",
];

/// Hand-written subset of `onnx.proto` (proto2 field numbers).
pub mod proto {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct ModelProto {
        #[prost(int64, tag = "1")]
        pub ir_version: i64,
        #[prost(string, tag = "2")]
        pub producer_name: String,
        #[prost(string, tag = "3")]
        pub producer_version: String,
        #[prost(string, tag = "4")]
        pub domain: String,
        #[prost(int64, tag = "5")]
        pub model_version: i64,
        #[prost(string, tag = "6")]
        pub doc_string: String,
        #[prost(message, optional, tag = "7")]
        pub graph: Option<GraphProto>,
        #[prost(message, repeated, tag = "8")]
        pub opset_import: Vec<OperatorSetIdProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct OperatorSetIdProto {
        #[prost(string, tag = "1")]
        pub domain: String,
        #[prost(int64, tag = "2")]
        pub version: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct GraphProto {
        #[prost(message, repeated, tag = "1")]
        pub node: Vec<NodeProto>,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(message, repeated, tag = "5")]
        pub initializer: Vec<TensorProto>,
        #[prost(message, repeated, tag = "11")]
        pub input: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "12")]
        pub output: Vec<ValueInfoProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NodeProto {
        #[prost(string, repeated, tag = "1")]
        pub input: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub output: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(string, tag = "4")]
        pub op_type: String,
        #[prost(message, repeated, tag = "5")]
        pub attribute: Vec<AttributeProto>,
        #[prost(string, tag = "7")]
        pub domain: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AttributeProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(float, tag = "2")]
        pub f: f32,
        #[prost(int64, tag = "3")]
        pub i: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub s: Vec<u8>,
        #[prost(message, optional, tag = "5")]
        pub t: Option<TensorProto>,
        #[prost(float, repeated, tag = "7")]
        pub floats: Vec<f32>,
        #[prost(int64, repeated, tag = "8")]
        pub ints: Vec<i64>,
        #[prost(int32, tag = "20")]
        pub r#type: i32,
    }

    pub mod attribute_type {
        pub const FLOAT: i32 = 1;
        pub const INT: i32 = 2;
        pub const STRING: i32 = 3;
        pub const TENSOR: i32 = 4;
        pub const FLOATS: i32 = 6;
        pub const INTS: i32 = 7;
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorProto {
        #[prost(int64, repeated, tag = "1")]
        pub dims: Vec<i64>,
        #[prost(int32, tag = "2")]
        pub data_type: i32,
        #[prost(float, repeated, tag = "4")]
        pub float_data: Vec<f32>,
        #[prost(int32, repeated, tag = "5")]
        pub int32_data: Vec<i32>,
        #[prost(int64, repeated, tag = "7")]
        pub int64_data: Vec<i64>,
        #[prost(string, tag = "8")]
        pub name: String,
        #[prost(bytes = "vec", tag = "9")]
        pub raw_data: Vec<u8>,
        #[prost(message, repeated, tag = "13")]
        pub external_data: Vec<StringStringEntryProto>,
        #[prost(int32, tag = "14")]
        pub data_location: i32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct StringStringEntryProto {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ValueInfoProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub r#type: Option<TypeProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TypeProto {
        #[prost(message, optional, tag = "1")]
        pub tensor_type: Option<TensorTypeProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorTypeProto {
        #[prost(int32, tag = "1")]
        pub elem_type: i32,
        #[prost(message, optional, tag = "2")]
        pub shape: Option<TensorShapeProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorShapeProto {
        #[prost(message, repeated, tag = "1")]
        pub dim: Vec<tensor_shape_proto::Dimension>,
    }

    pub mod tensor_shape_proto {
        use prost::Message;

        #[derive(Clone, PartialEq, Message)]
        pub struct Dimension {
            #[prost(oneof = "dimension::Value", tags = "1, 2")]
            pub value: Option<dimension::Value>,
        }

        pub mod dimension {
            #[derive(Clone, PartialEq, prost::Oneof)]
            pub enum Value {
                #[prost(int64, tag = "1")]
                DimValue(i64),
                #[prost(string, tag = "2")]
                DimParam(String),
            }
        }
    }
}

use proto::tensor_shape_proto::{Dimension, dimension};
use proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeProto, TensorTypeProto, TypeProto, ValueInfoProto, attribute_type,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    UnsupportedElementType(i32),
    NegativeDim(i64),
    ExternalData,
    PayloadMismatch {
        shape: Vec<usize>,
        element_type: ElementType,
        bytes: usize,
    },
    ValueOutOfRange {
        element_type: ElementType,
        value: i64,
    },
    Malformed(String),
    Tensor(TensorError),
    MissingGraph,
    IncompleteValueInfo(String),
    UnsupportedAttribute {
        name: String,
        type_code: i32,
    },
}

impl WireError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnsupportedElementType(_) => "wire_element_type_unsupported",
            Self::NegativeDim(_) => "wire_negative_dim",
            Self::ExternalData => "wire_external_data",
            Self::PayloadMismatch { .. } => "wire_payload_mismatch",
            Self::ValueOutOfRange { .. } => "wire_value_out_of_range",
            Self::Malformed(_) => "wire_protobuf_malformed",
            Self::Tensor(_) => "wire_tensor_invalid",
            Self::MissingGraph => "wire_graph_missing",
            Self::IncompleteValueInfo(_) => "wire_value_info_incomplete",
            Self::UnsupportedAttribute { .. } => "wire_attribute_unsupported",
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedElementType(tag) => {
                write!(f, "tensor data_type {tag} is not supported")
            }
            Self::NegativeDim(dim) => write!(f, "negative dimension {dim}"),
            Self::ExternalData => write!(f, "tensor payload is stored externally"),
            Self::PayloadMismatch {
                shape,
                element_type,
                bytes,
            } => write!(
                f,
                "payload of {bytes} bytes does not fill {element_type} tensor of shape {shape:?}"
            ),
            Self::ValueOutOfRange {
                element_type,
                value,
            } => write!(f, "typed value {value} does not fit {element_type}"),
            Self::Malformed(detail) => write!(f, "malformed protobuf: {detail}"),
            Self::Tensor(err) => write!(f, "{err}"),
            Self::MissingGraph => write!(f, "model has no graph"),
            Self::IncompleteValueInfo(name) => {
                write!(f, "value info {name} lacks a tensor type or shape")
            }
            Self::UnsupportedAttribute { name, type_code } => {
                write!(f, "attribute {name} has unsupported type {type_code}")
            }
        }
    }
}

impl std::error::Error for WireError {}

impl From<TensorError> for WireError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Model-level fields that are not part of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMetadata {
    pub ir_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    /// Opset for the default domain when the graph declares none.
    pub default_opset: i64,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            ir_version: DEFAULT_IR_VERSION,
            producer_name: DEFAULT_PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            default_opset: DEFAULT_OPSET,
        }
    }
}

/// Serialize a tensor as `TensorProto` with a little-endian `raw_data` payload.
pub fn encode_tensor(tensor: &Tensor) -> Result<Vec<u8>, WireError> {
    Ok(tensor_to_proto("", tensor)?.encode_to_vec())
}

pub fn encode_named_tensor(named: &NamedTensor) -> Result<Vec<u8>, WireError> {
    Ok(tensor_to_proto(&named.name, &named.tensor)?.encode_to_vec())
}

pub fn decode_tensor(bytes: &[u8]) -> Result<Tensor, WireError> {
    decode_named_tensor(bytes).map(|named| named.tensor)
}

pub fn decode_named_tensor(bytes: &[u8]) -> Result<NamedTensor, WireError> {
    let proto = TensorProto::decode(bytes).map_err(|err| WireError::Malformed(err.to_string()))?;
    tensor_from_proto(&proto)
}

fn tensor_to_proto(name: &str, tensor: &Tensor) -> Result<TensorProto, WireError> {
    Ok(TensorProto {
        dims: dims_to_wire(tensor.shape())?,
        data_type: tensor.element_type().onnx_tag(),
        name: name.to_string(),
        raw_data: tensor.as_le_bytes().to_vec(),
        ..TensorProto::default()
    })
}

fn dims_to_wire(shape: &[usize]) -> Result<Vec<i64>, WireError> {
    shape
        .iter()
        .map(|&dim| i64::try_from(dim).map_err(|_| WireError::Tensor(TensorError::Overflow)))
        .collect()
}

fn tensor_from_proto(proto: &TensorProto) -> Result<NamedTensor, WireError> {
    if proto.data_location == DATA_LOCATION_EXTERNAL || !proto.external_data.is_empty() {
        return Err(WireError::ExternalData);
    }
    let element_type = ElementType::from_onnx_tag(proto.data_type)
        .map_err(|_| WireError::UnsupportedElementType(proto.data_type))?;
    let shape = proto
        .dims
        .iter()
        .map(|&dim| usize::try_from(dim).map_err(|_| WireError::NegativeDim(dim)))
        .collect::<Result<Vec<_>, _>>()?;
    let expected = element_count(&shape)?
        .checked_mul(element_type.item_size())
        .ok_or(WireError::Tensor(TensorError::Overflow))?;

    let bytes = if proto.raw_data.is_empty() {
        typed_payload(proto, element_type)?
    } else {
        proto.raw_data.clone()
    };
    if bytes.len() != expected {
        return Err(WireError::PayloadMismatch {
            shape,
            element_type,
            bytes: bytes.len(),
        });
    }
    let tensor = Tensor::from_le_bytes(shape, element_type, bytes)?;
    Ok(NamedTensor::new(proto.name.clone(), tensor))
}

/// Little-endian bytes from the typed repeated fields. Types narrower than 32
/// bits travel in `int32_data`, float16/bfloat16 as their bit patterns.
fn typed_payload(proto: &TensorProto, element_type: ElementType) -> Result<Vec<u8>, WireError> {
    let out_of_range = |value: i32| WireError::ValueOutOfRange {
        element_type,
        value: i64::from(value),
    };
    let mut bytes = Vec::new();
    match element_type {
        ElementType::Float32 => {
            for value in &proto.float_data {
                bytes.extend_from_slice(&value.to_bits().to_le_bytes());
            }
        }
        ElementType::Int64 => {
            for value in &proto.int64_data {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        ElementType::Int32 => {
            for value in &proto.int32_data {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        ElementType::Int8 => {
            for &value in &proto.int32_data {
                let narrowed = i8::try_from(value).map_err(|_| out_of_range(value))?;
                bytes.extend_from_slice(&narrowed.to_le_bytes());
            }
        }
        ElementType::Uint8 => {
            for &value in &proto.int32_data {
                bytes.push(u8::try_from(value).map_err(|_| out_of_range(value))?);
            }
        }
        ElementType::Bool => {
            for &value in &proto.int32_data {
                match value {
                    0 | 1 => bytes.push(value as u8),
                    other => return Err(out_of_range(other)),
                }
            }
        }
        ElementType::Float16 | ElementType::BFloat16 => {
            for &value in &proto.int32_data {
                let bits = u16::try_from(value).map_err(|_| out_of_range(value))?;
                bytes.extend_from_slice(&bits.to_le_bytes());
            }
        }
    }
    Ok(bytes)
}

/// Serialize a single-graph model. Deterministic: equal inputs give equal bytes.
pub fn encode_model(graph: &Graph, metadata: &ModelMetadata) -> Result<Vec<u8>, WireError> {
    let opset_import = if graph.opset_imports.is_empty() {
        vec![OperatorSetIdProto {
            domain: DEFAULT_DOMAIN.to_string(),
            version: metadata.default_opset,
        }]
    } else {
        graph
            .opset_imports
            .iter()
            .map(|import| OperatorSetIdProto {
                domain: import.domain.clone(),
                version: import.version,
            })
            .collect()
    };
    let model = ModelProto {
        ir_version: metadata.ir_version,
        producer_name: metadata.producer_name.clone(),
        producer_version: metadata.producer_version.clone(),
        graph: Some(graph_to_proto(graph)?),
        opset_import,
        ..ModelProto::default()
    };
    Ok(model.encode_to_vec())
}

fn graph_to_proto(graph: &Graph) -> Result<GraphProto, WireError> {
    Ok(GraphProto {
        node: graph
            .nodes
            .iter()
            .map(node_to_proto)
            .collect::<Result<_, _>>()?,
        name: graph.name.clone(),
        initializer: graph
            .initializers
            .iter()
            .map(|init| tensor_to_proto(&init.name, &init.tensor))
            .collect::<Result<_, _>>()?,
        input: graph.inputs.iter().map(value_info_to_proto).collect(),
        output: graph.outputs.iter().map(value_info_to_proto).collect(),
    })
}

fn node_to_proto(node: &Node) -> Result<NodeProto, WireError> {
    Ok(NodeProto {
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        name: node.name.clone(),
        op_type: node.op_type.clone(),
        attribute: node
            .attributes
            .iter()
            .map(attribute_to_proto)
            .collect::<Result<_, _>>()?,
        domain: node.domain.clone(),
    })
}

fn attribute_to_proto(attribute: &Attribute) -> Result<AttributeProto, WireError> {
    let mut proto = AttributeProto {
        name: attribute.name.clone(),
        ..AttributeProto::default()
    };
    match &attribute.value {
        AttributeValue::Int(value) => {
            proto.r#type = attribute_type::INT;
            proto.i = *value;
        }
        AttributeValue::Float(value) => {
            proto.r#type = attribute_type::FLOAT;
            proto.f = *value;
        }
        AttributeValue::String(value) => {
            proto.r#type = attribute_type::STRING;
            proto.s = value.as_bytes().to_vec();
        }
        AttributeValue::Ints(values) => {
            proto.r#type = attribute_type::INTS;
            proto.ints.clone_from(values);
        }
        AttributeValue::Floats(values) => {
            proto.r#type = attribute_type::FLOATS;
            proto.floats.clone_from(values);
        }
        AttributeValue::Tensor(tensor) => {
            proto.r#type = attribute_type::TENSOR;
            proto.t = Some(tensor_to_proto("", tensor)?);
        }
    }
    Ok(proto)
}

fn value_info_to_proto(decl: &TensorDecl) -> ValueInfoProto {
    let dim = decl
        .dims
        .iter()
        .map(|dim| Dimension {
            value: match dim {
                Dim::Fixed(value) => Some(dimension::Value::DimValue(*value as i64)),
                Dim::Dynamic => None,
            },
        })
        .collect();
    ValueInfoProto {
        name: decl.name.clone(),
        r#type: Some(TypeProto {
            tensor_type: Some(TensorTypeProto {
                elem_type: decl.element_type.onnx_tag(),
                shape: Some(TensorShapeProto { dim }),
            }),
        }),
    }
}

/// Parse a model written by [`encode_model`] (or any model within the same subset).
pub fn decode_model(bytes: &[u8]) -> Result<(Graph, ModelMetadata), WireError> {
    let model = ModelProto::decode(bytes).map_err(|err| WireError::Malformed(err.to_string()))?;
    let proto = model.graph.ok_or(WireError::MissingGraph)?;

    let opset_imports: Vec<OpsetImport> = model
        .opset_import
        .iter()
        .map(|import| OpsetImport {
            domain: import.domain.clone(),
            version: import.version,
        })
        .collect();
    let metadata = ModelMetadata {
        ir_version: model.ir_version,
        producer_name: model.producer_name,
        producer_version: model.producer_version,
        default_opset: opset_imports
            .iter()
            .find(|import| import.domain == DEFAULT_DOMAIN)
            .map_or(DEFAULT_OPSET, |import| import.version),
    };

    let graph = Graph {
        name: proto.name,
        nodes: proto
            .node
            .iter()
            .map(node_from_proto)
            .collect::<Result<_, _>>()?,
        inputs: proto
            .input
            .iter()
            .map(value_info_from_proto)
            .collect::<Result<_, _>>()?,
        outputs: proto
            .output
            .iter()
            .map(value_info_from_proto)
            .collect::<Result<_, _>>()?,
        initializers: proto
            .initializer
            .iter()
            .map(tensor_from_proto)
            .collect::<Result<_, _>>()?,
        opset_imports,
    };
    Ok((graph, metadata))
}

fn node_from_proto(proto: &NodeProto) -> Result<Node, WireError> {
    Ok(Node {
        op_type: proto.op_type.clone(),
        domain: proto.domain.clone(),
        name: proto.name.clone(),
        inputs: proto.input.clone(),
        outputs: proto.output.clone(),
        attributes: proto
            .attribute
            .iter()
            .map(attribute_from_proto)
            .collect::<Result<_, _>>()?,
    })
}

fn attribute_from_proto(proto: &AttributeProto) -> Result<Attribute, WireError> {
    let unsupported = || WireError::UnsupportedAttribute {
        name: proto.name.clone(),
        type_code: proto.r#type,
    };
    let name = proto.name.as_str();
    let attribute = match proto.r#type {
        attribute_type::INT => Attribute::int(name, proto.i),
        attribute_type::FLOAT => Attribute::float(name, proto.f),
        attribute_type::STRING => {
            let value = String::from_utf8(proto.s.clone()).map_err(|_| unsupported())?;
            Attribute::string(name, value)
        }
        attribute_type::INTS => Attribute::ints(name, &proto.ints),
        attribute_type::FLOATS => Attribute::floats(name, &proto.floats),
        attribute_type::TENSOR => {
            let tensor = proto.t.as_ref().ok_or_else(unsupported)?;
            Attribute::tensor(name, tensor_from_proto(tensor)?.tensor)
        }
        _ => return Err(unsupported()),
    };
    Ok(attribute)
}

fn value_info_from_proto(proto: &ValueInfoProto) -> Result<TensorDecl, WireError> {
    let incomplete = || WireError::IncompleteValueInfo(proto.name.clone());
    let tensor_type = proto
        .r#type
        .as_ref()
        .and_then(|ty| ty.tensor_type.as_ref())
        .ok_or_else(incomplete)?;
    let shape = tensor_type.shape.as_ref().ok_or_else(incomplete)?;
    let element_type = ElementType::from_onnx_tag(tensor_type.elem_type)
        .map_err(|_| WireError::UnsupportedElementType(tensor_type.elem_type))?;
    let dims = shape
        .dim
        .iter()
        .map(|dim| match dim.value {
            Some(dimension::Value::DimValue(value)) => usize::try_from(value)
                .map(Dim::Fixed)
                .map_err(|_| WireError::NegativeDim(value)),
            Some(dimension::Value::DimParam(_)) | None => Ok(Dim::Dynamic),
        })
        .collect::<Result<_, _>>()?;
    Ok(TensorDecl {
        name: proto.name.clone(),
        element_type,
        dims,
    })
}

#[cfg(test)]
mod tests {
    use super::proto::{StringStringEntryProto, TensorProto};
    use super::{
        ModelMetadata, decode_model, decode_named_tensor, decode_tensor, encode_model,
        encode_named_tensor, encode_tensor,
    };
    use gg_dtype::ElementType;
    use gg_graph::{Attribute, BuildRequest, Operand, OutputDims, TensorDecl, build};
    use gg_tensor::{NamedTensor, Tensor};
    use half::{bf16, f16};
    use prost::Message;
    use proptest::prelude::*;

    fn tensor_bytes(proto: &TensorProto) -> Vec<u8> {
        proto.encode_to_vec()
    }

    #[test]
    fn every_element_type_roundtrips_through_raw_data() {
        let tensors = [
            Tensor::from_values(vec![3], &[1.5_f32, f32::NEG_INFINITY, -0.0]).expect("f32"),
            Tensor::from_values(vec![2], &[f16::from_f32(0.5), f16::NAN]).expect("f16"),
            Tensor::from_values(vec![2], &[bf16::from_bits(0x0001), bf16::INFINITY])
                .expect("bf16"),
            Tensor::from_values(vec![2, 2], &[-128_i8, 127, 0, -1]).expect("i8"),
            Tensor::from_values(vec![2], &[0_u8, 255]).expect("u8"),
            Tensor::from_values(vec![1], &[i32::MIN]).expect("i32"),
            Tensor::from_values(vec![2], &[i64::MIN, i64::MAX]).expect("i64"),
            Tensor::from_values(vec![3], &[true, false, true]).expect("bool"),
            Tensor::scalar(7_i64),
            Tensor::from_values::<f32>(vec![0, 3], &[]).expect("empty"),
        ];
        for tensor in tensors {
            let bytes = encode_tensor(&tensor).expect("encode");
            assert_eq!(decode_tensor(&bytes).expect("decode"), tensor);
            assert_eq!(encode_tensor(&tensor).expect("re-encode"), bytes);
        }
    }

    #[test]
    fn named_tensors_keep_their_name() {
        let named = NamedTensor::new("input_0", Tensor::scalar(1.0_f32));
        let decoded = decode_named_tensor(&encode_named_tensor(&named).expect("encode"))
            .expect("decode");
        assert_eq!(decoded, named);
    }

    #[test]
    fn typed_fields_are_accepted_on_decode() {
        let floats = TensorProto {
            dims: vec![2],
            data_type: ElementType::Float32.onnx_tag(),
            float_data: vec![1.0, -2.5],
            ..TensorProto::default()
        };
        let tensor = decode_tensor(&tensor_bytes(&floats)).expect("float_data");
        assert_eq!(tensor.values::<f32>().expect("f32"), vec![1.0, -2.5]);

        let halves = TensorProto {
            dims: vec![2],
            data_type: ElementType::Float16.onnx_tag(),
            int32_data: vec![0x3C00, 0x7E00],
            ..TensorProto::default()
        };
        let tensor = decode_tensor(&tensor_bytes(&halves)).expect("f16 bits");
        let values = tensor.values::<f16>().expect("f16");
        assert_eq!(values[0].to_f32(), 1.0);
        assert!(values[1].is_nan());

        let bytes = TensorProto {
            dims: vec![3],
            data_type: ElementType::Int8.onnx_tag(),
            int32_data: vec![-5, 0, 100],
            ..TensorProto::default()
        };
        let tensor = decode_tensor(&tensor_bytes(&bytes)).expect("int8 via int32_data");
        assert_eq!(tensor.values::<i8>().expect("i8"), vec![-5, 0, 100]);

        let wide = TensorProto {
            dims: vec![1],
            data_type: ElementType::Int64.onnx_tag(),
            int64_data: vec![i64::MAX],
            ..TensorProto::default()
        };
        assert_eq!(
            decode_tensor(&tensor_bytes(&wide)).expect("int64_data").to_i64_values().expect("i64"),
            vec![i64::MAX]
        );

        let overflow = TensorProto {
            dims: vec![1],
            data_type: ElementType::Uint8.onnx_tag(),
            int32_data: vec![300],
            ..TensorProto::default()
        };
        let err = decode_tensor(&tensor_bytes(&overflow)).expect_err("300 is not u8");
        assert_eq!(err.reason_code(), "wire_value_out_of_range");
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let double = TensorProto {
            dims: vec![1],
            data_type: 11,
            raw_data: vec![0; 8],
            ..TensorProto::default()
        };
        let err = decode_tensor(&tensor_bytes(&double)).expect_err("double unsupported");
        assert_eq!(err.reason_code(), "wire_element_type_unsupported");

        let negative = TensorProto {
            dims: vec![-1],
            data_type: ElementType::Float32.onnx_tag(),
            ..TensorProto::default()
        };
        let err = decode_tensor(&tensor_bytes(&negative)).expect_err("negative dim");
        assert_eq!(err.reason_code(), "wire_negative_dim");

        let external = TensorProto {
            dims: vec![1],
            data_type: ElementType::Float32.onnx_tag(),
            external_data: vec![StringStringEntryProto {
                key: "location".to_string(),
                value: "weights.bin".to_string(),
            }],
            ..TensorProto::default()
        };
        let err = decode_tensor(&tensor_bytes(&external)).expect_err("external data");
        assert_eq!(err.reason_code(), "wire_external_data");

        let short = TensorProto {
            dims: vec![2, 2],
            data_type: ElementType::Float32.onnx_tag(),
            raw_data: vec![0; 12],
            ..TensorProto::default()
        };
        let err = decode_tensor(&tensor_bytes(&short)).expect_err("12 bytes for 4 floats");
        assert_eq!(err.reason_code(), "wire_payload_mismatch");

        let err = decode_tensor(&[0x0A, 0xFF, 0xFF]).expect_err("truncated varint");
        assert_eq!(err.reason_code(), "wire_protobuf_malformed");
    }

    #[test]
    fn models_roundtrip_through_protobuf() {
        let indices = Tensor::from_values(vec![2], &[0_i64, 2]).expect("indices");
        let request = BuildRequest::new("test_gather_axis1", "Gather")
            .operand(Operand::Declared(TensorDecl::fixed(
                "data",
                ElementType::Float32,
                &[2, 3, 4],
            )))
            .operand(Operand::Initializer(NamedTensor::new("indices", indices)))
            .attribute(Attribute::int("axis", 1))
            .output_dims(OutputDims::RankOnly);
        let graph = build(&request).expect("gather graph");
        let metadata = ModelMetadata::default();

        let bytes = encode_model(&graph, &metadata).expect("encode model");
        assert_eq!(encode_model(&graph, &metadata).expect("again"), bytes);
        let (decoded, decoded_metadata) = decode_model(&bytes).expect("decode model");
        assert_eq!(decoded, graph);
        assert_eq!(decoded_metadata, metadata);
    }

    #[test]
    fn qlinear_models_import_both_domains() {
        let q = |name: &str| Operand::Declared(TensorDecl::fixed(name, ElementType::Int8, &[]));
        let s = |name: &str| Operand::Declared(TensorDecl::fixed(name, ElementType::Float32, &[]));
        let request = BuildRequest::new("qlinearmul_int8", "QLinearMul")
            .operand(q("a"))
            .operand(s("a_scale"))
            .operand(q("a_zero_point"))
            .operand(q("b"))
            .operand(s("b_scale"))
            .operand(q("b_zero_point"))
            .operand(s("c_scale"))
            .operand(q("c_zero_point"));
        let graph = build(&request).expect("qlinear graph");
        let bytes = encode_model(&graph, &ModelMetadata::default()).expect("encode");
        let (decoded, _) = decode_model(&bytes).expect("decode");
        assert_eq!(decoded.opset_version("com.microsoft"), Some(1));
        assert_eq!(decoded.nodes[0].domain, "com.microsoft");
    }

    #[test]
    fn model_without_graph_is_rejected() {
        let err = decode_model(&[]).expect_err("empty model");
        assert_eq!(err.reason_code(), "wire_graph_missing");
    }

    proptest! {
        #[test]
        fn float32_bit_patterns_survive(bits in proptest::collection::vec(any::<u32>(), 1..32)) {
            let values: Vec<f32> = bits.iter().map(|&b| f32::from_bits(b)).collect();
            let tensor = Tensor::from_values(vec![values.len()], &values).expect("tensor");
            let decoded = decode_tensor(&encode_tensor(&tensor).expect("encode")).expect("decode");
            let decoded_bits: Vec<u32> = decoded
                .values::<f32>()
                .expect("f32")
                .iter()
                .map(|v| v.to_bits())
                .collect();
            prop_assert_eq!(decoded_bits, bits);
        }

        #[test]
        fn half_bit_patterns_survive(bits in proptest::collection::vec(any::<u16>(), 1..32)) {
            let values: Vec<f16> = bits.iter().map(|&b| f16::from_bits(b)).collect();
            let tensor = Tensor::from_values(vec![values.len()], &values).expect("tensor");
            let decoded = decode_tensor(&encode_tensor(&tensor).expect("encode")).expect("decode");
            prop_assert_eq!(decoded.as_le_bytes(), tensor.as_le_bytes());
        }

        #[test]
        fn bfloat16_bit_patterns_survive(bits in proptest::collection::vec(any::<u16>(), 1..32)) {
            let values: Vec<bf16> = bits.iter().map(|&b| bf16::from_bits(b)).collect();
            let tensor = Tensor::from_values(vec![values.len()], &values).expect("tensor");
            let decoded = decode_tensor(&encode_tensor(&tensor).expect("encode")).expect("decode");
            let decoded_bits: Vec<u16> = decoded
                .values::<bf16>()
                .expect("bf16")
                .iter()
                .map(|v| v.to_bits())
                .collect();
            prop_assert_eq!(&decoded_bits, &bits);

            let typed = TensorProto {
                dims: vec![bits.len() as i64],
                data_type: ElementType::BFloat16.onnx_tag(),
                int32_data: bits.iter().map(|&b| i32::from(b)).collect(),
                ..TensorProto::default()
            };
            let from_typed = decode_tensor(&tensor_bytes(&typed)).expect("bf16 via int32_data");
            prop_assert_eq!(from_typed.as_le_bytes(), tensor.as_le_bytes());
        }
    }
}
