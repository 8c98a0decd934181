#![forbid(unsafe_code)]

use gg_dtype::ElementType;
use half::{bf16, f16};

pub const TENSOR_REASON_CODES: [&str; 4] = [
    "tensor_value_count_mismatch",
    "tensor_byte_length_mismatch",
    "tensor_element_type_mismatch",
    "tensor_shape_overflow",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    ValueCountMismatch { shape: Vec<usize>, values: usize },
    ByteLengthMismatch {
        shape: Vec<usize>,
        element_type: ElementType,
        bytes: usize,
    },
    ElementTypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },
    Overflow,
}

impl TensorError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ValueCountMismatch { .. } => "tensor_value_count_mismatch",
            Self::ByteLengthMismatch { .. } => "tensor_byte_length_mismatch",
            Self::ElementTypeMismatch { .. } => "tensor_element_type_mismatch",
            Self::Overflow => "tensor_shape_overflow",
        }
    }
}

impl std::fmt::Display for TensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValueCountMismatch { shape, values } => {
                write!(f, "shape {shape:?} requires a different count than {values} values")
            }
            Self::ByteLengthMismatch {
                shape,
                element_type,
                bytes,
            } => write!(
                f,
                "{bytes} bytes do not match shape {shape:?} of {element_type}"
            ),
            Self::ElementTypeMismatch { expected, actual } => {
                write!(f, "element type mismatch expected={expected} actual={actual}")
            }
            Self::Overflow => write!(f, "size arithmetic overflow"),
        }
    }
}

impl std::error::Error for TensorError {}

/// Number of elements described by `shape`; the empty shape is a scalar.
pub fn element_count(shape: &[usize]) -> Result<usize, TensorError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or(TensorError::Overflow)
    })
}

/// Multidirectional (numpy-style) broadcast of two shapes.
///
/// Returns `None` when a pair of trailing-aligned axes differ and neither is 1.
#[must_use]
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let nd = lhs.len().max(rhs.len());
    let mut out = Vec::with_capacity(nd);

    for idx in 0..nd {
        let l = *lhs.get(lhs.len().wrapping_sub(1 + idx)).unwrap_or(&1);
        let r = *rhs.get(rhs.len().wrapping_sub(1 + idx)).unwrap_or(&1);

        let merged = if l == r {
            l
        } else if l == 1 {
            r
        } else if r == 1 {
            l
        } else {
            return None;
        };
        out.push(merged);
    }

    out.reverse();
    Some(out)
}

/// True when `from` can be stretched to exactly `to` (ONNX unidirectional broadcast).
#[must_use]
pub fn broadcasts_to(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let offset = to.len() - from.len();
    from.iter()
        .enumerate()
        .all(|(axis, &dim)| dim == 1 || dim == to[axis + offset])
}

/// Scalar types that can live inside a [`Tensor`].
pub trait Element: Copy {
    const ELEMENT_TYPE: ElementType;

    fn write_le(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `ELEMENT_TYPE.item_size()` long.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $width:literal) => {
        impl Element for $ty {
            const ELEMENT_TYPE: ElementType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $width];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(f32, ElementType::Float32, 4);
impl_element!(i8, ElementType::Int8, 1);
impl_element!(u8, ElementType::Uint8, 1);
impl_element!(i32, ElementType::Int32, 4);
impl_element!(i64, ElementType::Int64, 8);

impl Element for f16 {
    const ELEMENT_TYPE: ElementType = ElementType::Float16;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl Element for bf16 {
    const ELEMENT_TYPE: ElementType = ElementType::BFloat16;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        bf16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl Element for bool {
    const ELEMENT_TYPE: ElementType = ElementType::Bool;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Dense tensor: shape, element type and raw little-endian element bytes.
///
/// Equality is byte equality, so two NaNs compare equal exactly when their
/// bit patterns match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    shape: Vec<usize>,
    element_type: ElementType,
    bytes: Vec<u8>,
}

impl Tensor {
    pub fn from_values<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, TensorError> {
        let expected = element_count(&shape)?;
        if values.len() != expected {
            return Err(TensorError::ValueCountMismatch {
                shape,
                values: values.len(),
            });
        }
        let mut bytes = Vec::with_capacity(expected * T::ELEMENT_TYPE.item_size());
        for &value in values {
            value.write_le(&mut bytes);
        }
        Ok(Self {
            shape,
            element_type: T::ELEMENT_TYPE,
            bytes,
        })
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        let mut bytes = Vec::with_capacity(T::ELEMENT_TYPE.item_size());
        value.write_le(&mut bytes);
        Self {
            shape: Vec::new(),
            element_type: T::ELEMENT_TYPE,
            bytes,
        }
    }

    pub fn from_le_bytes(
        shape: Vec<usize>,
        element_type: ElementType,
        bytes: Vec<u8>,
    ) -> Result<Self, TensorError> {
        let expected = element_count(&shape)?
            .checked_mul(element_type.item_size())
            .ok_or(TensorError::Overflow)?;
        if bytes.len() != expected {
            return Err(TensorError::ByteLengthMismatch {
                shape,
                element_type,
                bytes: bytes.len(),
            });
        }
        Ok(Self {
            shape,
            element_type,
            bytes,
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len() / self.element_type.item_size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_le_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_le_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn values<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(TensorError::ElementTypeMismatch {
                expected: T::ELEMENT_TYPE,
                actual: self.element_type,
            });
        }
        Ok(self
            .bytes
            .chunks_exact(self.element_type.item_size())
            .map(T::read_le)
            .collect())
    }

    /// Integer view for int8/uint8/int32/int64/bool tensors.
    pub fn to_i64_values(&self) -> Result<Vec<i64>, TensorError> {
        match self.element_type {
            ElementType::Int8 => Ok(self.values::<i8>()?.into_iter().map(i64::from).collect()),
            ElementType::Uint8 => Ok(self.values::<u8>()?.into_iter().map(i64::from).collect()),
            ElementType::Int32 => Ok(self.values::<i32>()?.into_iter().map(i64::from).collect()),
            ElementType::Int64 => self.values::<i64>(),
            ElementType::Bool => Ok(self.values::<bool>()?.into_iter().map(i64::from).collect()),
            other => Err(TensorError::ElementTypeMismatch {
                expected: ElementType::Int64,
                actual: other,
            }),
        }
    }

    /// Widened float view; narrow floats convert exactly.
    pub fn to_f64_values(&self) -> Result<Vec<f64>, TensorError> {
        match self.element_type {
            ElementType::Float32 => Ok(self.values::<f32>()?.into_iter().map(f64::from).collect()),
            ElementType::Float16 => Ok(self.values::<f16>()?.into_iter().map(f64::from).collect()),
            ElementType::BFloat16 => {
                Ok(self.values::<bf16>()?.into_iter().map(f64::from).collect())
            }
            _ => Ok(self
                .to_i64_values()?
                .into_iter()
                .map(|value| value as f64)
                .collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Tensor,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Tensor, TensorError, broadcast_shape, broadcasts_to, element_count};
    use gg_dtype::ElementType;
    use half::{bf16, f16};

    #[test]
    fn broadcast_shape_matches_numpy_style() {
        let out = broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]).expect("broadcast should succeed");
        assert_eq!(out, vec![8, 7, 6, 5]);
        assert!(broadcast_shape(&[4, 3], &[5, 3]).is_none());
    }

    #[test]
    fn unidirectional_broadcast_requires_target_rank() {
        assert!(broadcasts_to(&[4], &[2, 4]));
        assert!(broadcasts_to(&[1, 4], &[2, 4]));
        assert!(!broadcasts_to(&[3], &[2, 4]));
        assert!(!broadcasts_to(&[1, 2, 4], &[2, 4]));
    }

    #[test]
    fn scalar_shape_holds_exactly_one_value() {
        assert_eq!(element_count(&[]).expect("scalar count"), 1);
        let scalar = Tensor::scalar(7_i64);
        assert_eq!(scalar.rank(), 0);
        assert_eq!(scalar.len(), 1);

        let err = Tensor::from_values::<f32>(Vec::new(), &[]).expect_err("scalar needs a value");
        assert_eq!(err.reason_code(), "tensor_value_count_mismatch");
    }

    #[test]
    fn zero_sized_dimensions_hold_no_bytes() {
        let empty = Tensor::from_values::<i64>(vec![0], &[]).expect("empty tensor");
        assert!(empty.is_empty());
        assert_eq!(empty.shape(), &[0]);
    }

    #[test]
    fn byte_constructor_checks_footprint() {
        let err = Tensor::from_le_bytes(vec![2, 2], ElementType::Float16, vec![0; 6])
            .expect_err("short payload");
        assert!(matches!(err, TensorError::ByteLengthMismatch { .. }));
        let ok = Tensor::from_le_bytes(vec![2, 2], ElementType::Float16, vec![0; 8])
            .expect("exact payload");
        assert_eq!(ok.values::<f16>().expect("f16 view").len(), 4);
    }

    #[test]
    fn nan_payloads_survive_byte_storage() {
        let quiet = f32::from_bits(0x7FC0_0001);
        let other = f32::from_bits(0x7FC0_0002);
        let a = Tensor::from_values(vec![1], &[quiet]).expect("tensor");
        let b = Tensor::from_values(vec![1], &[other]).expect("tensor");
        assert_ne!(a, b);
        let back = a.values::<f32>().expect("f32 view");
        assert_eq!(back[0].to_bits(), 0x7FC0_0001);
    }

    #[test]
    fn typed_views_reject_wrong_element_type() {
        let t = Tensor::from_values(vec![2], &[bf16::from_f32(1.0), bf16::from_f32(2.0)])
            .expect("bf16 tensor");
        let err = t.values::<f32>().expect_err("wrong view");
        assert_eq!(err.reason_code(), "tensor_element_type_mismatch");
        assert_eq!(t.to_f64_values().expect("widen"), vec![1.0, 2.0]);
    }

    #[test]
    fn integer_views_widen_every_integer_type() {
        let t = Tensor::from_values(vec![3], &[-1_i8, 0, 127]).expect("i8 tensor");
        assert_eq!(t.to_i64_values().expect("widen"), vec![-1, 0, 127]);
        let b = Tensor::from_values(vec![2], &[true, false]).expect("bool tensor");
        assert_eq!(b.to_i64_values().expect("widen"), vec![1, 0]);
        assert_eq!(b.as_le_bytes(), &[1, 0]);
    }
}
