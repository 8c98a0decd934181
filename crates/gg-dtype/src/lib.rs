#![forbid(unsafe_code)]

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

pub const DTYPE_REASON_CODES: [&str; 3] = [
    "dtype_tag_unsupported",
    "dtype_name_unknown",
    "dtype_format_invalid",
];

/// Element types a golden tensor may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Float16,
    BFloat16,
    Int8,
    Uint8,
    Int32,
    Int64,
    Bool,
}

pub const ALL_ELEMENT_TYPES: [ElementType; 8] = [
    ElementType::Float32,
    ElementType::Float16,
    ElementType::BFloat16,
    ElementType::Int8,
    ElementType::Uint8,
    ElementType::Int32,
    ElementType::Int64,
    ElementType::Bool,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DTypeError {
    UnsupportedTag(i32),
    UnknownName(String),
    InvalidFormat { exponent_bits: u32, mantissa_bits: u32 },
}

impl DTypeError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnsupportedTag(_) => "dtype_tag_unsupported",
            Self::UnknownName(_) => "dtype_name_unknown",
            Self::InvalidFormat { .. } => "dtype_format_invalid",
        }
    }
}

impl std::fmt::Display for DTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedTag(tag) => write!(f, "unsupported tensor data_type tag {tag}"),
            Self::UnknownName(name) => write!(f, "unknown element type name '{name}'"),
            Self::InvalidFormat {
                exponent_bits,
                mantissa_bits,
            } => write!(
                f,
                "invalid float format exponent_bits={exponent_bits} mantissa_bits={mantissa_bits}"
            ),
        }
    }
}

impl std::error::Error for DTypeError {}

impl ElementType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bool => "bool",
        }
    }

    /// `TensorProto.DataType` value used on the wire.
    #[must_use]
    pub const fn onnx_tag(self) -> i32 {
        match self {
            Self::Float32 => 1,
            Self::Uint8 => 2,
            Self::Int8 => 3,
            Self::Int32 => 6,
            Self::Int64 => 7,
            Self::Bool => 9,
            Self::Float16 => 10,
            Self::BFloat16 => 16,
        }
    }

    pub fn from_onnx_tag(tag: i32) -> Result<Self, DTypeError> {
        match tag {
            1 => Ok(Self::Float32),
            2 => Ok(Self::Uint8),
            3 => Ok(Self::Int8),
            6 => Ok(Self::Int32),
            7 => Ok(Self::Int64),
            9 => Ok(Self::Bool),
            10 => Ok(Self::Float16),
            16 => Ok(Self::BFloat16),
            other => Err(DTypeError::UnsupportedTag(other)),
        }
    }

    pub fn parse(name: &str) -> Result<Self, DTypeError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "float32" | "float" | "f32" => Ok(Self::Float32),
            "float16" | "half" | "f16" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            "int8" | "i8" => Ok(Self::Int8),
            "uint8" | "u8" => Ok(Self::Uint8),
            "int32" | "i32" => Ok(Self::Int32),
            "int64" | "i64" => Ok(Self::Int64),
            "bool" => Ok(Self::Bool),
            _ => Err(DTypeError::UnknownName(name.to_string())),
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Bool => 1,
            Self::Float16 | Self::BFloat16 => 2,
            Self::Float32 | Self::Int32 => 4,
            Self::Int64 => 8,
        }
    }

    /// Returns `true` for signed or unsigned integer types (not Bool).
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::Int8 | Self::Uint8 | Self::Int32 | Self::Int64)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float16 | Self::BFloat16)
    }

    /// Field layout of a floating-point type, `None` for integers and bool.
    #[must_use]
    pub const fn float_format(self) -> Option<FloatFormat> {
        match self {
            Self::Float32 => Some(FloatFormat::SINGLE),
            Self::Float16 => Some(FloatFormat::HALF),
            Self::BFloat16 => Some(FloatFormat::BFLOAT16),
            _ => None,
        }
    }

    /// Inclusive `(min, max)` for integer and bool types.
    #[must_use]
    pub const fn integer_range(self) -> Option<(i64, i64)> {
        match self {
            Self::Bool => Some((0, 1)),
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::Uint8 => Some((0, u8::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Binary layout of an IEEE-style float: sign bit, `exponent_bits`, `mantissa_bits`.
///
/// Every boundary constant is derived from the field widths so that narrow
/// types (half, bfloat16, or anything else) share one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FloatFormat {
    pub exponent_bits: u32,
    pub mantissa_bits: u32,
}

impl FloatFormat {
    pub const HALF: Self = Self {
        exponent_bits: 5,
        mantissa_bits: 10,
    };
    /// float32 with the low 16 mantissa bits dropped.
    pub const BFLOAT16: Self = Self {
        exponent_bits: 8,
        mantissa_bits: 7,
    };
    pub const SINGLE: Self = Self {
        exponent_bits: 8,
        mantissa_bits: 23,
    };

    pub fn new(exponent_bits: u32, mantissa_bits: u32) -> Result<Self, DTypeError> {
        // Narrower than 2 exponent bits has no normal range; wider than 11 leaves f64.
        if !(2..=11).contains(&exponent_bits) || mantissa_bits == 0 || mantissa_bits > 52 {
            return Err(DTypeError::InvalidFormat {
                exponent_bits,
                mantissa_bits,
            });
        }
        Ok(Self {
            exponent_bits,
            mantissa_bits,
        })
    }

    #[must_use]
    pub const fn bias(self) -> i32 {
        (1 << (self.exponent_bits - 1)) - 1
    }

    #[must_use]
    pub const fn min_normal_exponent(self) -> i32 {
        1 - self.bias()
    }

    #[must_use]
    pub const fn max_normal_exponent(self) -> i32 {
        (1 << self.exponent_bits) - 2 - self.bias()
    }

    #[must_use]
    pub fn smallest_normal(self) -> f64 {
        pow2(self.min_normal_exponent())
    }

    /// Value one binade below the smallest normal.
    #[must_use]
    pub fn subnormal(self) -> f64 {
        pow2(self.min_normal_exponent() - 1)
    }

    #[must_use]
    pub fn smallest_subnormal(self) -> f64 {
        pow2(self.min_normal_exponent() - self.mantissa_bits as i32)
    }

    /// `2^max_exp`, the largest normal power of two.
    #[must_use]
    pub fn largest_normal_power(self) -> f64 {
        pow2(self.max_normal_exponent())
    }

    /// A positive value that rounds to zero in this format.
    #[must_use]
    pub fn underflow_value(self) -> f64 {
        self.smallest_subnormal() / 64.0
    }
}

fn pow2(exponent: i32) -> f64 {
    2.0_f64.powi(exponent)
}

/// Round an f64 to the nearest half-precision value (ties to even).
#[must_use]
pub fn round_to_f16(value: f64) -> f16 {
    f16::from_f64(value)
}

/// Produce bfloat16 by masking the low 16 bits of the float32 representation.
///
/// The value is first narrowed to f32; no decimal round-trip is involved.
#[must_use]
pub fn truncate_to_bf16(value: f32) -> bf16 {
    bf16::from_bits((value.to_bits() >> 16) as u16)
}

/// Widen a masked bfloat16 back to the exact float32 it was taken from.
#[must_use]
pub fn bf16_to_f32_exact(value: bf16) -> f32 {
    f32::from_bits(u32::from(value.to_bits()) << 16)
}

#[cfg(test)]
mod tests {
    use super::{
        ALL_ELEMENT_TYPES, ElementType, FloatFormat, bf16_to_f32_exact, round_to_f16,
        truncate_to_bf16,
    };

    #[test]
    fn onnx_tags_roundtrip_for_all_types() {
        for dtype in ALL_ELEMENT_TYPES {
            let decoded = ElementType::from_onnx_tag(dtype.onnx_tag()).expect("known tag");
            assert_eq!(decoded, dtype);
            assert_eq!(ElementType::parse(dtype.name()).expect("known name"), dtype);
        }
    }

    #[test]
    fn unsupported_tags_are_rejected() {
        let err = ElementType::from_onnx_tag(11).expect_err("double is not supported");
        assert_eq!(err.reason_code(), "dtype_tag_unsupported");
        let err = ElementType::parse("complex64").expect_err("unknown name");
        assert_eq!(err.reason_code(), "dtype_name_unknown");
    }

    #[test]
    fn half_boundaries_follow_exponent_width() {
        let fmt = FloatFormat::HALF;
        assert_eq!(fmt.bias(), 15);
        assert_eq!(fmt.min_normal_exponent(), -14);
        assert_eq!(fmt.max_normal_exponent(), 15);
        assert_eq!(fmt.smallest_normal(), 2.0_f64.powi(-14));
        assert_eq!(fmt.subnormal(), 2.0_f64.powi(-15));
        assert_eq!(fmt.smallest_subnormal(), 2.0_f64.powi(-24));
        assert_eq!(fmt.largest_normal_power(), 32768.0);
    }

    #[test]
    fn bfloat16_boundaries_follow_exponent_width() {
        let fmt = FloatFormat::BFLOAT16;
        assert_eq!(fmt.bias(), 127);
        assert_eq!(fmt.smallest_normal(), 2.0_f64.powi(-126));
        assert_eq!(fmt.largest_normal_power(), 2.0_f64.powi(127));
        assert_eq!(
            FloatFormat::SINGLE.smallest_normal(),
            f64::from(f32::MIN_POSITIVE)
        );
    }

    #[test]
    fn custom_formats_derive_their_own_constants() {
        let e4m3 = FloatFormat::new(4, 3).expect("valid format");
        assert_eq!(e4m3.bias(), 7);
        assert_eq!(e4m3.smallest_normal(), 2.0_f64.powi(-6));
        assert_eq!(e4m3.max_normal_exponent(), 7);

        let err = FloatFormat::new(1, 3).expect_err("one exponent bit has no normals");
        assert_eq!(err.reason_code(), "dtype_format_invalid");
    }

    #[test]
    fn underflow_value_rounds_to_zero() {
        assert_eq!(round_to_f16(FloatFormat::HALF.underflow_value()).to_f32(), 0.0);
        let masked = truncate_to_bf16(FloatFormat::BFLOAT16.underflow_value() as f32);
        assert_eq!(bf16_to_f32_exact(masked), 0.0);
    }

    #[test]
    fn bf16_masking_is_exact_truncation() {
        let value = f32::from_bits(0x3F81_FFFF);
        let masked = truncate_to_bf16(value);
        assert_eq!(masked.to_bits(), 0x3F81);
        assert_eq!(bf16_to_f32_exact(masked).to_bits(), 0x3F81_0000);

        let nan = truncate_to_bf16(f32::NAN);
        assert!(bf16_to_f32_exact(nan).is_nan());
    }

    #[test]
    fn integer_ranges_match_native_bounds() {
        assert_eq!(ElementType::Int8.integer_range(), Some((-128, 127)));
        assert_eq!(ElementType::Uint8.integer_range(), Some((0, 255)));
        assert_eq!(ElementType::Float32.integer_range(), None);
        assert!(ElementType::BFloat16.is_float());
        assert!(!ElementType::Bool.is_integer());
    }
}
