#![forbid(unsafe_code)]

use gg_dtype::{ElementType, FloatFormat, round_to_f16, truncate_to_bf16};
use gg_tensor::{Tensor, TensorError, element_count};
use serde::{Deserialize, Serialize};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
const MIX_CONST1: u64 = 0xBF58_476D_1CE4_E5B9;
const MIX_CONST2: u64 = 0x94D0_49BB_1331_11EB;
const FNV_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;
pub const DEFAULT_SEED: u64 = 0;

/// Magnitude bound for the seeded filler that follows the edge-case prefix.
pub const EDGE_FILL_MAGNITUDE: f64 = 10.0;

pub const SYNTH_REASON_CODES: [&str; 5] = [
    "synth_policy_type_mismatch",
    "synth_integer_range_invalid",
    "synth_shape_too_small",
    "synth_value_unrepresentable",
    "synth_shape_invalid",
];

/// Every variant is a configuration error: the request cannot be satisfied for
/// the given element type, so the case aborts without retry.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthError {
    PolicyTypeMismatch {
        policy: &'static str,
        element_type: ElementType,
    },
    InvalidRange {
        low: i64,
        high: i64,
        element_type: ElementType,
    },
    ShapeTooSmall { required: usize, available: usize },
    Unrepresentable { value: f64, element_type: ElementType },
    Shape(TensorError),
}

impl SynthError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::PolicyTypeMismatch { .. } => "synth_policy_type_mismatch",
            Self::InvalidRange { .. } => "synth_integer_range_invalid",
            Self::ShapeTooSmall { .. } => "synth_shape_too_small",
            Self::Unrepresentable { .. } => "synth_value_unrepresentable",
            Self::Shape(_) => "synth_shape_invalid",
        }
    }
}

impl std::fmt::Display for SynthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyTypeMismatch {
                policy,
                element_type,
            } => write!(f, "policy {policy} cannot produce {element_type} values"),
            Self::InvalidRange {
                low,
                high,
                element_type,
            } => write!(
                f,
                "integer range [{low}, {high}) is empty or outside {element_type}"
            ),
            Self::ShapeTooSmall {
                required,
                available,
            } => write!(
                f,
                "edge-case vector needs {required} elements but shape holds {available}"
            ),
            Self::Unrepresentable {
                value,
                element_type,
            } => write!(f, "value {value} is not representable as {element_type}"),
            Self::Shape(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SynthError {}

impl From<TensorError> for SynthError {
    fn from(value: TensorError) -> Self {
        Self::Shape(value)
    }
}

/// Counter-based splitmix64 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterministicRng {
    stream_seed: u64,
    counter: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            stream_seed: seed,
            counter: 0,
        }
    }

    /// Independent stream for one named case under a run-wide seed.
    #[must_use]
    pub fn for_case(seed: u64, case_name: &str) -> Self {
        let name_hash = case_name.bytes().fold(FNV_OFFSET, |acc, byte| {
            (acc ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
        Self::new(splitmix64(seed ^ name_hash))
    }

    #[must_use]
    pub const fn state(self) -> (u64, u64) {
        (self.stream_seed, self.counter)
    }

    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(1);
        splitmix64(
            self.stream_seed
                .wrapping_add(self.counter.wrapping_mul(GOLDEN_GAMMA)),
        )
    }

    #[must_use]
    pub fn next_f64(&mut self) -> f64 {
        // High 53 bits give a uniform mantissa in [0, 1).
        let sample = self.next_u64() >> 11;
        sample as f64 / (1u64 << 53) as f64
    }

    /// Uniform in `[0, upper_bound)`; `upper_bound` must be non-zero.
    #[must_use]
    pub fn bounded_u64(&mut self, upper_bound: u64) -> u64 {
        debug_assert!(upper_bound > 0);
        let upper_bound = upper_bound.max(1);
        let threshold = u64::MAX - u64::MAX % upper_bound;

        loop {
            let candidate = self.next_u64();
            if candidate < threshold {
                return candidate % upper_bound;
            }
        }
    }

    /// Uniform in `[low, high)`; callers guarantee `low < high`.
    #[must_use]
    pub fn range_i64(&mut self, low: i64, high: i64) -> i64 {
        let span = (i128::from(high) - i128::from(low)).max(1);
        let offset = if span > i128::from(u64::MAX) {
            self.next_u64()
        } else {
            self.bounded_u64(span as u64)
        };
        (i128::from(low) + i128::from(offset)) as i64
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(MIX_CONST1);
    z = (z ^ (z >> 27)).wrapping_mul(MIX_CONST2);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SynthesisPolicy {
    /// Uniform in `[0, 1)`; floating types only.
    UniformUnit,
    /// Uniform integers in `[low, high)`; integer and bool types only.
    UniformInt { low: i64, high: i64 },
    /// Edge-case prefix from the type's float format, seeded filler after it.
    EdgeCases,
    /// Every element set to `value`.
    Fill { value: f64 },
    /// Literal elements in row-major order; the count must match the shape.
    Values { values: Vec<f64> },
}

impl SynthesisPolicy {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UniformUnit => "uniform_unit",
            Self::UniformInt { .. } => "uniform_int",
            Self::EdgeCases => "edge_cases",
            Self::Fill { .. } => "fill",
            Self::Values { .. } => "values",
        }
    }
}

pub fn synthesize(
    shape: &[usize],
    element_type: ElementType,
    policy: &SynthesisPolicy,
    rng: &mut DeterministicRng,
) -> Result<Tensor, SynthError> {
    let count = element_count(shape)?;
    match policy {
        SynthesisPolicy::UniformUnit => {
            let format = float_format_for(policy, element_type)?;
            // Draw on the format's own grid so narrowing can never round up to 1.0.
            let grid_bits = (format.mantissa_bits + 1).min(53);
            let grid = 1u64 << grid_bits;
            let values: Vec<f64> = (0..count)
                .map(|_| rng.bounded_u64(grid) as f64 / grid as f64)
                .collect();
            encode_floats(shape, element_type, &values)
        }
        SynthesisPolicy::UniformInt { low, high } => {
            let (min, max) = element_type.integer_range().ok_or(
                SynthError::PolicyTypeMismatch {
                    policy: policy.label(),
                    element_type,
                },
            )?;
            if low >= high || *low < min || i128::from(*high) > i128::from(max) + 1 {
                return Err(SynthError::InvalidRange {
                    low: *low,
                    high: *high,
                    element_type,
                });
            }
            let values: Vec<i64> = (0..count).map(|_| rng.range_i64(*low, *high)).collect();
            encode_integers(shape, element_type, &values)
        }
        SynthesisPolicy::EdgeCases => {
            let format = float_format_for(policy, element_type)?;
            let edges = edge_case_values(format);
            if count < edges.len() {
                return Err(SynthError::ShapeTooSmall {
                    required: edges.len(),
                    available: count,
                });
            }
            let mut values = edges;
            while values.len() < count {
                values.push(rng.next_f64() * 2.0 * EDGE_FILL_MAGNITUDE - EDGE_FILL_MAGNITUDE);
            }
            encode_floats(shape, element_type, &values)
        }
        SynthesisPolicy::Fill { value } => {
            if element_type.is_float() {
                encode_floats(shape, element_type, &vec![*value; count])
            } else {
                let as_int = integral_in_range(*value, element_type)?;
                encode_integers(shape, element_type, &vec![as_int; count])
            }
        }
        SynthesisPolicy::Values { values } => {
            if element_type.is_float() {
                encode_floats(shape, element_type, values)
            } else {
                let integers = values
                    .iter()
                    .map(|&value| integral_in_range(value, element_type))
                    .collect::<Result<Vec<_>, _>>()?;
                encode_integers(shape, element_type, &integers)
            }
        }
    }
}

fn float_format_for(
    policy: &SynthesisPolicy,
    element_type: ElementType,
) -> Result<FloatFormat, SynthError> {
    element_type
        .float_format()
        .ok_or(SynthError::PolicyTypeMismatch {
            policy: policy.label(),
            element_type,
        })
}

fn integral_in_range(value: f64, element_type: ElementType) -> Result<i64, SynthError> {
    let unrepresentable = SynthError::Unrepresentable {
        value,
        element_type,
    };
    let (min, max) = element_type.integer_range().ok_or(unrepresentable.clone())?;
    if value.fract() != 0.0 || value < min as f64 || value > max as f64 {
        return Err(unrepresentable);
    }
    Ok(value as i64)
}

/// Edge-case prefix derived from the format's field widths.
///
/// Order: NaN, +Inf, -Inf, 123, -123, subnormal, smallest normal, largest
/// normal power, their three negations, then a value that underflows to zero.
#[must_use]
pub fn edge_case_values(format: FloatFormat) -> Vec<f64> {
    let subnormal = format.subnormal();
    let smallest_normal = format.smallest_normal();
    let largest = format.largest_normal_power();
    vec![
        f64::NAN,
        f64::INFINITY,
        f64::NEG_INFINITY,
        123.0,
        -123.0,
        subnormal,
        smallest_normal,
        largest,
        -subnormal,
        -smallest_normal,
        -largest,
        format.underflow_value(),
    ]
}

/// Narrow f64 values into a float tensor of `element_type`.
pub fn encode_floats(
    shape: &[usize],
    element_type: ElementType,
    values: &[f64],
) -> Result<Tensor, SynthError> {
    let shape = shape.to_vec();
    let tensor = match element_type {
        ElementType::Float32 => {
            let narrowed: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            Tensor::from_values(shape, &narrowed)?
        }
        ElementType::Float16 => {
            let narrowed: Vec<_> = values.iter().map(|&v| round_to_f16(v)).collect();
            Tensor::from_values(shape, &narrowed)?
        }
        ElementType::BFloat16 => {
            let narrowed: Vec<_> = values
                .iter()
                .map(|&v| truncate_to_bf16(v as f32))
                .collect();
            Tensor::from_values(shape, &narrowed)?
        }
        other => {
            return Err(SynthError::PolicyTypeMismatch {
                policy: "float_values",
                element_type: other,
            });
        }
    };
    Ok(tensor)
}

/// Store already range-checked integers as `element_type`.
pub fn encode_integers(
    shape: &[usize],
    element_type: ElementType,
    values: &[i64],
) -> Result<Tensor, SynthError> {
    let shape = shape.to_vec();
    let check = |value: i64| -> Result<i64, SynthError> {
        match element_type.integer_range() {
            Some((min, max)) if value >= min && value <= max => Ok(value),
            _ => Err(SynthError::Unrepresentable {
                value: value as f64,
                element_type,
            }),
        }
    };
    let tensor = match element_type {
        ElementType::Int8 => {
            let narrowed = values
                .iter()
                .map(|&v| check(v).map(|v| v as i8))
                .collect::<Result<Vec<_>, _>>()?;
            Tensor::from_values(shape, &narrowed)?
        }
        ElementType::Uint8 => {
            let narrowed = values
                .iter()
                .map(|&v| check(v).map(|v| v as u8))
                .collect::<Result<Vec<_>, _>>()?;
            Tensor::from_values(shape, &narrowed)?
        }
        ElementType::Int32 => {
            let narrowed = values
                .iter()
                .map(|&v| check(v).map(|v| v as i32))
                .collect::<Result<Vec<_>, _>>()?;
            Tensor::from_values(shape, &narrowed)?
        }
        ElementType::Int64 => Tensor::from_values(shape, values)?,
        ElementType::Bool => {
            let narrowed = values
                .iter()
                .map(|&v| check(v).map(|v| v != 0))
                .collect::<Result<Vec<_>, _>>()?;
            Tensor::from_values(shape, &narrowed)?
        }
        other => {
            return Err(SynthError::PolicyTypeMismatch {
                policy: "integer_values",
                element_type: other,
            });
        }
    };
    Ok(tensor)
}

/// Affine quantization parameters for one 8-bit type.
///
/// The zero-point is configuration, never derived from the element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedType {
    pub element_type: ElementType,
    pub zero_point: i64,
}

impl QuantizedType {
    pub const INT8: Self = Self {
        element_type: ElementType::Int8,
        zero_point: 0,
    };
    pub const UINT8: Self = Self {
        element_type: ElementType::Uint8,
        zero_point: 128,
    };

    pub fn validate(self) -> Result<Self, SynthError> {
        if !matches!(self.element_type, ElementType::Int8 | ElementType::Uint8) {
            return Err(SynthError::PolicyTypeMismatch {
                policy: "quantized",
                element_type: self.element_type,
            });
        }
        integral_in_range(self.zero_point as f64, self.element_type)?;
        Ok(self)
    }

    /// Half-open sampling range for quantized values, `[min, max)`.
    #[must_use]
    pub fn value_range(self) -> (i64, i64) {
        self.element_type.integer_range().unwrap_or((0, 1))
    }
}

/// Value, scale and zero-point for one quantized operand.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedOperand {
    pub value: Tensor,
    pub scale: Tensor,
    pub zero_point: Tensor,
}

/// Scale is drawn from `[0, 0.1)`.
pub fn quantized_scalar_inputs(
    shape: &[usize],
    qtype: QuantizedType,
    rng: &mut DeterministicRng,
) -> Result<QuantizedOperand, SynthError> {
    let qtype = qtype.validate()?;
    let (low, high) = qtype.value_range();
    let value = synthesize(
        shape,
        qtype.element_type,
        &SynthesisPolicy::UniformInt { low, high },
        rng,
    )?;
    let (scale, zero_point) = quantization_params(qtype, rng)?;
    Ok(QuantizedOperand {
        value,
        scale,
        zero_point,
    })
}

/// Scalar scale/zero-point pair, e.g. for an output that has no value tensor.
pub fn quantization_params(
    qtype: QuantizedType,
    rng: &mut DeterministicRng,
) -> Result<(Tensor, Tensor), SynthError> {
    let qtype = qtype.validate()?;
    let scale = Tensor::scalar((rng.next_f64() * 0.1) as f32);
    let zero_point = encode_integers(&[], qtype.element_type, &[qtype.zero_point])?;
    Ok((scale, zero_point))
}

/// Layout of a weight tensor made of stacked per-gate blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateBlockLayout {
    pub directions: usize,
    pub gates: usize,
    pub block_rows: usize,
    /// `Some(cols)` gives `[directions, gates*rows, cols]`, `None` gives `[directions, gates*rows]`.
    pub cols: Option<usize>,
}

impl GateBlockLayout {
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = vec![self.directions, self.gates * self.block_rows];
        if let Some(cols) = self.cols {
            shape.push(cols);
        }
        shape
    }
}

/// Float32 gate-block weights in `[-1, 1)`, drawn independently per direction
/// and per gate. `fixed` pins whole gate blocks, e.g. `(forget_index, 1.0)`.
pub fn synthesize_gate_blocks(
    layout: GateBlockLayout,
    fixed: &[(usize, f32)],
    rng: &mut DeterministicRng,
) -> Result<Tensor, SynthError> {
    let block_len = layout.block_rows * layout.cols.unwrap_or(1);
    let mut values = Vec::with_capacity(layout.directions * layout.gates * block_len);
    for _direction in 0..layout.directions {
        for gate in 0..layout.gates {
            let pinned = fixed
                .iter()
                .find(|(index, _)| *index == gate)
                .map(|(_, value)| *value);
            for _ in 0..block_len {
                let value = match pinned {
                    Some(value) => value,
                    None => (rng.next_f64() * 2.0 - 1.0) as f32,
                };
                values.push(value);
            }
        }
    }
    Ok(Tensor::from_values(layout.shape(), &values)?)
}
