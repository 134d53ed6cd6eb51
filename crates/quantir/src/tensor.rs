//! Host tensors and the dtype/shape lattice shared by the whole pipeline.
//!
//! Storage is a flat `Arc<[f64]>` in row-major order. An `f64` lattice holds
//! every integer the pipeline can produce (precisions stay well below 53
//! bits), so float stages and integer stages share one representation and the
//! [`DType`] tag carries the logical element type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Scalar element types supported by the quantization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "int8")]
    Si8,
    #[serde(rename = "int16")]
    Si16,
    #[serde(rename = "int32")]
    Si32,
    #[serde(rename = "int64")]
    Si64,
}

impl DType {
    /// Returns `true` for the signed integer dtypes.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si8 | DType::Si16 | DType::Si32 | DType::Si64)
    }

    /// Returns `true` for the floating-point dtypes.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Storage bit-width of the dtype.
    pub fn bitwidth(self) -> usize {
        match self {
            DType::Si8 => 8,
            DType::Si16 => 16,
            DType::F32 | DType::Si32 => 32,
            DType::F64 | DType::Si64 => 64,
        }
    }

    /// Smallest signed integer dtype that holds `bits` bits including sign.
    pub fn for_precision(bits: u8) -> DType {
        match bits {
            0..=8 => DType::Si8,
            9..=16 => DType::Si16,
            17..=32 => DType::Si32,
            _ => DType::Si64,
        }
    }

    /// Stable tag used by the params blob format.
    pub fn tag(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::Si8 => 2,
            DType::Si16 => 3,
            DType::Si32 => 4,
            DType::Si64 => 5,
        }
    }

    /// Inverse of [`DType::tag`].
    pub fn from_tag(tag: u8) -> Option<DType> {
        Some(match tag {
            0 => DType::F32,
            1 => DType::F64,
            2 => DType::Si8,
            3 => DType::Si16,
            4 => DType::Si32,
            5 => DType::Si64,
            _ => return None,
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Si8 => "int8",
            DType::Si16 => "int16",
            DType::Si32 => "int32",
            DType::Si64 => "int64",
        };
        f.write_str(name)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count; the empty shape is a scalar with one element.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            shape: self.shape.clone(),
        }
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Type recorded on a graph node: a single tensor, or a tuple for
/// multi-output operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<TensorSpec>),
}

impl ValueType {
    /// Returns the tensor spec, or `None` for tuple-typed values.
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Tuple(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(spec) => spec.fmt(f),
            ValueType::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    field.fmt(f)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Errors raised while constructing or reinterpreting host tensors.
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} elements, data holds {found}")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
    #[error("cannot reshape {from} elements into shape {to:?}")]
    Reshape { from: usize, to: Vec<usize> },
}

/// Immutable host tensor with shared storage.
///
/// Clones are cheap (`Arc` on the payload), which is what makes the
/// copy-on-write parameter discipline of the trace pipeline affordable.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    spec: TensorSpec,
    data: Arc<[f64]>,
}

impl Tensor {
    pub fn new(
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        data: Vec<f64>,
    ) -> Result<Self, TensorError> {
        let spec = TensorSpec::new(dtype, shape);
        if spec.element_count() != data.len() {
            return Err(TensorError::LengthMismatch {
                expected: spec.element_count(),
                found: data.len(),
                shape: spec.shape,
            });
        }
        Ok(Self {
            spec,
            data: Arc::from(data),
        })
    }

    pub fn scalar(dtype: DType, value: f64) -> Self {
        Self {
            spec: TensorSpec::new(dtype, Vec::new()),
            data: Arc::from(vec![value]),
        }
    }

    pub fn zeros(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        let spec = TensorSpec::new(dtype, shape);
        let data = vec![0.0; spec.element_count()];
        Self {
            spec,
            data: Arc::from(data),
        }
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.spec.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Largest absolute element; `0.0` for empty tensors.
    pub fn absmax(&self) -> f64 {
        self.data.iter().fold(0.0f64, |m, v| m.max(v.abs()))
    }

    /// Elementwise `(min, max)`; `(0, 0)` for empty tensors.
    pub fn min_max(&self) -> (f64, f64) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in self.data.iter() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        if lo > hi {
            (0.0, 0.0)
        } else {
            (lo, hi)
        }
    }

    /// Applies `f` elementwise, producing a tensor of dtype `dtype`.
    pub fn map(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Tensor {
        let data: Vec<f64> = self.data.iter().map(|&v| f(v)).collect();
        Tensor {
            spec: self.spec.with_dtype(dtype),
            data: Arc::from(data),
        }
    }

    /// Reinterprets the payload under a new shape with identical element count.
    pub fn reshape(&self, shape: impl Into<Vec<usize>>) -> Result<Tensor, TensorError> {
        let shape = shape.into();
        let count: usize = shape.iter().product();
        if count != self.data.len() {
            return Err(TensorError::Reshape {
                from: self.data.len(),
                to: shape,
            });
        }
        Ok(Tensor {
            spec: TensorSpec::new(self.spec.dtype, shape),
            data: Arc::clone(&self.data),
        })
    }
}

impl Serialize for Tensor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Tensor", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("data", &self.data.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorHelper {
            spec: TensorSpec,
            data: Vec<f64>,
        }

        let helper = TensorHelper::deserialize(deserializer)?;
        if helper.spec.element_count() != helper.data.len() {
            return Err(serde::de::Error::custom("tensor payload length mismatch"));
        }
        Ok(Tensor {
            spec: helper.spec,
            data: Arc::from(helper.data),
        })
    }
}

/// Parameter store: variable name to backing tensor.
///
/// Ordered so that dumps, exports, and iteration are deterministic.
pub type ParametersT = BTreeMap<Arc<str>, Tensor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_to_dtype() {
        assert_eq!(DType::for_precision(8), DType::Si8);
        assert_eq!(DType::for_precision(9), DType::Si16);
        assert_eq!(DType::for_precision(24), DType::Si32);
        assert_eq!(DType::for_precision(40), DType::Si64);
    }

    #[test]
    fn length_checked_construction() {
        let err = Tensor::new(DType::F32, vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, TensorError::LengthMismatch { expected: 6, .. }));
    }

    #[test]
    fn absmax_and_range() {
        let t = Tensor::new(DType::F32, vec![4], vec![-3.0, 0.5, 2.0, -0.25]).unwrap();
        assert_eq!(t.absmax(), 3.0);
        assert_eq!(t.min_max(), (-3.0, 2.0));
    }
}
