//! Dense tensors for the host runtime.
//!
//! Storage is always `f64`; an `f32` tensor rounds every element through
//! `f32` on construction so results match single-precision arithmetic. Data is
//! shared behind an `Arc`, so cloning a tensor never copies elements.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::value::SliceValue;

/// Tensor shape; almost always rank <= 4.
pub type Shape = SmallVec<[usize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    #[inline]
    fn round(self, v: f64) -> f64 {
        match self {
            Self::F32 => v as f32 as f64,
            Self::F64 => v,
        }
    }

    fn promote(self, other: DType) -> DType {
        if self == Self::F64 || other == Self::F64 {
            Self::F64
        } else {
            Self::F32
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors raised by tensor kernels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    DataLength { expected: usize, got: usize },
    ShapeMismatch { left: Shape, right: Shape },
    RankMismatch { expected: usize, got: usize },
    UnsupportedDim { dim: i64, rank: usize },
    IndexOutOfBounds { index: i64, len: usize },
    InvalidSlice(SliceValue),
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataLength { expected, got } => {
                write!(f, "data length {} does not match shape size {}", got, expected)
            }
            Self::ShapeMismatch { left, right } => {
                write!(f, "shapes {:?} and {:?} are not compatible", left.as_slice(), right.as_slice())
            }
            Self::RankMismatch { expected, got } => {
                write!(f, "expected a rank-{} tensor, got rank {}", expected, got)
            }
            Self::UnsupportedDim { dim, rank } => {
                write!(f, "dim {} is not supported for a rank-{} tensor", dim, rank)
            }
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {} is out of bounds for dimension of size {}", index, len)
            }
            Self::InvalidSlice(s) => write!(f, "invalid slice {}", s),
        }
    }
}

impl std::error::Error for TensorError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    data: Arc<[f64]>,
}

impl Tensor {
    pub fn new(shape: &[usize], dtype: DType, data: Vec<f64>) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self::from_parts(SmallVec::from_slice(shape), dtype, data))
    }

    /// `float32` tensor from row-major data.
    pub fn from_vec(shape: &[usize], data: Vec<f64>) -> Result<Self, TensorError> {
        Self::new(shape, DType::F32, data)
    }

    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let n = shape.iter().product();
        Self::from_parts(SmallVec::from_slice(shape), dtype, vec![value; n])
    }

    fn from_parts(shape: Shape, dtype: DType, data: Vec<f64>) -> Self {
        let data: Arc<[f64]> = data.into_iter().map(|v| dtype.round(v)).collect();
        Self { shape, dtype, data }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Self::from_parts(
            self.shape.clone(),
            self.dtype,
            self.data.iter().map(|&x| f(x)).collect(),
        )
    }

    /// Elementwise binary op. A tensor whose shape is a trailing suffix of
    /// the other's is broadcast over the leading dimensions.
    pub fn zip_with(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor, TensorError> {
        let dtype = self.dtype.promote(other.dtype);
        if self.shape == other.shape {
            let data = self.data.iter().zip(other.data.iter()).map(|(&a, &b)| f(a, b)).collect();
            return Ok(Self::from_parts(self.shape.clone(), dtype, data));
        }
        if self.shape.ends_with(&other.shape) {
            let n = other.numel().max(1);
            let data = self
                .data
                .iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % n]))
                .collect();
            return Ok(Self::from_parts(self.shape.clone(), dtype, data));
        }
        if other.shape.ends_with(&self.shape) {
            let n = self.numel().max(1);
            let data = other
                .data
                .iter()
                .enumerate()
                .map(|(i, &b)| f(self.data[i % n], b))
                .collect();
            return Ok(Self::from_parts(other.shape.clone(), dtype, data));
        }
        Err(TensorError::ShapeMismatch {
            left: self.shape.clone(),
            right: other.shape.clone(),
        })
    }

    pub fn relu(&self) -> Tensor {
        self.map(|x| if x > 0.0 { x } else { 0.0 })
    }

    /// Softmax over the last dimension (`dim` must name it).
    pub fn softmax(&self, dim: i64) -> Result<Tensor, TensorError> {
        let rank = self.rank();
        let d = normalize_dim(dim, rank)?;
        if d + 1 != rank {
            return Err(TensorError::UnsupportedDim { dim, rank });
        }
        let width = self.shape[rank - 1];
        if width == 0 {
            return Ok(self.clone());
        }
        let mut out = Vec::with_capacity(self.numel());
        for row in self.data.chunks(width) {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let exps: SmallVec<[f64; 16]> = row.iter().map(|&x| (x - max).exp()).collect();
            let sum: f64 = exps.iter().sum();
            out.extend(exps.iter().map(|e| e / sum));
        }
        Ok(Self::from_parts(self.shape.clone(), self.dtype, out))
    }

    /// `[n, k] @ [k, m] -> [n, m]`
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        if self.rank() != 2 {
            return Err(TensorError::RankMismatch { expected: 2, got: self.rank() });
        }
        if other.rank() != 2 {
            return Err(TensorError::RankMismatch { expected: 2, got: other.rank() });
        }
        let (n, k, m) = (self.shape[0], self.shape[1], other.shape[1]);
        if other.shape[0] != k {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        let mut out = vec![0.0; n * m];
        for i in 0..n {
            for j in 0..m {
                out[i * m + j] = (0..k).map(|p| self.data[i * k + p] * other.data[p * m + j]).sum();
            }
        }
        Ok(Self::from_parts(
            SmallVec::from_slice(&[n, m]),
            self.dtype.promote(other.dtype),
            out,
        ))
    }

    /// Affine map over the last dimension with `weight` shaped `[out, in]`.
    pub fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor, TensorError> {
        if weight.rank() != 2 {
            return Err(TensorError::RankMismatch { expected: 2, got: weight.rank() });
        }
        let (out_features, in_features) = (weight.shape[0], weight.shape[1]);
        if self.rank() == 0 || self.shape[self.rank() - 1] != in_features {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: weight.shape.clone(),
            });
        }
        if let Some(b) = bias {
            if b.shape() != [out_features] {
                return Err(TensorError::ShapeMismatch {
                    left: weight.shape.clone(),
                    right: b.shape.clone(),
                });
            }
        }

        let rows = self.numel() / in_features.max(1);
        let mut out = Vec::with_capacity(rows * out_features);
        for r in 0..rows {
            let x = &self.data[r * in_features..(r + 1) * in_features];
            for o in 0..out_features {
                let w = &weight.data[o * in_features..(o + 1) * in_features];
                let acc: f64 = x.iter().zip(w).map(|(a, b)| a * b).sum();
                out.push(acc + bias.map_or(0.0, |b| b.data[o]));
            }
        }

        let mut shape = self.shape.clone();
        let last = shape.len() - 1;
        shape[last] = out_features;
        let dtype = self.dtype.promote(weight.dtype);
        Ok(Self::from_parts(shape, dtype, out))
    }

    /// Select one entry along the first dimension.
    pub fn index(&self, index: i64) -> Result<Tensor, TensorError> {
        let len = self.leading_len()?;
        let i = normalize_index(index, len).ok_or(TensorError::IndexOutOfBounds { index, len })?;
        let row = self.numel() / len;
        let data = self.data[i * row..(i + 1) * row].to_vec();
        Ok(Self::from_parts(SmallVec::from_slice(&self.shape[1..]), self.dtype, data))
    }

    /// Slice along the first dimension with positive steps.
    pub fn slice(&self, slice: SliceValue) -> Result<Tensor, TensorError> {
        let len = self.leading_len()?;
        let step = slice.step.unwrap_or(1);
        if step <= 0 {
            return Err(TensorError::InvalidSlice(slice));
        }
        let clamp = |bound: i64| -> usize {
            let b = if bound < 0 { bound + len as i64 } else { bound };
            b.clamp(0, len as i64) as usize
        };
        let start = slice.start.map_or(0, clamp);
        let stop = slice.stop.map_or(len, clamp);
        let row = if len == 0 { 0 } else { self.numel() / len };

        let mut data = Vec::new();
        let mut count = 0;
        for i in (start..stop.max(start)).step_by(step as usize) {
            data.extend_from_slice(&self.data[i * row..(i + 1) * row]);
            count += 1;
        }
        let mut shape = self.shape.clone();
        shape[0] = count;
        Ok(Self::from_parts(shape, self.dtype, data))
    }

    fn leading_len(&self) -> Result<usize, TensorError> {
        match self.shape.first() {
            Some(&len) => Ok(len),
            None => Err(TensorError::RankMismatch { expected: 1, got: 0 }),
        }
    }
}

fn normalize_dim(dim: i64, rank: usize) -> Result<usize, TensorError> {
    let d = if dim < 0 { dim + rank as i64 } else { dim };
    if d < 0 || d as usize >= rank {
        return Err(TensorError::UnsupportedDim { dim, rank });
    }
    Ok(d as usize)
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let i = if index < 0 { index + len as i64 } else { index };
    (i >= 0 && (i as usize) < len).then_some(i as usize)
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor(shape={:?}, dtype={})", self.shape.as_slice(), self.dtype)
    }
}
