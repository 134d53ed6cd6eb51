//! Graph execution seam and the built-in reference interpreter.
//!
//! The pipeline treats execution as an external collaborator behind the
//! [`Executor`] trait: calibration runs sample batches through it and
//! constant folding evaluates weight-only subgraphs with it. The
//! [`ReferenceExecutor`] is a plain, allocation-happy interpreter; it values
//! being obviously correct over being fast.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use thiserror::Error;

use crate::graph::{post_order, SymbolRef};
use crate::ops::{infer::broadcast_shapes, Op};
use crate::tensor::{DType, ParametersT, Tensor};

/// Evaluation failures surfaced by the reference interpreter.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no data bound for input `{0}`")]
    MissingInput(Arc<str>),
    #[error("`{op}` at node `{name}` has no evaluation rule")]
    Unsupported { op: &'static str, name: Arc<str> },
    #[error("node `{0}` produced a tuple where a tensor was required")]
    TupleResult(Arc<str>),
}

/// A node's runtime output.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Tuple(Vec<Tensor>),
}

impl Value {
    pub fn into_tensor(self, name: &Arc<str>) -> Result<Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            Value::Tuple(_) => Err(RuntimeError::TupleResult(name.clone()).into()),
        }
    }

    fn as_tensor(&self, name: &Arc<str>) -> Result<&Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            Value::Tuple(_) => Err(RuntimeError::TupleResult(name.clone()).into()),
        }
    }
}

/// Blocking, synchronous graph evaluation.
pub trait Executor {
    /// Evaluates every node reachable from `root`, returning each node's
    /// output keyed by name.
    fn eval_nodes(
        &self,
        root: &SymbolRef,
        params: &ParametersT,
        inputs: &HashMap<Arc<str>, Tensor>,
    ) -> Result<HashMap<Arc<str>, Value>>;

    /// Evaluates the graph and returns the root's tensor output.
    fn eval(
        &self,
        root: &SymbolRef,
        params: &ParametersT,
        inputs: &HashMap<Arc<str>, Tensor>,
    ) -> Result<Tensor> {
        let mut outputs = self.eval_nodes(root, params, inputs)?;
        outputs
            .remove(root.name())
            .ok_or_else(|| anyhow!("root `{}` missing from evaluation", root.name()))?
            .into_tensor(root.name())
    }
}

/// The built-in interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceExecutor;

impl Executor for ReferenceExecutor {
    fn eval_nodes(
        &self,
        root: &SymbolRef,
        params: &ParametersT,
        inputs: &HashMap<Arc<str>, Tensor>,
    ) -> Result<HashMap<Arc<str>, Value>> {
        let mut outputs: HashMap<Arc<str>, Value> = HashMap::new();
        for node in post_order(root) {
            let value = if let Op::Var = node.op() {
                let tensor = inputs
                    .get(node.name())
                    .or_else(|| params.get(node.name()))
                    .cloned()
                    .ok_or_else(|| RuntimeError::MissingInput(node.name().clone()))?;
                Value::Tensor(tensor)
            } else {
                let args: Vec<&Value> = node
                    .args()
                    .iter()
                    .map(|a| &outputs[a.name()])
                    .collect();
                eval_op(&node, &args)?
            };
            outputs.insert(node.name().clone(), value);
        }
        Ok(outputs)
    }
}

fn eval_op(node: &SymbolRef, args: &[&Value]) -> Result<Value> {
    let name = node.name();
    let out_dtype = node
        .ty()
        .as_tensor()
        .map(|spec| spec.dtype)
        .unwrap_or(DType::F32);
    let out_shape = || -> Result<Vec<usize>> { Ok(node.shape()?.to_vec()) };

    let out = match node.op() {
        Op::Var => unreachable!("variables are resolved by the caller"),
        Op::Tuple => {
            let fields = args
                .iter()
                .zip(node.args())
                .map(|(v, a)| (*v).clone().into_tensor(a.name()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Value::Tuple(fields));
        }
        Op::TupleGetItem { index } => match args[0] {
            Value::Tuple(fields) => fields
                .get(*index)
                .cloned()
                .ok_or_else(|| anyhow!("tuple index {index} out of bounds at `{name}`"))?,
            Value::Tensor(_) => return Err(anyhow!("`{name}` indexes a non-tuple value")),
        },
        Op::Conv2d(attrs) => {
            let data = args[0].as_tensor(name)?;
            let weight = args[1].as_tensor(name)?;
            conv2d(data, weight, attrs, &out_shape()?, out_dtype)?
        }
        Op::Dense { units } => {
            let data = args[0].as_tensor(name)?;
            let weight = args[1].as_tensor(name)?;
            dense(data, weight, *units, out_dtype)?
        }
        Op::BatchNorm { axis, epsilon } => {
            let data = args[0].as_tensor(name)?;
            let gamma = args[1].as_tensor(name)?;
            let beta = args[2].as_tensor(name)?;
            let mean = args[3].as_tensor(name)?;
            let var = args[4].as_tensor(name)?;
            let normalized = per_channel(data, *axis, |v, c| {
                (v - mean.data()[c]) / (var.data()[c] + epsilon).sqrt() * gamma.data()[c]
                    + beta.data()[c]
            });
            return Ok(Value::Tuple(vec![normalized, mean.clone(), var.clone()]));
        }
        Op::BiasAdd { axis } => {
            let data = args[0].as_tensor(name)?;
            let bias = args[1].as_tensor(name)?;
            per_channel(data, *axis, |v, c| v + bias.data()[c])
        }
        Op::Relu => args[0].as_tensor(name)?.map(out_dtype, |v| v.max(0.0)),
        Op::Clip { a_min, a_max } => {
            let (lo, hi) = (*a_min, *a_max);
            args[0].as_tensor(name)?.map(out_dtype, move |v| v.clamp(lo, hi))
        }
        Op::Round => args[0].as_tensor(name)?.map(out_dtype, f64::round),
        Op::Dropout { .. } => args[0].as_tensor(name)?.clone(),
        Op::LogSoftmax { axis } => log_softmax(args[0].as_tensor(name)?, *axis),
        Op::MaxPool2d(attrs) => max_pool2d(args[0].as_tensor(name)?, attrs, &out_shape()?)?,
        Op::GlobalAvgPool2d => global_avg_pool2d(args[0].as_tensor(name)?)?,
        Op::Sum(attrs) => {
            let data = args[0].as_tensor(name)?;
            let rank = data.shape().len();
            let axes: Vec<usize> = attrs.axes.clone().unwrap_or_else(|| (0..rank).collect());
            reduce_sum(data, &axes, &out_shape()?)
        }
        Op::Squeeze { .. } | Op::Reshape { .. } => {
            args[0].as_tensor(name)?.reshape(out_shape()?)?
        }
        Op::Cast { dtype } => {
            let dtype = *dtype;
            args[0].as_tensor(name)?.map(dtype, move |v| {
                if dtype.is_integer() {
                    v.trunc()
                } else {
                    v
                }
            })
        }
        Op::RightShift { bits } => {
            let div = (1u64 << bits) as f64;
            args[0].as_tensor(name)?.map(out_dtype, move |v| (v / div).floor())
        }
        Op::Add => binary(args[0].as_tensor(name)?, args[1].as_tensor(name)?, out_dtype, |a, b| a + b)?,
        Op::Sub => binary(args[0].as_tensor(name)?, args[1].as_tensor(name)?, out_dtype, |a, b| a - b)?,
        Op::Mul => binary(args[0].as_tensor(name)?, args[1].as_tensor(name)?, out_dtype, |a, b| a * b)?,
        // pure rescale marker in the float stages; the fixed-point lowering
        // replaces it with explicit shift/clip primitives
        Op::Requant(_) => args[0].as_tensor(name)?.clone(),
        Op::Pclip { precision } => {
            let bound = precision_bound(*precision);
            args[0].as_tensor(name)?.map(out_dtype, move |v| v.clamp(-bound, bound))
        }
        Op::RsPclip { shift, precision } => {
            let div = (1u64 << shift) as f64;
            let bound = precision_bound(*precision);
            args[0]
                .as_tensor(name)?
                .map(out_dtype, move |v| (v / div).round().clamp(-bound, bound))
        }
    };
    Ok(Value::Tensor(out))
}

/// Largest representable magnitude at `bits` of signed precision.
pub fn precision_bound(bits: u8) -> f64 {
    ((1u64 << (bits.max(1) - 1)) - 1) as f64
}

fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn per_channel(data: &Tensor, axis: usize, f: impl Fn(f64, usize) -> f64) -> Tensor {
    let shape = data.shape().to_vec();
    let strides = strides_of(&shape);
    let dtype = data.dtype();
    let out: Vec<f64> = data
        .data()
        .iter()
        .enumerate()
        .map(|(i, &v)| f(v, (i / strides[axis]) % shape[axis]))
        .collect();
    Tensor::new(dtype, shape, out).expect("shape is unchanged")
}

fn binary(
    lhs: &Tensor,
    rhs: &Tensor,
    dtype: DType,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor> {
    let shape = broadcast_shapes(lhs.shape(), rhs.shape())
        .ok_or_else(|| anyhow!("cannot broadcast {:?} with {:?}", lhs.shape(), rhs.shape()))?;
    let out_strides = strides_of(&shape);
    let l_strides = strides_of(lhs.shape());
    let r_strides = strides_of(rhs.shape());
    let l_lead = shape.len() - lhs.shape().len();
    let r_lead = shape.len() - rhs.shape().len();
    let count: usize = shape.iter().product();
    let mut out = Vec::with_capacity(count);
    for flat in 0..count {
        let mut l_off = 0usize;
        let mut r_off = 0usize;
        for (axis, &extent) in shape.iter().enumerate() {
            let idx = (flat / out_strides[axis]) % extent;
            if axis >= l_lead && lhs.shape()[axis - l_lead] != 1 {
                l_off += idx * l_strides[axis - l_lead];
            }
            if axis >= r_lead && rhs.shape()[axis - r_lead] != 1 {
                r_off += idx * r_strides[axis - r_lead];
            }
        }
        out.push(f(lhs.data()[l_off], rhs.data()[r_off]));
    }
    Ok(Tensor::new(dtype, shape, out)?)
}

fn conv2d(
    data: &Tensor,
    weight: &Tensor,
    attrs: &crate::ops::Conv2dAttrs,
    out_shape: &[usize],
    dtype: DType,
) -> Result<Tensor> {
    let [n, cin, h, w] = dims4(data.shape())?;
    let [cout, wcin, kh, kw] = dims4(weight.shape())?;
    let (oh, ow) = (out_shape[2], out_shape[3]);
    let (sh, sw) = attrs.strides;
    let (ph, pw) = attrs.padding;
    let group_in = cin / attrs.groups;
    let group_out = cout / attrs.groups;
    let x = data.data();
    let k = weight.data();
    let mut out = vec![0.0f64; n * cout * oh * ow];
    for b in 0..n {
        for oc in 0..cout {
            let group = oc / group_out;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0;
                    for ic in 0..wcin {
                        for ky in 0..kh {
                            let iy = oy * sh + ky;
                            if iy < ph || iy - ph >= h {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = ox * sw + kx;
                                if ix < pw || ix - pw >= w {
                                    continue;
                                }
                                let xi = ((b * cin + group * group_in + ic) * h + (iy - ph)) * w
                                    + (ix - pw);
                                let ki = ((oc * wcin + ic) * kh + ky) * kw + kx;
                                acc += x[xi] * k[ki];
                            }
                        }
                    }
                    out[((b * cout + oc) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    Ok(Tensor::new(dtype, out_shape.to_vec(), out)?)
}

fn dense(data: &Tensor, weight: &Tensor, units: usize, dtype: DType) -> Result<Tensor> {
    let (n, k) = (data.shape()[0], data.shape()[1]);
    let x = data.data();
    let w = weight.data();
    let mut out = vec![0.0f64; n * units];
    for b in 0..n {
        for u in 0..units {
            let mut acc = 0.0;
            for i in 0..k {
                acc += x[b * k + i] * w[u * k + i];
            }
            out[b * units + u] = acc;
        }
    }
    Ok(Tensor::new(dtype, vec![n, units], out)?)
}

fn max_pool2d(
    data: &Tensor,
    attrs: &crate::ops::Pool2dAttrs,
    out_shape: &[usize],
) -> Result<Tensor> {
    let [n, c, h, w] = dims4(data.shape())?;
    let (oh, ow) = (out_shape[2], out_shape[3]);
    let (kh, kw) = attrs.pool;
    let (sh, sw) = attrs.strides;
    let (ph, pw) = attrs.padding;
    let x = data.data();
    let mut out = vec![f64::NEG_INFINITY; n * c * oh * ow];
    for b in 0..n {
        for ch in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = f64::NEG_INFINITY;
                    for ky in 0..kh {
                        let iy = oy * sh + ky;
                        if iy < ph || iy - ph >= h {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = ox * sw + kx;
                            if ix < pw || ix - pw >= w {
                                continue;
                            }
                            best = best.max(x[((b * c + ch) * h + (iy - ph)) * w + (ix - pw)]);
                        }
                    }
                    out[((b * c + ch) * oh + oy) * ow + ox] = best;
                }
            }
        }
    }
    Ok(Tensor::new(data.dtype(), out_shape.to_vec(), out)?)
}

fn global_avg_pool2d(data: &Tensor) -> Result<Tensor> {
    let [n, c, h, w] = dims4(data.shape())?;
    let x = data.data();
    let mut out = vec![0.0f64; n * c];
    for b in 0..n {
        for ch in 0..c {
            let base = (b * c + ch) * h * w;
            out[b * c + ch] = x[base..base + h * w].iter().sum::<f64>() / (h * w) as f64;
        }
    }
    Ok(Tensor::new(data.dtype(), vec![n, c, 1, 1], out)?)
}

fn reduce_sum(data: &Tensor, axes: &[usize], out_shape: &[usize]) -> Tensor {
    let in_shape = data.shape();
    let in_strides = strides_of(in_shape);
    let out_strides = strides_of(out_shape);
    let keepdims = out_shape.len() == in_shape.len();
    let mut out = vec![0.0f64; out_shape.iter().product::<usize>()];
    for (flat, &v) in data.data().iter().enumerate() {
        let mut off = 0usize;
        let mut out_axis = 0usize;
        for (axis, &stride) in in_strides.iter().enumerate() {
            let idx = (flat / stride) % in_shape[axis];
            if axes.contains(&axis) {
                if keepdims {
                    out_axis += 1;
                }
                continue;
            }
            off += idx * out_strides[out_axis];
            out_axis += 1;
        }
        out[off] += v;
    }
    Tensor::new(data.dtype(), out_shape.to_vec(), out).expect("reduced shape accounts all elements")
}

fn log_softmax(data: &Tensor, axis: usize) -> Tensor {
    let shape = data.shape().to_vec();
    let strides = strides_of(&shape);
    let extent = shape[axis];
    let stride = strides[axis];
    let x = data.data();
    let mut out = vec![0.0f64; x.len()];
    let lanes = x.len() / extent;
    for lane in 0..lanes {
        // decompose lane index into (outer, inner) around the reduced axis
        let inner = lane % stride;
        let outer = lane / stride;
        let base = outer * stride * extent + inner;
        let mut max = f64::NEG_INFINITY;
        for i in 0..extent {
            max = max.max(x[base + i * stride]);
        }
        let mut denom = 0.0;
        for i in 0..extent {
            denom += (x[base + i * stride] - max).exp();
        }
        let log_denom = denom.ln();
        for i in 0..extent {
            out[base + i * stride] = x[base + i * stride] - max - log_denom;
        }
    }
    Tensor::new(data.dtype(), shape, out).expect("shape is unchanged")
}

fn dims4(shape: &[usize]) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(shape).map_err(|_| anyhow!("expected rank 4, found {:?}", shape))
}
