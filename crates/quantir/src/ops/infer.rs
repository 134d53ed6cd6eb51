//! Operator type inference.
//!
//! Quantization-introduced operators are shape-preserving and take their type
//! from the first argument, computed locally. Every other kind defers to a
//! [`TypeInference`] collaborator; [`StandardInference`] is the built-in
//! implementation covering the closed operator set.

use thiserror::Error;

use super::Op;
use crate::graph::SymbolRef;
use crate::tensor::{DType, TensorSpec, ValueType};

/// Inference failures; all fatal to the enclosing transform.
#[derive(Debug, Error, PartialEq)]
pub enum InferError {
    #[error("dtype mismatch for `{op}`: {lhs} vs {rhs}")]
    TypeMismatch { op: &'static str, lhs: DType, rhs: DType },
    #[error("`{op}` expects {expected} argument(s), found {found}")]
    Arity {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("shape error for `{op}`: {msg}")]
    Shape { op: &'static str, msg: String },
    #[error("`{op}` expects a tensor argument, found a tuple")]
    ExpectedTensor { op: &'static str },
    #[error("variable types are declared at construction, never inferred")]
    Variable,
}

/// Pluggable shape/dtype checker for operator kinds without a local rule.
pub trait TypeInference {
    fn infer(&self, op: &Op, args: &[ValueType]) -> Result<ValueType, InferError>;
}

/// Computes the type for a new node: first-argument-like kinds locally,
/// everything else through the collaborator, after the generic dtype
/// consistency check.
pub fn infer_value_type(
    op: &Op,
    args: &[SymbolRef],
    infer: &dyn TypeInference,
) -> Result<ValueType, InferError> {
    if op.is_first_like() {
        let first = args.first().ok_or(InferError::Arity {
            op: op.name(),
            expected: 1,
            found: 0,
        })?;
        return Ok(first.ty().clone());
    }

    let tys: Vec<ValueType> = args.iter().map(|a| a.ty().clone()).collect();

    // generic dtype rule: all tensor arguments agree
    if !matches!(op, Op::Tuple | Op::TupleGetItem { .. }) {
        let mut dtype: Option<DType> = None;
        for ty in &tys {
            if let ValueType::Tensor(spec) = ty {
                match dtype {
                    None => dtype = Some(spec.dtype),
                    Some(seen) if seen != spec.dtype => {
                        return Err(InferError::TypeMismatch {
                            op: op.name(),
                            lhs: seen,
                            rhs: spec.dtype,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
    }

    infer.infer(op, &tys)
}

/// Built-in shape algebra for the closed operator set.
pub struct StandardInference;

impl TypeInference for StandardInference {
    fn infer(&self, op: &Op, args: &[ValueType]) -> Result<ValueType, InferError> {
        let name = op.name();
        match op {
            Op::Var => Err(InferError::Variable),
            Op::Tuple => {
                let fields = args
                    .iter()
                    .map(|ty| tensor_of(name, ty).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ValueType::Tuple(fields))
            }
            Op::TupleGetItem { index } => {
                let arg = one(name, args)?;
                match arg {
                    ValueType::Tuple(fields) => fields
                        .get(*index)
                        .cloned()
                        .map(ValueType::Tensor)
                        .ok_or_else(|| InferError::Shape {
                            op: name,
                            msg: format!("index {index} out of {} fields", fields.len()),
                        }),
                    ValueType::Tensor(_) => Err(InferError::Shape {
                        op: name,
                        msg: "argument is not tuple-typed".into(),
                    }),
                }
            }
            Op::Conv2d(attrs) => {
                let (data, weight) = two(name, args)?;
                let data = tensor_of(name, data)?;
                let weight = tensor_of(name, weight)?;
                let [n, cin, h, w] = rank4(name, &data.shape)?;
                let [cout, wcin, kh, kw] = rank4(name, &weight.shape)?;
                if attrs.groups == 0 || cin % attrs.groups != 0 {
                    return Err(shape(name, format!("groups {} do not divide {cin}", attrs.groups)));
                }
                if cout != attrs.channels || wcin != cin / attrs.groups {
                    return Err(shape(
                        name,
                        format!("weight [{cout}, {wcin}, ..] does not match data [{n}, {cin}, ..]"),
                    ));
                }
                if (kh, kw) != attrs.kernel {
                    return Err(shape(name, format!("kernel attr {:?} vs weight {kh}x{kw}", attrs.kernel)));
                }
                let oh = window(name, h, kh, attrs.padding.0, attrs.strides.0)?;
                let ow = window(name, w, kw, attrs.padding.1, attrs.strides.1)?;
                Ok(tensor(data.dtype, vec![n, cout, oh, ow]))
            }
            Op::Dense { units } => {
                let (data, weight) = two(name, args)?;
                let data = tensor_of(name, data)?;
                let weight = tensor_of(name, weight)?;
                let [n, k] = rank2(name, &data.shape)?;
                let [u, wk] = rank2(name, &weight.shape)?;
                if u != *units || wk != k {
                    return Err(shape(
                        name,
                        format!("weight [{u}, {wk}] does not match data [{n}, {k}] with units {units}"),
                    ));
                }
                Ok(tensor(data.dtype, vec![n, *units]))
            }
            Op::BatchNorm { axis, .. } => {
                if args.len() != 5 {
                    return Err(InferError::Arity {
                        op: name,
                        expected: 5,
                        found: args.len(),
                    });
                }
                let data = tensor_of(name, &args[0])?;
                let c = *data.shape.get(*axis).ok_or_else(|| {
                    shape(name, format!("axis {axis} out of rank {}", data.shape.len()))
                })?;
                for arg in &args[1..] {
                    let spec = tensor_of(name, arg)?;
                    if spec.shape != [c] {
                        return Err(shape(name, format!("stats must have shape [{c}]")));
                    }
                }
                Ok(ValueType::Tuple(vec![
                    data.clone(),
                    TensorSpec::new(data.dtype, vec![c]),
                    TensorSpec::new(data.dtype, vec![c]),
                ]))
            }
            Op::BiasAdd { axis } => {
                let (data, bias) = two(name, args)?;
                let data = tensor_of(name, data)?;
                let bias = tensor_of(name, bias)?;
                let c = *data.shape.get(*axis).ok_or_else(|| {
                    shape(name, format!("axis {axis} out of rank {}", data.shape.len()))
                })?;
                if bias.shape != [c] {
                    return Err(shape(name, format!("bias must have shape [{c}]")));
                }
                Ok(ValueType::Tensor(data.clone()))
            }
            Op::Relu
            | Op::Clip { .. }
            | Op::Round
            | Op::Dropout { .. }
            | Op::RightShift { .. }
            | Op::LogSoftmax { .. } => {
                let data = tensor_of(name, one(name, args)?)?;
                Ok(ValueType::Tensor(data.clone()))
            }
            Op::MaxPool2d(attrs) => {
                let data = tensor_of(name, one(name, args)?)?;
                let [n, c, h, w] = rank4(name, &data.shape)?;
                let oh = window(name, h, attrs.pool.0, attrs.padding.0, attrs.strides.0)?;
                let ow = window(name, w, attrs.pool.1, attrs.padding.1, attrs.strides.1)?;
                Ok(tensor(data.dtype, vec![n, c, oh, ow]))
            }
            Op::GlobalAvgPool2d => {
                let data = tensor_of(name, one(name, args)?)?;
                let [n, c, _, _] = rank4(name, &data.shape)?;
                Ok(tensor(data.dtype, vec![n, c, 1, 1]))
            }
            Op::Sum(attrs) => {
                let data = tensor_of(name, one(name, args)?)?;
                let rank = data.shape.len();
                let axes: Vec<usize> = match &attrs.axes {
                    None => (0..rank).collect(),
                    Some(axes) => axes.clone(),
                };
                for &axis in &axes {
                    if axis >= rank {
                        return Err(shape(name, format!("axis {axis} out of rank {rank}")));
                    }
                }
                let mut dims = Vec::new();
                for (i, &d) in data.shape.iter().enumerate() {
                    if axes.contains(&i) {
                        if attrs.keepdims {
                            dims.push(1);
                        }
                    } else {
                        dims.push(d);
                    }
                }
                Ok(tensor(data.dtype, dims))
            }
            Op::Squeeze { axes } => {
                let data = tensor_of(name, one(name, args)?)?;
                for &axis in axes {
                    match data.shape.get(axis) {
                        Some(1) => {}
                        Some(d) => {
                            return Err(shape(name, format!("axis {axis} has extent {d}, not 1")))
                        }
                        None => {
                            return Err(shape(
                                name,
                                format!("axis {axis} out of rank {}", data.shape.len()),
                            ))
                        }
                    }
                }
                let dims = data
                    .shape
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !axes.contains(i))
                    .map(|(_, &d)| d)
                    .collect();
                Ok(tensor(data.dtype, dims))
            }
            Op::Reshape { newshape } => {
                let data = tensor_of(name, one(name, args)?)?;
                let total: usize = data.shape.iter().product();
                let mut dims: Vec<usize> = Vec::with_capacity(newshape.len());
                let mut infer_at: Option<usize> = None;
                let mut known = 1usize;
                for (i, &d) in newshape.iter().enumerate() {
                    match d {
                        -1 if infer_at.is_none() => {
                            infer_at = Some(i);
                            dims.push(0);
                        }
                        -1 => return Err(shape(name, "more than one -1 extent".into())),
                        d if d > 0 => {
                            dims.push(d as usize);
                            known *= d as usize;
                        }
                        _ => return Err(shape(name, format!("invalid extent {d}"))),
                    }
                }
                if let Some(i) = infer_at {
                    if known == 0 || total % known != 0 {
                        return Err(shape(name, format!("cannot infer -1 from {total}/{known}")));
                    }
                    dims[i] = total / known;
                } else if known != total {
                    return Err(shape(name, format!("{total} elements vs new shape {known}")));
                }
                Ok(tensor(data.dtype, dims))
            }
            Op::Cast { dtype } => {
                let data = tensor_of(name, one(name, args)?)?;
                Ok(tensor(*dtype, data.shape.clone()))
            }
            Op::Add | Op::Sub | Op::Mul => {
                let (lhs, rhs) = two(name, args)?;
                let lhs = tensor_of(name, lhs)?;
                let rhs = tensor_of(name, rhs)?;
                let dims = broadcast_shapes(&lhs.shape, &rhs.shape)
                    .ok_or_else(|| shape(name, format!("cannot broadcast {:?} with {:?}", lhs.shape, rhs.shape)))?;
                Ok(tensor(lhs.dtype, dims))
            }
            Op::Requant(_) | Op::Pclip { .. } | Op::RsPclip { .. } => {
                // handled by the first-argument rule before dispatch
                let data = tensor_of(name, one(name, args)?)?;
                Ok(ValueType::Tensor(data.clone()))
            }
        }
    }
}

/// Right-aligned broadcasting; `None` when the shapes are incompatible.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut dims = vec![0usize; rank];
    for i in 0..rank {
        let l = lhs.len().checked_sub(i + 1).map_or(1, |j| lhs[j]);
        let r = rhs.len().checked_sub(i + 1).map_or(1, |j| rhs[j]);
        dims[rank - 1 - i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return None,
        };
    }
    Some(dims)
}

fn tensor(dtype: DType, shape: Vec<usize>) -> ValueType {
    ValueType::Tensor(TensorSpec::new(dtype, shape))
}

fn shape(op: &'static str, msg: String) -> InferError {
    InferError::Shape { op, msg }
}

fn tensor_of<'t>(op: &'static str, ty: &'t ValueType) -> Result<&'t TensorSpec, InferError> {
    ty.as_tensor().ok_or(InferError::ExpectedTensor { op })
}

fn one<'t>(op: &'static str, args: &'t [ValueType]) -> Result<&'t ValueType, InferError> {
    if args.len() != 1 {
        return Err(InferError::Arity {
            op,
            expected: 1,
            found: args.len(),
        });
    }
    Ok(&args[0])
}

fn two<'t>(op: &'static str, args: &'t [ValueType]) -> Result<(&'t ValueType, &'t ValueType), InferError> {
    if args.len() != 2 {
        return Err(InferError::Arity {
            op,
            expected: 2,
            found: args.len(),
        });
    }
    Ok((&args[0], &args[1]))
}

fn window(
    op: &'static str,
    extent: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
) -> Result<usize, InferError> {
    let padded = extent + 2 * padding;
    if stride == 0 || kernel == 0 || padded < kernel {
        return Err(shape(
            op,
            format!("window {kernel}/{stride}/{padding} does not fit extent {extent}"),
        ));
    }
    Ok((padded - kernel) / stride + 1)
}

fn rank2(op: &'static str, dims: &[usize]) -> Result<[usize; 2], InferError> {
    <[usize; 2]>::try_from(dims)
        .map_err(|_| shape(op, format!("expected rank 2, found {:?}", dims)))
}

fn rank4(op: &'static str, dims: &[usize]) -> Result<[usize; 4], InferError> {
    <[usize; 4]>::try_from(dims)
        .map_err(|_| shape(op, format!("expected rank 4, found {:?}", dims)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_rules() {
        assert_eq!(broadcast_shapes(&[2, 3], &[2, 3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[2, 3], &[]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[4, 1, 3], &[2, 1]), Some(vec![4, 2, 3]));
        assert_eq!(broadcast_shapes(&[2, 3], &[4]), None);
    }

    #[test]
    fn window_arithmetic() {
        assert_eq!(window("t", 28, 3, 1, 1).unwrap(), 28);
        assert_eq!(window("t", 28, 2, 0, 2).unwrap(), 14);
        assert!(window("t", 2, 5, 0, 1).is_err());
    }
}
