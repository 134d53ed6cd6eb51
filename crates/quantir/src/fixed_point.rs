//! Lowering a discretized graph to its two terminal forms.
//!
//! [`Simulator`] builds a floating-point graph that reproduces, in float
//! arithmetic, exactly the rounding and clipping the integer path will apply;
//! comparing it against the source graph isolates quantization error before
//! committing to integers. [`FixPoint`] builds the deliverable: an
//! all-integer graph plus integer parameter tensors, with every rescale made
//! explicit as shift/clip primitives.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::info;

use crate::graph::{post_order, transform, GraphError, NameCtx, Symbol, SymbolRef};
use crate::ops::{self, Op, OpBuilder, StandardInference};
use crate::runtime::precision_bound;
use crate::tensor::{DType, ParametersT, Tensor, ValueType};
use crate::trace::GraphTransform;

fn integer_ty(sym: &SymbolRef) -> Result<ValueType, GraphError> {
    Ok(ValueType::Tensor(sym.tensor_ty()?.with_dtype(DType::Si32)))
}

/// Fixed-point conversion failures; fatal to the stage.
#[derive(Debug, Error)]
pub enum QuantError {
    #[error("`{op}` at node `{name}` has no integer-equivalent rule")]
    Unsupported { op: &'static str, name: Arc<str> },
    #[error("node `{0}` lacks scale/precision; run the discretizer first")]
    NotDiscretized(Arc<str>),
}

fn scale_and_precision(sym: &SymbolRef) -> Result<(f64, u8), QuantError> {
    match (sym.scale(), sym.precision()) {
        (Some(scale), Some(precision)) => Ok((scale, precision)),
        _ => Err(QuantError::NotDiscretized(sym.name().clone())),
    }
}

/// Floating-point mirror of the integer path's rounding and clipping.
///
/// Every discretized node is wrapped in
/// `mul(1/s) -> round -> clip -> mul(s)`; disabling `with_round` or
/// `with_clip` isolates which effect drives an observed accuracy loss.
#[derive(Debug, Clone, Copy)]
pub struct Simulator {
    pub with_round: bool,
    pub with_clip: bool,
}

impl Default for Simulator {
    fn default() -> Self {
        Self {
            with_round: true,
            with_clip: true,
        }
    }
}

impl GraphTransform for Simulator {
    fn name(&self) -> &'static str {
        "simulator"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let mut namer = NameCtx::above(symbol);
        let infer = StandardInference;
        let mut new_params: ParametersT = ParametersT::new();

        // parameters take their rounding offline; no graph nodes needed
        for node in post_order(symbol) {
            if ops::is_param(&node, params) {
                let (scale, precision) = scale_and_precision(&node)?;
                let bound = precision_bound(precision);
                let tensor = &params[node.name()];
                let rounded = tensor.map(tensor.dtype(), |v| {
                    let mut q = v / scale;
                    if self.with_round {
                        q = q.round();
                    }
                    if self.with_clip {
                        q = q.clamp(-bound, bound);
                    }
                    q * scale
                });
                new_params.insert(node.name().clone(), rounded);
            }
        }

        let out = transform(symbol, |sym| {
            if sym.ty().as_tensor().is_none() || ops::is_param(sym, params) {
                return Ok(None);
            }
            let (scale, precision) = scale_and_precision(sym)?;
            let bound = precision_bound(precision);
            let dtype = sym.dtype()?;
            let mut builder = OpBuilder::new(&mut namer, &infer);

            let inv_t = Tensor::scalar(dtype, 1.0 / scale);
            let inv_var = builder.fresh_var(&format!("{}_sim_inv", sym.name()), inv_t.spec().clone());
            new_params.insert(inv_var.name().clone(), inv_t);
            let mut wrapped = builder.op(Op::Mul, vec![sym.clone(), inv_var])?;
            if self.with_round {
                wrapped = builder.op(Op::Round, vec![wrapped])?;
            }
            if self.with_clip {
                wrapped = builder.op(
                    Op::Clip {
                        a_min: -bound,
                        a_max: bound,
                    },
                    vec![wrapped],
                )?;
            }
            let scale_t = Tensor::scalar(dtype, scale);
            let scale_var = builder.fresh_var(&format!("{}_sim_scale", sym.name()), scale_t.spec().clone());
            new_params.insert(scale_var.name().clone(), scale_t);
            let restored = builder.op(Op::Mul, vec![wrapped, scale_var])?;
            Ok(Some(restored.map_extra(|extra| {
                extra.origin = Some(sym.name().clone());
                extra.scale = Some(scale);
                extra.precision = Some(precision);
            })))
        })?;

        Ok((out, new_params))
    }
}

/// The integer lowering. Output contract: fed integer inputs at their
/// assigned scales, each node's integer output equals
/// `round(float_output / scale)` to within one unit in the last place.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixPoint;

impl GraphTransform for FixPoint {
    fn name(&self) -> &'static str {
        "fix-point"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let mut namer = NameCtx::above(symbol);
        let mut new_params: ParametersT = ParametersT::new();

        for node in post_order(symbol) {
            if ops::is_param(&node, params) {
                let (scale, precision) = scale_and_precision(&node)?;
                let bound = precision_bound(precision);
                let tensor = &params[node.name()];
                let quantized =
                    tensor.map(DType::Si32, |v| (v / scale).round().clamp(-bound, bound));
                new_params.insert(node.name().clone(), quantized);
            }
        }

        let out = transform(symbol, |sym| {
            match sym.op().clone() {
                Op::Var => Ok(Some(sym.with_ty(integer_ty(sym)?))),
                Op::Requant(attrs) => {
                    let (_, precision) = scale_and_precision(sym)?;
                    let data = sym.args()[0].clone();
                    let lowered = if attrs.shift > 0 {
                        sym.with_op(Op::RsPclip {
                            shift: attrs.shift as u32,
                            precision,
                        })
                    } else if attrs.shift == 0 {
                        sym.with_op(Op::Pclip { precision })
                    } else {
                        // scale increase: integer multiply by 2^|shift|
                        let gain = 2f64.powi(-attrs.shift);
                        let gain_var_name = namer.fresh_prefixed(&format!("{}_gain", sym.name()));
                        let gain_t = Tensor::scalar(DType::Si32, gain);
                        let gain_var = Symbol::build(
                            gain_var_name,
                            Op::Var,
                            Default::default(),
                            ValueType::Tensor(gain_t.spec().clone()),
                        );
                        new_params.insert(gain_var.name().clone(), gain_t);
                        let scaled = Symbol::build(
                            namer.fresh(),
                            Op::Mul,
                            vec![data, gain_var].into(),
                            integer_ty(sym)?,
                        );
                        sym.with_op(Op::Pclip { precision })
                            .with_args(vec![scaled].into())
                    };
                    Ok(Some(lowered.with_ty(integer_ty(sym)?)))
                }
                Op::Clip { a_min, a_max } => {
                    let (scale, _) = scale_and_precision(sym)?;
                    Ok(Some(
                        sym.with_op(Op::Clip {
                            a_min: (a_min / scale).round(),
                            a_max: (a_max / scale).round(),
                        })
                        .with_ty(integer_ty(sym)?),
                    ))
                }
                Op::Conv2d(_)
                | Op::Dense { .. }
                | Op::Add
                | Op::Sub
                | Op::Mul
                | Op::BiasAdd { .. }
                | Op::Relu
                | Op::MaxPool2d(_)
                | Op::Sum(_)
                | Op::Reshape { .. }
                | Op::Squeeze { .. }
                | Op::Pclip { .. }
                | Op::RsPclip { .. } => Ok(Some(sym.with_ty(integer_ty(sym)?))),
                op => Err(QuantError::Unsupported {
                    op: op.name(),
                    name: sym.name().clone(),
                }
                .into()),
            }
        })?;

        info!(
            nodes = post_order(&out).len(),
            "lowered graph to integer form"
        );
        Ok((out, new_params))
    }
}

/// Quantizes a float input tensor to the integer domain of a fixed-point
/// graph input: `round(v / scale)` clipped to the input's precision.
pub fn quantize_input(input: &Tensor, scale: f64, precision: u8) -> Tensor {
    let bound = precision_bound(precision);
    input.map(DType::Si32, |v| (v / scale).round().clamp(-bound, bound))
}

/// Maps an integer output back to the float domain.
pub fn dequantize_output(output: &Tensor, scale: f64) -> Tensor {
    output.map(DType::F32, |v| v * scale)
}
