use anyhow::{anyhow, Result};
use tracing::debug;

use super::consumer_counts;
use crate::graph::{transform, NameCtx, SymbolRef};
use crate::ops::{self, Op, OpBuilder, StandardInference};
use crate::tensor::{ParametersT, Tensor};
use crate::trace::GraphTransform;

/// Folds batch normalization into the producer.
///
/// `conv2d -> batch_norm` becomes a conv2d with per-output-channel rescaled
/// weights plus a `bias_add`; any other producer gets an explicit
/// `multiply(scale) -> bias_add` pair. Either way no `batch_norm` node
/// survives and the output is numerically identical up to float
/// associativity. New parameter tensors are fresh entries; the originals stay
/// untouched for earlier traces.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseBatchNorm;

impl GraphTransform for FuseBatchNorm {
    fn name(&self) -> &'static str {
        "fuse-batch-norm"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let consumers = consumer_counts(symbol);
        let mut namer = NameCtx::above(symbol);
        let infer = StandardInference;
        let mut new_params = params.clone();

        let out = transform(symbol, |sym| {
            let &Op::BatchNorm { axis, epsilon } = sym.op() else {
                return Ok(None);
            };
            if sym.ty().as_tensor().is_none() {
                // still tuple-typed: an unfused consumer wants the running
                // stats, leave the pattern alone
                return Ok(None);
            }
            let [data, gamma, beta, mean, var] = sym.args() else {
                return Err(anyhow!("`{}` has a malformed batch_norm arity", sym.name()));
            };
            if ![gamma, beta, mean, var]
                .iter()
                .all(|arg| ops::is_param(arg, params))
            {
                return Ok(None);
            }

            let gamma_t = &params[gamma.name()];
            let beta_t = &params[beta.name()];
            let mean_t = &params[mean.name()];
            let var_t = &params[var.name()];
            let channels = gamma_t.len();
            let scale: Vec<f64> = (0..channels)
                .map(|c| gamma_t.data()[c] / (var_t.data()[c] + epsilon).sqrt())
                .collect();
            let bias: Vec<f64> = (0..channels)
                .map(|c| beta_t.data()[c] - mean_t.data()[c] * scale[c])
                .collect();
            let dtype = gamma_t.dtype();

            let mut builder = OpBuilder::new(&mut namer, &infer);

            let scaled_producer = match data.op() {
                Op::Conv2d(attrs)
                    if axis == 1
                        && attrs.groups == 1
                        && ops::is_param(&data.args()[1], params)
                        && consumers.get(data.name()).copied().unwrap_or(0) == 1 =>
                {
                    let weight = &params[data.args()[1].name()];
                    let per_out: usize = weight.shape()[1..].iter().product();
                    let folded: Vec<f64> = weight
                        .data()
                        .iter()
                        .enumerate()
                        .map(|(i, &w)| w * scale[i / per_out])
                        .collect();
                    let wname = format!("{}_weight", sym.name());
                    let folded = Tensor::new(dtype, weight.shape().to_vec(), folded)?;
                    let weight_var = builder.var(wname, folded.spec().clone());
                    new_params.insert(weight_var.name().clone(), folded);
                    debug!(node = %sym.name(), "folded batch_norm into conv2d weights");
                    builder.op_named(
                        data.name().clone(),
                        Op::Conv2d(attrs.clone()),
                        vec![data.args()[0].clone(), weight_var],
                    )?
                }
                _ => {
                    // broadcastable [C, 1, .., 1] aligned on the channel axis
                    let rank = data.shape()?.len();
                    let mut shape = vec![1usize; rank - axis];
                    shape[0] = channels;
                    let sname = format!("{}_scale", sym.name());
                    let scale_t = Tensor::new(dtype, shape, scale)?;
                    let scale_var = builder.var(sname, scale_t.spec().clone());
                    new_params.insert(scale_var.name().clone(), scale_t);
                    builder.op(Op::Mul, vec![data.clone(), scale_var])?
                }
            };

            let bname = format!("{}_bias", sym.name());
            let bias_t = Tensor::new(dtype, vec![channels], bias)?;
            let bias_var = builder.var(bname, bias_t.spec().clone());
            new_params.insert(bias_var.name().clone(), bias_t);
            let fused = builder.op_named(
                sym.name().clone(),
                Op::BiasAdd { axis },
                vec![scaled_producer, bias_var],
            )?;
            Ok(Some(fused.with_extra(sym.extra().clone())))
        })?;

        Ok((out, new_params))
    }
}
