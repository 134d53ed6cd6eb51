use anyhow::Result;

use crate::graph::{transform, NameCtx, SymbolRef};
use crate::ops::{Op, OpBuilder, ReduceAttrs, StandardInference};
use crate::tensor::{ParametersT, Tensor};
use crate::trace::GraphTransform;

/// Lowers global average pooling into `sum(axes=[2,3]) * 1/(H*W)`.
///
/// The integer path cannot divide, but it can sum and multiply by a
/// calibrated constant; this is the form the fixed-point converter expects.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseAvgPool2d;

impl GraphTransform for FuseAvgPool2d {
    fn name(&self) -> &'static str {
        "fuse-avg-pool2d"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let mut namer = NameCtx::above(symbol);
        let infer = StandardInference;
        let mut new_params = params.clone();

        let out = transform(symbol, |sym| {
            let Op::GlobalAvgPool2d = sym.op() else {
                return Ok(None);
            };
            let data = sym.args()[0].clone();
            let shape = data.shape()?;
            let window = (shape[2] * shape[3]) as f64;
            let dtype = data.dtype()?;

            let mut builder = OpBuilder::new(&mut namer, &infer);
            let summed = builder.op(
                Op::Sum(ReduceAttrs {
                    axes: Some(vec![2, 3]),
                    keepdims: true,
                }),
                vec![data],
            )?;
            let rescale = Tensor::scalar(dtype, 1.0 / window);
            let rescale_var = builder.var(format!("{}_rescale", sym.name()), rescale.spec().clone());
            new_params.insert(rescale_var.name().clone(), rescale);
            let fused = builder.op_named(sym.name().clone(), Op::Mul, vec![summed, rescale_var])?;
            Ok(Some(fused.with_extra(sym.extra().clone())))
        })?;

        Ok((out, new_params))
    }
}
