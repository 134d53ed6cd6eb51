use anyhow::Result;

use crate::graph::{transform, SymbolRef};
use crate::ops::Op;
use crate::tensor::ParametersT;
use crate::trace::GraphTransform;

/// Removes dropout nodes; at inference time dropout is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseDropout;

impl GraphTransform for FuseDropout {
    fn name(&self) -> &'static str {
        "fuse-dropout"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let out = transform(symbol, |sym| {
            if let Op::Dropout { .. } = sym.op() {
                Ok(Some(sym.args()[0].clone()))
            } else {
                Ok(None)
            }
        })?;
        Ok((out, params.clone()))
    }
}

/// Drops a trailing `log_softmax`.
///
/// Only the graph root is touched: log_softmax is monotone, so a
/// classification argmax is unchanged, and the integer path has no
/// equivalent for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseNaiveSoftmax;

impl GraphTransform for FuseNaiveSoftmax {
    fn name(&self) -> &'static str {
        "fuse-naive-softmax"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let mut root = symbol.clone();
        while let Op::LogSoftmax { .. } = root.op() {
            root = root.args()[0].clone();
        }
        Ok((root, params.clone()))
    }
}
