use anyhow::Result;

use crate::graph::{transform, SymbolRef};
use crate::ops::Op;
use crate::tensor::{ParametersT, ValueType};
use crate::trace::GraphTransform;

/// Collapses `TupleGetItem` over a freshly built `Tuple`, and collapses the
/// primary output of a tuple-typed `batch_norm` so downstream passes see a
/// single-output producer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseTupleGetItem;

impl GraphTransform for FuseTupleGetItem {
    fn name(&self) -> &'static str {
        "fuse-tuple-get-item"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let out = transform(symbol, |sym| {
            let Op::TupleGetItem { index } = sym.op() else {
                return Ok(None);
            };
            let producer = &sym.args()[0];
            match producer.op() {
                Op::Tuple => Ok(Some(producer.args()[*index].clone())),
                Op::BatchNorm { .. } if *index == 0 => {
                    let ValueType::Tuple(fields) = producer.ty() else {
                        return Ok(None);
                    };
                    let collapsed = producer.with_ty(ValueType::Tensor(fields[0].clone()));
                    Ok(Some(collapsed.with_extra(
                        collapsed.extra().merged_missing(sym.extra()),
                    )))
                }
                // the auxiliary batch-norm outputs (running stats) have no
                // inference-time consumer worth preserving
                _ => Ok(None),
            }
        })?;
        Ok((out, params.clone()))
    }
}
