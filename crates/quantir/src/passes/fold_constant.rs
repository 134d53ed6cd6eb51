use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::graph::{as_variable, post_order, transform, SymbolRef};
use crate::ops::{self, Op};
use crate::runtime::{Executor, ReferenceExecutor};
use crate::tensor::ParametersT;
use crate::trace::GraphTransform;

/// Evaluates operator subgraphs whose every leaf is a stored parameter and
/// replaces them with fresh parameter variables.
///
/// Must run after the structural fusions: by then a weight-only subtree is in
/// its final shape and a single evaluation retires it. Folded nodes keep
/// their names, so the new parameter entry slots in where the operator was.
pub struct FoldConstant {
    executor: Arc<dyn Executor>,
}

impl FoldConstant {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Default for FoldConstant {
    fn default() -> Self {
        Self::new(Arc::new(ReferenceExecutor))
    }
}

impl GraphTransform for FoldConstant {
    fn name(&self) -> &'static str {
        "fold-constant"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let order = post_order(symbol);

        let mut is_static: HashMap<Arc<str>, bool> = HashMap::new();
        for node in &order {
            let flag = if ops::is_variable(node) {
                ops::is_param(node, params)
            } else {
                node.args()
                    .iter()
                    .all(|arg| is_static[arg.name()])
            };
            is_static.insert(node.name().clone(), flag);
        }

        let mut dynamic_users: HashSet<Arc<str>> = HashSet::new();
        for node in &order {
            if !is_static[node.name()] {
                for arg in node.args() {
                    dynamic_users.insert(arg.name().clone());
                }
            }
        }

        let root_name = symbol.name().clone();
        let targets: HashSet<Arc<str>> = order
            .iter()
            .filter(|node| {
                ops::is_operator(node)
                    && !matches!(node.op(), Op::Tuple)
                    && node.ty().as_tensor().is_some()
                    && is_static[node.name()]
                    && (dynamic_users.contains(node.name()) || *node.name() == root_name)
            })
            .map(|node| node.name().clone())
            .collect();

        let mut new_params = params.clone();
        let empty = HashMap::new();
        let out = transform(symbol, |sym| {
            if !targets.contains(sym.name()) {
                return Ok(None);
            }
            // arguments already folded by this pass resolve through the
            // entries inserted below
            let value = self.executor.eval(sym, &new_params, &empty)?;
            debug!(node = %sym.name(), op = sym.op().name(), "folded constant subgraph");
            new_params.insert(sym.name().clone(), value);
            Ok(Some(as_variable(sym)))
        })?;

        Ok((out, new_params))
    }
}
