//! Post-order rewrite engine with name-keyed memoization.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::mem::discriminant;
use std::sync::Arc;

use anyhow::Result;
use smallvec::SmallVec;

use super::namer::NameCtx;
use super::symbol::{Symbol, SymbolRef};
use super::GraphError;
use crate::ops::Op;
use crate::tensor::ValueType;

/// Dependency-ordered enumeration of the distinct nodes reachable from
/// `root`: every argument precedes its consumer, and a name appears once no
/// matter how many paths reach it.
pub fn post_order(root: &SymbolRef) -> Vec<SymbolRef> {
    let mut order = Vec::new();
    let mut seen: HashSet<Arc<str>> = HashSet::new();
    // (node, args_pushed)
    let mut stack: Vec<(SymbolRef, bool)> = vec![(root.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if seen.contains(node.name()) {
            continue;
        }
        if expanded {
            seen.insert(node.name().clone());
            order.push(node);
            continue;
        }
        stack.push((node.clone(), true));
        for arg in node.args().iter().rev() {
            if !seen.contains(arg.name()) {
                stack.push((arg.clone(), false));
            }
        }
    }
    order
}

/// Rebuilds the graph bottom-up, invoking `visitor` exactly once per distinct
/// node name.
///
/// The node handed to the visitor already has its arguments substituted with
/// their rewritten forms, so attribute or type updates may rely on updated
/// children. Returning `Ok(None)` keeps the structurally-copied node;
/// returning a replacement substitutes it for every consumer, whatever the
/// replacement's own name is.
pub fn transform<F>(root: &SymbolRef, mut visitor: F) -> Result<SymbolRef>
where
    F: FnMut(&SymbolRef) -> Result<Option<SymbolRef>>,
{
    let mut memo: HashMap<Arc<str>, SymbolRef> = HashMap::new();
    for node in post_order(root) {
        let changed = node
            .args()
            .iter()
            .any(|arg| !Arc::ptr_eq(&memo[arg.name()], arg));
        let rebuilt = if changed {
            let args: SmallVec<[SymbolRef; 2]> = node
                .args()
                .iter()
                .map(|arg| memo[arg.name()].clone())
                .collect();
            node.with_args(args)
        } else {
            node.clone()
        };
        let out = visitor(&rebuilt)?.unwrap_or(rebuilt);
        memo.insert(node.name().clone(), out);
    }
    Ok(memo[root.name()].clone())
}

/// Converts a node into a free variable of the same name and type, detaching
/// it from its own subgraph.
pub fn as_variable(sym: &SymbolRef) -> SymbolRef {
    Symbol::build(
        sym.name().clone(),
        Op::Var,
        SmallVec::new(),
        sym.ty().clone(),
    )
    .with_extra(sym.extra().clone())
}

/// Extracts the region bounded by `inames` (cut to fresh variables) and
/// `onames` (collected as outputs).
///
/// With several outputs the result is a `Tuple`; with none matched the result
/// falls back to the (possibly rewritten) root. A name listed in `inames`
/// that does not occur in the graph is a structural error.
pub fn subgraph(root: &SymbolRef, inames: &[&str], onames: &[&str]) -> Result<SymbolRef> {
    let mut outputs: Vec<SymbolRef> = Vec::new();
    let mut cut: HashSet<String> = HashSet::new();
    let rewritten = transform(root, |sym| {
        let name = sym.name().as_ref();
        if inames.contains(&name) {
            cut.insert(name.to_string());
            return Ok(Some(as_variable(sym)));
        }
        if onames.contains(&name) {
            outputs.push(sym.clone());
        }
        Ok(None)
    })?;

    for iname in inames {
        if !cut.contains(*iname) {
            return Err(GraphError::MissingName((*iname).to_string()).into());
        }
    }

    match outputs.len() {
        0 => Ok(rewritten),
        1 => Ok(outputs.pop().expect("length checked")),
        _ => {
            let fields = outputs
                .iter()
                .map(|out| Ok(out.tensor_ty()?.clone()))
                .collect::<Result<Vec<_>, GraphError>>()?;
            let mut namer = NameCtx::above(root);
            Ok(Symbol::build(
                namer.fresh(),
                Op::Tuple,
                outputs.into(),
                ValueType::Tuple(fields),
            ))
        }
    }
}

/// Walks two structurally-parallel graphs in lockstep and backfills onto
/// `new` the auxiliary metadata present in `old` but lost during a rebuild.
/// Divergent operator sequences are an error.
pub fn graph_like(new: &SymbolRef, old: &SymbolRef) -> Result<SymbolRef> {
    let old_nodes = post_order(old);
    let new_len = post_order(new).len();
    if new_len != old_nodes.len() {
        return Err(GraphError::LengthMismatch {
            new: new_len,
            old: old_nodes.len(),
        }
        .into());
    }

    let mut old_iter = old_nodes.into_iter();
    transform(new, |sym| {
        let target = old_iter.next().expect("lengths checked above");
        if discriminant(sym.op()) != discriminant(target.op()) {
            return Err(GraphError::OpSequenceMismatch {
                new: sym.name().clone(),
                new_op: sym.op().name(),
                old: target.name().clone(),
                old_op: target.op().name(),
            }
            .into());
        }
        Ok(Some(
            sym.with_extra(sym.extra().merged_missing(target.extra())),
        ))
    })
}

/// Renders the graph as one line per node in dependency order.
pub fn dump(root: &SymbolRef) -> String {
    let mut text = String::new();
    for node in post_order(root) {
        let _ = writeln!(text, "{node}");
    }
    text
}
