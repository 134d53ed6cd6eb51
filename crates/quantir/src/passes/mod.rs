//! Pattern-based fusion passes.
//!
//! Each pass recognizes one local operator pattern and replaces it with an
//! equivalent form, preserving the output tensor exactly up to float
//! associativity. Ordering matters: tuple-get-item collapse must precede
//! batch-norm folding (so multi-output producers are single-output by then),
//! and constant folding runs after every structural fusion so it only sees
//! finished weight-only subtrees.

mod fold_constant;
mod fuse_avg_pool;
mod fuse_batch_norm;
mod fuse_identity;
mod fuse_tuple_get_item;

pub use fold_constant::FoldConstant;
pub use fuse_avg_pool::FuseAvgPool2d;
pub use fuse_batch_norm::FuseBatchNorm;
pub use fuse_identity::{FuseDropout, FuseNaiveSoftmax};
pub use fuse_tuple_get_item::FuseTupleGetItem;

use std::collections::HashMap;
use std::sync::Arc;

use crate::graph::{post_order, SymbolRef};

/// Number of distinct consumers per node name.
pub(crate) fn consumer_counts(root: &SymbolRef) -> HashMap<Arc<str>, usize> {
    let mut counts: HashMap<Arc<str>, usize> = HashMap::new();
    for node in post_order(root) {
        for arg in node.args() {
            *counts.entry(arg.name().clone()).or_default() += 1;
        }
    }
    counts
}
