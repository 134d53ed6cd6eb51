//! Immutable symbol graph and the rewrite engine over it.

mod namer;
mod symbol;
mod transform;

pub use namer::NameCtx;
pub use symbol::{ExtraAttrs, Symbol, SymbolRef};
pub use transform::{as_variable, dump, graph_like, post_order, subgraph, transform};

use std::sync::Arc;

use thiserror::Error;

/// Structural failures while building, walking, or extracting graphs.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("node `{0}` is tuple-typed where a tensor was expected")]
    ExpectedTensor(Arc<str>),
    #[error("duplicate node name `{0}` in one graph")]
    DuplicateName(Arc<str>),
    #[error("extraction input `{0}` not found in graph")]
    MissingName(String),
    #[error("operator sequence diverges: `{new}` ({new_op}) vs `{old}` ({old_op})")]
    OpSequenceMismatch {
        new: Arc<str>,
        new_op: &'static str,
        old: Arc<str>,
        old_op: &'static str,
    },
    #[error("graphs hold different node counts: {new} vs {old}")]
    LengthMismatch { new: usize, old: usize },
}
