//! The immutable graph node.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::GraphError;
use crate::ops::Op;
use crate::tensor::{DType, TensorSpec, ValueType};

/// Shared handle to one graph node. Aliasing a `SymbolRef` across traces is
/// how structural sharing works; nodes are never edited in place.
pub type SymbolRef = Arc<Symbol>;

/// Auxiliary metadata that rides along a node without affecting operator
/// semantics. Rewrites must propagate it; [`ExtraAttrs::merged_missing`]
/// backfills entries lost during reconstruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraAttrs {
    /// Name this node carried in the stage it was derived from.
    pub origin: Option<Arc<str>>,
    /// Calibrated output range `(min, max)`.
    pub range: Option<(f64, f64)>,
    /// Symmetric calibrated bound `max(|min|, |max|)`.
    pub absmax: Option<f64>,
    /// Assigned integer bit width, sign included.
    pub precision: Option<u8>,
    /// Assigned power-of-two scale.
    pub scale: Option<f64>,
}

impl ExtraAttrs {
    /// Entries set in `old` but absent here win; present entries are kept.
    pub fn merged_missing(&self, old: &ExtraAttrs) -> ExtraAttrs {
        ExtraAttrs {
            origin: self.origin.clone().or_else(|| old.origin.clone()),
            range: self.range.or(old.range),
            absmax: self.absmax.or(old.absmax),
            precision: self.precision.or(old.precision),
            scale: self.scale.or(old.scale),
        }
    }
}

/// One operator application in the computation DAG.
///
/// Identity is the `name`: two handles naming the same node are the same node
/// to the rewrite engine, however they were reached. All mutation is
/// copy-with-overrides via the `with_*` methods; the originals stay valid for
/// every trace that still references them.
#[derive(Debug, Clone)]
pub struct Symbol {
    name: Arc<str>,
    op: Op,
    args: SmallVec<[SymbolRef; 2]>,
    ty: ValueType,
    extra: ExtraAttrs,
}

impl Symbol {
    pub(crate) fn build(
        name: Arc<str>,
        op: Op,
        args: SmallVec<[SymbolRef; 2]>,
        ty: ValueType,
    ) -> SymbolRef {
        Arc::new(Symbol {
            name,
            op,
            args,
            ty,
            extra: ExtraAttrs::default(),
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn args(&self) -> &[SymbolRef] {
        &self.args
    }

    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    /// The node's tensor spec; tuple-typed nodes are a structural error here.
    pub fn tensor_ty(&self) -> Result<&TensorSpec, GraphError> {
        self.ty
            .as_tensor()
            .ok_or_else(|| GraphError::ExpectedTensor(self.name.clone()))
    }

    pub fn shape(&self) -> Result<&[usize], GraphError> {
        Ok(&self.tensor_ty()?.shape)
    }

    pub fn dtype(&self) -> Result<DType, GraphError> {
        Ok(self.tensor_ty()?.dtype)
    }

    pub fn extra(&self) -> &ExtraAttrs {
        &self.extra
    }

    /// Assigned power-of-two scale, if discretization has run.
    pub fn scale(&self) -> Option<f64> {
        self.extra.scale
    }

    /// Assigned bit width, if discretization has run.
    pub fn precision(&self) -> Option<u8> {
        self.extra.precision
    }

    pub fn with_args(self: &Arc<Self>, args: SmallVec<[SymbolRef; 2]>) -> SymbolRef {
        let mut node = (**self).clone();
        node.args = args;
        Arc::new(node)
    }

    pub fn with_ty(self: &Arc<Self>, ty: ValueType) -> SymbolRef {
        let mut node = (**self).clone();
        node.ty = ty;
        Arc::new(node)
    }

    pub fn with_op(self: &Arc<Self>, op: Op) -> SymbolRef {
        let mut node = (**self).clone();
        node.op = op;
        Arc::new(node)
    }

    pub fn with_extra(self: &Arc<Self>, extra: ExtraAttrs) -> SymbolRef {
        let mut node = (**self).clone();
        node.extra = extra;
        Arc::new(node)
    }

    /// Copy with one extra-attr field updated through `edit`.
    pub fn map_extra(self: &Arc<Self>, edit: impl FnOnce(&mut ExtraAttrs)) -> SymbolRef {
        let mut extra = self.extra.clone();
        edit(&mut extra);
        self.with_extra(extra)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}(", self.name, self.op.name())?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg.name())?;
        }
        write!(f, ") -> {}", self.ty)?;
        if let Some(scale) = self.extra.scale {
            write!(f, " scale={scale}")?;
        }
        if let Some(precision) = self.extra.precision {
            write!(f, " bits={precision}")?;
        }
        Ok(())
    }
}
