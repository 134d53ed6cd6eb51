//! Closed operator vocabulary and typed graph construction.
//!
//! Operator kinds are a tagged enumeration with their configuration carried
//! inside the variant, so an operator's attributes are fixed when the node is
//! built and the export/lowering layers can match exhaustively. The wire
//! names (`nn.conv2d`, `mrt.requant`, ...) are what the integer-graph export
//! emits.

pub mod infer;

pub use infer::{infer_value_type, InferError, StandardInference, TypeInference};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::graph::{NameCtx, Symbol, SymbolRef};
use crate::tensor::{DType, ParametersT, TensorSpec, ValueType};

/// Convolution configuration (NCHW layout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dAttrs {
    pub channels: usize,
    pub kernel: (usize, usize),
    pub strides: (usize, usize),
    pub padding: (usize, usize),
    pub groups: usize,
}

impl Conv2dAttrs {
    pub fn unit(channels: usize, kernel: (usize, usize)) -> Self {
        Self {
            channels,
            kernel,
            strides: (1, 1),
            padding: (0, 0),
            groups: 1,
        }
    }
}

/// Window pooling configuration (NCHW layout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool2dAttrs {
    pub pool: (usize, usize),
    pub strides: (usize, usize),
    pub padding: (usize, usize),
}

/// Reduction configuration; `axes: None` reduces every axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceAttrs {
    pub axes: Option<Vec<usize>>,
    pub keepdims: bool,
}

/// Rescale configuration: divide by `2^shift`, then clip to `precision` bits.
///
/// `shift` may be negative, meaning the value is scaled up; the fixed-point
/// lowering turns that case into an integer multiply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequantAttrs {
    pub shift: i32,
    pub precision: u8,
}

/// One operator kind, attributes included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Free variable: a graph input or a named parameter.
    Var,
    Tuple,
    TupleGetItem { index: usize },
    Conv2d(Conv2dAttrs),
    Dense { units: usize },
    BatchNorm { axis: usize, epsilon: f64 },
    BiasAdd { axis: usize },
    Relu,
    MaxPool2d(Pool2dAttrs),
    GlobalAvgPool2d,
    Dropout { rate: f64 },
    LogSoftmax { axis: usize },
    Sum(ReduceAttrs),
    Squeeze { axes: Vec<usize> },
    Reshape { newshape: Vec<i64> },
    Clip { a_min: f64, a_max: f64 },
    RightShift { bits: u32 },
    Cast { dtype: DType },
    Round,
    Add,
    Sub,
    Mul,
    Requant(RequantAttrs),
    Pclip { precision: u8 },
    RsPclip { shift: u32, precision: u8 },
}

impl Op {
    /// Wire name used by exports and dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Var => "var",
            Op::Tuple => "Tuple",
            Op::TupleGetItem { .. } => "TupleGetItem",
            Op::Conv2d(_) => "nn.conv2d",
            Op::Dense { .. } => "nn.dense",
            Op::BatchNorm { .. } => "nn.batch_norm",
            Op::BiasAdd { .. } => "nn.bias_add",
            Op::Relu => "nn.relu",
            Op::MaxPool2d(_) => "nn.max_pool2d",
            Op::GlobalAvgPool2d => "nn.adaptive_avg_pool2d",
            Op::Dropout { .. } => "nn.dropout",
            Op::LogSoftmax { .. } => "nn.log_softmax",
            Op::Sum(_) => "sum",
            Op::Squeeze { .. } => "squeeze",
            Op::Reshape { .. } => "reshape",
            Op::Clip { .. } => "clip",
            Op::RightShift { .. } => "right_shift",
            Op::Cast { .. } => "cast",
            Op::Round => "round",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "multiply",
            Op::Requant(_) => "mrt.requant",
            Op::Pclip { .. } => "mrt.pclip",
            Op::RsPclip { .. } => "mrt.rs_pclip",
        }
    }

    /// Shape-preserving quantization ops whose type is forced to the first
    /// argument's, bypassing generic inference.
    pub fn is_first_like(&self) -> bool {
        matches!(
            self,
            Op::Requant(_) | Op::Pclip { .. } | Op::RsPclip { .. }
        )
    }
}

/// `true` when the symbol is a free variable.
pub fn is_variable(sym: &Symbol) -> bool {
    matches!(sym.op(), Op::Var)
}

/// `true` when the symbol applies an operator.
pub fn is_operator(sym: &Symbol) -> bool {
    !is_variable(sym)
}

/// A variable with no backing tensor: a true runtime input.
pub fn is_input(sym: &Symbol, params: &ParametersT) -> bool {
    is_variable(sym) && !params.contains_key(sym.name())
}

/// A variable backed by a stored tensor: a learned constant.
pub fn is_param(sym: &Symbol, params: &ParametersT) -> bool {
    is_variable(sym) && params.contains_key(sym.name())
}

/// Typed node constructor bound to one naming session and one inference
/// collaborator. Every node it produces carries its inferred type; an
/// untyped node cannot be observed.
pub struct OpBuilder<'a> {
    namer: &'a mut NameCtx,
    infer: &'a dyn TypeInference,
}

impl<'a> OpBuilder<'a> {
    pub fn new(namer: &'a mut NameCtx, infer: &'a dyn TypeInference) -> Self {
        Self { namer, infer }
    }

    /// Builds an operator node with a fresh name.
    pub fn op(&mut self, op: Op, args: Vec<SymbolRef>) -> Result<SymbolRef, InferError> {
        let name = self.namer.fresh();
        self.op_named(name, op, args)
    }

    /// Builds an operator node under a caller-chosen name. Used by rewrites
    /// that replace a node but must keep its identity.
    pub fn op_named(
        &mut self,
        name: Arc<str>,
        op: Op,
        args: Vec<SymbolRef>,
    ) -> Result<SymbolRef, InferError> {
        let ty = infer::infer_value_type(&op, &args, self.infer)?;
        let args: SmallVec<[SymbolRef; 2]> = args.into();
        Ok(Symbol::build(name, op, args, ty))
    }

    /// Creates a free variable with an explicit type.
    pub fn var(&mut self, name: impl Into<Arc<str>>, spec: TensorSpec) -> SymbolRef {
        Symbol::build(
            name.into(),
            Op::Var,
            SmallVec::new(),
            ValueType::Tensor(spec),
        )
    }

    /// Creates a free variable with a session-generated name.
    pub fn fresh_var(&mut self, prefix: &str, spec: TensorSpec) -> SymbolRef {
        let name = self.namer.fresh_prefixed(prefix);
        self.var(name, spec)
    }

    pub fn tuple(&mut self, fields: Vec<SymbolRef>) -> Result<SymbolRef, InferError> {
        self.op(Op::Tuple, fields)
    }

    pub fn tuple_get_item(
        &mut self,
        tuple: SymbolRef,
        index: usize,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::TupleGetItem { index }, vec![tuple])
    }

    pub fn conv2d(
        &mut self,
        data: SymbolRef,
        weight: SymbolRef,
        attrs: Conv2dAttrs,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::Conv2d(attrs), vec![data, weight])
    }

    pub fn dense(
        &mut self,
        data: SymbolRef,
        weight: SymbolRef,
        units: usize,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::Dense { units }, vec![data, weight])
    }

    pub fn batch_norm(
        &mut self,
        data: SymbolRef,
        gamma: SymbolRef,
        beta: SymbolRef,
        mean: SymbolRef,
        var: SymbolRef,
        epsilon: f64,
    ) -> Result<SymbolRef, InferError> {
        self.op(
            Op::BatchNorm { axis: 1, epsilon },
            vec![data, gamma, beta, mean, var],
        )
    }

    pub fn bias_add(
        &mut self,
        data: SymbolRef,
        bias: SymbolRef,
        axis: usize,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::BiasAdd { axis }, vec![data, bias])
    }

    pub fn relu(&mut self, data: SymbolRef) -> Result<SymbolRef, InferError> {
        self.op(Op::Relu, vec![data])
    }

    pub fn max_pool2d(
        &mut self,
        data: SymbolRef,
        attrs: Pool2dAttrs,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::MaxPool2d(attrs), vec![data])
    }

    pub fn global_avg_pool2d(&mut self, data: SymbolRef) -> Result<SymbolRef, InferError> {
        self.op(Op::GlobalAvgPool2d, vec![data])
    }

    pub fn dropout(&mut self, data: SymbolRef, rate: f64) -> Result<SymbolRef, InferError> {
        self.op(Op::Dropout { rate }, vec![data])
    }

    pub fn log_softmax(&mut self, data: SymbolRef, axis: usize) -> Result<SymbolRef, InferError> {
        self.op(Op::LogSoftmax { axis }, vec![data])
    }

    pub fn sum(&mut self, data: SymbolRef, attrs: ReduceAttrs) -> Result<SymbolRef, InferError> {
        self.op(Op::Sum(attrs), vec![data])
    }

    pub fn squeeze(&mut self, data: SymbolRef, axes: Vec<usize>) -> Result<SymbolRef, InferError> {
        self.op(Op::Squeeze { axes }, vec![data])
    }

    pub fn reshape(
        &mut self,
        data: SymbolRef,
        newshape: Vec<i64>,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::Reshape { newshape }, vec![data])
    }

    pub fn clip(
        &mut self,
        data: SymbolRef,
        a_min: f64,
        a_max: f64,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::Clip { a_min, a_max }, vec![data])
    }

    pub fn right_shift(&mut self, data: SymbolRef, bits: u32) -> Result<SymbolRef, InferError> {
        self.op(Op::RightShift { bits }, vec![data])
    }

    pub fn cast(&mut self, data: SymbolRef, dtype: DType) -> Result<SymbolRef, InferError> {
        self.op(Op::Cast { dtype }, vec![data])
    }

    pub fn round(&mut self, data: SymbolRef) -> Result<SymbolRef, InferError> {
        self.op(Op::Round, vec![data])
    }

    pub fn add(&mut self, lhs: SymbolRef, rhs: SymbolRef) -> Result<SymbolRef, InferError> {
        self.op(Op::Add, vec![lhs, rhs])
    }

    pub fn sub(&mut self, lhs: SymbolRef, rhs: SymbolRef) -> Result<SymbolRef, InferError> {
        self.op(Op::Sub, vec![lhs, rhs])
    }

    pub fn mul(&mut self, lhs: SymbolRef, rhs: SymbolRef) -> Result<SymbolRef, InferError> {
        self.op(Op::Mul, vec![lhs, rhs])
    }

    pub fn requant(
        &mut self,
        data: SymbolRef,
        attrs: RequantAttrs,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::Requant(attrs), vec![data])
    }

    pub fn pclip(&mut self, data: SymbolRef, precision: u8) -> Result<SymbolRef, InferError> {
        self.op(Op::Pclip { precision }, vec![data])
    }

    pub fn rs_pclip(
        &mut self,
        data: SymbolRef,
        shift: u32,
        precision: u8,
    ) -> Result<SymbolRef, InferError> {
        self.op(Op::RsPclip { shift, precision }, vec![data])
    }
}
