//! quantir: staged quantization of neural-network graphs.
//!
//! The pipeline takes an imported floating-point operator graph through
//! fusion, calibration, discretization, and fixed-point lowering, each stage
//! a checkpointed [`trace::Trace`] transform, and exports the resulting
//! integer graph for integer-only runtimes or provable-computation circuits.

pub mod calibrate;
pub mod discrete;
pub mod export;
pub mod fixed_point;
pub mod graph;
pub mod ops;
pub mod passes;
pub mod runtime;
pub mod tensor;
pub mod trace;

pub use graph::{Symbol, SymbolRef};
pub use tensor::{DType, ParametersT, Tensor, TensorSpec, ValueType};
pub use trace::{CheckpointOptions, GraphTransform, Trace};
