//! Circuit export for fixed-point graphs.
//!
//! Maps each symbol of an all-integer graph onto one circom component and
//! emits a complete circuit source plus the witness input JSON. Parameters
//! enter the circuit as signals; one designated input symbol is redirected to
//! take caller-supplied data instead of a stored parameter.

mod generate;
mod witness;

pub use generate::{model_to_circom, CircomError};
pub use witness::input_json;

use anyhow::Result;
use quantir::graph::post_order;
use quantir::{ops, ParametersT, SymbolRef, Tensor};

/// A generated circuit and its witness input file.
#[derive(Debug, Clone)]
pub struct CircuitArtifact {
    pub code: String,
    pub witness: serde_json::Value,
}

/// Generates the circuit and witness for a fixed-point trace.
///
/// `input` supplies data for the graph's runtime input; when omitted, the
/// input must already be present in `params`.
pub fn export_circuit(
    symbol: &SymbolRef,
    params: &ParametersT,
    input: Option<&Tensor>,
) -> Result<CircuitArtifact> {
    let mut bound = params.clone();
    if let Some(tensor) = input {
        let first_input = post_order(symbol)
            .into_iter()
            .find(|node| ops::is_input(node, params))
            .ok_or(CircomError::NoInput)?;
        bound.insert(first_input.name().clone(), tensor.clone());
    }

    let code = model_to_circom(symbol)?;
    let witness = input_json(symbol, &bound)?;
    Ok(CircuitArtifact { code, witness })
}
