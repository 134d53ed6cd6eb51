//! Witness input emission.

use serde_json::{json, Map, Value};

use quantir::graph::post_order;
use quantir::ops::Op;
use quantir::{ParametersT, SymbolRef};

use crate::generate::{CircomError, SignalNames};

/// Builds the witness input JSON: one entry per variable, keyed by the same
/// signal names the generated circuit declares, values flattened row-major.
///
/// Traversal order matches [`crate::model_to_circom`], so the name mapping is
/// identical by construction.
pub fn input_json(symbol: &SymbolRef, params: &ParametersT) -> Result<Value, CircomError> {
    let mut names = SignalNames::new();
    let mut object = Map::new();
    for node in post_order(symbol) {
        let sig = names.name_for(node.name());
        if !matches!(node.op(), Op::Var) {
            continue;
        }
        let tensor = params
            .get(node.name())
            .ok_or_else(|| CircomError::Shape {
                op: "var",
                name: node.name().clone(),
                msg: "no tensor bound for circuit input".into(),
            })?;
        let values: Vec<Value> = tensor
            .data()
            .iter()
            .map(|&v| json!(v as i64))
            .collect();
        object.insert(sig, Value::Array(values));
    }
    Ok(Value::Object(object))
}
