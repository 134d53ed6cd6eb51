//! Output-range estimation for every node.
//!
//! Calibration runs sample batches (or a seeded synthetic batch) through the
//! reference executor and records each node's observed `(min, max)` in its
//! extra attributes. Sampling then reduces the raw range to the symmetric
//! bound the discretizer consumes. Both stages are bit-for-bit deterministic
//! for a fixed seed or fixed data.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::info;

use crate::graph::{post_order, transform, SymbolRef};
use crate::ops;
use crate::runtime::{Executor, ReferenceExecutor, Value};
use crate::tensor::{ParametersT, Tensor};
use crate::trace::GraphTransform;

/// Calibration failures; fatal to the stage.
#[derive(Debug, Error)]
pub enum CalibrateError {
    #[error("sample batch {index} has spec {found}, input `{name}` expects {expected}")]
    Data {
        index: usize,
        name: Arc<str>,
        expected: String,
        found: String,
    },
    #[error("sample-data calibration requires exactly one runtime input, graph has {0}")]
    InputCount(usize),
    #[error("calibrator configured with neither sample data nor a random policy")]
    NoPolicy,
}

/// Synthetic calibration policy: inputs drawn uniformly from
/// `[-absmax, absmax]` with a fixed seed.
#[derive(Debug, Clone, Copy)]
pub struct RandomConfig {
    pub absmax: f64,
    pub seed: u64,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            absmax: 1.0,
            seed: 42,
        }
    }
}

/// Records per-node output ranges into `extra.range`.
pub struct Calibrator {
    data: Option<Vec<Tensor>>,
    random: Option<RandomConfig>,
    executor: Arc<dyn Executor>,
}

impl Calibrator {
    /// Calibrates against real sample batches bound to the sole runtime input.
    pub fn with_data(batches: Vec<Tensor>) -> Self {
        Self {
            data: Some(batches),
            random: None,
            executor: Arc::new(ReferenceExecutor),
        }
    }

    /// Calibrates against one synthetic batch drawn by `config`.
    pub fn with_random(config: RandomConfig) -> Self {
        Self {
            data: None,
            random: Some(config),
            executor: Arc::new(ReferenceExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    fn batches(
        &self,
        inputs: &[SymbolRef],
    ) -> Result<Vec<HashMap<Arc<str>, Tensor>>> {
        if let Some(batches) = &self.data {
            let [input] = inputs else {
                return Err(CalibrateError::InputCount(inputs.len()).into());
            };
            let expected = input.tensor_ty()?;
            for (index, batch) in batches.iter().enumerate() {
                if batch.spec() != expected {
                    return Err(CalibrateError::Data {
                        index,
                        name: input.name().clone(),
                        expected: expected.to_string(),
                        found: batch.spec().to_string(),
                    }
                    .into());
                }
            }
            return Ok(batches
                .iter()
                .map(|batch| {
                    let mut bound = HashMap::new();
                    bound.insert(input.name().clone(), batch.clone());
                    bound
                })
                .collect());
        }

        let Some(config) = self.random else {
            return Err(CalibrateError::NoPolicy.into());
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut bound = HashMap::new();
        for input in inputs {
            let spec = input.tensor_ty()?;
            let data: Vec<f64> = (0..spec.element_count())
                .map(|_| rng.gen_range(-config.absmax..=config.absmax))
                .collect();
            bound.insert(
                input.name().clone(),
                Tensor::new(spec.dtype, spec.shape.clone(), data)?,
            );
        }
        Ok(vec![bound])
    }
}

impl GraphTransform for Calibrator {
    fn name(&self) -> &'static str {
        "calibrate"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let inputs: Vec<SymbolRef> = post_order(symbol)
            .into_iter()
            .filter(|node| ops::is_input(node, params))
            .collect();
        let batches = self.batches(&inputs)?;

        let mut ranges: HashMap<Arc<str>, (f64, f64)> = HashMap::new();
        for bound in &batches {
            let outputs = self.executor.eval_nodes(symbol, params, bound)?;
            for (name, value) in outputs {
                if let Value::Tensor(tensor) = value {
                    let (lo, hi) = tensor.min_max();
                    ranges
                        .entry(name)
                        .and_modify(|r| {
                            r.0 = r.0.min(lo);
                            r.1 = r.1.max(hi);
                        })
                        .or_insert((lo, hi));
                }
            }
        }
        info!(
            batches = batches.len(),
            nodes = ranges.len(),
            "calibrated output ranges"
        );

        let out = transform(symbol, |sym| {
            Ok(ranges
                .get(sym.name())
                .map(|&range| sym.map_extra(|extra| extra.range = Some(range))))
        })?;
        Ok((out, params.clone()))
    }
}

/// Reduces calibrated ranges to the symmetric bound `max(|min|, |max|)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymmetricMinMaxSampling;

impl GraphTransform for SymmetricMinMaxSampling {
    fn name(&self) -> &'static str {
        "symmetric-min-max-sampling"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let out = transform(symbol, |sym| {
            Ok(sym.extra().range.map(|(lo, hi)| {
                sym.map_extra(|extra| extra.absmax = Some(lo.abs().max(hi.abs())))
            }))
        })?;
        Ok((out, params.clone()))
    }
}
