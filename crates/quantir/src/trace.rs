//! Staged pipeline control: named trace snapshots over graph transforms.
//!
//! A [`Trace`] binds one graph root to its parameter store at one pipeline
//! stage. [`Trace::checkpoint_transform`] threads a list of transforms over a
//! trace and produces the next one; completed stages are retained in a shared
//! log so a pipeline can skip re-execution, print any stage, or branch two
//! stages (e.g. a fixed-point graph and its float simulator) off the same
//! parent. A trace is never mutated after construction.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::graph::{dump, post_order, SymbolRef};
use crate::ops;
use crate::runtime::Executor;
use crate::tensor::{ParametersT, Tensor};

/// A pure graph-to-graph pipeline stage.
///
/// Transforms consume the previous stage's graph and parameters and build new
/// ones; they must never mutate their inputs (parameter tensors are shared
/// across traces).
pub trait GraphTransform {
    fn name(&self) -> &'static str;
    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)>;
}

/// Controls one `checkpoint_transform` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointOptions {
    /// Re-execute even when the stage log already holds a result.
    pub force: bool,
    /// Dump the graph before the first transform runs.
    pub print_before: bool,
    /// Dump the graph after the last transform ran.
    pub print_after: bool,
}

#[derive(Default)]
struct StageLog {
    stages: Mutex<HashMap<String, Trace>>,
}

/// One named pipeline stage: a graph root plus its parameters.
#[derive(Clone)]
pub struct Trace {
    model: Arc<str>,
    stage: Arc<str>,
    symbol: SymbolRef,
    params: Arc<ParametersT>,
    log: Arc<StageLog>,
}

impl Trace {
    /// Wraps an imported, fully-typed graph as the initial stage.
    ///
    /// Validates what the import boundary promises: unique node names and
    /// parameter tensors agreeing with their variables' declared types.
    pub fn from_graph(
        model: impl Into<Arc<str>>,
        symbol: SymbolRef,
        params: ParametersT,
    ) -> Result<Trace> {
        let mut seen: HashSet<Arc<str>> = HashSet::new();
        for node in post_order(&symbol) {
            if !seen.insert(node.name().clone()) {
                bail!("duplicate node name `{}` in imported graph", node.name());
            }
            if ops::is_param(&node, &params) {
                let declared = node.tensor_ty()?;
                let stored = params[node.name()].spec();
                if declared != stored {
                    bail!(
                        "parameter `{}` declared {} but stored {}",
                        node.name(),
                        declared,
                        stored
                    );
                }
            }
        }
        let trace = Trace {
            model: model.into(),
            stage: Arc::from("init"),
            symbol,
            params: Arc::new(params),
            log: Arc::new(StageLog::default()),
        };
        trace.checkpoint();
        Ok(trace)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn symbol(&self) -> &SymbolRef {
        &self.symbol
    }

    pub fn params(&self) -> &ParametersT {
        &self.params
    }

    fn log_key(&self, stage: &str) -> String {
        format!("{}/{}", self.model, stage)
    }

    /// Records this trace in the shared stage log under its stage name.
    pub fn checkpoint(&self) {
        let key = self.log_key(&self.stage);
        self.log
            .stages
            .lock()
            .expect("stage log poisoned")
            .insert(key, self.clone());
    }

    /// Retrieves a previously recorded stage.
    pub fn stage_named(&self, stage: &str) -> Option<Trace> {
        let key = self.log_key(stage);
        self.log
            .stages
            .lock()
            .expect("stage log poisoned")
            .get(&key)
            .cloned()
    }

    /// Applies `transforms` in order and returns the resulting stage.
    ///
    /// The stage is named `name` (or the transform names joined). A stage
    /// already present in the log short-circuits unless `force` is set; the
    /// source trace is left untouched either way.
    pub fn checkpoint_transform(
        &self,
        transforms: &[&dyn GraphTransform],
        name: Option<&str>,
        opts: CheckpointOptions,
    ) -> Result<Trace> {
        let stage: String = match name {
            Some(name) => name.to_string(),
            None => transforms
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join("-"),
        };
        let key = self.log_key(&stage);

        if !opts.force {
            let cached = self
                .log
                .stages
                .lock()
                .expect("stage log poisoned")
                .get(&key)
                .cloned();
            if let Some(trace) = cached {
                info!(model = %self.model, stage = %stage, "stage already recorded, skipping");
                return Ok(trace);
            }
        }

        if opts.print_before {
            info!(model = %self.model, stage = %stage, "before:\n{}", dump(&self.symbol));
        }

        let mut symbol = self.symbol.clone();
        let mut params: ParametersT = (*self.params).clone();
        for transform in transforms {
            debug!(model = %self.model, transform = transform.name(), "running transform");
            let (next_symbol, next_params) = transform.run(&symbol, &params)?;
            symbol = next_symbol;
            params = next_params;
        }

        // parameters referenced by no surviving variable are dropped with the
        // stage that lost them
        let live: HashSet<Arc<str>> = post_order(&symbol)
            .iter()
            .filter(|node| ops::is_variable(node))
            .map(|node| node.name().clone())
            .collect();
        params.retain(|name, _| live.contains(name));

        if opts.print_after {
            info!(model = %self.model, stage = %stage, "after:\n{}", dump(&symbol));
        }

        let trace = Trace {
            model: self.model.clone(),
            stage: Arc::from(stage),
            symbol,
            params: Arc::new(params),
            log: Arc::clone(&self.log),
        };
        trace.checkpoint();
        Ok(trace)
    }

    /// Runs the stage's graph on `input` bound to the sole runtime input.
    pub fn eval(&self, executor: &dyn Executor, input: &Tensor) -> Result<Tensor> {
        let inputs: Vec<SymbolRef> = post_order(&self.symbol)
            .into_iter()
            .filter(|node| ops::is_input(node, &self.params))
            .collect();
        let [input_sym] = inputs.as_slice() else {
            bail!(
                "graph has {} runtime inputs, expected exactly one",
                inputs.len()
            );
        };
        let mut bound = HashMap::new();
        bound.insert(input_sym.name().clone(), input.clone());
        executor.eval(&self.symbol, &self.params, &bound)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trace {}/{}:", self.model, self.stage)?;
        write!(f, "{}", dump(&self.symbol))
    }
}
