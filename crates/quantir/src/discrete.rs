//! Precision and scale assignment from calibrated ranges.
//!
//! The symmetric linear policy: every node gets a power-of-two `scale` and a
//! bit width `precision` such that `absmax / scale <= 2^(precision-1) - 1`,
//! with the scale the smallest power of two admitting the bound. Scales
//! propagate structurally — multiplicative operators multiply their input
//! scales, additive operators first rescale operands to a common scale via
//! inserted `requant` nodes — and any output whose natural width exceeds the
//! configured standard precision is requantized back down.

use std::sync::Arc;

use anyhow::Result;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

use crate::graph::{transform, NameCtx, Symbol, SymbolRef};
use crate::ops::{Op, RequantAttrs};
use crate::tensor::ParametersT;
use crate::trace::GraphTransform;

/// Discretization failures; fatal to the stage.
#[derive(Debug, Error)]
pub enum DiscreteError {
    #[error("node `{0}` has no calibrated absmax; run calibration and sampling first")]
    MissingAbsmax(Arc<str>),
    #[error("`{op}` at node `{name}` has no scale propagation rule; fuse it away first")]
    UnsupportedOp { op: &'static str, name: Arc<str> },
}

/// Smallest power of two `s` with `absmax / s <= 2^(bits-1) - 1`.
pub fn pow2_scale(absmax: f64, bits: u8) -> f64 {
    if absmax <= 0.0 {
        return 1.0;
    }
    let limit = ((1u64 << (bits - 1)) - 1) as f64;
    2f64.powi((absmax / limit).log2().ceil() as i32)
}

/// Smallest bit width admitting `absmax` at `scale`.
pub fn bits_for(absmax: f64, scale: f64) -> u8 {
    let quantized = absmax / scale;
    for bits in 2u8..=64 {
        if quantized <= ((1u128 << (bits - 1)) - 1) as f64 {
            return bits;
        }
    }
    64
}

/// Exponent `k` with `to = from * 2^k`; both sides are powers of two.
fn shift_between(from: f64, to: f64) -> i32 {
    let exact = (to / from).log2();
    let shift = exact.round();
    debug_assert!((exact - shift).abs() < 1e-9, "scales must be powers of two");
    shift as i32
}

#[derive(Debug, Clone, Copy)]
pub struct DiscreteConfig {
    /// Bit width assigned to variables and restored after wide intermediates.
    pub standard_precision: u8,
}

impl Default for DiscreteConfig {
    fn default() -> Self {
        Self {
            standard_precision: 8,
        }
    }
}

/// The `SymmetricLinearDiscretor` policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymmetricLinearDiscretor {
    pub config: DiscreteConfig,
}

impl SymmetricLinearDiscretor {
    pub fn new(config: DiscreteConfig) -> Self {
        Self { config }
    }
}

fn absmax_of(sym: &SymbolRef) -> Result<f64, DiscreteError> {
    sym.extra()
        .absmax
        .ok_or_else(|| DiscreteError::MissingAbsmax(sym.name().clone()))
}

fn scale_of(sym: &SymbolRef) -> f64 {
    sym.scale()
        .expect("arguments are discretized before their consumer")
}

fn annotate(sym: SymbolRef, scale: f64, precision: u8) -> SymbolRef {
    sym.map_extra(|extra| {
        extra.scale = Some(scale);
        extra.precision = Some(precision);
    })
}

/// Wraps `arg` in a `requant` rescaling it from its own scale to `to_scale`.
fn requant(namer: &mut NameCtx, arg: SymbolRef, to_scale: f64, precision: u8) -> SymbolRef {
    let shift = shift_between(scale_of(&arg), to_scale);
    let absmax = arg.extra().absmax;
    let origin = arg.name().clone();
    let ty = arg.ty().clone();
    let node = Symbol::build(
        namer.fresh(),
        Op::Requant(RequantAttrs { shift, precision }),
        SmallVec::from_vec(vec![arg]),
        ty,
    );
    node.map_extra(|extra| {
        extra.origin = Some(origin);
        extra.absmax = absmax;
        extra.scale = Some(to_scale);
        extra.precision = Some(precision);
    })
}

impl GraphTransform for SymmetricLinearDiscretor {
    fn name(&self) -> &'static str {
        "symmetric-linear-discretor"
    }

    fn run(&self, symbol: &SymbolRef, params: &ParametersT) -> Result<(SymbolRef, ParametersT)> {
        let standard = self.config.standard_precision;
        let mut namer = NameCtx::above(symbol);

        let out = transform(symbol, |sym| {
            let node = match sym.op() {
                Op::Var => {
                    let absmax = absmax_of(sym)?;
                    let scale = pow2_scale(absmax, standard);
                    annotate(sym.clone(), scale, standard)
                }

                // scale-transparent: representation passes straight through
                Op::Relu
                | Op::MaxPool2d(_)
                | Op::Reshape { .. }
                | Op::Squeeze { .. }
                | Op::Clip { .. } => {
                    let scale = scale_of(&sym.args()[0]);
                    let precision = match sym.extra().absmax {
                        Some(absmax) => bits_for(absmax, scale),
                        None => sym.args()[0]
                            .precision()
                            .expect("arguments are discretized before their consumer"),
                    };
                    annotate(sym.clone(), scale, precision)
                }

                // accumulation keeps the scale and widens
                Op::Sum(_) => {
                    let absmax = absmax_of(sym)?;
                    let scale = scale_of(&sym.args()[0]);
                    annotate(sym.clone(), scale, bits_for(absmax, scale))
                }

                // multiplicative: output scale is the product of input scales
                Op::Mul | Op::Conv2d(_) | Op::Dense { .. } => {
                    let absmax = absmax_of(sym)?;
                    let scale = scale_of(&sym.args()[0]) * scale_of(&sym.args()[1]);
                    annotate(sym.clone(), scale, bits_for(absmax, scale))
                }

                // additive: operands must agree on a scale first
                Op::Add | Op::Sub | Op::BiasAdd { .. } => {
                    let absmax = absmax_of(sym)?;
                    let common = sym
                        .args()
                        .iter()
                        .map(scale_of)
                        .fold(f64::MIN, f64::max);
                    let args: SmallVec<[SymbolRef; 2]> = sym
                        .args()
                        .iter()
                        .map(|arg| {
                            if scale_of(arg) == common {
                                arg.clone()
                            } else {
                                let bits = match arg.extra().absmax {
                                    Some(a) => bits_for(a, common),
                                    None => standard,
                                };
                                requant(&mut namer, arg.clone(), common, bits)
                            }
                        })
                        .collect();
                    annotate(sym.with_args(args), common, bits_for(absmax, common))
                }

                Op::Tuple => return Ok(None),

                op => {
                    return Err(DiscreteError::UnsupportedOp {
                        op: op.name(),
                        name: sym.name().clone(),
                    }
                    .into())
                }
            };

            // wide intermediates drop back to the standard width
            let precision = node.precision().unwrap_or(standard);
            if matches!(node.op(), Op::Var) || precision <= standard {
                return Ok(Some(node));
            }
            let absmax = absmax_of(&node)?;
            let target = pow2_scale(absmax, standard);
            debug!(
                node = %node.name(),
                natural_bits = precision,
                scale = target,
                "requantizing wide intermediate"
            );
            Ok(Some(requant(&mut namer, node, target, standard)))
        })?;

        Ok((out, params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_admitting_power_of_two() {
        assert_eq!(pow2_scale(127.0, 8), 1.0);
        assert_eq!(pow2_scale(128.0, 8), 2.0);
        assert_eq!(pow2_scale(1.0, 8), 2f64.powi(-6));
        assert_eq!(pow2_scale(0.0, 8), 1.0);
    }

    #[test]
    fn width_from_bound_and_scale() {
        assert_eq!(bits_for(127.0, 1.0), 8);
        assert_eq!(bits_for(128.0, 1.0), 9);
        assert_eq!(bits_for(1.0, 1.0), 2);
    }

    #[test]
    fn shift_is_exact_for_pow2_pairs() {
        assert_eq!(shift_between(0.125, 16.0), 7);
        assert_eq!(shift_between(0.5, 0.5), 0);
        assert_eq!(shift_between(1.0, 0.25), -2);
    }
}
