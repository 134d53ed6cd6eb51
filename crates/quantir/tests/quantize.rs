mod support;

use std::sync::Arc;

use quantir::calibrate::{Calibrator, RandomConfig, SymmetricMinMaxSampling};
use quantir::discrete::SymmetricLinearDiscretor;
use quantir::fixed_point::{dequantize_output, quantize_input, FixPoint, Simulator};
use quantir::graph::{post_order, NameCtx};
use quantir::ops::{self, Op, OpBuilder, RequantAttrs, StandardInference};
use quantir::runtime::ReferenceExecutor;
use quantir::{
    CheckpointOptions, DType, GraphTransform, ParametersT, Tensor, TensorSpec, Trace,
};

use support::{dense_relu, seeded, tensor};

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    assert_eq!(a.shape(), b.shape());
    a.data()
        .iter()
        .zip(b.data())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// The contract scenario: `mul` with input scales 0.5 and 0.25 gets output
/// scale 0.125, and an 8-bit constraint forces a requant above it.
#[test]
fn multiply_scale_propagation_with_requant() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let lhs = b.var("a", TensorSpec::new(DType::F32, vec![2]));
    let rhs = b.var("b", TensorSpec::new(DType::F32, vec![2]));
    let root = b.mul(lhs, rhs).expect("mul types");

    let mut params = ParametersT::new();
    params.insert("b".into(), tensor(&[2], vec![31.75, -31.75]));

    let trace = Trace::from_graph("scenario", root, params).expect("trace");
    let calibrate = Calibrator::with_data(vec![tensor(&[2], vec![63.5, -63.5])]);
    let calibrated = trace
        .checkpoint_transform(
            &[&calibrate, &SymmetricMinMaxSampling],
            Some("calibrate"),
            CheckpointOptions::default(),
        )
        .expect("calibration");
    let discretized = calibrated
        .checkpoint_transform(
            &[&SymmetricLinearDiscretor::default()],
            Some("discrete"),
            CheckpointOptions::default(),
        )
        .expect("discretization");

    let root = discretized.symbol();
    let Op::Requant(RequantAttrs { shift, precision }) = root.op() else {
        panic!("expected a requant above the widened multiply, found {}", root.op().name());
    };
    assert_eq!((*shift, *precision), (7, 8));
    assert_eq!(root.scale(), Some(16.0));

    let mul = &root.args()[0];
    assert!(matches!(mul.op(), Op::Mul));
    assert_eq!(mul.scale(), Some(0.125), "output scale must be s1 * s2");

    for node in post_order(root) {
        match node.name().as_ref() {
            "a" => assert_eq!(node.scale(), Some(0.5)),
            "b" => assert_eq!(node.scale(), Some(0.25)),
            _ => {}
        }
    }
}

#[test]
fn fixed_point_graph_matches_float_graph_within_bound() {
    let (root, params) = dense_relu();
    let batches = vec![seeded(&[1, 4], 3, 1.0), seeded(&[1, 4], 4, 1.0)];

    let trace = Trace::from_graph("dense", root, params).expect("trace");
    let calibrate = Calibrator::with_data(batches.clone());
    let calibrated = trace
        .checkpoint_transform(
            &[&calibrate, &SymmetricMinMaxSampling],
            Some("calibrate"),
            CheckpointOptions::default(),
        )
        .expect("calibration");
    let discretized = calibrated
        .checkpoint_transform(
            &[&SymmetricLinearDiscretor::default()],
            Some("discrete"),
            CheckpointOptions::default(),
        )
        .expect("discretization");
    let fixed = discretized
        .checkpoint_transform(&[&FixPoint], Some("fix-point"), CheckpointOptions::default())
        .expect("fixed-point lowering");
    let simulated = discretized
        .checkpoint_transform(
            &[&Simulator::default()],
            Some("sim"),
            CheckpointOptions::default(),
        )
        .expect("simulator lowering");

    // both terminal stages hang off the same discretized parent
    assert!(discretized.stage_named("fix-point").is_some());
    assert!(discretized.stage_named("sim").is_some());

    let probe = batches[0].clone();
    let float_out = trace
        .eval(&ReferenceExecutor, &probe)
        .expect("float evaluation");

    let input_node = post_order(fixed.symbol())
        .into_iter()
        .find(|n| ops::is_input(n, fixed.params()))
        .expect("fixed graph keeps its input");
    let in_scale = input_node.scale().expect("input scale assigned");
    let in_precision = input_node.precision().expect("input precision assigned");
    let quantized_in = quantize_input(&probe, in_scale, in_precision);

    let int_out = fixed
        .eval(&ReferenceExecutor, &quantized_in)
        .expect("integer evaluation");
    assert!(
        int_out.data().iter().all(|v| v.fract() == 0.0),
        "integer graph produced non-integer values"
    );

    let out_scale = fixed.symbol().scale().expect("output scale assigned");
    let dequantized = dequantize_output(&int_out, out_scale);
    assert!(
        max_abs_diff(&float_out, &dequantized) <= 4.0 * out_scale,
        "fixed-point output strayed past its error bound"
    );

    // the simulator reproduces the integer path's rounding exactly
    let sim_out = simulated
        .eval(&ReferenceExecutor, &probe)
        .expect("simulator evaluation");
    assert!(max_abs_diff(&sim_out, &dequantized) < 1e-9);
}

#[test]
fn fixed_point_rejects_operators_without_integer_rule() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b
        .var("x", TensorSpec::new(DType::F32, vec![2]))
        .map_extra(|extra| {
            extra.scale = Some(0.5);
            extra.precision = Some(8);
        });
    let root = b
        .round(x)
        .expect("round types")
        .map_extra(|extra| {
            extra.scale = Some(0.5);
            extra.precision = Some(8);
        });

    let err = FixPoint.run(&root, &ParametersT::new()).unwrap_err();
    assert!(err.to_string().contains("no integer-equivalent"));
}

#[test]
fn seeded_calibration_is_deterministic() {
    let run = || {
        let (root, params) = dense_relu();
        let trace = Trace::from_graph("dense", root, params).expect("trace");
        let calibrate = Calibrator::with_random(RandomConfig {
            absmax: 1.0,
            seed: 7,
        });
        trace
            .checkpoint_transform(
                &[&calibrate, &SymmetricMinMaxSampling],
                Some("calibrate"),
                CheckpointOptions::default(),
            )
            .expect("calibration")
    };
    let first = run();
    let second = run();
    let lhs = post_order(first.symbol());
    let rhs = post_order(second.symbol());
    assert_eq!(lhs.len(), rhs.len());
    for (a, b) in lhs.iter().zip(&rhs) {
        assert_eq!(a.name(), b.name());
        assert_eq!(a.extra(), b.extra(), "ranges diverged at `{}`", a.name());
    }
}

#[test]
fn checkpoint_log_skips_recorded_stages() {
    let (root, params) = dense_relu();
    let trace = Trace::from_graph("dense", root, params).expect("trace");
    let calibrate = Calibrator::with_random(RandomConfig::default());
    let transforms: [&dyn GraphTransform; 2] = [&calibrate, &SymmetricMinMaxSampling];

    let first = trace
        .checkpoint_transform(&transforms, Some("calibrate"), CheckpointOptions::default())
        .expect("first run");
    let second = trace
        .checkpoint_transform(&transforms, Some("calibrate"), CheckpointOptions::default())
        .expect("cached run");
    assert!(Arc::ptr_eq(first.symbol(), second.symbol()));

    let forced = trace
        .checkpoint_transform(
            &transforms,
            Some("calibrate"),
            CheckpointOptions {
                force: true,
                ..Default::default()
            },
        )
        .expect("forced run");
    assert!(!Arc::ptr_eq(first.symbol(), forced.symbol()));
}
