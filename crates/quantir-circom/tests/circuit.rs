use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quantir::calibrate::{Calibrator, SymmetricMinMaxSampling};
use quantir::discrete::SymmetricLinearDiscretor;
use quantir::fixed_point::{quantize_input, FixPoint};
use quantir::graph::{post_order, NameCtx};
use quantir::ops::{self, OpBuilder, StandardInference};
use quantir::{CheckpointOptions, DType, ParametersT, Tensor, TensorSpec, Trace};

use quantir_circom::{export_circuit, model_to_circom};

fn random_tensor(shape: &[usize], seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let count: usize = shape.iter().product();
    let data = (0..count).map(|_| rng.gen_range(-1.0..=1.0)).collect();
    Tensor::new(DType::F32, shape.to_vec(), data).expect("tensor shape")
}

fn fixed_point_dense() -> Trace {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b.var("input", TensorSpec::new(DType::F32, vec![1, 4]));
    let w = b.var("dense_weight", TensorSpec::new(DType::F32, vec![3, 4]));
    let dense = b.dense(x, w, 3).expect("dense types");
    let bias = b.var("dense_bias", TensorSpec::new(DType::F32, vec![3]));
    let biased = b.bias_add(dense, bias, 1).expect("bias_add types");
    let root = b.relu(biased).expect("relu types");

    let mut params = ParametersT::new();
    params.insert("dense_weight".into(), random_tensor(&[3, 4], 17));
    params.insert(
        "dense_bias".into(),
        Tensor::new(DType::F32, vec![3], vec![0.25, -0.125, 0.0625]).expect("bias"),
    );

    let trace = Trace::from_graph("dense", root, params).expect("trace");
    let calibrate = Calibrator::with_data(vec![random_tensor(&[1, 4], 19)]);
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
    discretized
        .checkpoint_transform(&[&FixPoint], Some("fix-point"), CheckpointOptions::default())
        .expect("fixed-point lowering")
}

#[test]
fn dense_graph_generates_a_complete_circuit() {
    let fixed = fixed_point_dense();
    let code = model_to_circom(fixed.symbol()).expect("circuit generation");

    assert!(code.starts_with("pragma circom 2.0.0;"));
    assert!(code.contains("template DenseLayer"));
    assert!(code.contains("template Relu"));
    assert!(code.contains("template Model()"));
    assert!(code.contains("component main = Model();"));
    assert!(code.contains("signal input input["));
    assert!(code.contains("signal output out[3];"));
}

#[test]
fn witness_covers_every_variable_and_the_caller_input() {
    let fixed = fixed_point_dense();

    let input_node = post_order(fixed.symbol())
        .into_iter()
        .find(|n| ops::is_input(n, fixed.params()))
        .expect("input variable");
    let scale = input_node.scale().expect("input scale");
    let precision = input_node.precision().expect("input precision");
    let quantized = quantize_input(&random_tensor(&[1, 4], 19), scale, precision);

    let artifact =
        export_circuit(fixed.symbol(), fixed.params(), Some(&quantized)).expect("export");
    let witness = artifact.witness.as_object().expect("witness object");

    assert!(witness.contains_key("input"), "caller input missing");
    assert!(witness.contains_key("dense_weight"));
    assert!(witness.contains_key("dense_bias"));
    for values in witness.values() {
        assert!(values.as_array().map(|a| !a.is_empty()).unwrap_or(false));
    }
    assert!(artifact.code.contains("component main = Model();"));
}

#[test]
fn graphs_with_float_remnants_are_rejected() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b.var("x", TensorSpec::new(DType::F32, vec![2]));
    let root = b.round(x).expect("round types");

    let err = model_to_circom(&root).expect_err("round has no circuit fragment");
    assert!(err.to_string().contains("no circuit fragment"));
}
