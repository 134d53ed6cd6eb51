//! Shared graph builders for the integration tests.
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quantir::graph::NameCtx;
use quantir::ops::{Conv2dAttrs, OpBuilder, StandardInference};
use quantir::{DType, ParametersT, SymbolRef, Tensor, TensorSpec};

pub fn tensor(shape: &[usize], data: Vec<f64>) -> Tensor {
    Tensor::new(DType::F32, shape.to_vec(), data).expect("test tensor shape")
}

pub fn seeded(shape: &[usize], seed: u64, absmax: f64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let count: usize = shape.iter().product();
    let data = (0..count).map(|_| rng.gen_range(-absmax..=absmax)).collect();
    tensor(shape, data)
}

/// `input -> conv2d -> batch_norm -> TupleGetItem(0) -> relu`
pub fn conv_bn_relu() -> (SymbolRef, ParametersT) {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);

    let x = b.var("input", TensorSpec::new(DType::F32, vec![1, 2, 4, 4]));
    let w = b.var("conv_weight", TensorSpec::new(DType::F32, vec![2, 2, 3, 3]));
    let conv = b
        .conv2d(
            x,
            w,
            Conv2dAttrs {
                channels: 2,
                kernel: (3, 3),
                strides: (1, 1),
                padding: (1, 1),
                groups: 1,
            },
        )
        .expect("conv types");
    let gamma = b.var("bn_gamma", TensorSpec::new(DType::F32, vec![2]));
    let beta = b.var("bn_beta", TensorSpec::new(DType::F32, vec![2]));
    let mean = b.var("bn_mean", TensorSpec::new(DType::F32, vec![2]));
    let var = b.var("bn_var", TensorSpec::new(DType::F32, vec![2]));
    let bn = b
        .batch_norm(conv, gamma, beta, mean, var, 1e-5)
        .expect("batch_norm types");
    let item = b.tuple_get_item(bn, 0).expect("tuple item types");
    let root = b.relu(item).expect("relu types");

    let mut params = ParametersT::new();
    params.insert("conv_weight".into(), seeded(&[2, 2, 3, 3], 11, 1.0));
    params.insert("bn_gamma".into(), tensor(&[2], vec![1.5, 0.75]));
    params.insert("bn_beta".into(), tensor(&[2], vec![0.1, -0.2]));
    params.insert("bn_mean".into(), tensor(&[2], vec![0.05, -0.1]));
    params.insert("bn_var".into(), tensor(&[2], vec![0.25, 0.5]));
    (root, params)
}

/// `input -> dense -> bias_add -> relu`
pub fn dense_relu() -> (SymbolRef, ParametersT) {
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
    params.insert("dense_weight".into(), seeded(&[3, 4], 5, 1.0));
    params.insert("dense_bias".into(), tensor(&[3], vec![0.25, -0.125, 0.0625]));
    (root, params)
}

/// Diamond: `x -> relu -> {mul(relu, relu)} -> add(mul, relu)`
pub fn diamond() -> SymbolRef {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);

    let x = b.var("x", TensorSpec::new(DType::F32, vec![4]));
    let a = b.relu(x).expect("relu types");
    let m = b.mul(a.clone(), a.clone()).expect("mul types");
    b.add(m, a).expect("add types")
}
