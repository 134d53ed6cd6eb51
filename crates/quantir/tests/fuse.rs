mod support;

use std::collections::HashMap;

use quantir::graph::{post_order, NameCtx};
use quantir::ops::{self, Op, OpBuilder, StandardInference};
use quantir::passes::{
    FoldConstant, FuseAvgPool2d, FuseBatchNorm, FuseDropout, FuseNaiveSoftmax, FuseTupleGetItem,
};
use quantir::runtime::{Executor, ReferenceExecutor};
use quantir::{DType, GraphTransform, ParametersT, SymbolRef, Tensor, TensorSpec};

use support::{conv_bn_relu, seeded, tensor};

fn eval(root: &SymbolRef, params: &ParametersT, input_name: &str, input: &Tensor) -> Tensor {
    let mut bound = HashMap::new();
    bound.insert(input_name.into(), input.clone());
    ReferenceExecutor
        .eval(root, params, &bound)
        .expect("evaluation")
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    assert_eq!(a.shape(), b.shape());
    a.data()
        .iter()
        .zip(b.data())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[test]
fn batch_norm_fusion_is_numerically_exact() {
    let (root, params) = conv_bn_relu();
    let probe = seeded(&[1, 2, 4, 4], 23, 1.0);
    let reference = eval(&root, &params, "input", &probe);

    let (collapsed, params) = FuseTupleGetItem
        .run(&root, &params)
        .expect("tuple-get-item fusion");
    let (fused, params) = FuseBatchNorm
        .run(&collapsed, &params)
        .expect("batch-norm fusion");

    assert!(
        post_order(&fused)
            .iter()
            .all(|n| !matches!(n.op(), Op::BatchNorm { .. } | Op::TupleGetItem { .. })),
        "batch_norm survived fusion"
    );

    let fused_out = eval(&fused, &params, "input", &probe);
    assert!(max_abs_diff(&reference, &fused_out) < 1e-5);
}

#[test]
fn dropout_degenerates_to_identity() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b.var("x", TensorSpec::new(DType::F32, vec![4]));
    let dropped = b.dropout(x, 0.5).expect("dropout types");
    let root = b.relu(dropped).expect("relu types");

    let (fused, _) = FuseDropout.run(&root, &ParametersT::new()).expect("fusion");
    assert!(post_order(&fused)
        .iter()
        .all(|n| !matches!(n.op(), Op::Dropout { .. })));
    assert_eq!(post_order(&fused).len(), 2);
}

#[test]
fn trailing_log_softmax_is_dropped() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b.var("x", TensorSpec::new(DType::F32, vec![1, 10]));
    let root = b.log_softmax(x, 1).expect("log_softmax types");

    let (fused, _) = FuseNaiveSoftmax
        .run(&root, &ParametersT::new())
        .expect("fusion");
    assert!(ops::is_variable(&fused));
}

#[test]
fn global_avg_pool_lowers_to_sum_and_rescale() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b.var("x", TensorSpec::new(DType::F32, vec![1, 2, 4, 4]));
    let root = b.global_avg_pool2d(x).expect("pool types");

    let probe = seeded(&[1, 2, 4, 4], 31, 2.0);
    let reference = eval(&root, &ParametersT::new(), "x", &probe);

    let (fused, params) = FuseAvgPool2d.run(&root, &ParametersT::new()).expect("fusion");
    assert!(post_order(&fused)
        .iter()
        .any(|n| matches!(n.op(), Op::Sum(_))));
    assert!(post_order(&fused)
        .iter()
        .all(|n| !matches!(n.op(), Op::GlobalAvgPool2d)));

    let fused_out = eval(&fused, &params, "x", &probe);
    assert!(max_abs_diff(&reference, &fused_out) < 1e-9);
}

#[test]
fn weight_only_subgraphs_fold_to_parameters() {
    let mut namer = NameCtx::new();
    let infer = StandardInference;
    let mut b = OpBuilder::new(&mut namer, &infer);
    let x = b.var("x", TensorSpec::new(DType::F32, vec![2]));
    let w1 = b.var("w1", TensorSpec::new(DType::F32, vec![2]));
    let w2 = b.var("w2", TensorSpec::new(DType::F32, vec![2]));
    let combined = b.add(w1, w2).expect("add types");
    let root = b.mul(x, combined.clone()).expect("mul types");

    let mut params = ParametersT::new();
    params.insert("w1".into(), tensor(&[2], vec![1.0, 2.0]));
    params.insert("w2".into(), tensor(&[2], vec![0.5, -0.5]));

    let probe = tensor(&[2], vec![3.0, 4.0]);
    let reference = eval(&root, &params, "x", &probe);

    let (folded, params) = FoldConstant::default().run(&root, &params).expect("fold");
    let add_survivors = post_order(&folded)
        .iter()
        .filter(|n| matches!(n.op(), Op::Add))
        .count();
    assert_eq!(add_survivors, 0, "weight-only add should have been folded");

    let folded_param = params
        .get(combined.name())
        .expect("folded value stored under the node's name");
    assert_eq!(folded_param.data(), &[1.5, 1.5]);

    let folded_out = eval(&folded, &params, "x", &probe);
    assert!(max_abs_diff(&reference, &folded_out) < 1e-12);
}
