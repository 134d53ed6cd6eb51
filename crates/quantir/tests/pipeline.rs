mod support;

use quantir::calibrate::{Calibrator, RandomConfig, SymmetricMinMaxSampling};
use quantir::discrete::SymmetricLinearDiscretor;
use quantir::export::{graph_to_json, load_params, save_params, write_graph_json};
use quantir::fixed_point::FixPoint;
use quantir::graph::post_order;
use quantir::passes::{FoldConstant, FuseBatchNorm, FuseDropout, FuseTupleGetItem};
use quantir::{CheckpointOptions, DType, GraphTransform, Trace};

use support::conv_bn_relu;

fn fixed_point_conv_trace() -> Trace {
    let (root, params) = conv_bn_relu();
    let trace = Trace::from_graph("convnet", root, params).expect("trace");

    let fold = FoldConstant::default();
    let fuse: [&dyn GraphTransform; 4] = [&FuseTupleGetItem, &FuseBatchNorm, &FuseDropout, &fold];
    let fused = trace
        .checkpoint_transform(&fuse, Some("fuse"), CheckpointOptions::default())
        .expect("fusion stage");

    let calibrate = Calibrator::with_random(RandomConfig {
        absmax: 1.0,
        seed: 13,
    });
    let calibrated = fused
        .checkpoint_transform(
            &[&calibrate, &SymmetricMinMaxSampling],
            Some("calibrate"),
            CheckpointOptions::default(),
        )
        .expect("calibration stage");

    let discretized = calibrated
        .checkpoint_transform(
            &[&SymmetricLinearDiscretor::default()],
            Some("discrete"),
            CheckpointOptions::default(),
        )
        .expect("discretization stage");

    discretized
        .checkpoint_transform(&[&FixPoint], Some("fix-point"), CheckpointOptions::default())
        .expect("fixed-point stage")
}

#[test]
fn conv_pipeline_reaches_integer_form() {
    let fixed = fixed_point_conv_trace();

    for node in post_order(fixed.symbol()) {
        let spec = node.tensor_ty().expect("integer graphs are tuple-free");
        assert!(
            spec.dtype.is_integer(),
            "node `{}` kept dtype {}",
            node.name(),
            spec.dtype
        );
        assert!(node.scale().is_some(), "node `{}` lost its scale", node.name());
    }
    for tensor in fixed.params().values() {
        assert_eq!(tensor.dtype(), DType::Si32);
        assert!(tensor.data().iter().all(|v| v.fract() == 0.0));
    }

    // earlier stages stay retrievable and untouched
    let init = fixed.stage_named("init").expect("initial stage recorded");
    assert!(post_order(init.symbol())
        .iter()
        .any(|n| n.dtype().map(|d| d.is_float()).unwrap_or(false)));
}

#[test]
fn graph_json_mirrors_the_symbol_schema() {
    let fixed = fixed_point_conv_trace();
    let json = graph_to_json(fixed.symbol());
    let nodes = json.as_array().expect("node list");
    assert_eq!(nodes.len(), post_order(fixed.symbol()).len());

    for node in nodes {
        assert!(node.get("name").is_some());
        assert!(node.get("op_name").is_some());
        assert!(node.get("args").map(|a| a.is_array()).unwrap_or(false));
        let attrs = node.get("attrs").and_then(|a| a.as_object()).expect("attrs");
        assert!(attrs.contains_key("shape"));
        assert!(attrs.contains_key("dtype"));
    }

    let op_names: Vec<&str> = nodes
        .iter()
        .filter_map(|n| n.get("op_name").and_then(|v| v.as_str()))
        .collect();
    assert!(op_names.contains(&"nn.conv2d"));
    assert!(
        op_names.contains(&"mrt.rs_pclip") || op_names.contains(&"mrt.pclip"),
        "requantization primitives missing from export: {op_names:?}"
    );
}

#[test]
fn params_blob_round_trips() {
    let fixed = fixed_point_conv_trace();
    let dir = tempfile::tempdir().expect("tempdir");

    let params_path = dir.path().join("convnet.params");
    save_params(&params_path, fixed.params()).expect("save");
    let restored = load_params(&params_path).expect("load");
    assert_eq!(&restored, fixed.params());

    let graph_path = dir.path().join("convnet.json");
    write_graph_json(&graph_path, fixed.symbol()).expect("write graph");
    let text = std::fs::read_to_string(&graph_path).expect("read back");
    assert!(text.contains("\"op_name\""));
}
