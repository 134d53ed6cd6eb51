//! Symbol-to-circom lowering.
//!
//! Each operator kind used by the graph pulls in one parameterized template;
//! the model template instantiates a component per node and wires the signal
//! arrays flat, in row-major order. Comparisons and shifts lean on the
//! circomlib `Num2Bits`/`LessThan` gadgets.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use quantir::graph::post_order;
use quantir::ops::Op;
use quantir::SymbolRef;

/// Circuit lowering failures.
#[derive(Debug, Error)]
pub enum CircomError {
    #[error("`{op}` at node `{name}` has no circuit fragment")]
    Unsupported { op: &'static str, name: Arc<str> },
    #[error("`{op}` at node `{name}`: {msg}")]
    Shape {
        op: &'static str,
        name: Arc<str>,
        msg: String,
    },
    #[error("graph has no runtime input to redirect")]
    NoInput,
    #[error(transparent)]
    Graph(#[from] quantir::graph::GraphError),
}

/// Bit width the shift/comparison gadgets decompose to. Wide enough for the
/// 32-bit accumulators the fixed-point path produces.
const GADGET_BITS: u32 = 34;

/// Maps symbol names onto circom identifiers, uniquely.
pub(crate) struct SignalNames {
    by_symbol: HashMap<Arc<str>, String>,
    used: HashMap<String, usize>,
}

impl SignalNames {
    pub(crate) fn new() -> Self {
        Self {
            by_symbol: HashMap::new(),
            used: HashMap::new(),
        }
    }

    pub(crate) fn name_for(&mut self, symbol: &Arc<str>) -> String {
        if let Some(existing) = self.by_symbol.get(symbol) {
            return existing.clone();
        }
        let mut base: String = symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if base.starts_with(|c: char| c.is_ascii_digit()) || base.starts_with('_') {
            base = format!("n{base}");
        }
        let candidate = match self.used.get(&base) {
            None => base.clone(),
            Some(count) => format!("{base}_{count}"),
        };
        *self.used.entry(base).or_insert(0) += 1;
        self.by_symbol.insert(symbol.clone(), candidate.clone());
        candidate
    }
}

struct Emitter {
    names: SignalNames,
    templates: Vec<&'static str>,
    body: String,
}

impl Emitter {
    fn want_template(&mut self, name: &'static str) {
        if !self.templates.contains(&name) {
            self.templates.push(name);
        }
    }
}

/// Generates a complete circom source for a fixed-point graph.
pub fn model_to_circom(symbol: &SymbolRef) -> Result<String, CircomError> {
    let mut em = Emitter {
        names: SignalNames::new(),
        templates: Vec::new(),
        body: String::new(),
    };

    // expression each node's consumers read from: an input signal for
    // variables, a component output array otherwise
    let mut slot: HashMap<Arc<str>, String> = HashMap::new();
    let mut inputs: Vec<(String, usize)> = Vec::new();

    let order = post_order(symbol);
    for node in &order {
        let sig = em.names.name_for(node.name());
        let len = tensor_len(node)?;
        if let Op::Var = node.op() {
            inputs.push((sig.clone(), len));
            slot.insert(node.name().clone(), sig);
            continue;
        }
        let comp = format!("c_{sig}");
        emit_node(&mut em, node, &comp, &slot)?;
        slot.insert(node.name().clone(), format!("{comp}.out"));
    }

    let root_slot = slot[symbol.name()].clone();
    let root_len = tensor_len(symbol)?;

    let mut code = String::new();
    let _ = writeln!(code, "pragma circom 2.0.0;\n");
    let _ = writeln!(code, "include \"circomlib/circuits/bitify.circom\";");
    let _ = writeln!(code, "include \"circomlib/circuits/comparators.circom\";\n");
    for template in &em.templates {
        code.push_str(template_source(template));
        code.push('\n');
    }
    let _ = writeln!(code, "template Model() {{");
    for (sig, len) in &inputs {
        let _ = writeln!(code, "    signal input {sig}[{len}];");
    }
    let _ = writeln!(code, "    signal output out[{root_len}];");
    code.push_str(&em.body);
    let _ = writeln!(
        code,
        "    for (var i = 0; i < {root_len}; i++) {{ out[i] <== {root_slot}[i]; }}"
    );
    let _ = writeln!(code, "}}\n");
    let _ = writeln!(code, "component main = Model();");
    Ok(code)
}

fn tensor_len(node: &SymbolRef) -> Result<usize, CircomError> {
    Ok(node.tensor_ty()?.element_count())
}

fn unsupported(node: &SymbolRef) -> CircomError {
    CircomError::Unsupported {
        op: node.op().name(),
        name: node.name().clone(),
    }
}

fn shape_err(node: &SymbolRef, msg: impl Into<String>) -> CircomError {
    CircomError::Shape {
        op: node.op().name(),
        name: node.name().clone(),
        msg: msg.into(),
    }
}

fn wire(body: &mut String, comp: &str, port: &str, source: &str, len: usize) {
    let _ = writeln!(
        body,
        "    for (var i = 0; i < {len}; i++) {{ {comp}.{port}[i] <== {source}[i]; }}"
    );
}

fn emit_node(
    em: &mut Emitter,
    node: &SymbolRef,
    comp: &str,
    slot: &HashMap<Arc<str>, String>,
) -> Result<(), CircomError> {
    let arg_slot = |i: usize| slot[node.args()[i].name()].clone();
    let out_len = tensor_len(node)?;

    match node.op() {
        Op::Conv2d(attrs) => {
            if attrs.groups != 1 {
                return Err(shape_err(node, "grouped convolution has no circuit form"));
            }
            let data = &node.args()[0];
            let [n, cin, h, w] = dims4(data)?;
            let [_, _, oh, ow] = dims4(node)?;
            em.want_template("Conv2D");
            let _ = writeln!(
                em.body,
                "    component {comp} = Conv2D({n}, {cin}, {h}, {w}, {cout}, {kh}, {kw}, {sh}, {sw}, {ph}, {pw}, {oh}, {ow});",
                cout = attrs.channels,
                kh = attrs.kernel.0,
                kw = attrs.kernel.1,
                sh = attrs.strides.0,
                sw = attrs.strides.1,
                ph = attrs.padding.0,
                pw = attrs.padding.1,
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), tensor_len(data)?);
            wire(
                &mut em.body,
                comp,
                "weight",
                &arg_slot(1),
                tensor_len(&node.args()[1])?,
            );
        }
        Op::Dense { units } => {
            let data = &node.args()[0];
            let shape = data.shape()?;
            let (n, k) = (shape[0], shape[1]);
            em.want_template("DenseLayer");
            let _ = writeln!(em.body, "    component {comp} = DenseLayer({n}, {k}, {units});");
            wire(&mut em.body, comp, "in", &arg_slot(0), n * k);
            wire(&mut em.body, comp, "weight", &arg_slot(1), units * k);
        }
        Op::BiasAdd { axis } => {
            let data = &node.args()[0];
            let shape = data.shape()?.to_vec();
            let channels = shape[*axis];
            let stride: usize = shape[axis + 1..].iter().product();
            em.want_template("BiasAddLayer");
            let _ = writeln!(
                em.body,
                "    component {comp} = BiasAddLayer({out_len}, {channels}, {stride});"
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), out_len);
            wire(&mut em.body, comp, "bias", &arg_slot(1), channels);
        }
        Op::Add | Op::Sub | Op::Mul => {
            emit_binary(em, node, comp, &arg_slot(0), &arg_slot(1))?;
        }
        Op::Relu => {
            em.want_template("Relu");
            let _ = writeln!(
                em.body,
                "    component {comp} = Relu({out_len}, {GADGET_BITS});"
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), out_len);
        }
        Op::MaxPool2d(attrs) => {
            if attrs.padding != (0, 0) {
                return Err(shape_err(node, "padded max pooling has no circuit form"));
            }
            let data = &node.args()[0];
            let [n, c, h, w] = dims4(data)?;
            let [_, _, oh, ow] = dims4(node)?;
            em.want_template("Max2");
            em.want_template("MaxPool2D");
            let _ = writeln!(
                em.body,
                "    component {comp} = MaxPool2D({n}, {c}, {h}, {w}, {kh}, {kw}, {sh}, {sw}, {oh}, {ow}, {GADGET_BITS});",
                kh = attrs.pool.0,
                kw = attrs.pool.1,
                sh = attrs.strides.0,
                sw = attrs.strides.1,
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), tensor_len(data)?);
        }
        Op::Sum(attrs) => {
            let data = &node.args()[0];
            if attrs.axes.as_deref() != Some(&[2, 3]) || !attrs.keepdims {
                return Err(shape_err(node, "only spatial sum lowers to a circuit"));
            }
            let [n, c, h, w] = dims4(data)?;
            em.want_template("SpatialSum");
            let _ = writeln!(
                em.body,
                "    component {comp} = SpatialSum({n}, {c}, {h}, {w});"
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), tensor_len(data)?);
        }
        Op::Reshape { .. } | Op::Squeeze { .. } => {
            em.want_template("Passthrough");
            let _ = writeln!(em.body, "    component {comp} = Passthrough({out_len});");
            wire(&mut em.body, comp, "in", &arg_slot(0), out_len);
        }
        Op::Pclip { precision } => {
            em.want_template("PrecisionCheck");
            let _ = writeln!(
                em.body,
                "    component {comp} = PrecisionCheck({out_len}, {precision});"
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), out_len);
        }
        Op::RsPclip { shift, precision } => {
            em.want_template("RightShiftRound");
            let _ = writeln!(
                em.body,
                "    component {comp} = RightShiftRound({out_len}, {shift}, {precision});"
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), out_len);
        }
        Op::Clip { a_min, a_max } => {
            em.want_template("Max2");
            em.want_template("ClipRange");
            let _ = writeln!(
                em.body,
                "    component {comp} = ClipRange({out_len}, {}, {}, {GADGET_BITS});",
                *a_min as i64, *a_max as i64
            );
            wire(&mut em.body, comp, "in", &arg_slot(0), out_len);
        }
        _ => return Err(unsupported(node)),
    }
    Ok(())
}

fn emit_binary(
    em: &mut Emitter,
    node: &SymbolRef,
    comp: &str,
    lhs: &str,
    rhs: &str,
) -> Result<(), CircomError> {
    let out_len = tensor_len(node)?;
    let lhs_len = tensor_len(&node.args()[0])?;
    let rhs_len = tensor_len(&node.args()[1])?;
    let kind = match node.op() {
        Op::Add => "Add",
        Op::Sub => "Sub",
        Op::Mul => "Mul",
        _ => unreachable!("caller dispatched a binary op"),
    };

    if lhs_len == out_len && rhs_len == out_len {
        let template: &'static str = match kind {
            "Add" => "ElemAdd",
            "Sub" => "ElemSub",
            _ => "ElemMul",
        };
        em.want_template(template);
        let _ = writeln!(em.body, "    component {comp} = {template}({out_len});");
        wire(&mut em.body, comp, "a", lhs, out_len);
        wire(&mut em.body, comp, "b", rhs, out_len);
        return Ok(());
    }

    if rhs_len == 1 && kind == "Mul" {
        em.want_template("ScalarMul");
        let _ = writeln!(em.body, "    component {comp} = ScalarMul({out_len});");
        wire(&mut em.body, comp, "in", lhs, out_len);
        let _ = writeln!(em.body, "    {comp}.k <== {rhs}[0];");
        return Ok(());
    }

    // per-channel broadcast: rhs shaped [c, 1, ..] against the tail of lhs
    if kind == "Mul" {
        let rhs_shape = node.args()[1].shape()?;
        let lhs_shape = node.args()[0].shape()?;
        let non_unit: Vec<usize> = rhs_shape
            .iter()
            .enumerate()
            .filter(|(_, &d)| d != 1)
            .map(|(i, _)| i)
            .collect();
        if let [axis] = non_unit.as_slice() {
            let channels = rhs_shape[*axis];
            let lhs_axis = lhs_shape.len() - rhs_shape.len() + axis;
            let stride: usize = lhs_shape[lhs_axis + 1..].iter().product();
            em.want_template("ChannelMul");
            let _ = writeln!(
                em.body,
                "    component {comp} = ChannelMul({out_len}, {channels}, {stride});"
            );
            wire(&mut em.body, comp, "in", lhs, out_len);
            wire(&mut em.body, comp, "k", rhs, channels);
            return Ok(());
        }
    }

    Err(shape_err(node, "unsupported broadcast in circuit lowering"))
}

fn dims4(node: &SymbolRef) -> Result<[usize; 4], CircomError> {
    let shape = node.shape()?;
    <[usize; 4]>::try_from(shape)
        .map_err(|_| shape_err(node, format!("expected rank 4, found {shape:?}")))
}

fn template_source(name: &str) -> &'static str {
    match name {
        "Passthrough" => {
            r#"template Passthrough(n) {
    signal input in[n];
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== in[i]; }
}
"#
        }
        "ElemAdd" => {
            r#"template ElemAdd(n) {
    signal input a[n];
    signal input b[n];
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== a[i] + b[i]; }
}
"#
        }
        "ElemSub" => {
            r#"template ElemSub(n) {
    signal input a[n];
    signal input b[n];
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== a[i] - b[i]; }
}
"#
        }
        "ElemMul" => {
            r#"template ElemMul(n) {
    signal input a[n];
    signal input b[n];
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== a[i] * b[i]; }
}
"#
        }
        "ScalarMul" => {
            r#"template ScalarMul(n) {
    signal input in[n];
    signal input k;
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== in[i] * k; }
}
"#
        }
        "ChannelMul" => {
            r#"template ChannelMul(n, c, stride) {
    signal input in[n];
    signal input k[c];
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== in[i] * k[(i \ stride) % c]; }
}
"#
        }
        "BiasAddLayer" => {
            r#"template BiasAddLayer(n, c, stride) {
    signal input in[n];
    signal input bias[c];
    signal output out[n];
    for (var i = 0; i < n; i++) { out[i] <== in[i] + bias[(i \ stride) % c]; }
}
"#
        }
        "Conv2D" => {
            r#"template Conv2D(batch, cin, h, w, cout, kh, kw, sh, sw, ph, pw, oh, ow) {
    signal input in[batch * cin * h * w];
    signal input weight[cout * cin * kh * kw];
    signal output out[batch * cout * oh * ow];
    for (var b = 0; b < batch; b++) {
        for (var oc = 0; oc < cout; oc++) {
            for (var oy = 0; oy < oh; oy++) {
                for (var ox = 0; ox < ow; ox++) {
                    var lc = 0;
                    for (var ic = 0; ic < cin; ic++) {
                        for (var ky = 0; ky < kh; ky++) {
                            for (var kx = 0; kx < kw; kx++) {
                                var iy = oy * sh + ky - ph;
                                var ix = ox * sw + kx - pw;
                                if (iy >= 0 && iy < h && ix >= 0 && ix < w) {
                                    lc += in[((b * cin + ic) * h + iy) * w + ix]
                                        * weight[((oc * cin + ic) * kh + ky) * kw + kx];
                                }
                            }
                        }
                    }
                    out[((b * cout + oc) * oh + oy) * ow + ox] <== lc;
                }
            }
        }
    }
}
"#
        }
        "DenseLayer" => {
            r#"template DenseLayer(n, k, units) {
    signal input in[n * k];
    signal input weight[units * k];
    signal output out[n * units];
    for (var b = 0; b < n; b++) {
        for (var u = 0; u < units; u++) {
            var lc = 0;
            for (var i = 0; i < k; i++) {
                lc += in[b * k + i] * weight[u * k + i];
            }
            out[b * units + u] <== lc;
        }
    }
}
"#
        }
        "SpatialSum" => {
            r#"template SpatialSum(batch, c, h, w) {
    signal input in[batch * c * h * w];
    signal output out[batch * c];
    for (var b = 0; b < batch; b++) {
        for (var ch = 0; ch < c; ch++) {
            var lc = 0;
            for (var i = 0; i < h * w; i++) {
                lc += in[(b * c + ch) * h * w + i];
            }
            out[b * c + ch] <== lc;
        }
    }
}
"#
        }
        "Relu" => {
            r#"template Relu(n, nbits) {
    signal input in[n];
    signal output out[n];
    component sign[n];
    for (var i = 0; i < n; i++) {
        sign[i] = Num2Bits(nbits + 1);
        sign[i].in <== in[i] + (1 << nbits);
        out[i] <== in[i] * sign[i].out[nbits];
    }
}
"#
        }
        "PrecisionCheck" => {
            r#"template PrecisionCheck(n, nbits) {
    signal input in[n];
    signal output out[n];
    component range[n];
    for (var i = 0; i < n; i++) {
        range[i] = Num2Bits(nbits);
        range[i].in <== in[i] + (1 << (nbits - 1)) - 1;
        out[i] <== in[i];
    }
}
"#
        }
        "RightShiftRound" => {
            r#"template RightShiftRound(n, shift, nbits) {
    signal input in[n];
    signal output out[n];
    component bits[n];
    for (var i = 0; i < n; i++) {
        bits[i] = Num2Bits(nbits + shift);
        bits[i].in <== in[i] + (1 << (shift - 1)) + (1 << (nbits + shift - 1));
        var acc = 0;
        for (var j = shift; j < nbits + shift; j++) {
            acc += bits[i].out[j] * (1 << (j - shift));
        }
        out[i] <== acc - (1 << (nbits - 1));
    }
}
"#
        }
        "Max2" => {
            r#"template Max2(nbits) {
    signal input a;
    signal input b;
    signal output out;
    component lt = LessThan(nbits);
    lt.in[0] <== a + (1 << (nbits - 1));
    lt.in[1] <== b + (1 << (nbits - 1));
    out <== lt.out * (b - a) + a;
}
"#
        }
        "MaxPool2D" => {
            r#"template MaxPool2D(batch, c, h, w, kh, kw, sh, sw, oh, ow, nbits) {
    signal input in[batch * c * h * w];
    signal output out[batch * c * oh * ow];
    signal acc[batch * c * oh * ow][kh * kw];
    component max[batch * c * oh * ow][kh * kw - 1];
    for (var b = 0; b < batch; b++) {
        for (var ch = 0; ch < c; ch++) {
            for (var oy = 0; oy < oh; oy++) {
                for (var ox = 0; ox < ow; ox++) {
                    var o = ((b * c + ch) * oh + oy) * ow + ox;
                    for (var ky = 0; ky < kh; ky++) {
                        for (var kx = 0; kx < kw; kx++) {
                            var j = ky * kw + kx;
                            var src = ((b * c + ch) * h + (oy * sh + ky)) * w + (ox * sw + kx);
                            if (j == 0) {
                                acc[o][0] <== in[src];
                            } else {
                                max[o][j - 1] = Max2(nbits);
                                max[o][j - 1].a <== acc[o][j - 1];
                                max[o][j - 1].b <== in[src];
                                acc[o][j] <== max[o][j - 1].out;
                            }
                        }
                    }
                    out[o] <== acc[o][kh * kw - 1];
                }
            }
        }
    }
}
"#
        }
        "ClipRange" => {
            r#"template ClipRange(n, lo, hi, nbits) {
    signal input in[n];
    signal output out[n];
    component floor[n];
    component ceil[n];
    signal lower[n];
    for (var i = 0; i < n; i++) {
        floor[i] = Max2(nbits);
        floor[i].a <== in[i];
        floor[i].b <== lo;
        lower[i] <== floor[i].out;
        // max(lo, in) then min against hi via negation
        ceil[i] = Max2(nbits);
        ceil[i].a <== -lower[i];
        ceil[i].b <== -hi;
        out[i] <== -ceil[i].out;
    }
}
"#
        }
        other => unreachable!("template `{other}` is never requested"),
    }
}
