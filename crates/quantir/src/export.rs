//! Integer-target export: the operator graph as a JSON node list and the
//! parameter store as a framed binary blob.
//!
//! The JSON schema mirrors the symbol structure directly: one object per
//! node, `{name, op_name, args[], attrs{}}`, in dependency order. The params
//! blob is magic + version framed, little-endian throughout.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Map, Value};

use crate::graph::{post_order, SymbolRef};
use crate::ops::Op;
use crate::tensor::{DType, ParametersT, Tensor};

const MAGIC: &[u8; 8] = b"QIRPARMS";
const VERSION: u32 = 1;

/// Serializes the graph as a dependency-ordered node list.
pub fn graph_to_json(root: &SymbolRef) -> Value {
    let nodes: Vec<Value> = post_order(root)
        .iter()
        .map(|node| {
            json!({
                "name": node.name().as_ref(),
                "op_name": node.op().name(),
                "args": node.args().iter().map(|a| a.name().as_ref()).collect::<Vec<_>>(),
                "attrs": attrs_json(node),
            })
        })
        .collect();
    Value::Array(nodes)
}

pub fn write_graph_json(path: impl AsRef<Path>, root: &SymbolRef) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &graph_to_json(root))?;
    writer.flush()?;
    Ok(())
}

fn attrs_json(node: &SymbolRef) -> Value {
    let mut attrs = Map::new();
    if let Ok(spec) = node.tensor_ty() {
        attrs.insert("shape".into(), json!(spec.shape));
        attrs.insert("dtype".into(), json!(spec.dtype.to_string()));
    }
    match node.op() {
        Op::Conv2d(a) => {
            attrs.insert("channels".into(), json!(a.channels));
            attrs.insert("kernel_size".into(), json!([a.kernel.0, a.kernel.1]));
            attrs.insert("strides".into(), json!([a.strides.0, a.strides.1]));
            attrs.insert("padding".into(), json!([a.padding.0, a.padding.1]));
            attrs.insert("groups".into(), json!(a.groups));
        }
        Op::Dense { units } => {
            attrs.insert("units".into(), json!(units));
        }
        Op::BatchNorm { axis, epsilon } => {
            attrs.insert("axis".into(), json!(axis));
            attrs.insert("epsilon".into(), json!(epsilon));
        }
        Op::BiasAdd { axis } => {
            attrs.insert("axis".into(), json!(axis));
        }
        Op::MaxPool2d(a) => {
            attrs.insert("pool_size".into(), json!([a.pool.0, a.pool.1]));
            attrs.insert("strides".into(), json!([a.strides.0, a.strides.1]));
            attrs.insert("padding".into(), json!([a.padding.0, a.padding.1]));
        }
        Op::Dropout { rate } => {
            attrs.insert("rate".into(), json!(rate));
        }
        Op::LogSoftmax { axis } => {
            attrs.insert("axis".into(), json!(axis));
        }
        Op::Sum(a) => {
            attrs.insert("axis".into(), json!(a.axes));
            attrs.insert("keepdims".into(), json!(a.keepdims));
        }
        Op::Squeeze { axes } => {
            attrs.insert("axis".into(), json!(axes));
        }
        Op::Reshape { newshape } => {
            attrs.insert("newshape".into(), json!(newshape));
        }
        Op::Clip { a_min, a_max } => {
            attrs.insert("a_min".into(), json!(a_min));
            attrs.insert("a_max".into(), json!(a_max));
        }
        Op::RightShift { bits } => {
            attrs.insert("bits".into(), json!(bits));
        }
        Op::Cast { dtype } => {
            attrs.insert("target_dtype".into(), json!(dtype.to_string()));
        }
        Op::TupleGetItem { index } => {
            attrs.insert("index".into(), json!(index));
        }
        Op::Requant(a) => {
            attrs.insert("shift".into(), json!(a.shift));
            attrs.insert("precision".into(), json!(a.precision));
        }
        Op::Pclip { precision } => {
            attrs.insert("precision".into(), json!(precision));
        }
        Op::RsPclip { shift, precision } => {
            attrs.insert("shift".into(), json!(shift));
            attrs.insert("precision".into(), json!(precision));
        }
        Op::Var | Op::Tuple | Op::Relu | Op::GlobalAvgPool2d | Op::Round | Op::Add | Op::Sub
        | Op::Mul => {}
    }
    if let Some(scale) = node.scale() {
        attrs.insert("scale".into(), json!(scale));
    }
    if let Some(precision) = node.precision() {
        attrs.insert("precision".into(), json!(precision));
    }
    Value::Object(attrs)
}

/// Writes the parameter store as a framed binary blob.
pub fn save_params(path: impl AsRef<Path>, params: &ParametersT) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(params.len() as u32).to_le_bytes())?;
    for (name, tensor) in params {
        let name_bytes = name.as_bytes();
        writer.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(name_bytes)?;

        writer.write_all(&(tensor.shape().len() as u32).to_le_bytes())?;
        for &dim in tensor.shape() {
            writer.write_all(&(dim as u64).to_le_bytes())?;
        }
        writer.write_all(&[tensor.dtype().tag()])?;
        if tensor.dtype().is_integer() {
            for &value in tensor.data() {
                writer.write_all(&(value as i64).to_le_bytes())?;
            }
        } else {
            for &value in tensor.data() {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Reads back a blob written by [`save_params`].
pub fn load_params(path: impl AsRef<Path>) -> Result<ParametersT> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("not a quantir params blob");
    }
    let version = read_u32(&mut reader)?;
    if version != VERSION {
        bail!("unsupported params blob version {version}");
    }

    let count = read_u32(&mut reader)? as usize;
    let mut params = ParametersT::new();
    for _ in 0..count {
        let name_len = read_u32(&mut reader)? as usize;
        let mut name_bytes = vec![0u8; name_len];
        reader.read_exact(&mut name_bytes)?;
        let name: Arc<str> = Arc::from(String::from_utf8(name_bytes)?);

        let rank = read_u32(&mut reader)? as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            shape.push(u64::from_le_bytes(buf) as usize);
        }

        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        let dtype = DType::from_tag(tag[0])
            .ok_or_else(|| anyhow!("unknown dtype tag {} for `{name}`", tag[0]))?;

        let count: usize = shape.iter().product();
        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            if dtype.is_integer() {
                data.push(i64::from_le_bytes(buf) as f64);
            } else {
                data.push(f64::from_le_bytes(buf));
            }
        }
        params.insert(name, Tensor::new(dtype, shape, data)?);
    }
    Ok(params)
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
