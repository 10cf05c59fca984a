//! Construction rules keyed by (op type, opset version range).
//!
//! A rule is a plain function from the decoded node, the initializer cursor
//! and the incoming per-sample shape to the operator and its output shape.

use std::ops::RangeInclusive;

use super::proto::{NodeProto, TensorProto};
use crate::error::{LayerwiseError, Result};
use crate::nn::{BatchNorm, Conv2d, ConvTranspose2d, Dropout, Flatten, Linear, MaxPool2d, Operator, ReLU};

/// Sequential reader over the graph's initializers.
///
/// Nodes take their weights in file order rather than by input name.
pub struct InitializerCursor<'a> {
    tensors: &'a [TensorProto],
    pos: usize,
}

impl<'a> InitializerCursor<'a> {
    pub fn new(tensors: &'a [TensorProto]) -> Self {
        Self { tensors, pos: 0 }
    }

    /// Take the next initializer for `node`.
    ///
    /// # Errors
    /// `Configuration` once every initializer has been consumed.
    pub fn next_for(&mut self, node: &NodeProto) -> Result<&'a TensorProto> {
        let tensor = self.tensors.get(self.pos).ok_or_else(|| {
            LayerwiseError::config(format!(
                "{} '{}' needs another initializer but all {} are consumed",
                node.op_type,
                node.display_name(),
                self.tensors.len()
            ))
        })?;
        self.pos += 1;
        log::trace!("{} takes initializer '{}'", node.display_name(), tensor.name);
        Ok(tensor)
    }

    pub fn remaining(&self) -> usize {
        self.tensors.len() - self.pos
    }
}

pub type Constructor =
    fn(&NodeProto, &mut InitializerCursor<'_>, &[usize]) -> Result<(Box<dyn Operator>, Vec<usize>)>;

pub struct Rule {
    pub op_type: &'static str,
    pub versions: RangeInclusive<i64>,
    pub build: Constructor,
}

pub struct Registry {
    rules: Vec<Rule>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { rules: Vec::new() }
    }

    /// Every rule this crate ships.
    pub fn standard() -> Self {
        let mut registry = Registry::new();
        registry.register("BatchNormalization", 7..=8, batch_norm_v7);
        registry.register("BatchNormalization", 9..=i64::MAX, batch_norm_v9);
        registry.register("Conv", 1..=10, conv);
        registry.register("ConvTranspose", 1..=10, conv_transpose);
        registry.register("Dropout", 7..=9, dropout);
        registry.register("Gemm", 7..=8, gemm);
        registry.register("MaxPool", 8..=9, max_pool);
        registry.register("Relu", 6..=i64::MAX, relu);
        registry.register("Flatten", 1..=i64::MAX, flatten);
        registry
    }

    pub fn register(&mut self, op_type: &'static str, versions: RangeInclusive<i64>, build: Constructor) {
        self.rules.push(Rule {
            op_type,
            versions,
            build,
        });
    }

    /// # Errors
    /// `UnsupportedOperation` when no rule covers `op_type` at `version`.
    pub fn resolve(&self, op_type: &str, version: i64) -> Result<&Rule> {
        self.rules
            .iter()
            .find(|r| r.op_type == op_type && r.versions.contains(&version))
            .ok_or_else(|| LayerwiseError::UnsupportedOperation {
                op_type: op_type.to_string(),
                version,
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

// ===== ATTRIBUTE HELPERS =====

fn unsupported(node: &NodeProto, attribute: &str, detail: impl Into<String>) -> LayerwiseError {
    LayerwiseError::UnsupportedAttribute {
        op_type: node.op_type.clone(),
        attribute: attribute.to_string(),
        detail: detail.into(),
    }
}

fn to_usize(node: &NodeProto, attribute: &str, v: i64) -> Result<usize> {
    usize::try_from(v).map_err(|_| unsupported(node, attribute, format!("negative value {v}")))
}

/// A two-element spatial attribute, `default` when absent.
fn pair(node: &NodeProto, attribute: &str, default: usize) -> Result<(usize, usize)> {
    match node.attr_ints(attribute)?.as_deref() {
        None => Ok((default, default)),
        Some(&[a, b]) => Ok((to_usize(node, attribute, a)?, to_usize(node, attribute, b)?)),
        Some(other) => Err(unsupported(
            node,
            attribute,
            format!("expected 2 spatial values, got {other:?}"),
        )),
    }
}

/// `pads` as `[h_begin, w_begin, h_end, w_end]`; begin and end must agree.
fn symmetric_pads(node: &NodeProto) -> Result<(usize, usize)> {
    match node.attr_ints("pads")?.as_deref() {
        None => Ok((0, 0)),
        Some(&[hb, wb, he, we]) if hb == he && wb == we => {
            Ok((to_usize(node, "pads", hb)?, to_usize(node, "pads", wb)?))
        }
        Some(other) => Err(unsupported(
            node,
            "pads",
            format!("only symmetric 2-D padding is supported, got {other:?}"),
        )),
    }
}

fn require_int(node: &NodeProto, attribute: &str, default: i64, wanted: i64) -> Result<()> {
    let v = node.attr_int(attribute, default)?;
    if v != wanted {
        return Err(unsupported(node, attribute, format!("only {wanted} is supported, got {v}")));
    }
    Ok(())
}

fn require_unit_dilations(node: &NodeProto) -> Result<()> {
    if let Some(d) = node.attr_ints("dilations")? {
        if d.iter().any(|&v| v != 1) {
            return Err(unsupported(node, "dilations", format!("only 1 is supported, got {d:?}")));
        }
    }
    Ok(())
}

fn require_explicit_padding(node: &NodeProto) -> Result<()> {
    match node.attr_string("auto_pad")? {
        None | Some("NOTSET") => Ok(()),
        Some(other) => Err(unsupported(node, "auto_pad", format!("{other} is not supported"))),
    }
}

fn dims4(node: &NodeProto, tensor: &TensorProto) -> Result<[usize; 4]> {
    match tensor.dims.as_slice() {
        &[a, b, c, d] if a > 0 && b > 0 && c > 0 && d > 0 => {
            Ok([a as usize, b as usize, c as usize, d as usize])
        }
        other => Err(LayerwiseError::config(format!(
            "{} '{}': weight '{}' must be 4-D, got dims {other:?}",
            node.op_type,
            node.display_name(),
            tensor.name
        ))),
    }
}

fn kernel_matches(node: &NodeProto, kh: usize, kw: usize) -> Result<()> {
    let declared = pair(node, "kernel_shape", 0)?;
    if declared != (0, 0) && declared != (kh, kw) {
        return Err(LayerwiseError::config(format!(
            "{} '{}': kernel_shape {declared:?} disagrees with weight kernel ({kh}, {kw})",
            node.op_type,
            node.display_name()
        )));
    }
    Ok(())
}

fn finish<O: Operator + 'static>(op: O, input: &[usize]) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    let shape = op.output_shape(input)?;
    Ok((Box::new(op), shape))
}

// ===== RULES =====

/// ONNX BatchNormalization nodes carry trained statistics, so the operator is
/// built in inference mode with scale, bias, mean and variance loaded, and the
/// statistics bound as parameters. `train(true)` switches it to batch statistics.
fn batch_norm(
    node: &NodeProto,
    init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    let scale = init.next_for(node)?.floats()?;
    let bias = init.next_for(node)?.floats()?;
    let mean = init.next_for(node)?.floats()?;
    let var = init.next_for(node)?.floats()?;

    let eps = node.attr_float("epsilon", 1e-5)?;
    let momentum = node.attr_float("momentum", 0.9)?;
    let bn = BatchNorm::with_params(scale.len(), momentum, eps, false)?
        .with_name(node.display_name())
        .with_statistics(&scale, &bias, &mean, &var)?;
    finish(bn, input)
}

fn batch_norm_v7(
    node: &NodeProto,
    init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    // spatial=0 normalizes every activation separately
    require_int(node, "spatial", 1, 1)?;
    batch_norm(node, init, input)
}

fn batch_norm_v9(
    node: &NodeProto,
    init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    batch_norm(node, init, input)
}

fn conv(
    node: &NodeProto,
    init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    require_int(node, "group", 1, 1)?;
    require_unit_dilations(node)?;
    require_explicit_padding(node)?;

    let w_proto = init.next_for(node)?;
    let [out_ch, in_ch, kh, kw] = dims4(node, w_proto)?;
    let w = w_proto.floats()?;
    let b = if node.inputs.len() > 2 {
        Some(init.next_for(node)?.floats()?)
    } else {
        None
    };

    kernel_matches(node, kh, kw)?;
    let stride = pair(node, "strides", 1)?;
    let pads = symmetric_pads(node)?;

    let conv = Conv2d::with_params(in_ch, out_ch, (kh, kw), stride, pads, b.is_some())?
        .with_name(node.display_name())
        .with_weights(&w, b.as_deref())?;
    finish(conv, input)
}

fn conv_transpose(
    node: &NodeProto,
    init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    require_int(node, "group", 1, 1)?;
    require_unit_dilations(node)?;
    require_explicit_padding(node)?;
    if let Some(padding) = node.attr_ints("output_padding")? {
        if padding.iter().any(|&p| p != 0) {
            return Err(unsupported(node, "output_padding", format!("{padding:?}")));
        }
    }
    if node.attr("output_shape").is_some() {
        return Err(unsupported(node, "output_shape", "derive the size from pads instead"));
    }

    let w_proto = init.next_for(node)?;
    // stored [C_in, C_out, kH, kW]
    let [in_ch, out_ch, kh, kw] = dims4(node, w_proto)?;
    let w = w_proto.floats()?;
    let b = if node.inputs.len() > 2 {
        Some(init.next_for(node)?.floats()?)
    } else {
        None
    };

    kernel_matches(node, kh, kw)?;
    let stride = pair(node, "strides", 1)?;
    let trim = symmetric_pads(node)?;

    let k = kh * kw;
    let mut relaid = vec![0.0; w.len()];
    for ic in 0..in_ch {
        for oc in 0..out_ch {
            let src = (ic * out_ch + oc) * k;
            let dst = (oc * in_ch + ic) * k;
            relaid[dst..dst + k].copy_from_slice(&w[src..src + k]);
        }
    }

    let deconv = ConvTranspose2d::with_params(in_ch, out_ch, (kh, kw), stride, trim, b.is_some())?
        .with_name(node.display_name())
        .with_weights(&relaid, b.as_deref())?;
    finish(deconv, input)
}

fn dropout(
    node: &NodeProto,
    _init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    let ratio = node.attr_float("ratio", 0.5)?;
    finish(Dropout::new(ratio)?.with_name(node.display_name()), input)
}

fn gemm(
    node: &NodeProto,
    init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    require_int(node, "transA", 0, 0)?;
    for scale in ["alpha", "beta"] {
        let v = node.attr_float(scale, 1.0)?;
        if v != 1.0 {
            return Err(unsupported(node, scale, format!("only 1.0 is supported, got {v}")));
        }
    }
    let trans_b = node.attr_int("transB", 0)? != 0;

    let w_proto = init.next_for(node)?;
    let (rows, cols) = match w_proto.dims.as_slice() {
        &[r, c] if r > 0 && c > 0 => (r as usize, c as usize),
        other => {
            return Err(LayerwiseError::config(format!(
                "Gemm '{}': weight '{}' must be 2-D, got dims {other:?}",
                node.display_name(),
                w_proto.name
            )));
        }
    };
    let w = w_proto.floats()?;
    let b = init.next_for(node)?.floats()?;

    // Linear wants [out, in]; transB=1 already stores it that way
    let (out_features, in_features, weight) = if trans_b {
        (rows, cols, w)
    } else {
        let mut t = vec![0.0; w.len()];
        for i in 0..rows {
            for o in 0..cols {
                t[o * rows + i] = w[i * cols + o];
            }
        }
        (cols, rows, t)
    };

    let linear = Linear::new(in_features, out_features, true)?
        .with_name(node.display_name())
        .with_weights(&weight, Some(b.as_slice()))?;
    finish(linear, input)
}

fn max_pool(
    node: &NodeProto,
    _init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    require_explicit_padding(node)?;
    require_int(node, "storage_order", 0, 0)?;
    if node.outputs.len() > 1 {
        return Err(unsupported(node, "Indices", "the optional indices output is not produced"));
    }
    let kernel = match node.attr_ints("kernel_shape")? {
        Some(_) => pair(node, "kernel_shape", 0)?,
        None => return Err(unsupported(node, "kernel_shape", "required attribute is missing")),
    };
    let stride = pair(node, "strides", 1)?;
    let pads = symmetric_pads(node)?;

    let pool = MaxPool2d::with_params(kernel, stride, pads, true)?.with_name(node.display_name());
    finish(pool, input)
}

fn relu(
    node: &NodeProto,
    _init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    finish(ReLU::new().with_name(node.display_name()), input)
}

fn flatten(
    node: &NodeProto,
    _init: &mut InitializerCursor<'_>,
    input: &[usize],
) -> Result<(Box<dyn Operator>, Vec<usize>)> {
    // axis 1 keeps the batch axis apart, which is the only layout tensors here have
    require_int(node, "axis", 1, 1)?;
    finish(Flatten::new().with_name(node.display_name()), input)
}
