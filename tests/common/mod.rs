//! Hand-rolled ONNX protobuf encoding for importer tests.
#![allow(dead_code)]

fn varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

fn bytes_field(field: u32, payload: &[u8], out: &mut Vec<u8>) {
    varint(u64::from(field << 3 | 2), out);
    varint(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

fn int_field(field: u32, v: i64, out: &mut Vec<u8>) {
    varint(u64::from(field << 3), out);
    varint(v as u64, out);
}

pub fn model(opset: i64, graph: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    int_field(1, 7, &mut out); // ir_version
    bytes_field(2, b"layerwise-tests", &mut out); // producer_name
    let mut opset_id = Vec::new();
    bytes_field(1, b"", &mut opset_id);
    int_field(2, opset, &mut opset_id);
    bytes_field(8, &opset_id, &mut out);
    bytes_field(7, graph, &mut out);
    out
}

pub fn graph(nodes: &[Vec<u8>], initializers: &[Vec<u8>], inputs: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for n in nodes {
        bytes_field(1, n, &mut out);
    }
    bytes_field(2, b"test-graph", &mut out);
    for t in initializers {
        bytes_field(5, t, &mut out);
    }
    for i in inputs {
        bytes_field(11, i, &mut out);
    }
    out
}

pub fn node(name: &str, op_type: &str, inputs: &[&str], outputs: &[&str], attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for i in inputs {
        bytes_field(1, i.as_bytes(), &mut out);
    }
    for o in outputs {
        bytes_field(2, o.as_bytes(), &mut out);
    }
    bytes_field(3, name.as_bytes(), &mut out);
    bytes_field(4, op_type.as_bytes(), &mut out);
    for a in attrs {
        bytes_field(5, a, &mut out);
    }
    out
}

pub fn attr_int(name: &str, v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    bytes_field(1, name.as_bytes(), &mut out);
    int_field(3, v, &mut out);
    int_field(20, 2, &mut out);
    out
}

pub fn attr_float(name: &str, v: f32) -> Vec<u8> {
    let mut out = Vec::new();
    bytes_field(1, name.as_bytes(), &mut out);
    varint(u64::from(2u32 << 3 | 5), &mut out);
    out.extend_from_slice(&v.to_le_bytes());
    int_field(20, 1, &mut out);
    out
}

pub fn attr_ints(name: &str, values: &[i64]) -> Vec<u8> {
    let mut out = Vec::new();
    bytes_field(1, name.as_bytes(), &mut out);
    let mut packed = Vec::new();
    for &v in values {
        varint(v as u64, &mut packed);
    }
    bytes_field(8, &packed, &mut out);
    int_field(20, 7, &mut out);
    out
}

/// FLOAT tensor; `raw` stores the values in `raw_data` instead of `float_data`.
pub fn tensor(name: &str, dims: &[i64], values: &[f32], raw: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for &d in dims {
        int_field(1, d, &mut out);
    }
    int_field(2, 1, &mut out);
    bytes_field(8, name.as_bytes(), &mut out);
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    bytes_field(if raw { 9 } else { 4 }, &bytes, &mut out);
    out
}

/// Graph input; `None` axes are written as a symbolic `dim_param`.
pub fn value_info(name: &str, dims: &[Option<i64>]) -> Vec<u8> {
    let mut shape = Vec::new();
    for d in dims {
        let mut dim = Vec::new();
        match d {
            Some(v) => int_field(1, *v, &mut dim),
            None => bytes_field(2, b"N", &mut dim),
        }
        bytes_field(1, &dim, &mut shape);
    }
    let mut tensor_type = Vec::new();
    int_field(1, 1, &mut tensor_type);
    bytes_field(2, &shape, &mut tensor_type);
    let mut type_proto = Vec::new();
    bytes_field(1, &tensor_type, &mut type_proto);

    let mut out = Vec::new();
    bytes_field(1, name.as_bytes(), &mut out);
    bytes_field(2, &type_proto, &mut out);
    out
}

/// Deterministic test values in [-1, 1]
pub fn ramp(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 + phase) * 0.37).sin()).collect()
}
