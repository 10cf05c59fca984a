//! Minimal protobuf wire reader and the slice of the ONNX schema the importer needs.
//!
//! Only the fields listed on each decoder are read; everything else is skipped
//! by wire type, so models carrying doc strings, metadata or value types we do
//! not use still decode.

use crate::error::{LayerwiseError, Result};

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// `TensorProto.DataType.FLOAT`
pub const DATA_TYPE_FLOAT: i32 = 1;

fn decode_err(msg: impl Into<String>) -> LayerwiseError {
    LayerwiseError::Decode(msg.into())
}

// ===== WIRE READER =====

pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = *self
                .data
                .get(self.pos)
                .ok_or_else(|| decode_err("varint: unexpected end of input"))?;
            self.pos += 1;
            result |= u64::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(decode_err("varint longer than 10 bytes"));
            }
        }
    }

    /// (field number, wire type)
    pub(crate) fn read_tag(&mut self) -> Result<(u32, u32)> {
        let v = self.read_varint()?;
        Ok(((v >> 3) as u32, (v & 7) as u32))
    }

    pub(crate) fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.read_varint()?)
            .map_err(|_| decode_err("length prefix does not fit in memory"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| decode_err(format!("length {len} runs past the end of the message")))?;
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| decode_err(format!("fixed{}: unexpected end of input", N * 8)))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub(crate) fn read_fixed32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    pub(crate) fn read_fixed64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| decode_err(format!("invalid UTF-8: {e}")))
    }

    pub(crate) fn skip_field(&mut self, wire_type: u32) -> Result<()> {
        match wire_type {
            WIRE_VARINT => {
                self.read_varint()?;
            }
            WIRE_FIXED64 => {
                self.read_fixed64()?;
            }
            WIRE_LEN => {
                self.read_bytes()?;
            }
            WIRE_FIXED32 => {
                self.read_fixed32()?;
            }
            _ => return Err(decode_err(format!("unknown wire type: {wire_type}"))),
        }
        Ok(())
    }
}

fn packed_varints(bytes: &[u8]) -> Result<Vec<i64>> {
    let mut sub = WireReader::new(bytes);
    let mut out = Vec::new();
    while !sub.is_empty() {
        out.push(sub.read_varint()? as i64);
    }
    Ok(out)
}

fn le_floats(bytes: &[u8], what: &str) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(decode_err(format!(
            "{what}: {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ===== MESSAGES =====

#[derive(Debug, Clone)]
pub struct ModelProto {
    /// Version of the default (`""` / `ai.onnx`) operator set
    pub opset_version: i64,
    pub graph: GraphProto,
}

#[derive(Debug, Clone, Default)]
pub struct GraphProto {
    pub name: String,
    pub nodes: Vec<NodeProto>,
    /// In file order; the importer consumes them sequentially
    pub initializers: Vec<TensorProto>,
    pub inputs: Vec<ValueInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeProto {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    /// Tensors, graphs and other kinds the importer never reads
    Other(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, Default)]
pub struct TensorProto {
    pub name: String,
    pub dims: Vec<i64>,
    pub data_type: i32,
    float_data: Vec<f32>,
    raw_data: Option<Vec<u8>>,
}

/// A graph input or output with its tensor shape, if declared.
#[derive(Debug, Clone, Default)]
pub struct ValueInfo {
    pub name: String,
    /// `dim_value` per axis; symbolic `dim_param` axes read as 1
    pub dims: Option<Vec<usize>>,
}

impl NodeProto {
    /// `name`, or `op_type` for anonymous nodes
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.op_type
        } else {
            &self.name
        }
    }

    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    fn wrong_kind(&self, name: &str, wanted: &str) -> LayerwiseError {
        LayerwiseError::UnsupportedAttribute {
            op_type: self.op_type.clone(),
            attribute: name.to_string(),
            detail: format!("expected {wanted}, found {:?}", self.attr(name)),
        }
    }

    pub fn attr_int(&self, name: &str, default: i64) -> Result<i64> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttributeValue::Int(v)) => Ok(*v),
            Some(_) => Err(self.wrong_kind(name, "an int")),
        }
    }

    pub fn attr_float(&self, name: &str, default: f32) -> Result<f32> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttributeValue::Float(v)) => Ok(*v),
            Some(_) => Err(self.wrong_kind(name, "a float")),
        }
    }

    pub fn attr_ints(&self, name: &str) -> Result<Option<Vec<i64>>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttributeValue::Ints(v)) => Ok(Some(v.clone())),
            Some(_) => Err(self.wrong_kind(name, "a list of ints")),
        }
    }

    pub fn attr_string(&self, name: &str) -> Result<Option<&str>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttributeValue::String(s)) => Ok(Some(s)),
            Some(_) => Err(self.wrong_kind(name, "a string")),
        }
    }
}

impl TensorProto {
    /// Product of `dims`.
    ///
    /// # Errors
    /// `Decode` for a negative dimension or a product that overflows `usize`.
    pub fn element_count(&self) -> Result<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| {
            usize::try_from(d)
                .ok()
                .and_then(|d| acc.checked_mul(d))
                .ok_or_else(|| {
                    decode_err(format!(
                        "initializer '{}' has unusable dims {:?}",
                        self.name, self.dims
                    ))
                })
        })
    }

    /// Values as `f32`, from `float_data` or little-endian `raw_data`.
    ///
    /// # Errors
    /// `Decode` for non-FLOAT tensors or when the value count disagrees with `dims`.
    pub fn floats(&self) -> Result<Vec<f32>> {
        if self.data_type != DATA_TYPE_FLOAT {
            return Err(decode_err(format!(
                "initializer '{}' has data type {}, only FLOAT ({DATA_TYPE_FLOAT}) is supported",
                self.name, self.data_type
            )));
        }
        let values = match &self.raw_data {
            Some(raw) => le_floats(raw, &self.name)?,
            None => self.float_data.clone(),
        };
        let expected = self.element_count()?;
        if values.len() != expected {
            return Err(decode_err(format!(
                "initializer '{}' holds {} values but dims {:?} need {expected}",
                self.name,
                values.len(),
                self.dims
            )));
        }
        Ok(values)
    }
}

// ===== DECODERS =====

/// Decode a serialized `ModelProto`.
pub fn decode_model(data: &[u8]) -> Result<ModelProto> {
    let mut reader = WireReader::new(data);
    let mut opset_version = None;
    let mut graph = None;

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (7, WIRE_LEN) => graph = Some(decode_graph(reader.read_bytes()?)?),
            (8, WIRE_LEN) => {
                let (domain, version) = decode_opset(reader.read_bytes()?)?;
                if domain.is_empty() || domain == "ai.onnx" {
                    opset_version = Some(version);
                }
            }
            _ => reader.skip_field(wire)?,
        }
    }

    Ok(ModelProto {
        opset_version: opset_version
            .ok_or_else(|| decode_err("model imports no default-domain operator set"))?,
        graph: graph.ok_or_else(|| decode_err("model has no graph"))?,
    })
}

fn decode_opset(data: &[u8]) -> Result<(String, i64)> {
    let mut reader = WireReader::new(data);
    let mut domain = String::new();
    let mut version = 0;
    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => domain = reader.read_string()?,
            (2, WIRE_VARINT) => version = reader.read_varint()? as i64,
            _ => reader.skip_field(wire)?,
        }
    }
    Ok((domain, version))
}

fn decode_graph(data: &[u8]) -> Result<GraphProto> {
    let mut reader = WireReader::new(data);
    let mut graph = GraphProto::default();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => graph.nodes.push(decode_node(reader.read_bytes()?)?),
            (2, WIRE_LEN) => graph.name = reader.read_string()?,
            (5, WIRE_LEN) => graph
                .initializers
                .push(decode_tensor(reader.read_bytes()?)?),
            (11, WIRE_LEN) => graph.inputs.push(decode_value_info(reader.read_bytes()?)?),
            _ => reader.skip_field(wire)?,
        }
    }
    Ok(graph)
}

fn decode_node(data: &[u8]) -> Result<NodeProto> {
    let mut reader = WireReader::new(data);
    let mut node = NodeProto::default();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => node.inputs.push(reader.read_string()?),
            (2, WIRE_LEN) => node.outputs.push(reader.read_string()?),
            (3, WIRE_LEN) => node.name = reader.read_string()?,
            (4, WIRE_LEN) => node.op_type = reader.read_string()?,
            (5, WIRE_LEN) => node.attributes.push(decode_attribute(reader.read_bytes()?)?),
            (7, WIRE_LEN) => node.domain = reader.read_string()?,
            _ => reader.skip_field(wire)?,
        }
    }
    Ok(node)
}

fn decode_attribute(data: &[u8]) -> Result<Attribute> {
    let mut reader = WireReader::new(data);
    let mut name = String::new();
    let mut kind: Option<i64> = None;
    let mut f = None;
    let mut i = None;
    let mut s = None;
    let mut floats = Vec::new();
    let mut ints = Vec::new();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => name = reader.read_string()?,
            (2, WIRE_FIXED32) => f = Some(f32::from_bits(reader.read_fixed32()?)),
            (3, WIRE_VARINT) => i = Some(reader.read_varint()? as i64),
            (4, WIRE_LEN) => s = Some(String::from_utf8_lossy(reader.read_bytes()?).into_owned()),
            (7, WIRE_LEN) => floats.extend(le_floats(reader.read_bytes()?, &name)?),
            (7, WIRE_FIXED32) => floats.push(f32::from_bits(reader.read_fixed32()?)),
            (8, WIRE_LEN) => ints.extend(packed_varints(reader.read_bytes()?)?),
            (8, WIRE_VARINT) => ints.push(reader.read_varint()? as i64),
            (20, WIRE_VARINT) => kind = Some(reader.read_varint()? as i64),
            _ => reader.skip_field(wire)?,
        }
    }

    // AttributeType: FLOAT=1 INT=2 STRING=3 FLOATS=6 INTS=7
    let value = match kind {
        Some(1) => AttributeValue::Float(f.unwrap_or(0.0)),
        Some(2) => AttributeValue::Int(i.unwrap_or(0)),
        Some(3) => AttributeValue::String(s.unwrap_or_default()),
        Some(6) => AttributeValue::Floats(floats),
        Some(7) => AttributeValue::Ints(ints),
        Some(other) => AttributeValue::Other(other),
        // pre-IR3 files leave the type out; infer it from the populated field
        None => {
            if !ints.is_empty() {
                AttributeValue::Ints(ints)
            } else if !floats.is_empty() {
                AttributeValue::Floats(floats)
            } else if let Some(i) = i {
                AttributeValue::Int(i)
            } else if let Some(f) = f {
                AttributeValue::Float(f)
            } else if let Some(s) = s {
                AttributeValue::String(s)
            } else {
                return Err(decode_err(format!("attribute '{name}' carries no value")));
            }
        }
    };

    Ok(Attribute { name, value })
}

fn decode_tensor(data: &[u8]) -> Result<TensorProto> {
    let mut reader = WireReader::new(data);
    let mut tensor = TensorProto::default();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => tensor.dims.extend(packed_varints(reader.read_bytes()?)?),
            (1, WIRE_VARINT) => tensor.dims.push(reader.read_varint()? as i64),
            (2, WIRE_VARINT) => tensor.data_type = reader.read_varint()? as i32,
            (4, WIRE_LEN) => {
                let bytes = reader.read_bytes()?;
                tensor.float_data.extend(le_floats(bytes, "float_data")?);
            }
            (4, WIRE_FIXED32) => tensor
                .float_data
                .push(f32::from_bits(reader.read_fixed32()?)),
            (8, WIRE_LEN) => tensor.name = reader.read_string()?,
            (9, WIRE_LEN) => tensor.raw_data = Some(reader.read_bytes()?.to_vec()),
            _ => reader.skip_field(wire)?,
        }
    }
    Ok(tensor)
}

fn decode_value_info(data: &[u8]) -> Result<ValueInfo> {
    let mut reader = WireReader::new(data);
    let mut info = ValueInfo::default();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => info.name = reader.read_string()?,
            // TypeProto.tensor_type (1) -> Tensor.shape (2) -> dim (1)
            (2, WIRE_LEN) => info.dims = decode_type(reader.read_bytes()?)?,
            _ => reader.skip_field(wire)?,
        }
    }
    Ok(info)
}

fn decode_type(data: &[u8]) -> Result<Option<Vec<usize>>> {
    let mut reader = WireReader::new(data);
    let mut dims = None;
    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => {
                let mut tensor_type = WireReader::new(reader.read_bytes()?);
                while !tensor_type.is_empty() {
                    let (f, w) = tensor_type.read_tag()?;
                    match (f, w) {
                        (2, WIRE_LEN) => dims = Some(decode_shape(tensor_type.read_bytes()?)?),
                        _ => tensor_type.skip_field(w)?,
                    }
                }
            }
            _ => reader.skip_field(wire)?,
        }
    }
    Ok(dims)
}

fn decode_shape(data: &[u8]) -> Result<Vec<usize>> {
    let mut reader = WireReader::new(data);
    let mut dims = Vec::new();
    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => {
                let mut dim = WireReader::new(reader.read_bytes()?);
                // symbolic (dim_param) or unset axes count as 1
                let mut value = 1usize;
                while !dim.is_empty() {
                    let (f, w) = dim.read_tag()?;
                    match (f, w) {
                        (1, WIRE_VARINT) => value = (dim.read_varint()? as i64).max(1) as usize,
                        _ => dim.skip_field(w)?,
                    }
                }
                dims.push(value);
            }
            _ => reader.skip_field(wire)?,
        }
    }
    Ok(dims)
}
