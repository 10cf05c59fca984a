//! Import of binary ONNX models into a [`Pipeline`].
//!
//! The graph must be a linear chain: every node reads the output of the node
//! before it. Weights are taken from the graph initializers in file order.

pub mod proto;
pub mod registry;

use std::fs;
use std::path::Path;

use crate::error::{LayerwiseError, Result};
use crate::nn::Pipeline;
use proto::{GraphProto, ModelProto, decode_model};
use registry::{InitializerCursor, Registry};

pub use registry::{Constructor, Rule};

/// Decode `bytes` and build the pipeline with the standard rule table.
pub fn import_model(bytes: &[u8]) -> Result<Pipeline> {
    import_with(&Registry::standard(), bytes)
}

/// Read an `.onnx` file and build the pipeline with the standard rule table.
pub fn load_network(path: impl AsRef<Path>) -> Result<Pipeline> {
    let path = path.as_ref();
    let bytes = fs::read(path).inspect_err(|e| {
        log::warn!("could not read model {}: {e}", path.display());
    })?;
    import_model(&bytes)
}

/// Decode `bytes` and build the pipeline with a caller-supplied rule table.
///
/// # Errors
/// Any decode, dispatch or shape error aborts the import; no partially built
/// pipeline is returned.
pub fn import_with(registry: &Registry, bytes: &[u8]) -> Result<Pipeline> {
    let model = decode_model(bytes).inspect_err(|e| log::warn!("ONNX decode failed: {e}"))?;
    build_pipeline(registry, &model).inspect_err(|e| log::warn!("ONNX import failed: {e}"))
}

/// Per-sample shape of the graph's data input, batch axis stripped.
fn input_shape(graph: &GraphProto) -> Result<Vec<usize>> {
    let input = graph
        .inputs
        .iter()
        .find(|i| !graph.initializers.iter().any(|t| t.name == i.name))
        .ok_or_else(|| LayerwiseError::config("graph declares no data input"))?;
    let dims = input.dims.as_ref().ok_or_else(|| {
        LayerwiseError::config(format!("graph input '{}' has no tensor shape", input.name))
    })?;
    match dims.split_first() {
        Some((_batch, rest)) if !rest.is_empty() => Ok(rest.to_vec()),
        _ => Err(LayerwiseError::config(format!(
            "graph input '{}' needs a batch axis and at least one more, got {dims:?}",
            input.name
        ))),
    }
}

fn build_pipeline(registry: &Registry, model: &ModelProto) -> Result<Pipeline> {
    let graph = &model.graph;
    let version = model.opset_version;
    let shape = input_shape(graph)?;
    log::debug!("graph '{}': input shape {shape:?}, opset {version}", graph.name);

    let mut cursor = InitializerCursor::new(&graph.initializers);
    let mut builder = Pipeline::builder(&shape);
    let mut previous_output: Option<&str> = None;

    for node in &graph.nodes {
        if let (Some(prev), Some(input)) = (previous_output, node.inputs.first()) {
            if input != prev {
                return Err(LayerwiseError::config(format!(
                    "node '{}' reads '{input}' instead of '{prev}'; only linear chains import",
                    node.display_name()
                )));
            }
        }

        let rule = registry.resolve(&node.op_type, version)?;
        let (op, next) = (rule.build)(node, &mut cursor, builder.current_shape())?;
        log::debug!(
            "{} ({} v{}) -> {next:?}",
            node.display_name(),
            node.op_type,
            version
        );
        builder = builder.add_named(node.display_name(), op);
        previous_output = node.outputs.first().map(String::as_str);
    }

    if cursor.remaining() > 0 {
        log::warn!(
            "{} initializer(s) were not consumed by any node",
            cursor.remaining()
        );
    }

    let pipeline = builder.build()?;
    log::info!(
        "imported {} operator(s) from opset {version}",
        pipeline.len()
    );
    Ok(pipeline)
}
