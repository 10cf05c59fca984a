//! JSON description of a pipeline.
//!
//! ```json
//! {
//!   "input_shape": [3, 8, 8],
//!   "layers": [
//!     { "type": "conv2d", "in_channels": 3, "out_channels": 8, "kernel": 3, "pad": 1 },
//!     { "type": "batch_norm", "channels": 8 },
//!     { "type": "max_pool2d", "kernel": 2, "stride": 2 },
//!     { "type": "dropout" }
//!   ]
//! }
//! ```

use crate::error::{LayerwiseError, Result};
use crate::nn::{
    BatchNorm, Conv2d, ConvTranspose2d, Dropout, Flatten, Linear, MaskScope, MaxPool2d, Operator,
    Pipeline, ReLU,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-sample input shape, batch axis excluded
    pub input_shape: Vec<usize>,
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Conv2d {
        #[serde(default)]
        name: Option<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        #[serde(default = "LayerConfig::default_stride")]
        stride: usize,
        #[serde(default)]
        pad: usize,
        #[serde(default = "LayerConfig::default_true")]
        bias: bool,
    },
    ConvTranspose2d {
        #[serde(default)]
        name: Option<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        #[serde(default = "LayerConfig::default_stride")]
        stride: usize,
        #[serde(default)]
        pad: usize,
        #[serde(default = "LayerConfig::default_true")]
        bias: bool,
    },
    MaxPool2d {
        #[serde(default)]
        name: Option<String>,
        kernel: usize,
        #[serde(default = "LayerConfig::default_stride")]
        stride: usize,
        #[serde(default)]
        pad: usize,
        #[serde(default = "LayerConfig::default_true")]
        cover_all: bool,
    },
    BatchNorm {
        #[serde(default)]
        name: Option<String>,
        channels: usize,
        #[serde(default = "LayerConfig::default_decay")]
        decay: f32,
        #[serde(default = "LayerConfig::default_eps")]
        eps: f32,
        #[serde(default = "LayerConfig::default_true")]
        training: bool,
    },
    Dropout {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "LayerConfig::default_ratio")]
        ratio: f32,
        #[serde(default)]
        scope: MaskScope,
    },
    Linear {
        #[serde(default)]
        name: Option<String>,
        in_features: usize,
        out_features: usize,
        #[serde(default = "LayerConfig::default_true")]
        bias: bool,
    },
    Relu {
        #[serde(default)]
        name: Option<String>,
    },
    Flatten {
        #[serde(default)]
        name: Option<String>,
    },
}

impl LayerConfig {
    const fn default_stride() -> usize {
        1
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_decay() -> f32 {
        0.9
    }

    const fn default_eps() -> f32 {
        1e-5
    }

    const fn default_ratio() -> f32 {
        0.5
    }

    fn name(&self) -> Option<&str> {
        match self {
            LayerConfig::Conv2d { name, .. }
            | LayerConfig::ConvTranspose2d { name, .. }
            | LayerConfig::MaxPool2d { name, .. }
            | LayerConfig::BatchNorm { name, .. }
            | LayerConfig::Dropout { name, .. }
            | LayerConfig::Linear { name, .. }
            | LayerConfig::Relu { name }
            | LayerConfig::Flatten { name } => name.as_deref(),
        }
    }

    /// Construct the operator this entry describes, labeled with `name` when one is set.
    pub fn build(&self) -> Result<Box<dyn Operator>> {
        let op: Box<dyn Operator> = match *self {
            LayerConfig::Conv2d {
                ref name,
                in_channels,
                out_channels,
                kernel,
                stride,
                pad,
                bias,
            } => labeled(
                Conv2d::new(in_channels, out_channels, kernel, stride, pad, bias)?,
                name,
                |op, n| op.with_name(n),
            ),
            LayerConfig::ConvTranspose2d {
                ref name,
                in_channels,
                out_channels,
                kernel,
                stride,
                pad,
                bias,
            } => labeled(
                ConvTranspose2d::new(in_channels, out_channels, kernel, stride, pad, bias)?,
                name,
                |op, n| op.with_name(n),
            ),
            LayerConfig::MaxPool2d {
                ref name,
                kernel,
                stride,
                pad,
                cover_all,
            } => labeled(
                MaxPool2d::new(kernel, stride, pad)?.with_cover_all(cover_all),
                name,
                |op, n| op.with_name(n),
            ),
            LayerConfig::BatchNorm {
                ref name,
                channels,
                decay,
                eps,
                training,
            } => labeled(
                BatchNorm::with_params(channels, decay, eps, training)?,
                name,
                |op, n| op.with_name(n),
            ),
            LayerConfig::Dropout {
                ref name,
                ratio,
                scope,
            } => labeled(Dropout::new(ratio)?.with_scope(scope), name, |op, n| {
                op.with_name(n)
            }),
            LayerConfig::Linear {
                ref name,
                in_features,
                out_features,
                bias,
            } => labeled(
                Linear::new(in_features, out_features, bias)?,
                name,
                |op, n| op.with_name(n),
            ),
            LayerConfig::Relu { ref name } => labeled(ReLU::new(), name, |op, n| op.with_name(n)),
            LayerConfig::Flatten { ref name } => {
                labeled(Flatten::new(), name, |op, n| op.with_name(n))
            }
        };
        Ok(op)
    }
}

fn labeled<O: Operator + 'static>(
    op: O,
    name: &Option<String>,
    rename: impl FnOnce(O, String) -> O,
) -> Box<dyn Operator> {
    match name {
        Some(n) => Box::new(rename(op, n.clone())),
        None => Box::new(op),
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the pipeline, checking every layer against the shape flowing into it.
    pub fn build(&self) -> Result<Pipeline> {
        if self.input_shape.is_empty() {
            return Err(LayerwiseError::config("input_shape must not be empty"));
        }
        let mut builder = Pipeline::builder(&self.input_shape);
        for (i, layer) in self.layers.iter().enumerate() {
            let op = layer.build()?;
            builder = match layer.name() {
                Some(name) => builder.add_named(name, op),
                None => builder.add(op),
            };
            log::debug!("layer {i}: shape after {:?}", builder.current_shape());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    const NET: &str = r#"{
        "input_shape": [3, 8, 8],
        "layers": [
            { "type": "conv2d", "name": "stem", "in_channels": 3, "out_channels": 8, "kernel": 3, "pad": 1 },
            { "type": "batch_norm", "channels": 8 },
            { "type": "relu" },
            { "type": "max_pool2d", "kernel": 2, "stride": 2 },
            { "type": "dropout", "ratio": 0.25 },
            { "type": "flatten" },
            { "type": "linear", "in_features": 128, "out_features": 10 }
        ]
    }"#;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::from_json(NET).unwrap();
        assert_eq!(config.layers.len(), 7);
        match &config.layers[0] {
            LayerConfig::Conv2d { stride, bias, .. } => {
                assert_eq!(*stride, 1);
                assert!(*bias);
            }
            other => panic!("unexpected layer {other:?}"),
        }
        match &config.layers[1] {
            LayerConfig::BatchNorm {
                decay,
                eps,
                training,
                ..
            } => {
                assert_eq!(*decay, 0.9);
                assert_eq!(*eps, 1e-5);
                assert!(*training);
            }
            other => panic!("unexpected layer {other:?}"),
        }
        match &config.layers[3] {
            LayerConfig::MaxPool2d { cover_all, pad, .. } => {
                assert!(*cover_all);
                assert_eq!(*pad, 0);
            }
            other => panic!("unexpected layer {other:?}"),
        }
    }

    #[test]
    fn test_config_build_and_predict() {
        let net = PipelineConfig::from_json(NET).unwrap().build().unwrap();
        assert_eq!(net.len(), 7);
        assert_eq!(net.names()[0], "stem");
        let y = net.predict(&Tensor::randn(&[3, 8, 8], 2)).unwrap();
        assert_eq!(y.full_shape(), vec![2, 10]);
    }

    #[test]
    fn test_config_names_reach_the_operators() {
        let json = r#"{
            "input_shape": [1, 6, 6],
            "layers": [
                { "type": "conv2d", "name": "c1", "in_channels": 1, "out_channels": 2, "kernel": 3 },
                { "type": "conv2d", "name": "c2", "in_channels": 2, "out_channels": 2, "kernel": 3 },
                { "type": "batch_norm", "name": "bn", "channels": 2 }
            ]
        }"#;
        let mut net = PipelineConfig::from_json(json).unwrap().build().unwrap();
        let labels: Vec<String> = net.parameters().iter().map(|p| p.label.clone()).collect();
        assert_eq!(
            labels,
            vec!["c1 W", "c1 b", "c2 W", "c2 b", "bn Gamma", "bn Beta"]
        );

        let conv = net.get_mut(1).unwrap();
        assert_eq!(conv.name(), "c2");
        match conv.backward(&Tensor::zeros(&[2, 2, 2], 1)) {
            Err(LayerwiseError::CacheUnderflow { operator }) => assert_eq!(operator, "c2"),
            other => panic!("expected CacheUnderflow, got {:?}", other.map(|t| t.full_shape())),
        }
    }

    #[test]
    fn test_config_shape_mismatch() {
        let json = r#"{
            "input_shape": [3, 8, 8],
            "layers": [
                { "type": "conv2d", "in_channels": 4, "out_channels": 8, "kernel": 3 }
            ]
        }"#;
        let result = PipelineConfig::from_json(json).unwrap().build();
        assert!(matches!(result, Err(LayerwiseError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_config_invalid_values() {
        let json = r#"{ "input_shape": [4], "layers": [ { "type": "dropout", "ratio": 1.5 } ] }"#;
        let result = PipelineConfig::from_json(json).unwrap().build();
        assert!(matches!(result, Err(LayerwiseError::Configuration(_))));

        assert!(matches!(
            PipelineConfig::from_json(r#"{ "input_shape": [4], "layers": [ { "type": "softmax" } ] }"#),
            Err(LayerwiseError::Json(_))
        ));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = PipelineConfig::from_json(NET).unwrap();
        let again = PipelineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(config, again);
    }
}
