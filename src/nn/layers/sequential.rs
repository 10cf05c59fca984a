use crate::error::Result;
use crate::nn::Operator;
use crate::parameter::Parameter;
use crate::tensor::Tensor;

use super::sequential_builder::PipelineBuilder;

/// Entry in a Pipeline
pub(crate) struct LayerEntry {
    pub(crate) name: Option<String>,
    pub(crate) layer: Box<dyn Operator>,
}

/// An ordered chain of operators.
///
/// `forward` runs front to back and `backward` runs back to front, so every
/// operator sees its backward calls in the reverse order of its forwards.
pub struct Pipeline {
    pub(crate) layers: Vec<LayerEntry>,
    pub(crate) input_shape: Option<Vec<usize>>,
}

impl Pipeline {
    /// Unvalidated pipeline over `layers`; use [`Pipeline::builder`] to check shapes up front.
    pub fn new(layers: Vec<Box<dyn Operator>>) -> Self {
        Pipeline {
            layers: layers
                .into_iter()
                .map(|layer| LayerEntry { name: None, layer })
                .collect(),
            input_shape: None,
        }
    }

    /// Builder that propagates `input_shape` through every appended operator.
    pub fn builder(input_shape: &[usize]) -> PipelineBuilder {
        PipelineBuilder::new(input_shape)
    }

    pub fn push(&mut self, layer: Box<dyn Operator>) {
        self.layers.push(LayerEntry { name: None, layer });
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Per-sample input shape the pipeline was validated against, if built that way.
    pub fn input_shape(&self) -> Option<&[usize]> {
        self.input_shape.as_deref()
    }

    /// Entry names, falling back to each operator's own name.
    pub fn names(&self) -> Vec<&str> {
        self.layers
            .iter()
            .map(|e| e.name.as_deref().unwrap_or_else(|| e.layer.name()))
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Operator> {
        self.layers.get(index).map(|e| e.layer.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn Operator + 'static)> {
        self.layers.get_mut(index).map(|e| e.layer.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Operator> {
        self.layers.iter().map(|e| e.layer.as_ref())
    }
}

impl Operator for Pipeline {
    fn name(&self) -> &str {
        "Pipeline"
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        self.layers
            .iter()
            .try_fold(input.to_vec(), |shape, e| e.layer.output_shape(&shape))
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let mut current = x.clone();
        for entry in &mut self.layers {
            current = entry.layer.forward(&current)?;
        }
        Ok(current)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let mut current = gy.clone();
        for entry in self.layers.iter_mut().rev() {
            current = entry.layer.backward(&current)?;
        }
        Ok(current)
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        let mut current = x.clone();
        for entry in &self.layers {
            current = entry.layer.predict(&current)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.layers.iter().flat_map(|e| e.layer.parameters()).collect()
    }

    fn zero_grad(&self) {
        for entry in &self.layers {
            entry.layer.zero_grad();
        }
    }

    /// Cache entries pending across all operators
    fn pending(&self) -> usize {
        self.layers.iter().map(|e| e.layer.pending()).sum()
    }

    fn reset_state(&mut self) {
        for entry in &mut self.layers {
            entry.layer.reset_state();
        }
    }

    fn train(&mut self, mode: bool) {
        for entry in &mut self.layers {
            entry.layer.train(mode);
        }
    }
}
