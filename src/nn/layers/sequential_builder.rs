use super::sequential::{LayerEntry, Pipeline};
use crate::error::{LayerwiseError, Result};
use crate::nn::Operator;

/// Builder for constructing a Pipeline with named or unnamed operators
///
/// Every appended operator's `output_shape` is evaluated against the shape
/// produced so far. The first mismatch is kept and returned from `build`.
///
/// # Examples
///
/// ```
/// use layerwise::nn::{Conv2d, MaxPool2d, Pipeline, ReLU};
///
/// let net = Pipeline::builder(&[3, 8, 8])
///     .add_named("conv1", Box::new(Conv2d::new(3, 8, 3, 1, 1, true).unwrap()))
///     .add(Box::new(ReLU::new()))
///     .add(Box::new(MaxPool2d::new(2, 2, 0).unwrap()))
///     .build()
///     .unwrap();
/// assert_eq!(net.len(), 3);
/// ```
pub struct PipelineBuilder {
    input_shape: Vec<usize>,
    shape: Vec<usize>,
    entries: Vec<LayerEntry>,
    error: Option<LayerwiseError>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(input_shape: &[usize]) -> Self {
        Self {
            input_shape: input_shape.to_vec(),
            shape: input_shape.to_vec(),
            entries: Vec::new(),
            error: None,
        }
    }

    /// Add an unnamed operator; it is listed under its own name.
    #[must_use]
    pub fn add(self, layer: Box<dyn Operator>) -> Self {
        self.push(None, layer)
    }

    /// Add a named operator. Empty strings are treated as unnamed.
    #[must_use]
    pub fn add_named(self, name: impl Into<String>, layer: Box<dyn Operator>) -> Self {
        let name = name.into();
        self.push((!name.is_empty()).then_some(name), layer)
    }

    fn push(mut self, name: Option<String>, layer: Box<dyn Operator>) -> Self {
        if self.error.is_some() {
            return self;
        }
        match layer.output_shape(&self.shape) {
            Ok(next) => {
                self.shape = next;
                self.entries.push(LayerEntry { name, layer });
            }
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Per-sample shape after the operators added so far
    pub fn current_shape(&self) -> &[usize] {
        &self.shape
    }

    /// # Errors
    /// The first shape error met while adding operators.
    pub fn build(self) -> Result<Pipeline> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(Pipeline {
            layers: self.entries,
            input_shape: Some(self.input_shape),
        })
    }
}
