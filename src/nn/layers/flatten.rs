use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Operator, check_shape};
use crate::tensor::{Tensor, checked_volume};

/// Flattens every sample into a single axis.
///
/// The batch axis is kept apart as always, so per-sample shape (D1, D2, ...)
/// becomes (D1 * D2 * ...).
pub struct Flatten {
    name: String,
    shapes: CacheStack<Vec<usize>>,
}

impl Flatten {
    pub fn new() -> Self {
        Flatten {
            name: "Flatten".to_string(),
            shapes: CacheStack::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for Flatten {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for Flatten {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let flat = checked_volume(input, 1).ok_or_else(|| {
            LayerwiseError::config(format!("{}: shape {input:?} is too large", self.name))
        })?;
        Ok(vec![flat])
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.predict(x)?;
        self.shapes.push(x.shape.clone());
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let shape = self.shapes.pop(&self.name)?;
        check_shape(&self.name, &[shape.iter().product::<usize>()], &gy.shape)?;
        gy.reshape(&shape)
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        x.reshape(&[x.len()])
    }

    fn pending(&self) -> usize {
        self.shapes.len()
    }

    fn reset_state(&mut self) {
        self.shapes.clear();
    }
}
