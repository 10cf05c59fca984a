use crate::error::{LayerwiseError, Result};
use crate::tensor::{SharedTensor, Tensor};

/// A learnable tensor bound to its gradient and a human-readable label.
///
/// Cloning a binding shares the underlying tensors, so an optimizer holding
/// a clone sees the gradients the operator accumulates.
#[derive(Clone)]
pub struct Parameter {
    pub value: SharedTensor,
    pub grad: SharedTensor,
    pub label: String,
}

impl Parameter {
    /// Bind `value` with a zeroed gradient tensor of the same shape.
    pub fn new(value: Tensor, label: impl Into<String>) -> Self {
        let grad = value.zeros_like();
        Parameter {
            value: value.shared(),
            grad: grad.shared(),
            label: label.into(),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.value.borrow().shape.clone()
    }

    pub fn zero_grad(&self) {
        self.grad.borrow_mut().data.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Overwrite the value with externally provided data (pretrained weights).
    ///
    /// # Errors
    /// `Configuration` when `data` does not have exactly as many elements as the value.
    pub fn load(&self, data: &[f32]) -> Result<()> {
        let mut v = self.value.borrow_mut();
        if data.len() != v.data.len() {
            return Err(LayerwiseError::config(format!(
                "{}: expected {} values for shape {:?}, got {}",
                self.label,
                v.data.len(),
                v.shape,
                data.len()
            )));
        }
        v.data.copy_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("label", &self.label)
            .field("shape", &self.value.borrow().shape)
            .finish()
    }
}
