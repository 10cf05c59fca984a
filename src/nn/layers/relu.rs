use crate::cache::CacheStack;
use crate::error::Result;
use crate::nn::{Operator, check_shape};
use crate::tensor::Tensor;

pub struct ReLU {
    name: String,
    outputs: CacheStack<Tensor>,
}

impl ReLU {
    pub fn new() -> Self {
        ReLU {
            name: "ReLU".to_string(),
            outputs: CacheStack::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for ReLU {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        Ok(input.to_vec())
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.predict(x)?;
        self.outputs.push(y.clone());
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let y = self.outputs.pop(&self.name)?;
        check_shape(&self.name, &y.full_shape(), &gy.full_shape())?;
        let data = y
            .data
            .iter()
            .zip(&gy.data)
            .map(|(&out, &g)| if out > 0.0 { g } else { 0.0 })
            .collect();
        Ok(Tensor::from_parts(data, &y.shape, y.batch_count))
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        let data = x.data.iter().map(|&v| v.max(0.0)).collect();
        Ok(Tensor::from_parts(data, &x.shape, x.batch_count))
    }

    fn pending(&self) -> usize {
        self.outputs.len()
    }

    fn reset_state(&mut self) {
        self.outputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_forward_backward() {
        let mut relu = ReLU::new();
        let x = Tensor::from_sample(vec![-1.0, 0.0, 2.0, -3.0, 4.0], &[5]).unwrap();
        let y = relu.forward(&x).unwrap();
        assert_eq!(y.data, vec![0.0, 0.0, 2.0, 0.0, 4.0]);

        let gx = relu.backward(&Tensor::ones(&[5], 1)).unwrap();
        assert_eq!(gx.data, vec![0.0, 0.0, 1.0, 0.0, 1.0]);
        assert!(relu.backward(&Tensor::ones(&[5], 1)).is_err());
    }
}
