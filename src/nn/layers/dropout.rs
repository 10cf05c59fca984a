use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Operator, check_shape};
use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How much of the buffer one sampled mask covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskScope {
    /// One mask of per-sample length, shared by every sample in the batch
    #[default]
    Sample,
    /// One mask over the whole batch buffer
    Batch,
}

pub struct Dropout {
    name: String,
    ratio: f32,
    scope: MaskScope,
    training: bool,
    masks: CacheStack<Vec<f32>>,
}

impl Dropout {
    /// Create a new Dropout layer
    ///
    /// # Arguments
    /// * `ratio` - Probability of an element being zeroed out, in [0, 1)
    ///
    /// # Errors
    /// `Configuration` if `ratio` falls outside [0, 1).
    pub fn new(ratio: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&ratio) {
            return Err(LayerwiseError::config(format!(
                "Dropout ratio must be in [0, 1), got {ratio}"
            )));
        }
        if ratio == 0.0 {
            log::warn!("Dropout ratio is 0, the operator is an identity");
        }
        Ok(Self {
            name: "Dropout".to_string(),
            ratio,
            scope: MaskScope::default(),
            training: true,
            masks: CacheStack::new(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: MaskScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn scope(&self) -> MaskScope {
        self.scope
    }

    fn sample_mask(&self, size: usize) -> Vec<f32> {
        let keep_prob = 1.0 - self.ratio;
        let scale = 1.0 / keep_prob;

        // 1/(1-ratio) with prob (1-ratio), 0 with prob ratio
        crate::tensor::with_rng(|rng| {
            (0..size)
                .map(|_| {
                    if rng.random::<f32>() < keep_prob {
                        scale
                    } else {
                        0.0
                    }
                })
                .collect()
        })
    }
}

fn apply_mask(x: &Tensor, mask: &[f32]) -> Tensor {
    let data = x
        .data
        .iter()
        .enumerate()
        .map(|(i, v)| v * mask[i % mask.len()])
        .collect();
    Tensor::from_parts(data, &x.shape, x.batch_count)
}

impl Operator for Dropout {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        Ok(input.to_vec())
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let size = match self.scope {
            MaskScope::Sample => x.len(),
            MaskScope::Batch => x.data.len(),
        };
        let mask = if self.training {
            self.sample_mask(size)
        } else {
            vec![1.0; size]
        };
        let y = apply_mask(x, &mask);
        self.masks.push(mask);
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let mask = self.masks.pop(&self.name)?;
        let expected = match self.scope {
            MaskScope::Sample => gy.len(),
            MaskScope::Batch => gy.data.len(),
        };
        check_shape(&self.name, &[mask.len()], &[expected])?;
        Ok(apply_mask(gy, &mask))
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn pending(&self) -> usize {
        self.masks.len()
    }

    fn reset_state(&mut self) {
        self.masks.clear();
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::manual_seed;

    #[test]
    fn test_dropout_predict_is_identity() {
        for ratio in [0.0, 0.3, 0.5, 0.9] {
            let dropout = Dropout::new(ratio).unwrap();
            let x = Tensor::randn(&[3, 4], 2);
            assert_eq!(dropout.predict(&x).unwrap(), x);
            assert_eq!(dropout.pending(), 0);
        }
    }

    #[test]
    fn test_dropout_mask_values() {
        manual_seed(7);
        let mut dropout = Dropout::new(0.5).unwrap();
        let x = Tensor::ones(&[1000], 1);
        let y = dropout.forward(&x).unwrap();
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = y.data.iter().filter(|&&v| v > 0.0).count();
        assert!((350..650).contains(&kept), "kept {kept} of 1000");
    }

    #[test]
    fn test_dropout_sample_scope_shares_mask() {
        manual_seed(1);
        let mut dropout = Dropout::new(0.5).unwrap();
        let x = Tensor::ones(&[16], 3);
        let y = dropout.forward(&x).unwrap();
        assert_eq!(y.sample(0), y.sample(1));
        assert_eq!(y.sample(1), y.sample(2));
    }

    #[test]
    fn test_dropout_backward_replays_mask() {
        manual_seed(3);
        let mut dropout = Dropout::new(0.4).unwrap().with_scope(MaskScope::Batch);
        let x = Tensor::ones(&[8], 2);
        let y = dropout.forward(&x).unwrap();
        let gx = dropout.backward(&Tensor::ones(&[8], 2)).unwrap();
        assert_eq!(gx.data, y.data);
    }

    #[test]
    fn test_dropout_eval_pushes_unit_mask() {
        let mut dropout = Dropout::new(0.5).unwrap();
        dropout.eval();
        let x = Tensor::randn(&[5], 2);
        assert_eq!(dropout.forward(&x).unwrap(), x);
        assert_eq!(dropout.pending(), 1);
        let g = Tensor::randn(&[5], 2);
        assert_eq!(dropout.backward(&g).unwrap(), g);
    }

    #[test]
    fn test_dropout_lifo() {
        manual_seed(11);
        let mut dropout = Dropout::new(0.5).unwrap();
        let x = Tensor::ones(&[32], 1);
        let first = dropout.forward(&x).unwrap();
        let second = dropout.forward(&x).unwrap();

        let g = Tensor::ones(&[32], 1);
        assert_eq!(dropout.backward(&g).unwrap().data, second.data);
        assert_eq!(dropout.backward(&g).unwrap().data, first.data);
        assert!(matches!(
            dropout.backward(&g),
            Err(LayerwiseError::CacheUnderflow { .. })
        ));
    }

    #[test]
    fn test_dropout_invalid_ratio() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(f32::NAN).is_err());
    }
}
