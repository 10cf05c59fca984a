use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Mode, Operator, check_shape};
use crate::parameter::Parameter;
use crate::tensor::{Tensor, checked_volume};

/// Batch normalization over the leading (channel) axis of each sample.
///
/// A per-sample shape `[C, ...]` is normalized per channel over the batch
/// and every trailing position, so `[C]` is the classic fully connected
/// variant and `[C, H, W]` the convolutional one.
///
/// Training mode normalizes with the mini-batch statistics and folds them
/// into an exponential moving average; inference mode uses the stored
/// averages unchanged. `predict` always runs inference statistics without
/// touching the mode flag.
pub struct BatchNorm {
    name: String,
    channels: usize,
    decay: f32,
    eps: f32,
    training: bool,
    // Parameters (Learnable)
    gamma: Parameter,
    beta: Parameter,
    // Buffers, exposed as parameters only when built for inference
    running_mean: Parameter,
    running_var: Parameter,
    bind_statistics: bool,
    cache: CacheStack<NormCache>,
}

#[derive(Debug, Clone)]
struct NormCache {
    xhat: Vec<f32>,
    std: Vec<f32>,
    mode: Mode,
    shape: Vec<usize>,
    batch_count: usize,
}

struct Normalized {
    y: Tensor,
    cache: NormCache,
    batch_stats: Option<(Vec<f32>, Vec<f32>)>,
}

impl BatchNorm {
    /// Training-mode layer with decay 0.9 and eps 1e-5
    pub fn new(channels: usize) -> Result<Self> {
        Self::with_params(channels, 0.9, 1e-5, true)
    }

    pub fn with_params(channels: usize, decay: f32, eps: f32, training: bool) -> Result<Self> {
        if channels == 0 {
            return Err(LayerwiseError::config("BatchNorm needs at least one channel"));
        }
        if !(0.0..=1.0).contains(&decay) {
            return Err(LayerwiseError::config(format!(
                "BatchNorm decay must be in [0, 1], got {decay}"
            )));
        }
        if eps.is_nan() || eps <= 0.0 {
            return Err(LayerwiseError::config(format!(
                "BatchNorm eps must be positive, got {eps}"
            )));
        }
        let name = "BatchNorm".to_string();
        Ok(BatchNorm {
            gamma: Parameter::new(Tensor::ones(&[channels], 1), format!("{name} Gamma")),
            beta: Parameter::new(Tensor::zeros(&[channels], 1), format!("{name} Beta")),
            running_mean: Parameter::new(Tensor::zeros(&[channels], 1), format!("{name} Mean")),
            running_var: Parameter::new(Tensor::zeros(&[channels], 1), format!("{name} Variance")),
            bind_statistics: !training,
            name,
            channels,
            decay,
            eps,
            training,
            cache: CacheStack::new(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.gamma.label = format!("{} Gamma", self.name);
        self.beta.label = format!("{} Beta", self.name);
        self.running_mean.label = format!("{} Mean", self.name);
        self.running_var.label = format!("{} Variance", self.name);
        self
    }

    /// Load scale, shift and running statistics, e.g. from a trained model.
    ///
    /// # Errors
    /// `Configuration` if any slice length differs from the channel count.
    pub fn with_statistics(
        self,
        gamma: &[f32],
        beta: &[f32],
        mean: &[f32],
        var: &[f32],
    ) -> Result<Self> {
        self.gamma.load(gamma)?;
        self.beta.load(beta)?;
        self.running_mean.load(mean)?;
        self.running_var.load(var)?;
        Ok(self)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.value.borrow().data.clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.value.borrow().data.clone()
    }

    fn spatial(&self, shape: &[usize]) -> Result<usize> {
        match shape.split_first() {
            Some((&c, rest)) if c == self.channels => checked_volume(rest, 1).ok_or_else(|| {
                LayerwiseError::config(format!("{}: shape {shape:?} is too large", self.name))
            }),
            _ => {
                let mut expected = shape.to_vec();
                match expected.first_mut() {
                    Some(first) => *first = self.channels,
                    None => expected.push(self.channels),
                }
                Err(LayerwiseError::shape(&self.name, &expected, shape))
            }
        }
    }

    fn normalize(&self, x: &Tensor, mode: Mode) -> Result<Normalized> {
        let spatial = self.spatial(&x.shape)?;
        let (c_n, len) = (self.channels, x.len());
        let m = (x.batch_count * spatial) as f32;

        let (mean, var) = match mode {
            Mode::Train => {
                let mut mean = vec![0.0f32; c_n];
                let mut var = vec![0.0f32; c_n];
                for (c, mu) in mean.iter_mut().enumerate() {
                    for b in 0..x.batch_count {
                        let base = b * len + c * spatial;
                        *mu += x.data[base..base + spatial].iter().sum::<f32>();
                    }
                    *mu /= m;
                }
                for (c, v) in var.iter_mut().enumerate() {
                    for b in 0..x.batch_count {
                        let base = b * len + c * spatial;
                        *v += x.data[base..base + spatial]
                            .iter()
                            .map(|xi| (xi - mean[c]).powi(2))
                            .sum::<f32>();
                    }
                    *v = *v / m + self.eps;
                }
                (mean, var)
            }
            Mode::Inference => {
                let mean = self.running_mean();
                let var = self.running_var().iter().map(|v| v + self.eps).collect();
                (mean, var)
            }
        };

        let std: Vec<f32> = var.iter().map(|v| v.sqrt()).collect();
        let gamma = self.gamma.value.borrow();
        let beta = self.beta.value.borrow();

        let mut xhat = vec![0.0; x.data.len()];
        let mut y = vec![0.0; x.data.len()];
        for b in 0..x.batch_count {
            for c in 0..c_n {
                let base = b * len + c * spatial;
                for i in base..base + spatial {
                    xhat[i] = (x.data[i] - mean[c]) / std[c];
                    y[i] = gamma.data[c] * xhat[i] + beta.data[c];
                }
            }
        }

        Ok(Normalized {
            y: Tensor::from_parts(y, &x.shape, x.batch_count),
            cache: NormCache {
                xhat,
                std,
                mode,
                shape: x.shape.clone(),
                batch_count: x.batch_count,
            },
            batch_stats: (mode == Mode::Train).then_some((mean, var)),
        })
    }

    fn update_running_statistics(&mut self, mean: &[f32], var: &[f32], m: usize) {
        // unbiased estimation
        let adjust = m as f32 / (m as f32 - 1.0).max(1.0);
        let decay = self.decay;
        let mut avg_mean = self.running_mean.value.borrow_mut();
        let mut avg_var = self.running_var.value.borrow_mut();
        for c in 0..self.channels {
            avg_mean.data[c] = avg_mean.data[c] * decay + mean[c] * (1.0 - decay);
            avg_var.data[c] = avg_var.data[c] * decay + var[c] * (1.0 - decay) * adjust;
        }
    }
}

impl Operator for BatchNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        self.spatial(input)?;
        Ok(input.to_vec())
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let Normalized {
            y,
            cache,
            batch_stats,
        } = self.normalize(x, Mode::from_training(self.training))?;
        if let Some((mean, var)) = batch_stats {
            let m = x.batch_count * (x.len() / self.channels);
            self.update_running_statistics(&mean, &var, m);
        }
        self.cache.push(cache);
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let cache = self.cache.pop(&self.name)?;
        check_shape(
            &self.name,
            &[&[cache.batch_count][..], &cache.shape[..]].concat(),
            &gy.full_shape(),
        )?;
        let c_n = self.channels;
        let len = gy.len();
        let spatial = len / c_n;
        let m = (gy.batch_count * spatial) as f32;

        let mut g_gamma = vec![0.0f32; c_n];
        let mut g_beta = vec![0.0f32; c_n];
        for c in 0..c_n {
            for b in 0..gy.batch_count {
                let base = b * len + c * spatial;
                for i in base..base + spatial {
                    g_beta[c] += gy.data[i];
                    g_gamma[c] += gy.data[i] * cache.xhat[i];
                }
            }
        }

        let gamma = self.gamma.value.borrow();
        let mut gx = vec![0.0; gy.data.len()];
        for c in 0..c_n {
            let gs = gamma.data[c] / cache.std[c];
            for b in 0..gy.batch_count {
                let base = b * len + c * spatial;
                for i in base..base + spatial {
                    gx[i] = match cache.mode {
                        Mode::Train => gs * (gy.data[i] - (cache.xhat[i] * g_gamma[c] + g_beta[c]) / m),
                        Mode::Inference => gs * gy.data[i],
                    };
                }
            }
        }

        if cache.mode == Mode::Inference {
            // gradients w.r.t. the stored statistics; nothing consumes them internally
            let mut g_mean = self.running_mean.grad.borrow_mut();
            let mut g_var = self.running_var.grad.borrow_mut();
            for c in 0..c_n {
                let gs = gamma.data[c] / cache.std[c];
                let var = cache.std[c] * cache.std[c];
                g_mean.data[c] += -gs * g_beta[c];
                g_var.data[c] += -0.5 * gamma.data[c] / var * g_gamma[c];
            }
        }

        {
            let mut gg = self.gamma.grad.borrow_mut();
            let mut gb = self.beta.grad.borrow_mut();
            for c in 0..c_n {
                gg.data[c] += g_gamma[c];
                gb.data[c] += g_beta[c];
            }
        }

        Ok(Tensor::from_parts(gx, &cache.shape, cache.batch_count))
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.normalize(x, Mode::Inference)?.y)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.gamma.clone(), self.beta.clone()];
        if self.bind_statistics {
            params.push(self.running_mean.clone());
            params.push(self.running_var.clone());
        }
        params
    }

    fn pending(&self) -> usize {
        self.cache.len()
    }

    fn reset_state(&mut self) {
        self.cache.clear();
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}
