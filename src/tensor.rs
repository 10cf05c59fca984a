use crate::error::{LayerwiseError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::cell::RefCell;
use std::rc::Rc;

/// Reference-counted, interior-mutable tensor.
///
/// Parameters are handed out this way so an external optimizer can hold the
/// value/gradient pair while the owning operator keeps using it.
pub type SharedTensor = Rc<RefCell<Tensor>>;

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_os_rng());
}

/// Reseed the thread-local generator used for initialization and dropout masks.
pub fn manual_seed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

pub(crate) fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// Elements in `batch_count` samples of `shape`, `None` when the count overflows.
pub(crate) fn checked_volume(shape: &[usize], batch_count: usize) -> Option<usize> {
    shape.iter().try_fold(batch_count, |acc, &d| acc.checked_mul(d))
}

// overflow saturates to usize::MAX, which no allocation satisfies
fn saturating_volume(shape: &[usize], batch_count: usize) -> usize {
    checked_volume(shape, batch_count).unwrap_or(usize::MAX)
}

// ===== TENSOR STRUCTURE =====

/// A batch of equally shaped samples plus a parallel gradient buffer.
///
/// Fields:
/// - `data`: flat values, sample-major then row-major within a sample
/// - `grad`: gradient accumulator, same length as `data`
/// - `shape`: per-sample dimensions, e.g. [channels, height, width]
/// - `batch_count`: number of samples stored back to back
///
/// Invariant: `data.len() == grad.len() == batch_count * shape.product()`.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub grad: Vec<f32>,
    pub shape: Vec<usize>,
    pub batch_count: usize,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("batch_count", &self.batch_count)
            .field("len", &self.data.len())
            .finish()
    }
}

// ===== CONSTRUCTORS =====
impl Tensor {
    /// Create a tensor from flat data.
    ///
    /// # Errors
    /// `Configuration` if `data.len()` disagrees with `batch_count * shape.product()`,
    /// if that product overflows, or if `batch_count` is zero.
    pub fn new(data: Vec<f32>, shape: &[usize], batch_count: usize) -> Result<Tensor> {
        if batch_count == 0 {
            return Err(LayerwiseError::config("batch count must be at least 1"));
        }
        let expected = checked_volume(shape, batch_count).ok_or_else(|| {
            LayerwiseError::config(format!(
                "shape {shape:?} x batch {batch_count} overflows the element count"
            ))
        })?;
        if data.len() != expected {
            return Err(LayerwiseError::config(format!(
                "data length {} does not match shape {:?} x batch {} ({} elements)",
                data.len(),
                shape,
                batch_count,
                expected
            )));
        }
        Ok(Self::from_parts(data, shape, batch_count))
    }

    /// Single-sample tensor.
    pub fn from_sample(data: Vec<f32>, shape: &[usize]) -> Result<Tensor> {
        Self::new(data, shape, 1)
    }

    // callers guarantee the length invariant
    pub(crate) fn from_parts(data: Vec<f32>, shape: &[usize], batch_count: usize) -> Tensor {
        debug_assert_eq!(Some(data.len()), checked_volume(shape, batch_count));
        let grad = vec![0.0; data.len()];
        Tensor {
            data,
            grad,
            shape: shape.to_vec(),
            batch_count,
        }
    }

    pub fn zeros(shape: &[usize], batch_count: usize) -> Tensor {
        Self::filled(0.0, shape, batch_count)
    }

    pub fn ones(shape: &[usize], batch_count: usize) -> Tensor {
        Self::filled(1.0, shape, batch_count)
    }

    /// # Panics
    /// When the element count does not fit in memory, like `vec!`. Sizes that
    /// come from outside the program go through [`Tensor::new`] or a layer
    /// constructor, which report `Configuration` instead.
    pub fn filled(value: f32, shape: &[usize], batch_count: usize) -> Tensor {
        let size = saturating_volume(shape, batch_count);
        Self::from_parts(vec![value; size], shape, batch_count)
    }

    /// Uniform values in [0, 1)
    pub fn rand(shape: &[usize], batch_count: usize) -> Tensor {
        let size = saturating_volume(shape, batch_count);
        let data = with_rng(|rng| (0..size).map(|_| rng.random::<f32>()).collect());
        Self::from_parts(data, shape, batch_count)
    }

    /// Standard normal values N(0, 1)
    pub fn randn(shape: &[usize], batch_count: usize) -> Tensor {
        let size = saturating_volume(shape, batch_count);
        let data = with_rng(|rng| {
            (0..size)
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect()
        });
        Self::from_parts(data, shape, batch_count)
    }

    /// He (Kaiming) normal initialization: N(0, 2 / fan_in)
    pub fn he_normal(shape: &[usize], fan_in: usize) -> Tensor {
        let scale = (2.0 / fan_in.max(1) as f32).sqrt();
        let mut t = Self::randn(shape, 1);
        t.data.iter_mut().for_each(|v| *v *= scale);
        t
    }

    pub fn zeros_like(&self) -> Tensor {
        Self::zeros(&self.shape, self.batch_count)
    }

    pub fn shared(self) -> SharedTensor {
        Rc::new(RefCell::new(self))
    }
}

// ===== ACCESSORS =====
impl Tensor {
    /// Elements per sample
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shape with the batch dimension prepended
    pub fn full_shape(&self) -> Vec<usize> {
        let mut s = Vec::with_capacity(self.shape.len() + 1);
        s.push(self.batch_count);
        s.extend_from_slice(&self.shape);
        s
    }

    pub fn sample(&self, b: usize) -> &[f32] {
        let n = self.len();
        &self.data[b * n..(b + 1) * n]
    }

    pub fn sample_mut(&mut self, b: usize) -> &mut [f32] {
        let n = self.len();
        &mut self.data[b * n..(b + 1) * n]
    }

    /// Same data viewed with another per-sample shape.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        if checked_volume(shape, 1) != Some(self.len()) {
            return Err(LayerwiseError::shape("reshape", &self.shape, shape));
        }
        let mut out = self.clone();
        out.shape = shape.to_vec();
        Ok(out)
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Inner product of the data buffers of two equally shaped tensors.
    pub fn dot(&self, other: &Tensor) -> Result<f32> {
        self.check_same_layout("dot", other)?;
        Ok(self.data.iter().zip(&other.data).map(|(a, b)| a * b).sum())
    }
}

// ===== GRADIENT BUFFER =====
impl Tensor {
    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Add `contribution.data` into this tensor's gradient buffer.
    ///
    /// Used when one tensor feeds several consumers and each backward
    /// produces a partial gradient for it.
    pub fn accumulate_grad(&mut self, contribution: &Tensor) -> Result<()> {
        self.check_same_layout("accumulate_grad", contribution)?;
        for (g, c) in self.grad.iter_mut().zip(&contribution.data) {
            *g += *c;
        }
        Ok(())
    }

    /// Gradient buffer as a standalone tensor (its `data` is the gradient).
    pub fn grad_tensor(&self) -> Tensor {
        Self::from_parts(self.grad.clone(), &self.shape, self.batch_count)
    }

    fn check_same_layout(&self, op: &str, other: &Tensor) -> Result<()> {
        if self.shape != other.shape || self.batch_count != other.batch_count {
            return Err(LayerwiseError::shape(
                op,
                &self.full_shape(),
                &other.full_shape(),
            ));
        }
        Ok(())
    }
}
