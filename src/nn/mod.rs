use crate::error::{LayerwiseError, Result};
use crate::parameter::Parameter;
use crate::tensor::{Tensor, checked_volume};

pub mod layers;

pub use layers::{
    BatchNorm, Conv2d, ConvTranspose2d, Dropout, Flatten, Linear, MaskScope, MaxPool2d, Pipeline,
    PipelineBuilder, ReLU,
};

/// Whether a computation may use and update training-only state.
///
/// Passed explicitly into the numeric kernels instead of being read from a
/// mutable flag, so `predict` can run inference semantics on an operator that
/// is otherwise in training mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Inference,
}

impl Mode {
    pub const fn from_training(training: bool) -> Self {
        if training { Mode::Train } else { Mode::Inference }
    }
}

/// Stateful tensor operator with a hand-derived backward pass.
///
/// Tensors flowing backward carry the gradient in their `data` buffer.
pub trait Operator {
    /// Instance label, used in parameter labels and error messages.
    fn name(&self) -> &str;

    /// Per-sample output shape for a per-sample input shape.
    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>>;

    /// Training-path transformation. Stateful operators push whatever
    /// `backward` needs onto their cache stack.
    fn forward(&mut self, x: &Tensor) -> Result<Tensor>;

    /// Consume the most recent cache entry, accumulate parameter gradients
    /// and return the gradient with respect to that forward call's input.
    ///
    /// # Errors
    /// `CacheUnderflow` when no forward call is pending.
    fn backward(&mut self, gy: &Tensor) -> Result<Tensor>;

    /// Inference-path transformation. Never samples masks, updates running
    /// statistics or touches the cache.
    fn predict(&self, x: &Tensor) -> Result<Tensor>;

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }

    /// Forward calls not yet matched by a backward call.
    fn pending(&self) -> usize {
        0
    }

    /// Drop every pending cache entry.
    fn reset_state(&mut self) {}

    /// Switch between training and inference mode.
    /// Only meaningful for `BatchNorm` and `Dropout`.
    fn train(&mut self, _mode: bool) {}

    fn eval(&mut self) {
        self.train(false);
    }
}

// ===== SHAPE HELPERS =====

pub(crate) fn check_shape(operator: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(LayerwiseError::shape(operator, expected, actual));
    }
    Ok(())
}

/// Element count of a parameter shape requested by a constructor.
pub(crate) fn parameter_volume(operator: &str, shape: &[usize]) -> Result<usize> {
    checked_volume(shape, 1).ok_or_else(|| {
        LayerwiseError::config(format!("{operator}: parameter shape {shape:?} is too large"))
    })
}

/// Split a per-sample `[C, H, W]` shape.
pub(crate) fn chw(operator: &str, shape: &[usize]) -> Result<(usize, usize, usize)> {
    match *shape {
        [c, h, w] => Ok((c, h, w)),
        _ => Err(LayerwiseError::ShapeMismatch {
            operator: operator.to_string(),
            expected: vec![0, 0, 0],
            actual: shape.to_vec(),
        }),
    }
}

fn too_large(what: &str) -> LayerwiseError {
    LayerwiseError::config(format!("{what} overflows the supported size range"))
}

/// `input + 2*pad`, checked.
fn padded(input: usize, pad: usize) -> Result<usize> {
    pad.checked_mul(2)
        .and_then(|p| input.checked_add(p))
        .ok_or_else(|| too_large("padded input"))
}

/// floor((input + 2*pad - kernel) / stride) + 1
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    if kernel == 0 || stride == 0 {
        return Err(LayerwiseError::config("kernel and stride must be positive"));
    }
    let padded = padded(input, pad)?;
    if padded < kernel {
        return Err(LayerwiseError::config(format!(
            "kernel {kernel} larger than padded input {padded}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// (input - 1) * stride + kernel - 2*trim
pub fn deconv_output_size(input: usize, kernel: usize, stride: usize, trim: usize) -> Result<usize> {
    if kernel == 0 || stride == 0 || input == 0 {
        return Err(LayerwiseError::config(
            "kernel, stride and input size must be positive",
        ));
    }
    let full = (input - 1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(kernel))
        .ok_or_else(|| too_large("transposed convolution output"))?;
    if full <= trim.saturating_mul(2) {
        return Err(LayerwiseError::config(format!(
            "trim {trim} removes the whole {full}-wide output"
        )));
    }
    Ok(full - 2 * trim)
}

/// floor((input - kernel + 2*pad [+ stride - 1]) / stride) + 1
///
/// With `cover_all` the trailing partial window is kept.
pub fn pool_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    cover_all: bool,
) -> Result<usize> {
    if kernel == 0 || stride == 0 {
        return Err(LayerwiseError::config("kernel and stride must be positive"));
    }
    let mut span = padded(input, pad)?;
    if cover_all {
        span = span
            .checked_add(stride - 1)
            .ok_or_else(|| too_large("pooling span"))?;
    }
    if span < kernel {
        return Err(LayerwiseError::config(format!(
            "pooling window {kernel} does not fit input {input} with pad {pad}"
        )));
    }
    Ok((span - kernel) / stride + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_output_size() {
        assert_eq!(conv_output_size(32, 3, 1, 1).unwrap(), 32);
        assert_eq!(conv_output_size(7, 3, 2, 1).unwrap(), 4);
        assert_eq!(conv_output_size(8, 3, 2, 0).unwrap(), 3);
        assert!(conv_output_size(2, 5, 1, 1).is_err());
    }

    #[test]
    fn test_deconv_output_size() {
        assert_eq!(deconv_output_size(4, 4, 2, 1).unwrap(), 8);
        assert_eq!(deconv_output_size(3, 3, 1, 0).unwrap(), 5);
        assert!(deconv_output_size(1, 2, 1, 1).is_err());
    }

    #[test]
    fn test_pool_output_size_cover_all() {
        // (7 - 3 + 2 + 1) / 2 + 1
        assert_eq!(pool_output_size(7, 3, 2, 1, true).unwrap(), 4);
        // (7 - 3 + 2) / 2 + 1
        assert_eq!(pool_output_size(7, 3, 2, 1, false).unwrap(), 4);
        // partial trailing window kept only with cover_all
        assert_eq!(pool_output_size(7, 2, 2, 0, true).unwrap(), 4);
        assert_eq!(pool_output_size(7, 2, 2, 0, false).unwrap(), 3);
    }

    #[test]
    fn test_pool_output_size_rejects_oversized_window() {
        assert!(pool_output_size(2, 5, 1, 0, false).is_err());
    }

    #[test]
    fn test_output_sizes_reject_overflow() {
        assert!(conv_output_size(4, 3, 1, usize::MAX / 2 + 1).is_err());
        assert!(deconv_output_size(usize::MAX, 3, 2, 0).is_err());
        assert!(pool_output_size(usize::MAX - 1, 2, 4, 0, true).is_err());
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(Mode::from_training(true), Mode::Train);
        assert_eq!(Mode::from_training(false), Mode::Inference);
    }
}
