//! Finite-difference checks for hand-derived operator gradients.
//!
//! The scalar loss is `<op(x), r>` for a fixed random `r`, so the analytic
//! input gradient is `backward(r)` and the numerical one is the central
//! difference `(L(x + eps) - L(x - eps)) / (2 * eps)`.
//!
//! Numerical evaluations go through `forward` followed by `reset_state`, so
//! training-mode numerics (batch statistics) are what gets differentiated.

use crate::error::Result;
use crate::nn::Operator;
use crate::tensor::Tensor;

fn loss<O: Operator + ?Sized>(op: &mut O, x: &Tensor, r: &Tensor) -> Result<f64> {
    let y = op.forward(x)?;
    op.reset_state();
    Ok(y
        .data
        .iter()
        .zip(&r.data)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum())
}

fn compare(analytical: &[f32], numerical: &[f32], tolerance: f32) -> (f32, f32, bool) {
    let mut max_error: f32 = 0.0;
    let mut total_error: f32 = 0.0;

    for (i, (&a, &n)) in analytical.iter().zip(numerical).enumerate() {
        let scale = a.abs().max(n.abs()).max(1.0);
        let error = (a - n).abs() / scale;
        max_error = max_error.max(error);
        total_error += error;

        if error > tolerance {
            log::warn!(
                "Gradient mismatch at index {}: analytical={:.6e}, numerical={:.6e}, error={:.6e}",
                i,
                a,
                n,
                error
            );
        }
    }

    let mean_error = total_error / analytical.len().max(1) as f32;
    (max_error, mean_error, max_error < tolerance)
}

/// Check `op`'s input gradient at `x`.
///
/// # Returns
/// (max_error, mean_error, passed), errors measured relative to max(1, |grad|)
pub fn check_gradients<O: Operator + ?Sized>(
    op: &mut O,
    x: &Tensor,
    epsilon: f32,
    tolerance: f32,
) -> Result<(f32, f32, bool)> {
    let y = op.forward(x)?;
    let r = Tensor::randn(&y.shape, y.batch_count);
    let analytical = op.backward(&r)?.data;

    let mut numerical = vec![0.0; x.data.len()];
    let mut probe = x.clone();
    for i in 0..x.data.len() {
        let original = probe.data[i];
        probe.data[i] = original + epsilon;
        let plus = loss(op, &probe, &r)?;
        probe.data[i] = original - epsilon;
        let minus = loss(op, &probe, &r)?;
        probe.data[i] = original;
        numerical[i] = ((plus - minus) / (2.0 * f64::from(epsilon))) as f32;
    }

    Ok(compare(&analytical, &numerical, tolerance))
}

/// Check the gradients `op` accumulates into its own parameters at `x`.
pub fn check_parameter_gradients<O: Operator + ?Sized>(
    op: &mut O,
    x: &Tensor,
    epsilon: f32,
    tolerance: f32,
) -> Result<(f32, f32, bool)> {
    op.zero_grad();
    let y = op.forward(x)?;
    let r = Tensor::randn(&y.shape, y.batch_count);
    op.backward(&r)?;

    let mut analytical = Vec::new();
    let mut numerical = Vec::new();
    for param in op.parameters() {
        analytical.extend_from_slice(&param.grad.borrow().data);
        let len = param.value.borrow().data.len();
        for i in 0..len {
            let original = param.value.borrow().data[i];
            param.value.borrow_mut().data[i] = original + epsilon;
            let plus = loss(op, x, &r)?;
            param.value.borrow_mut().data[i] = original - epsilon;
            let minus = loss(op, x, &r)?;
            param.value.borrow_mut().data[i] = original;
            numerical.push(((plus - minus) / (2.0 * f64::from(epsilon))) as f32);
        }
    }

    Ok(compare(&analytical, &numerical, tolerance))
}

/// Input-gradient check with epsilon=1e-2 and tolerance=1e-2.
pub fn check_gradients_simple<O: Operator + ?Sized>(op: &mut O, x: &Tensor) -> bool {
    report(check_gradients(op, x, 1e-2, 1e-2))
}

/// Parameter-gradient check with epsilon=1e-2 and tolerance=1e-2.
pub fn check_parameter_gradients_simple<O: Operator + ?Sized>(op: &mut O, x: &Tensor) -> bool {
    report(check_parameter_gradients(op, x, 1e-2, 1e-2))
}

fn report(outcome: Result<(f32, f32, bool)>) -> bool {
    match outcome {
        Ok((max_err, mean_err, passed)) => {
            if !passed {
                log::warn!(
                    "Gradient check FAILED: max_error={:.6e}, mean_error={:.6e}",
                    max_err,
                    mean_err
                );
            }
            passed
        }
        Err(e) => {
            log::warn!("Gradient check aborted: {e}");
            false
        }
    }
}
