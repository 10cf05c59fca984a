use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Operator, check_shape, chw, conv_output_size, parameter_volume};
use crate::parameter::Parameter;
use crate::tensor::Tensor;

/// 2D convolution over per-sample `[C, H, W]` tensors.
///
/// Weight layout is `[out_channels, in_channels, kernel_h, kernel_w]`.
/// Output size per axis: floor((in + 2*pad - kernel) / stride) + 1
pub struct Conv2d {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    weight: Parameter,
    bias: Option<Parameter>,
    inputs: CacheStack<Tensor>,
}

impl Conv2d {
    /// Square-kernel constructor
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        use_bias: bool,
    ) -> Result<Self> {
        Self::with_params(
            in_ch,
            out_ch,
            (kernel, kernel),
            (stride, stride),
            (padding, padding),
            use_bias,
        )
    }

    /// Arbitrary kernel/stride/padding constructor, He-initialized weights
    pub fn with_params(
        in_ch: usize,
        out_ch: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        use_bias: bool,
    ) -> Result<Self> {
        if in_ch == 0 || out_ch == 0 {
            return Err(LayerwiseError::config("Conv2d channel counts must be positive"));
        }
        if kernel.0 == 0 || kernel.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(LayerwiseError::config(
                "Conv2d kernel and stride must be positive",
            ));
        }
        let name = "Conv2d".to_string();
        let w_shape = [out_ch, in_ch, kernel.0, kernel.1];
        let fan_in = parameter_volume("Conv2d", &w_shape)? / out_ch;
        let w = Tensor::he_normal(&w_shape, fan_in);
        let bias = use_bias.then(|| Parameter::new(Tensor::zeros(&[out_ch], 1), format!("{name} b")));
        Ok(Conv2d {
            weight: Parameter::new(w, format!("{name} W")),
            bias,
            name,
            in_channels: in_ch,
            out_channels: out_ch,
            kernel,
            stride,
            padding,
            inputs: CacheStack::new(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.weight.label = format!("{} W", self.name);
        if let Some(b) = self.bias.as_mut() {
            b.label = format!("{} b", self.name);
        }
        self
    }

    /// Replace the initial weights (and bias, when present).
    ///
    /// # Errors
    /// `Configuration` if a slice length disagrees with the parameter shape,
    /// or if a bias is given to a bias-free convolution.
    pub fn with_weights(self, weight: &[f32], bias: Option<&[f32]>) -> Result<Self> {
        self.weight.load(weight)?;
        match (bias, &self.bias) {
            (Some(data), Some(b)) => b.load(data)?,
            (Some(_), None) => {
                return Err(LayerwiseError::config(format!(
                    "{}: bias given but the layer has no bias",
                    self.name
                )));
            }
            (None, _) => {}
        }
        Ok(self)
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn check_input(&self, x: &Tensor) -> Result<(usize, usize, usize, usize)> {
        let (c, h, w) = chw(&self.name, &x.shape)?;
        if c != self.in_channels {
            return Err(LayerwiseError::shape(
                &self.name,
                &[self.in_channels, h, w],
                &x.shape,
            ));
        }
        let oh = conv_output_size(h, self.kernel.0, self.stride.0, self.padding.0)?;
        let ow = conv_output_size(w, self.kernel.1, self.stride.1, self.padding.1)?;
        Ok((h, w, oh, ow))
    }

    fn convolve(&self, x: &Tensor) -> Result<Tensor> {
        let (h, w, oh, ow) = self.check_input(x)?;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = (self.padding.0 as isize, self.padding.1 as isize);
        let (ic_n, oc_n) = (self.in_channels, self.out_channels);

        let weight = self.weight.value.borrow();
        let bias = self.bias.as_ref().map(|b| b.value.borrow());
        let mut out = vec![0.0; x.batch_count * oc_n * oh * ow];

        for b in 0..x.batch_count {
            let input = x.sample(b);
            for oc in 0..oc_n {
                let out_base = (b * oc_n + oc) * oh * ow;
                let bias_val = bias.as_ref().map_or(0.0, |bv| bv.data[oc]);
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = bias_val;
                        for ic in 0..ic_n {
                            let w_base = (oc * ic_n + ic) * kh * kw;
                            for ky in 0..kh {
                                let iy = (oy * sh) as isize + ky as isize - ph;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                let row = (ic * h + iy as usize) * w;
                                for kx in 0..kw {
                                    let ix = (ox * sw) as isize + kx as isize - pw;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    acc += input[row + ix as usize] * weight.data[w_base + ky * kw + kx];
                                }
                            }
                        }
                        out[out_base + oy * ow + ox] = acc;
                    }
                }
            }
        }

        Ok(Tensor::from_parts(out, &[oc_n, oh, ow], x.batch_count))
    }
}

impl Operator for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let (c, h, w) = chw(&self.name, input)?;
        check_shape(&self.name, &[self.in_channels, h, w], &[c, h, w])?;
        Ok(vec![
            self.out_channels,
            conv_output_size(h, self.kernel.0, self.stride.0, self.padding.0)?,
            conv_output_size(w, self.kernel.1, self.stride.1, self.padding.1)?,
        ])
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.convolve(x)?;
        self.inputs.push(x.clone());
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let x = self.inputs.pop(&self.name)?;
        let (h, w, oh, ow) = self.check_input(&x)?;
        check_shape(
            &self.name,
            &[x.batch_count, self.out_channels, oh, ow],
            &gy.full_shape(),
        )?;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = (self.padding.0 as isize, self.padding.1 as isize);
        let (ic_n, oc_n) = (self.in_channels, self.out_channels);

        let weight = self.weight.value.borrow();
        let mut g_weight = self.weight.grad.borrow_mut();
        let mut g_bias = self.bias.as_ref().map(|b| b.grad.borrow_mut());
        let mut gx = vec![0.0; x.data.len()];

        for b in 0..x.batch_count {
            let input = x.sample(b);
            let in_base = b * x.len();
            for oc in 0..oc_n {
                let gy_base = (b * oc_n + oc) * oh * ow;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let g = gy.data[gy_base + oy * ow + ox];
                        if let Some(gb) = g_bias.as_mut() {
                            gb.data[oc] += g;
                        }
                        for ic in 0..ic_n {
                            let w_base = (oc * ic_n + ic) * kh * kw;
                            for ky in 0..kh {
                                let iy = (oy * sh) as isize + ky as isize - ph;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                let row = (ic * h + iy as usize) * w;
                                for kx in 0..kw {
                                    let ix = (ox * sw) as isize + kx as isize - pw;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    let w_idx = w_base + ky * kw + kx;
                                    let in_idx = row + ix as usize;
                                    g_weight.data[w_idx] += input[in_idx] * g;
                                    gx[in_base + in_idx] += weight.data[w_idx] * g;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(Tensor::from_parts(gx, &x.shape, x.batch_count))
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        self.convolve(x)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut p = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            p.push(b.clone());
        }
        p
    }

    fn pending(&self) -> usize {
        self.inputs.len()
    }

    fn reset_state(&mut self) {
        self.inputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients_simple, check_parameter_gradients_simple};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_conv2d_forward_shape() {
        // (1, 3, 32, 32), 16 filters, 3x3, stride 1, pad 1 -> (1, 16, 32, 32)
        let conv = Conv2d::new(3, 16, 3, 1, 1, true).unwrap();
        let x = Tensor::randn(&[3, 32, 32], 1);
        let y = conv.predict(&x).unwrap();
        assert_eq!(y.full_shape(), vec![1, 16, 32, 32]);
    }

    #[test]
    fn test_conv2d_forward_values() {
        // 1x1 input channel, 2x2 ones kernel over a 3x3 ramp
        let conv = Conv2d::new(1, 1, 2, 1, 0, true)
            .unwrap()
            .with_weights(&[1.0; 4], Some(&[0.5]))
            .unwrap();
        let x = Tensor::from_sample((0..9).map(|i| i as f32).collect(), &[1, 3, 3]).unwrap();
        let y = conv.predict(&x).unwrap();
        assert_eq!(y.shape, vec![1, 2, 2]);
        assert_eq!(y.data, vec![8.5, 12.5, 20.5, 24.5]);
    }

    #[test]
    fn test_conv2d_padding_reads_zeros() {
        let conv = Conv2d::new(1, 1, 3, 1, 1, false)
            .unwrap()
            .with_weights(&[1.0; 9], None)
            .unwrap();
        let x = Tensor::ones(&[1, 2, 2], 1);
        let y = conv.predict(&x).unwrap();
        // every 3x3 window around a 2x2 image sees all four ones
        assert_eq!(y.data, vec![4.0; 4]);
    }

    #[test]
    fn test_conv2d_rejects_channel_mismatch() {
        let conv = Conv2d::new(3, 4, 3, 1, 1, true).unwrap();
        let x = Tensor::zeros(&[2, 5, 5], 1);
        assert!(matches!(
            conv.predict(&x),
            Err(LayerwiseError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv2d_rejects_zero_kernel() {
        assert!(Conv2d::new(3, 16, 0, 1, 1, true).is_err());
    }

    #[test]
    fn test_conv2d_rejects_overflowing_weight_shape() {
        assert!(matches!(
            Conv2d::new(1 << 20, 1 << 20, 1 << 16, 1, 0, false),
            Err(LayerwiseError::Configuration(_))
        ));
    }

    #[test]
    fn test_conv2d_with_weights_length_mismatch() {
        let conv = Conv2d::new(2, 2, 3, 1, 0, true).unwrap();
        assert!(matches!(
            conv.with_weights(&[0.0; 5], None),
            Err(LayerwiseError::Configuration(_))
        ));
    }

    #[test]
    fn test_conv2d_bias_gradient_is_spatial_sum() {
        let mut conv = Conv2d::new(1, 2, 3, 1, 1, true).unwrap();
        let x = Tensor::randn(&[1, 4, 4], 2);
        let y = conv.forward(&x).unwrap();
        let gy = Tensor::ones(&y.shape, y.batch_count);
        conv.backward(&gy).unwrap();
        let gb = conv.bias().unwrap().grad.borrow().data.clone();
        assert_abs_diff_eq!(gb[0], 32.0, epsilon = 1e-5);
        assert_abs_diff_eq!(gb[1], 32.0, epsilon = 1e-5);
    }

    #[test]
    fn test_conv2d_input_gradient() {
        let mut conv = Conv2d::new(2, 3, 3, 2, 1, true).unwrap();
        let x = Tensor::randn(&[2, 5, 5], 2);
        let passed = check_gradients_simple(&mut conv, &x);
        assert!(passed, "Conv2d input gradient check failed");
    }

    #[test]
    fn test_conv2d_parameter_gradients() {
        let mut conv = Conv2d::with_params(2, 2, (3, 2), (1, 2), (1, 0), true).unwrap();
        let x = Tensor::randn(&[2, 4, 5], 2);
        let passed = check_parameter_gradients_simple(&mut conv, &x);
        assert!(passed, "Conv2d parameter gradient check failed");
    }

    #[test]
    fn test_conv2d_backward_without_forward() {
        let mut conv = Conv2d::new(1, 1, 1, 1, 0, false).unwrap();
        let gy = Tensor::zeros(&[1, 2, 2], 1);
        assert!(matches!(
            conv.backward(&gy),
            Err(LayerwiseError::CacheUnderflow { .. })
        ));
    }
}
