use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Operator, check_shape, chw, deconv_output_size, parameter_volume};
use crate::parameter::Parameter;
use crate::tensor::Tensor;

/// Transposed 2D convolution (also called deconvolution)
///
/// Every input position scatters `input * weight` over a kernel-sized patch
/// of the output; `trim` crops the naive output symmetrically. This is the
/// adjoint of `Conv2d` with the same kernel, stride and padding.
///
/// Weight layout: `[out_channels, in_channels, kernel_h, kernel_w]`
/// Output size: `H_out` = (`H_in` - 1) * stride + kernel - 2*trim
pub struct ConvTranspose2d {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    trim: (usize, usize),
    weight: Parameter,
    bias: Option<Parameter>,
    inputs: CacheStack<Tensor>,
}

impl ConvTranspose2d {
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        stride: usize,
        trim: usize,
        use_bias: bool,
    ) -> Result<Self> {
        Self::with_params(
            in_ch,
            out_ch,
            (kernel, kernel),
            (stride, stride),
            (trim, trim),
            use_bias,
        )
    }

    pub fn with_params(
        in_ch: usize,
        out_ch: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        trim: (usize, usize),
        use_bias: bool,
    ) -> Result<Self> {
        if in_ch == 0 || out_ch == 0 {
            return Err(LayerwiseError::config(
                "ConvTranspose2d channel counts must be positive",
            ));
        }
        if kernel.0 == 0 || kernel.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(LayerwiseError::config(
                "ConvTranspose2d kernel and stride must be positive",
            ));
        }
        let name = "Deconv2D".to_string();
        let w_shape = [out_ch, in_ch, kernel.0, kernel.1];
        let fan_in = parameter_volume("ConvTranspose2d", &w_shape)? / out_ch;
        let w = Tensor::he_normal(&w_shape, fan_in);
        let bias = use_bias.then(|| Parameter::new(Tensor::zeros(&[out_ch], 1), format!("{name} b")));
        Ok(ConvTranspose2d {
            weight: Parameter::new(w, format!("{name} W")),
            bias,
            name,
            in_channels: in_ch,
            out_channels: out_ch,
            kernel,
            stride,
            trim,
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
        let oh = deconv_output_size(h, self.kernel.0, self.stride.0, self.trim.0)?;
        let ow = deconv_output_size(w, self.kernel.1, self.stride.1, self.trim.1)?;
        Ok((h, w, oh, ow))
    }

    fn scatter(&self, x: &Tensor) -> Result<Tensor> {
        let (h, w, oh, ow) = self.check_input(x)?;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (th, tw) = (self.trim.0 as isize, self.trim.1 as isize);
        let (ic_n, oc_n) = (self.in_channels, self.out_channels);

        let weight = self.weight.value.borrow();
        let mut out = vec![0.0; x.batch_count * oc_n * oh * ow];

        for b in 0..x.batch_count {
            let input = x.sample(b);
            for oc in 0..oc_n {
                let out_base = (b * oc_n + oc) * oh * ow;
                for ic in 0..ic_n {
                    let w_base = (oc * ic_n + ic) * kh * kw;
                    for iy in 0..h {
                        for ix in 0..w {
                            let v = input[(ic * h + iy) * w + ix];
                            for ky in 0..kh {
                                let oy = (iy * sh + ky) as isize - th;
                                if oy < 0 || oy >= oh as isize {
                                    continue;
                                }
                                for kx in 0..kw {
                                    let ox = (ix * sw + kx) as isize - tw;
                                    if ox < 0 || ox >= ow as isize {
                                        continue;
                                    }
                                    out[out_base + oy as usize * ow + ox as usize] +=
                                        v * weight.data[w_base + ky * kw + kx];
                                }
                            }
                        }
                    }
                }

                if let Some(ref bias) = self.bias {
                    let bv = bias.value.borrow().data[oc];
                    out[out_base..out_base + oh * ow]
                        .iter_mut()
                        .for_each(|o| *o += bv);
                }
            }
        }

        Ok(Tensor::from_parts(out, &[oc_n, oh, ow], x.batch_count))
    }
}

impl Operator for ConvTranspose2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let (c, h, w) = chw(&self.name, input)?;
        check_shape(&self.name, &[self.in_channels, h, w], &[c, h, w])?;
        Ok(vec![
            self.out_channels,
            deconv_output_size(h, self.kernel.0, self.stride.0, self.trim.0)?,
            deconv_output_size(w, self.kernel.1, self.stride.1, self.trim.1)?,
        ])
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.scatter(x)?;
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
        let (th, tw) = (self.trim.0 as isize, self.trim.1 as isize);
        let (ic_n, oc_n) = (self.in_channels, self.out_channels);

        let weight = self.weight.value.borrow();
        let mut g_weight = self.weight.grad.borrow_mut();
        let mut gx = vec![0.0; x.data.len()];

        for b in 0..x.batch_count {
            let input = x.sample(b);
            let in_base = b * x.len();
            for oc in 0..oc_n {
                let gy_base = (b * oc_n + oc) * oh * ow;
                for ic in 0..ic_n {
                    let w_base = (oc * ic_n + ic) * kh * kw;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let w_idx = w_base + ky * kw + kx;
                            for iy in 0..h {
                                let gyy = (iy * sh + ky) as isize - th;
                                if gyy < 0 || gyy >= oh as isize {
                                    continue;
                                }
                                for ix in 0..w {
                                    let gyx = (ix * sw + kx) as isize - tw;
                                    if gyx < 0 || gyx >= ow as isize {
                                        continue;
                                    }
                                    let g = gy.data[gy_base + gyy as usize * ow + gyx as usize];
                                    let in_idx = (ic * h + iy) * w + ix;
                                    g_weight.data[w_idx] += input[in_idx] * g;
                                    gx[in_base + in_idx] += weight.data[w_idx] * g;
                                }
                            }
                        }
                    }
                }

                if let Some(ref bias) = self.bias {
                    let channel_sum: f32 = gy.data[gy_base..gy_base + oh * ow].iter().sum();
                    bias.grad.borrow_mut().data[oc] += channel_sum;
                }
            }
        }

        Ok(Tensor::from_parts(gx, &x.shape, x.batch_count))
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        self.scatter(x)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
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
    fn test_conv_transpose_output_shape() {
        // (4 - 1) * 2 + 4 - 2 * 1 = 8
        let deconv = ConvTranspose2d::new(16, 8, 4, 2, 1, true).unwrap();
        let x = Tensor::randn(&[16, 4, 4], 2);
        let y = deconv.predict(&x).unwrap();
        assert_eq!(y.full_shape(), vec![2, 8, 8, 8]);
        assert_eq!(deconv.output_shape(&[16, 4, 4]).unwrap(), vec![8, 8, 8]);
    }

    #[test]
    fn test_conv_transpose_scatter_values() {
        // single input pixel, 2x2 kernel, stride 1: output is the kernel scaled
        let deconv = ConvTranspose2d::new(1, 1, 2, 1, 0, true)
            .unwrap()
            .with_weights(&[1.0, 2.0, 3.0, 4.0], Some(&[0.5]))
            .unwrap();
        let x = Tensor::from_sample(vec![2.0], &[1, 1, 1]).unwrap();
        let y = deconv.predict(&x).unwrap();
        assert_eq!(y.data, vec![2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn test_conv_transpose_overlap_accumulates() {
        // 1x2 input of ones, kernel 1x2 of ones, stride 1 -> [1, 2, 1]
        let deconv = ConvTranspose2d::with_params(1, 1, (1, 2), (1, 1), (0, 0), false)
            .unwrap()
            .with_weights(&[1.0, 1.0], None)
            .unwrap();
        let x = Tensor::ones(&[1, 1, 2], 1);
        let y = deconv.predict(&x).unwrap();
        assert_eq!(y.data, vec![1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_conv_transpose_bias_gradient() {
        let mut deconv = ConvTranspose2d::new(2, 3, 3, 2, 1, true).unwrap();
        let x = Tensor::randn(&[2, 3, 3], 2);
        let y = deconv.forward(&x).unwrap();
        let gy = Tensor::ones(&y.shape, y.batch_count);
        deconv.backward(&gy).unwrap();
        let spatial = (y.shape[1] * y.shape[2] * 2) as f32;
        for g in &deconv.bias().unwrap().grad.borrow().data {
            assert_abs_diff_eq!(*g, spatial, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_conv_transpose_input_gradient() {
        let mut deconv = ConvTranspose2d::new(2, 2, 3, 2, 1, true).unwrap();
        let x = Tensor::randn(&[2, 3, 3], 2);
        assert!(check_gradients_simple(&mut deconv, &x));
    }

    #[test]
    fn test_conv_transpose_parameter_gradients() {
        let mut deconv = ConvTranspose2d::with_params(2, 2, (2, 3), (2, 1), (0, 1), true).unwrap();
        let x = Tensor::randn(&[2, 3, 3], 2);
        assert!(check_parameter_gradients_simple(&mut deconv, &x));
    }

    #[test]
    fn test_conv_transpose_rejects_total_trim() {
        let deconv = ConvTranspose2d::new(1, 1, 2, 1, 1, false).unwrap();
        let x = Tensor::zeros(&[1, 1, 1], 1);
        assert!(deconv.predict(&x).is_err());
    }
}
