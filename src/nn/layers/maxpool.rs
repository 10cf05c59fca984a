use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Operator, check_shape, chw, pool_output_size};
use crate::tensor::Tensor;

/// 2D max pooling layer
///
/// Accepts per-sample `[C, H, W]` tensors and reduces each window to its
/// maximum, remembering which flat input position produced it. Padding is
/// never read: windows are clipped to the input, and a window clipped to
/// nothing yields `-inf` with no recorded index.
pub struct MaxPool2d {
    name: String,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    cover_all: bool,
    argmax: CacheStack<Argmax>,
}

/// Flat input positions selected by one forward call.
#[derive(Debug, Clone)]
struct Argmax {
    indices: Vec<Option<usize>>,
    input_shape: Vec<usize>,
    batch_count: usize,
}

impl MaxPool2d {
    /// Square-kernel constructor, partial border windows kept
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Result<Self> {
        Self::with_params((kernel, kernel), (stride, stride), (padding, padding), true)
    }

    /// Arbitrary kernel/stride/padding constructor
    pub fn with_params(
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        cover_all: bool,
    ) -> Result<Self> {
        if kernel.0 == 0 || kernel.1 == 0 {
            return Err(LayerwiseError::config("Kernel size must be positive"));
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(LayerwiseError::config("Stride must be positive"));
        }
        Ok(Self {
            name: "MaxPooling2D".to_string(),
            kernel,
            stride,
            padding,
            cover_all,
            argmax: CacheStack::new(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_cover_all(mut self, cover_all: bool) -> Self {
        self.cover_all = cover_all;
        self
    }

    fn out_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        Ok((
            pool_output_size(h, self.kernel.0, self.stride.0, self.padding.0, self.cover_all)?,
            pool_output_size(w, self.kernel.1, self.stride.1, self.padding.1, self.cover_all)?,
        ))
    }

    /// Pool `x` and return the output together with the argmax index map.
    ///
    /// Indices address `x.data` directly (batch offset included); `None`
    /// marks a window that lies entirely in the padding.
    pub fn pool(&self, x: &Tensor) -> Result<(Tensor, Vec<Option<usize>>)> {
        let (channels, h, w) = chw(&self.name, &x.shape)?;
        let (oh, ow) = self.out_hw(h, w)?;
        let (kh, kw) = (self.kernel.0 as isize, self.kernel.1 as isize);
        let (sh, sw) = (self.stride.0 as isize, self.stride.1 as isize);
        let (ph, pw) = (self.padding.0 as isize, self.padding.1 as isize);
        let (h_i, w_i) = (h as isize, w as isize);

        let mut indices = vec![None; x.batch_count * channels * oh * ow];

        for b in 0..x.batch_count {
            for c in 0..channels {
                let in_base = (b * channels + c) * h * w;
                let out_base = (b * channels + c) * oh * ow;
                for oy in 0..oh {
                    let in_y = oy as isize * sh - ph;
                    let dy_start = (-in_y).max(0);
                    let dy_limit = kh.min(h_i - in_y);
                    for ox in 0..ow {
                        let in_x = ox as isize * sw - pw;
                        let dx_start = (-in_x).max(0);
                        let dx_limit = kw.min(w_i - in_x);

                        let mut max_val = f32::NEG_INFINITY;
                        let mut max_idx = None;
                        for dy in dy_start..dy_limit {
                            let row = in_base + ((in_y + dy) as usize) * w;
                            for dx in dx_start..dx_limit {
                                let idx = row + (in_x + dx) as usize;
                                if max_val < x.data[idx] {
                                    max_val = x.data[idx];
                                    max_idx = Some(idx);
                                }
                            }
                        }
                        indices[out_base + oy * ow + ox] = max_idx;
                    }
                }
            }
        }

        let out_data = indices
            .iter()
            .map(|i| i.map_or(f32::NEG_INFINITY, |idx| x.data[idx]))
            .collect();

        Ok((
            Tensor::from_parts(out_data, &[channels, oh, ow], x.batch_count),
            indices,
        ))
    }
}

impl Operator for MaxPool2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let (c, h, w) = chw(&self.name, input)?;
        let (oh, ow) = self.out_hw(h, w)?;
        Ok(vec![c, oh, ow])
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let (y, indices) = self.pool(x)?;
        self.argmax.push(Argmax {
            indices,
            input_shape: x.shape.clone(),
            batch_count: x.batch_count,
        });
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let argmax = self.argmax.pop(&self.name)?;
        let mut expected = vec![argmax.batch_count];
        expected.extend(self.output_shape(&argmax.input_shape)?);
        check_shape(&self.name, &expected, &gy.full_shape())?;

        let mut gx = Tensor::zeros(&argmax.input_shape, argmax.batch_count);
        for (g, idx) in gy.data.iter().zip(&argmax.indices) {
            if let Some(i) = *idx {
                gx.data[i] += *g;
            }
        }
        Ok(gx)
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.pool(x)?.0)
    }

    fn pending(&self) -> usize {
        self.argmax.len()
    }

    fn reset_state(&mut self) {
        self.argmax.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::MaxPool2d;
    use crate::gradcheck::check_gradients_simple;
    use crate::nn::Operator;
    use crate::tensor::Tensor;

    fn ramp(shape: &[usize], batch: usize) -> Tensor {
        let n = batch * shape.iter().product::<usize>();
        Tensor::new((0..n).map(|i| i as f32).collect(), shape, batch).unwrap()
    }

    #[test]
    fn test_maxpool2d_forward_shape() {
        let pool = MaxPool2d::new(2, 2, 0).unwrap();
        let x = Tensor::randn(&[3, 32, 32], 1);
        let y = pool.predict(&x).unwrap();
        assert_eq!(y.full_shape(), vec![1, 3, 16, 16]);
    }

    #[test]
    fn test_maxpool2d_forward_values() {
        let pool = MaxPool2d::new(2, 2, 0).unwrap();
        let x = ramp(&[1, 4, 4], 1);
        let (y, idx) = pool.pool(&x).unwrap();
        assert_eq!(y.data, vec![5.0, 7.0, 13.0, 15.0]);
        assert_eq!(idx, vec![Some(5), Some(7), Some(13), Some(15)]);
    }

    #[test]
    fn test_maxpool2d_indices_include_batch_offset() {
        let pool = MaxPool2d::new(2, 2, 0).unwrap();
        let x = ramp(&[1, 2, 2], 2);
        let (_, idx) = pool.pool(&x).unwrap();
        assert_eq!(idx, vec![Some(3), Some(7)]);
    }

    #[test]
    fn test_maxpool2d_argmax_matches_brute_force() {
        let pool = MaxPool2d::new(3, 2, 1).unwrap();
        let x = Tensor::randn(&[2, 6, 6], 2);
        let (y, idx) = pool.pool(&x).unwrap();
        for (out, i) in y.data.iter().zip(&idx) {
            let i = i.expect("every window overlaps the input");
            assert_eq!(*out, x.data[i]);
        }
        // the first window of every channel covers rows/cols 0..2
        for plane in 0..4 {
            let base = plane * 36;
            let window = [base, base + 1, base + 6, base + 7];
            let best = window
                .iter()
                .copied()
                .max_by(|a, b| x.data[*a].total_cmp(&x.data[*b]))
                .unwrap();
            assert_eq!(idx[plane * 16], Some(best));
        }
    }

    #[test]
    fn test_maxpool2d_cover_all_shapes() {
        let cover = MaxPool2d::with_params((2, 2), (2, 2), (0, 0), true).unwrap();
        let drop = MaxPool2d::with_params((2, 2), (2, 2), (0, 0), false).unwrap();
        assert_eq!(cover.output_shape(&[1, 7, 7]).unwrap(), vec![1, 4, 4]);
        assert_eq!(drop.output_shape(&[1, 7, 7]).unwrap(), vec![1, 3, 3]);

        let cover = MaxPool2d::new(3, 2, 1).unwrap();
        assert_eq!(cover.output_shape(&[8, 7, 7]).unwrap(), vec![8, 4, 4]);
    }

    #[test]
    fn test_maxpool2d_partial_window_uses_available_cells() {
        let pool = MaxPool2d::with_params((2, 2), (2, 2), (0, 0), true).unwrap();
        let x = ramp(&[1, 3, 3], 1);
        let (y, idx) = pool.pool(&x).unwrap();
        assert_eq!(y.shape, vec![1, 2, 2]);
        assert_eq!(idx, vec![Some(4), Some(5), Some(7), Some(8)]);
    }

    #[test]
    fn test_maxpool2d_window_inside_padding_is_empty() {
        // pad 2 with kernel 2 and stride 2: the first window sees only padding
        let pool = MaxPool2d::new(2, 2, 2).unwrap();
        let x = ramp(&[1, 2, 2], 1);
        let (y, idx) = pool.pool(&x).unwrap();
        assert_eq!(idx[0], None);
        assert_eq!(y.data[0], f32::NEG_INFINITY);
    }

    #[test]
    fn test_maxpool2d_backward_routes_to_argmax() {
        let mut pool = MaxPool2d::new(2, 2, 0).unwrap();
        let x = ramp(&[1, 4, 4], 1);
        let y = pool.forward(&x).unwrap();
        let gy = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &y.shape, 1).unwrap();
        let gx = pool.backward(&gy).unwrap();

        let mut expected = vec![0.0; 16];
        expected[5] = 1.0;
        expected[7] = 2.0;
        expected[13] = 3.0;
        expected[15] = 4.0;
        assert_eq!(gx.data, expected);
        assert_eq!(gx.sum(), gy.sum());
    }

    #[test]
    fn test_maxpool2d_overlapping_windows_accumulate() {
        // stride 1 over a peak in the middle: every window picks the same cell
        let mut pool = MaxPool2d::with_params((2, 2), (1, 1), (0, 0), false).unwrap();
        let mut data = vec![0.0; 9];
        data[4] = 10.0;
        let x = Tensor::from_sample(data, &[1, 3, 3]).unwrap();
        let y = pool.forward(&x).unwrap();
        let gx = pool.backward(&Tensor::ones(&y.shape, 1)).unwrap();
        assert_eq!(gx.data[4], 4.0);
        assert_eq!(gx.sum(), 4.0);
    }

    #[test]
    fn test_maxpool2d_lifo_replay() {
        let mut pool = MaxPool2d::new(2, 2, 0).unwrap();
        let first = ramp(&[1, 2, 2], 1);
        let mut second = ramp(&[1, 2, 2], 1);
        second.data.reverse();

        pool.forward(&first).unwrap();
        pool.forward(&second).unwrap();
        assert_eq!(pool.pending(), 2);

        let g = Tensor::ones(&[1, 1, 1], 1);
        // most recent call: max of reversed ramp sits at index 0
        assert_eq!(pool.backward(&g).unwrap().data, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(pool.backward(&g).unwrap().data, vec![0.0, 0.0, 0.0, 1.0]);
        assert!(pool.backward(&g).is_err());
    }

    #[test]
    fn test_maxpool2d_gradcheck() {
        // strictly increasing data keeps every window maximum unique
        let mut pool = MaxPool2d::new(2, 2, 0).unwrap();
        let x = ramp(&[1, 4, 4], 1);
        assert!(check_gradients_simple(&mut pool, &x));
    }

    #[test]
    fn test_maxpool2d_invalid_params() {
        assert!(MaxPool2d::new(0, 1, 0).is_err());
        assert!(MaxPool2d::new(2, 0, 0).is_err());
    }
}
