use crate::cache::CacheStack;
use crate::error::{LayerwiseError, Result};
use crate::nn::{Operator, check_shape, parameter_volume};
use crate::parameter::Parameter;
use crate::tensor::{Tensor, checked_volume};

/// Fully-connected (dense/linear) layer
///
/// Computes: y = Wx + b
/// where x is a sample flattened to (in_features), W is (out_features, in_features), b is (out_features)
pub struct Linear {
    name: String,
    in_features: usize,
    out_features: usize,
    weight: Parameter,
    bias: Option<Parameter>,
    inputs: CacheStack<Tensor>,
}

impl Linear {
    /// Create a new linear layer with random initialization
    ///
    /// Uses He initialization.
    pub fn new(in_features: usize, out_features: usize, use_bias: bool) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(LayerwiseError::config(format!(
                "Linear needs non-zero features, got {in_features} -> {out_features}"
            )));
        }
        parameter_volume("Linear", &[out_features, in_features])?;
        let name = "Linear".to_string();
        let weight = Parameter::new(
            Tensor::he_normal(&[out_features, in_features], in_features),
            format!("{name} W"),
        );
        let bias = use_bias
            .then(|| Parameter::new(Tensor::zeros(&[out_features], 1), format!("{name} b")));
        Ok(Linear {
            name,
            in_features,
            out_features,
            weight,
            bias,
            inputs: CacheStack::new(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.weight.label = format!("{} W", self.name);
        if let Some(bias) = self.bias.as_mut() {
            bias.label = format!("{} b", self.name);
        }
        self
    }

    /// Load weights laid out `[out, in]` and, when the layer has one, the bias.
    pub fn with_weights(self, weight: &[f32], bias: Option<&[f32]>) -> Result<Self> {
        self.weight.load(weight)?;
        match (&self.bias, bias) {
            (Some(param), Some(values)) => param.load(values)?,
            (None, Some(_)) => {
                return Err(LayerwiseError::config(format!(
                    "{} was built without a bias",
                    self.name
                )));
            }
            _ => {}
        }
        Ok(self)
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        if x.len() != self.in_features {
            return Err(LayerwiseError::shape(&self.name, &[self.in_features], &x.shape));
        }
        Ok(())
    }

    fn affine(&self, x: &Tensor) -> Result<Tensor> {
        self.check_input(x)?;
        let w = self.weight.value.borrow();
        let b = self.bias.as_ref().map(|p| p.value.borrow());
        let (n_in, n_out) = (self.in_features, self.out_features);

        let mut y = vec![0.0; x.batch_count * n_out];
        for s in 0..x.batch_count {
            let xs = x.sample(s);
            for o in 0..n_out {
                let row = &w.data[o * n_in..(o + 1) * n_in];
                let mut acc: f32 = row.iter().zip(xs).map(|(wi, xi)| wi * xi).sum();
                if let Some(b) = &b {
                    acc += b.data[o];
                }
                y[s * n_out + o] = acc;
            }
        }
        Ok(Tensor::from_parts(y, &[n_out], x.batch_count))
    }
}

impl Operator for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        if checked_volume(input, 1) != Some(self.in_features) {
            return Err(LayerwiseError::shape(&self.name, &[self.in_features], input));
        }
        Ok(vec![self.out_features])
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.affine(x)?;
        self.inputs.push(x.clone());
        Ok(y)
    }

    fn backward(&mut self, gy: &Tensor) -> Result<Tensor> {
        let x = self.inputs.pop(&self.name)?;
        check_shape(
            &self.name,
            &[x.batch_count, self.out_features],
            &gy.full_shape(),
        )?;
        let (n_in, n_out) = (self.in_features, self.out_features);
        let w = self.weight.value.borrow();
        let mut gw = self.weight.grad.borrow_mut();

        let mut gx = vec![0.0; x.data.len()];
        for s in 0..x.batch_count {
            let xs = x.sample(s);
            let gys = gy.sample(s);
            for o in 0..n_out {
                let g = gys[o];
                for i in 0..n_in {
                    gw.data[o * n_in + i] += g * xs[i];
                    gx[s * n_in + i] += w.data[o * n_in + i] * g;
                }
            }
        }

        if let Some(bias) = &self.bias {
            let mut gb = bias.grad.borrow_mut();
            for s in 0..gy.batch_count {
                for (acc, g) in gb.data.iter_mut().zip(gy.sample(s)) {
                    *acc += g;
                }
            }
        }

        Ok(Tensor::from_parts(gx, &x.shape, x.batch_count))
    }

    fn predict(&self, x: &Tensor) -> Result<Tensor> {
        self.affine(x)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone())
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
