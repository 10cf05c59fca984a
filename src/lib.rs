//! Stateful feed-forward operators with hand-derived gradients.
//!
//! Every operator implements [`Operator`]: `forward` pushes whatever its
//! `backward` will need onto a per-instance LIFO cache, `backward` pops the
//! most recent entry, and `predict` runs the same numerics with no side
//! effects. A [`Pipeline`] chains operators; [`onnx::import_model`] builds one
//! from a serialized ONNX graph and [`config::PipelineConfig`] from JSON.
//!
//! ```
//! use layerwise::{BatchNorm, Conv2d, Dropout, MaxPool2d, Operator, Pipeline, Tensor};
//!
//! let mut net = Pipeline::builder(&[3, 8, 8])
//!     .add(Box::new(Conv2d::new(3, 8, 3, 1, 1, true)?))
//!     .add(Box::new(BatchNorm::new(8)?))
//!     .add(Box::new(MaxPool2d::new(2, 2, 0)?))
//!     .add(Box::new(Dropout::new(0.5)?))
//!     .build()?;
//!
//! let x = Tensor::randn(&[3, 8, 8], 2);
//! let y = net.forward(&x)?;
//! assert_eq!(y.full_shape(), vec![2, 8, 4, 4]);
//! let gx = net.backward(&Tensor::ones(&[8, 4, 4], 2))?;
//! assert_eq!(gx.full_shape(), x.full_shape());
//! # Ok::<(), layerwise::LayerwiseError>(())
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod gradcheck;
pub mod nn;
pub mod onnx;
pub mod parameter;
pub mod tensor;

pub use cache::CacheStack;
pub use config::{LayerConfig, PipelineConfig};
pub use error::{LayerwiseError, Result};
pub use nn::{
    BatchNorm, Conv2d, ConvTranspose2d, Dropout, Flatten, Linear, MaskScope, MaxPool2d, Mode,
    Operator, Pipeline, PipelineBuilder, ReLU,
};
pub use onnx::{import_model, load_network};
pub use parameter::Parameter;
pub use tensor::{SharedTensor, Tensor, manual_seed};
