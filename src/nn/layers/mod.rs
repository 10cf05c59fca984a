pub mod batchnorm;
pub mod conv;
pub mod conv_transpose;
pub mod dropout;
pub mod flatten;
pub mod linear;
pub mod maxpool;
pub mod relu;
pub mod sequential;
pub mod sequential_builder;

pub use batchnorm::BatchNorm;
pub use conv::Conv2d;
pub use conv_transpose::ConvTranspose2d;
pub use dropout::{Dropout, MaskScope};
pub use flatten::Flatten;
pub use linear::Linear;
pub use maxpool::MaxPool2d;
pub use relu::ReLU;
pub use sequential::Pipeline;
pub use sequential_builder::PipelineBuilder;
