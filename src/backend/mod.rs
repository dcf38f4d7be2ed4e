pub use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    tensor::backend::{AutodiffBackend, Backend},
};

use burn::backend::autodiff;

pub type Autodiff<B> = autodiff::Autodiff<B>;
