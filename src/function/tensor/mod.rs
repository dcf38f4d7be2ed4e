//! Moving tensors between burn backends and host buffers.

pub use crate::error::Error;

use burn::tensor::{backend::Backend, Bool, Int, Tensor, TensorData};

/// Reading a tensor into a host buffer.
pub trait TensorHostExtension {
    type Item;

    /// Reading the elements in row-major order.
    ///
    /// `name` identifies the tensor in errors.
    fn into_host(
        self,
        name: &str,
    ) -> Result<Vec<Self::Item>, Error>;

    /// Checking the shape before reading.
    fn into_host_with_dims<const D: usize>(
        self,
        name: &str,
        dims: [usize; D],
    ) -> Result<Vec<Self::Item>, Error>
    where
        Self: Sized + Dims<D>,
    {
        let dims_actual = self.dims();
        if dims_actual != dims {
            return Err(Error::MismatchedShape(
                format!("{name}.dims() ({dims_actual:?})"),
                format!("{dims:?}"),
            ));
        }
        self.into_host(name)
    }
}

/// Writing a host buffer into a tensor.
pub trait TensorHostWrite<B: Backend, const D: usize>: Sized {
    type Item;

    fn from_host(
        values: Vec<Self::Item>,
        dims: [usize; D],
        device: &B::Device,
    ) -> Self;
}

/// The shape of a tensor.
pub trait Dims<const D: usize> {
    fn dims(&self) -> [usize; D];
}

impl<B: Backend, const D: usize> TensorHostExtension for Tensor<B, D> {
    type Item = f32;

    fn into_host(
        self,
        name: &str,
    ) -> Result<Vec<f32>, Error> {
        self.into_data()
            .convert::<f32>()
            .into_vec::<f32>()
            .map_err(|error| Error::TensorData(format!("{name}: {error:?}")))
    }
}

impl<B: Backend, const D: usize> TensorHostExtension for Tensor<B, D, Int> {
    type Item = u32;

    /// The elements should be non-negative.
    fn into_host(
        self,
        name: &str,
    ) -> Result<Vec<u32>, Error> {
        self.into_data()
            .convert::<i64>()
            .into_vec::<i64>()
            .map_err(|error| Error::TensorData(format!("{name}: {error:?}")))?
            .into_iter()
            .map(|value| {
                u32::try_from(value).map_err(|_| {
                    Error::TensorData(format!("{name}: {value} is out of range"))
                })
            })
            .collect()
    }
}

impl<B: Backend, const D: usize> TensorHostExtension for Tensor<B, D, Bool> {
    type Item = bool;

    fn into_host(
        self,
        name: &str,
    ) -> Result<Vec<bool>, Error> {
        self.into_data()
            .into_vec::<bool>()
            .map_err(|error| Error::TensorData(format!("{name}: {error:?}")))
    }
}

impl<B: Backend, const D: usize> TensorHostWrite<B, D> for Tensor<B, D> {
    type Item = f32;

    #[inline]
    fn from_host(
        values: Vec<f32>,
        dims: [usize; D],
        device: &B::Device,
    ) -> Self {
        Self::from_data(TensorData::new(values, dims), device)
    }
}

impl<B: Backend, const D: usize> TensorHostWrite<B, D> for Tensor<B, D, Int> {
    type Item = i32;

    #[inline]
    fn from_host(
        values: Vec<i32>,
        dims: [usize; D],
        device: &B::Device,
    ) -> Self {
        Self::from_data(TensorData::new(values, dims), device)
    }
}

impl<B: Backend, const D: usize> Dims<D> for Tensor<B, D> {
    #[inline]
    fn dims(&self) -> [usize; D] {
        Tensor::dims(self)
    }
}

impl<B: Backend, const D: usize> Dims<D> for Tensor<B, D, Int> {
    #[inline]
    fn dims(&self) -> [usize; D] {
        Tensor::dims(self)
    }
}

impl<B: Backend, const D: usize> Dims<D> for Tensor<B, D, Bool> {
    #[inline]
    fn dims(&self) -> [usize; D] {
        Tensor::dims(self)
    }
}
