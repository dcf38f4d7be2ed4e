#![allow(clippy::excessive_precision)]
#![allow(missing_docs)]

pub mod backend;
pub mod camera;
pub mod error;
pub mod function;
pub mod rasterize;
pub mod render;

pub use error::Error;
