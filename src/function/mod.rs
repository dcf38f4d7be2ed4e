pub mod dual;
pub mod tensor;

pub use dual::{Dual, Real};
pub use tensor::{TensorHostExtension, TensorHostWrite};
