//! Forward-mode dual numbers.
//!
//! The camera models and the projection are written once over [`Real`].
//! Evaluating them with [`Dual`] yields their exact derivatives, and nesting
//! duals yields the derivatives of Jacobians.

use nalgebra::Scalar;
use num_traits::{One, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign,
};

/// A scalar field the projection is evaluated over.
///
/// It is a [`Scalar`] of `nalgebra`, so the vectors and matrices of the
/// projection can hold it.
pub trait Real:
    Scalar
    + Copy
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Send
    + Sync
{
    /// Lifting a constant.
    fn constant(value: f32) -> Self;

    /// The primal value.
    fn value(self) -> f32;

    fn sqrt(self) -> Self;

    /// `atan2(self, x)`
    fn atan2(
        self,
        x: Self,
    ) -> Self;

    #[inline]
    fn square(self) -> Self {
        self * self
    }

    #[inline]
    fn scale(
        self,
        factor: f32,
    ) -> Self {
        self * Self::constant(factor)
    }
}

impl Real for f32 {
    #[inline]
    fn constant(value: f32) -> Self {
        value
    }

    #[inline]
    fn value(self) -> f32 {
        self
    }

    #[inline]
    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }

    #[inline]
    fn atan2(
        self,
        x: Self,
    ) -> Self {
        f32::atan2(self, x)
    }
}

/// `value + sum(grads[i] * e_i)` with `e_i * e_j = 0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Dual<S, const N: usize> {
    pub value: S,
    pub grads: [S; N],
}

impl<S: Real, const N: usize> Dual<S, N> {
    /// The `index`-th input variable.
    #[inline]
    pub fn variable(
        value: S,
        index: usize,
    ) -> Self {
        let mut grads = [S::zero(); N];
        grads[index] = S::one();
        Self { value, grads }
    }

    /// Seeding `N` input variables in order.
    #[inline]
    pub fn variables(values: [S; N]) -> [Self; N] {
        std::array::from_fn(|index| Self::variable(values[index], index))
    }

    /// Applying a scalar function with the derivative `derivative`.
    #[inline]
    fn chain(
        self,
        value: S,
        derivative: S,
    ) -> Self {
        Self {
            value,
            grads: self.grads.map(|grad| grad * derivative),
        }
    }
}

impl<S: Real, const N: usize> Add for Dual<S, N> {
    type Output = Self;

    #[inline]
    fn add(
        self,
        rhs: Self,
    ) -> Self {
        Self {
            value: self.value + rhs.value,
            grads: std::array::from_fn(|i| self.grads[i] + rhs.grads[i]),
        }
    }
}

impl<S: Real, const N: usize> Sub for Dual<S, N> {
    type Output = Self;

    #[inline]
    fn sub(
        self,
        rhs: Self,
    ) -> Self {
        Self {
            value: self.value - rhs.value,
            grads: std::array::from_fn(|i| self.grads[i] - rhs.grads[i]),
        }
    }
}

impl<S: Real, const N: usize> Mul for Dual<S, N> {
    type Output = Self;

    #[inline]
    fn mul(
        self,
        rhs: Self,
    ) -> Self {
        Self {
            value: self.value * rhs.value,
            grads: std::array::from_fn(|i| {
                self.grads[i] * rhs.value + self.value * rhs.grads[i]
            }),
        }
    }
}

impl<S: Real, const N: usize> Div for Dual<S, N> {
    type Output = Self;

    #[inline]
    fn div(
        self,
        rhs: Self,
    ) -> Self {
        let value = self.value / rhs.value;
        Self {
            value,
            grads: std::array::from_fn(|i| {
                (self.grads[i] - value * rhs.grads[i]) / rhs.value
            }),
        }
    }
}

impl<S: Real, const N: usize> Neg for Dual<S, N> {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self {
            value: -self.value,
            grads: self.grads.map(|grad| -grad),
        }
    }
}

macro_rules! impl_assign {
    ($trait:ident, $method:ident, $op:tt) => {
        impl<S: Real, const N: usize> $trait for Dual<S, N> {
            #[inline]
            fn $method(
                &mut self,
                rhs: Self,
            ) {
                *self = *self $op rhs;
            }
        }
    };
}

impl_assign!(AddAssign, add_assign, +);
impl_assign!(SubAssign, sub_assign, -);
impl_assign!(MulAssign, mul_assign, *);
impl_assign!(DivAssign, div_assign, /);

impl<S: Real, const N: usize> Zero for Dual<S, N> {
    #[inline]
    fn zero() -> Self {
        Self::constant(0.0)
    }

    #[inline]
    fn is_zero(&self) -> bool {
        self.value.is_zero() && self.grads.iter().all(Zero::is_zero)
    }
}

impl<S: Real, const N: usize> One for Dual<S, N> {
    #[inline]
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl<S: Real, const N: usize> Real for Dual<S, N> {
    #[inline]
    fn constant(value: f32) -> Self {
        Self {
            value: S::constant(value),
            grads: [S::zero(); N],
        }
    }

    #[inline]
    fn value(self) -> f32 {
        self.value.value()
    }

    #[inline]
    fn sqrt(self) -> Self {
        let value = self.value.sqrt();
        self.chain(value, S::constant(0.5) / value)
    }

    #[inline]
    fn atan2(
        self,
        x: Self,
    ) -> Self {
        let norm_square = self.value.square() + x.value.square();
        let value = self.value.atan2(x.value);
        Self {
            value,
            grads: std::array::from_fn(|i| {
                (x.value * self.grads[i] - self.value * x.grads[i]) / norm_square
            }),
        }
    }
}
