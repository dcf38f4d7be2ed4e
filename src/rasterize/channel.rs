//! Channel-count dispatch.
//!
//! Every compositing routine is written once over a const channel width `C`.
//! [`dispatch`] maps a runtime channel count onto one of the supported widths.

pub use crate::error::Error;

/// The supported channel counts.
pub const CHANNEL_COUNTS: [usize; 19] = [
    1, 2, 3, 4, 5, 8, 9, 16, 17, 32, 33, 64, 65, 128, 129, 256, 257, 512, 513,
];

/// A routine generic over the channel width.
pub trait ChannelVisitor {
    type Output;

    fn visit<const C: usize>(self) -> Self::Output;
}

#[inline]
pub fn is_supported(channel_count: usize) -> bool {
    CHANNEL_COUNTS.contains(&channel_count)
}

/// A channel count among [`CHANNEL_COUNTS`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChannelCount(usize);

impl ChannelCount {
    /// ## Errors
    ///
    /// [`Error::UnsupportedChannelCount`] if `channel_count` is not one of
    /// [`CHANNEL_COUNTS`].
    pub fn new(channel_count: usize) -> Result<Self, Error> {
        if !is_supported(channel_count) {
            return Err(Error::UnsupportedChannelCount(channel_count));
        }
        Ok(Self(channel_count))
    }

    /// `C`
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// Running `visitor` with the channel width.
    pub fn visit<V: ChannelVisitor>(
        self,
        visitor: V,
    ) -> V::Output {
        match self.0 {
            1 => visitor.visit::<1>(),
            2 => visitor.visit::<2>(),
            3 => visitor.visit::<3>(),
            4 => visitor.visit::<4>(),
            5 => visitor.visit::<5>(),
            8 => visitor.visit::<8>(),
            9 => visitor.visit::<9>(),
            16 => visitor.visit::<16>(),
            17 => visitor.visit::<17>(),
            32 => visitor.visit::<32>(),
            33 => visitor.visit::<33>(),
            64 => visitor.visit::<64>(),
            65 => visitor.visit::<65>(),
            128 => visitor.visit::<128>(),
            129 => visitor.visit::<129>(),
            256 => visitor.visit::<256>(),
            257 => visitor.visit::<257>(),
            512 => visitor.visit::<512>(),
            // 513 is the last supported count
            _ => visitor.visit::<513>(),
        }
    }
}

/// Running `visitor` with the channel width `channel_count`.
///
/// ## Errors
///
/// [`Error::UnsupportedChannelCount`] if `channel_count` is not one of
/// [`CHANNEL_COUNTS`].
pub fn dispatch<V: ChannelVisitor>(
    channel_count: usize,
    visitor: V,
) -> Result<V::Output, Error> {
    Ok(ChannelCount::new(channel_count)?.visit(visitor))
}
