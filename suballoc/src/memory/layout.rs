// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{device::MemoryRequirements, DeviceSize, NonZeroDeviceSize};
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
};

/// The size and alignment of a request, analogous to std's [`Layout`] but using
/// [`DeviceSize`]s.
///
/// Unlike `Layout`s, `DeviceLayout`s are required to have non-zero size.
///
/// [`Layout`]: std::alloc::Layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLayout {
    size: NonZeroDeviceSize,
    alignment: DeviceAlignment,
}

impl DeviceLayout {
    /// The maximum size of a request after it has been rounded up to a multiple of its alignment.
    ///
    /// Keeping sizes below this bound means that offsets within a heap can be added and rounded
    /// without overflowing.
    pub const MAX_SIZE: DeviceSize = DeviceAlignment::MAX.as_devicesize() - 1;

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` is zero, `alignment` is not a power of two, or if `size` would
    /// exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the nearest multiple of `alignment`.
    #[inline]
    pub const fn from_size_alignment(size: DeviceSize, alignment: DeviceSize) -> Option<Self> {
        if let (Some(size), Some(alignment)) = (
            NonZeroDeviceSize::new(size),
            DeviceAlignment::new(alignment),
        ) {
            DeviceLayout::new(size, alignment)
        } else {
            None
        }
    }

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` would exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the
    /// nearest multiple of `alignment`.
    #[inline]
    pub const fn new(size: NonZeroDeviceSize, alignment: DeviceAlignment) -> Option<Self> {
        let max_size = DeviceLayout::MAX_SIZE - (alignment.as_devicesize() - 1);

        if size.get() <= max_size {
            Some(DeviceLayout { size, alignment })
        } else {
            None
        }
    }

    /// Creates the layout a resource with the given requirements takes up in a heap.
    ///
    /// Returns [`None`] if the size is zero or too large.
    #[inline]
    pub const fn from_requirements(requirements: &MemoryRequirements) -> Option<Self> {
        match NonZeroDeviceSize::new(requirements.size) {
            Some(size) => DeviceLayout::new(size, requirements.alignment),
            None => None,
        }
    }

    /// Returns the requested size.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size.get()
    }

    /// Returns the requested alignment.
    #[inline]
    pub const fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }
}

/// A power-of-two alignment of device memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceAlignment(NonZeroDeviceSize);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = DeviceAlignment(NonZeroDeviceSize::MIN);

    /// The largest possible alignment, 2<sup>63</sup>.
    pub const MAX: Self = match NonZeroDeviceSize::new(1 << 63) {
        Some(alignment) => DeviceAlignment(alignment),
        None => unreachable!(),
    };

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not a
    /// power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        match NonZeroDeviceSize::new(alignment) {
            Some(alignment) if alignment.is_power_of_two() => Some(DeviceAlignment(alignment)),
            _ => None,
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?} (1 << {:?})", self.0, self.log2())
    }
}

impl TryFrom<DeviceSize> for DeviceAlignment {
    type Error = TryFromIntError;

    #[inline]
    fn try_from(alignment: DeviceSize) -> Result<Self, Self::Error> {
        DeviceAlignment::new(alignment).ok_or(TryFromIntError)
    }
}

impl TryFrom<u32> for DeviceAlignment {
    type Error = TryFromIntError;

    #[inline]
    fn try_from(alignment: u32) -> Result<Self, Self::Error> {
        DeviceAlignment::new(DeviceSize::from(alignment)).ok_or(TryFromIntError)
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// Error that can happen when trying to convert an integer to a `DeviceAlignment`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryFromIntError;

impl Error for TryFromIntError {}

impl Display for TryFromIntError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("attempted to convert a non-power-of-two integer to a `DeviceAlignment`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_must_be_power_of_two() {
        assert!(DeviceAlignment::new(0).is_none());
        assert!(DeviceAlignment::new(3).is_none());
        assert_eq!(DeviceAlignment::new(256).unwrap().log2(), 8);
        assert_eq!(DeviceAlignment::try_from(96u32), Err(TryFromIntError));
    }

    #[test]
    fn layout_rejects_overflowing_sizes() {
        assert!(DeviceLayout::from_size_alignment(0, 1).is_none());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 1).is_some());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 2).is_none());

        let layout = DeviceLayout::from_size_alignment(100, 256).unwrap();
        assert_eq!(layout.size(), 100);
        assert_eq!(layout.alignment().as_devicesize(), 256);
    }

    #[test]
    fn layout_of_empty_resource() {
        let requirements = MemoryRequirements {
            size: 0,
            alignment: DeviceAlignment::MIN,
        };

        assert!(DeviceLayout::from_requirements(&requirements).is_none());
    }
}
