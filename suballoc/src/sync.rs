// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Tracking of how far the device has progressed through submitted work.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter of submitted and completed frames, mirroring a timeline
/// semaphore or a fence value that is incremented with every submission.
///
/// The CPU records the commands of a frame while the value [`pending_value`] is current. Calling
/// [`submit`] closes that frame and returns the value the device will signal once it has
/// finished executing it. When the application observes that the device reached a value (by
/// waiting on a fence, for example), it reports it with [`signal`].
///
/// The allocators tag every deallocation with the pending value at that moment, and only reuse
/// the memory once the timeline has been signaled with a value at least as large.
///
/// [`pending_value`]: Self::pending_value
/// [`submit`]: Self::submit
/// [`signal`]: Self::signal
#[derive(Debug)]
pub struct Timeline {
    pending: AtomicU64,
    completed: AtomicU64,
}

impl Timeline {
    /// Creates a new `Timeline`. Nothing has been submitted yet, the first frame will signal 1.
    #[inline]
    pub const fn new() -> Self {
        Timeline {
            pending: AtomicU64::new(1),
            completed: AtomicU64::new(0),
        }
    }

    /// Returns the value that the device will signal once it finishes the frame currently being
    /// recorded.
    #[inline]
    pub fn pending_value(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Closes the frame currently being recorded and returns the value that will be signaled
    /// when the device finishes it.
    #[inline]
    pub fn submit(&self) -> u64 {
        self.pending.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the largest value that the device is known to have signaled.
    #[inline]
    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Records that the device has finished every frame up to and including `value`. Signaling a
    /// value smaller than one signaled before has no effect.
    ///
    /// # Panics
    ///
    /// - Panics if `value` has not been submitted yet.
    #[inline]
    pub fn signal(&self, value: u64) {
        assert!(
            value < self.pending_value(),
            "signaled timeline value {value} before it was submitted",
        );

        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Returns whether the device has finished the frame that signals `value`.
    #[inline]
    pub fn is_complete(&self, value: u64) -> bool {
        value <= self.completed_value()
    }
}

impl Default for Timeline {
    #[inline]
    fn default() -> Self {
        Timeline::new()
    }
}
