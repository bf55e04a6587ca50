// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Utilities for applications using `suballoc`.
//!
//! [`AllocatorContext`] owns one allocator per kind of GPU memory along with the [`Timeline`]
//! they share, and is meant to be created once and passed to the subsystems that need memory.
//!
//! [`AllocatorContext`]: context::AllocatorContext
//! [`Timeline`]: suballoc::sync::Timeline

pub mod context;
