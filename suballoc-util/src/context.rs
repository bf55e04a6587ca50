// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use serde::{Deserialize, Deserializer, Serialize};
use std::{
    error::Error,
    fmt::{self, Display},
    fs, io,
    num::NonZeroU32,
    path::Path,
    sync::Arc,
};
use suballoc::{
    device::MemoryDevice,
    memory::{
        AllocationError, AllocatorStatistics, BuddyAllocatorCreateInfo, DefaultBufferAllocator,
        RenderTargetAllocator, TextureAllocator, UploadBufferAllocator,
    },
    sync::Timeline,
    DeviceSize,
};

/// Configuration of an [`AllocatorContext`].
///
/// Every field has a default, so a configuration file only needs to list what it changes. A pool
/// that is only partly listed keeps the defaults of its own kind of allocator for the rest:
///
/// ```
/// use suballoc_util::context::AllocatorContextConfig;
///
/// let config = AllocatorContextConfig::from_ron(
///     "(frames_in_flight: 3, upload_buffers: (max_block_size: 16777216))",
/// )
/// .unwrap();
///
/// assert_eq!(config.frames_in_flight, 3);
/// assert_eq!(config.upload_buffers.max_block_size, 16 * 1024 * 1024);
/// assert_eq!(config.upload_buffers.min_block_size, 256);
/// assert_eq!(config.textures.min_block_size, 64 * 1024);
///
/// let config =
///     AllocatorContextConfig::from_ron("(textures: (max_block_size: 16777216))").unwrap();
///
/// assert_eq!(config.textures.min_block_size, 64 * 1024);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorContextConfig {
    /// How many frames the CPU may record ahead of the device.
    ///
    /// The default value is `2`.
    pub frames_in_flight: u32,

    /// The default minimum block size is 256B.
    #[serde(deserialize_with = "PoolConfig::default_buffers")]
    pub default_buffers: PoolConfig,

    /// The default minimum block size is 256B.
    #[serde(deserialize_with = "PoolConfig::upload_buffers")]
    pub upload_buffers: PoolConfig,

    /// The default minimum block size is 64KiB.
    #[serde(deserialize_with = "PoolConfig::textures")]
    pub textures: PoolConfig,

    /// The default minimum block size is 64KiB.
    #[serde(deserialize_with = "PoolConfig::render_targets")]
    pub render_targets: PoolConfig,
}

impl Default for AllocatorContextConfig {
    fn default() -> Self {
        AllocatorContextConfig {
            frames_in_flight: 2,
            default_buffers: BuddyAllocatorCreateInfo::default_buffers().into(),
            upload_buffers: BuddyAllocatorCreateInfo::upload_buffers().into(),
            textures: BuddyAllocatorCreateInfo::textures().into(),
            render_targets: BuddyAllocatorCreateInfo::render_targets().into(),
        }
    }
}

/// The block sizes of one of the allocators of an [`AllocatorContext`]. The heap type, usage and
/// strategy are fixed by the kind of allocator.
///
/// Fields left out of a configuration file take the values of the [`BuddyAllocatorCreateInfo`]
/// preset of the allocator the pool belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub min_block_size: DeviceSize,

    /// The size of every heap. The default value is 512MiB.
    pub max_block_size: DeviceSize,
}

// A pool as written in a configuration file, where every field is optional.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolOverrides {
    #[serde(default)]
    min_block_size: Option<DeviceSize>,
    #[serde(default)]
    max_block_size: Option<DeviceSize>,
}

impl From<BuddyAllocatorCreateInfo> for PoolConfig {
    #[inline]
    fn from(create_info: BuddyAllocatorCreateInfo) -> Self {
        PoolConfig {
            min_block_size: create_info.min_block_size,
            max_block_size: create_info.max_block_size,
        }
    }
}

impl PoolConfig {
    fn deserialize_onto<'de, De: Deserializer<'de>>(
        deserializer: De,
        preset: BuddyAllocatorCreateInfo,
    ) -> Result<Self, De::Error> {
        let overrides = PoolOverrides::deserialize(deserializer)?;

        Ok(PoolConfig {
            min_block_size: overrides.min_block_size.unwrap_or(preset.min_block_size),
            max_block_size: overrides.max_block_size.unwrap_or(preset.max_block_size),
        })
    }

    fn default_buffers<'de, De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        Self::deserialize_onto(deserializer, BuddyAllocatorCreateInfo::default_buffers())
    }

    fn upload_buffers<'de, De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        Self::deserialize_onto(deserializer, BuddyAllocatorCreateInfo::upload_buffers())
    }

    fn textures<'de, De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        Self::deserialize_onto(deserializer, BuddyAllocatorCreateInfo::textures())
    }

    fn render_targets<'de, De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        Self::deserialize_onto(deserializer, BuddyAllocatorCreateInfo::render_targets())
    }

    /// Returns `create_info` with the block sizes of `self`.
    pub fn apply(self, create_info: BuddyAllocatorCreateInfo) -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo {
            min_block_size: self.min_block_size,
            max_block_size: self.max_block_size,
            ..create_info
        }
    }
}

impl AllocatorContextConfig {
    /// Parses a configuration in RON format.
    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(source)
            .map_err(ConfigError::Parse)
    }

    /// Reads a configuration in RON format from the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(ConfigError::Io)?;

        Self::from_ron(&source)
    }

    /// Formats the configuration in RON format.
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}

/// Error that can happen when loading an [`AllocatorContextConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(ron::error::SpannedError),
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(_) => f.write_str("reading the configuration file failed"),
            Self::Parse(_) => f.write_str("the configuration is not valid RON"),
        }
    }
}

/// Owns the allocators of an application, one per kind of GPU memory, and the [`Timeline`] that
/// gates their deferred frees.
///
/// A typical frame looks like this:
///
/// 1. If [`frame_to_wait_for`] returns a value, wait for the device to signal it and report it
///    with [`frame_completed`]. That frees the memory of every frame up to it.
/// 2. Record commands, allocating and deallocating through the allocators.
/// 3. Call [`end_frame`] and have the submission signal the returned value.
///
/// [`frame_to_wait_for`]: Self::frame_to_wait_for
/// [`frame_completed`]: Self::frame_completed
/// [`end_frame`]: Self::end_frame
pub struct AllocatorContext<D: MemoryDevice> {
    device: Arc<D>,
    timeline: Arc<Timeline>,
    frames_in_flight: NonZeroU32,
    default_buffers: DefaultBufferAllocator<D>,
    upload_buffers: UploadBufferAllocator<D>,
    textures: TextureAllocator<D>,
    render_targets: RenderTargetAllocator<D>,
}

impl<D: MemoryDevice> AllocatorContext<D> {
    /// Creates the allocators described by `config`. Each of them creates its first heap.
    ///
    /// # Panics
    ///
    /// - Panics if `config.frames_in_flight` is zero.
    /// - Panics if the block sizes of an allocator are not powers of two, or if the minimum
    ///   exceeds the maximum.
    pub fn new(device: Arc<D>, config: &AllocatorContextConfig) -> Result<Self, AllocationError> {
        let Some(frames_in_flight) = NonZeroU32::new(config.frames_in_flight) else {
            panic!("`config.frames_in_flight` must not be zero");
        };

        let timeline = Arc::new(Timeline::new());

        let default_buffers = DefaultBufferAllocator::new(
            device.clone(),
            timeline.clone(),
            config.default_buffers.apply(BuddyAllocatorCreateInfo::default_buffers()),
        )?;
        let upload_buffers = UploadBufferAllocator::new(
            device.clone(),
            timeline.clone(),
            config.upload_buffers.apply(BuddyAllocatorCreateInfo::upload_buffers()),
        )?;
        let textures = TextureAllocator::new(
            device.clone(),
            timeline.clone(),
            config.textures.apply(BuddyAllocatorCreateInfo::textures()),
        )?;
        let render_targets = RenderTargetAllocator::new(
            device.clone(),
            timeline.clone(),
            config.render_targets.apply(BuddyAllocatorCreateInfo::render_targets()),
        )?;

        log::debug!("created allocator context with {frames_in_flight} frames in flight");

        Ok(AllocatorContext {
            device,
            timeline,
            frames_in_flight,
            default_buffers,
            upload_buffers,
            textures,
            render_targets,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight.get()
    }

    #[inline]
    pub fn default_buffers(&self) -> &DefaultBufferAllocator<D> {
        &self.default_buffers
    }

    #[inline]
    pub fn upload_buffers(&self) -> &UploadBufferAllocator<D> {
        &self.upload_buffers
    }

    #[inline]
    pub fn textures(&self) -> &TextureAllocator<D> {
        &self.textures
    }

    #[inline]
    pub fn render_targets(&self) -> &RenderTargetAllocator<D> {
        &self.render_targets
    }

    /// Closes the frame being recorded. Returns the value that the submission of the frame must
    /// signal once the device has finished it.
    pub fn end_frame(&self) -> u64 {
        let value = self.timeline.submit();
        log::trace!("submitted frame {value}");

        value
    }

    /// Returns the frame that has to complete before another one may be recorded, so that no more
    /// than [`frames_in_flight`] frames are in flight at once.
    ///
    /// [`frames_in_flight`]: Self::frames_in_flight
    pub fn frame_to_wait_for(&self) -> Option<u64> {
        let submitted = self.timeline.pending_value() - 1;
        let completed = self.timeline.completed_value();
        let frames_in_flight = u64::from(self.frames_in_flight.get());

        (submitted - completed >= frames_in_flight).then(|| submitted + 1 - frames_in_flight)
    }

    /// Records that the device has finished every frame up to and including `value`, and frees
    /// the memory those frames were the last to use. Returns how many allocations were freed.
    ///
    /// # Panics
    ///
    /// - Panics if `value` was not returned by [`end_frame`] yet.
    ///
    /// [`end_frame`]: Self::end_frame
    pub fn frame_completed(&self, value: u64) -> usize {
        self.timeline.signal(value);

        let count = self.default_buffers.clear_up_allocations()
            + self.upload_buffers.clear_up_allocations()
            + self.textures.clear_up_allocations()
            + self.render_targets.clear_up_allocations();

        log::trace!("frame {value} completed, freed {count} allocations");

        count
    }

    /// Frees everything that was deallocated, regardless of the timeline.
    ///
    /// # Safety
    ///
    /// - The device must be idle.
    pub unsafe fn clear_up_all_allocations(&self) -> usize {
        let count = unsafe { self.default_buffers.clear_up_all_allocations() }
            + unsafe { self.upload_buffers.clear_up_all_allocations() }
            + unsafe { self.textures.clear_up_all_allocations() }
            + unsafe { self.render_targets.clear_up_all_allocations() };
        log::debug!("cleared up {count} allocations");

        count
    }

    /// Returns how much memory each allocator uses right now.
    pub fn statistics(&self) -> ContextStatistics {
        ContextStatistics {
            default_buffers: self.default_buffers.statistics(),
            upload_buffers: self.upload_buffers.statistics(),
            textures: self.textures.statistics(),
            render_targets: self.render_targets.statistics(),
        }
    }
}

/// The statistics of every allocator of an [`AllocatorContext`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStatistics {
    pub default_buffers: AllocatorStatistics,
    pub upload_buffers: AllocatorStatistics,
    pub textures: AllocatorStatistics,
    pub render_targets: AllocatorStatistics,
}

impl ContextStatistics {
    /// Returns the sum over every allocator.
    pub fn total(&self) -> AllocatorStatistics {
        [
            self.default_buffers,
            self.upload_buffers,
            self.textures,
            self.render_targets,
        ]
        .into_iter()
        .fold(AllocatorStatistics::default(), |acc, statistics| {
            AllocatorStatistics {
                instance_count: acc.instance_count + statistics.instance_count,
                reserved_size: acc.reserved_size + statistics.reserved_size,
                free_size: acc.free_size + statistics.free_size,
                allocation_count: acc.allocation_count + statistics.allocation_count,
                pending_free_count: acc.pending_free_count + statistics.pending_free_count,
                stand_alone_count: acc.stand_alone_count + statistics.stand_alone_count,
            }
        })
    }
}
