// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

// Simulates a renderer recording frames on the host device, with every kind of allocation a frame
// usually makes:
//
// - per-frame constants written to upload buffers,
// - scratch storage buffers that live for a single frame,
// - textures that are streamed in and out every now and then,
// - render targets that are recreated when the "window" is resized.
//
// The device finishes a frame as soon as the CPU has to wait for it, so memory is only ever
// reclaimed once the frame that last used it is reported complete.
//
// Run with `RUST_LOG=debug` to see the heaps being created, and optionally pass the path of a
// configuration file such as `demos/frame-loop/config.ron`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{env, error::Error, sync::Arc};
use suballoc::{
    device::{TextureDesc, TextureFormat, TextureUsage},
    host::HostDevice,
    memory::{DeviceAlignment, ResourceLocation},
};
use suballoc_util::context::{AllocatorContext, AllocatorContextConfig};

const FRAME_COUNT: u32 = 600;
const RESIZE_INTERVAL: u32 = 150;
const STATISTICS_INTERVAL: u32 = 100;
const TEXTURE_COUNT: usize = 32;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => AllocatorContextConfig::load(path)?,
        None => AllocatorContextConfig::default(),
    };
    log::info!("configuration:\n{}", config.to_ron()?);

    let device = Arc::new(HostDevice::new());
    let context = AllocatorContext::new(device.clone(), &config)?;
    let mut rng = StdRng::seed_from_u64(0);

    let constant_alignment = DeviceAlignment::new(256).unwrap();
    let storage_alignment = DeviceAlignment::new(16).unwrap();

    let mut textures = (0..TEXTURE_COUNT)
        .map(|_| context.textures().allocate(&random_texture(&mut rng)))
        .collect::<Result<Vec<_>, _>>()?;
    let mut render_targets = create_render_targets(&context, 1280, 720)?;

    for frame in 0..FRAME_COUNT {
        if let Some(value) = context.frame_to_wait_for() {
            let count = context.frame_completed(value);
            log::trace!("frame {value} retired {count} allocations");
        }

        // Camera and per-draw constants.
        let constants = (0..rng.gen_range(1..64))
            .map(|draw| [frame as f32, draw as f32, 0.0, 1.0])
            .collect::<Vec<[f32; 4]>>();
        let constants = context
            .upload_buffers()
            .allocate_slice(&constants, constant_alignment)?;

        let scratch = (0..rng.gen_range(0..8))
            .map(|_| {
                context
                    .default_buffers()
                    .allocate(rng.gen_range(1..256 * 1024), storage_alignment)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Stream a texture.
        if rng.gen_bool(0.1) {
            let index = rng.gen_range(0..textures.len());
            let texture = context.textures().allocate(&random_texture(&mut rng))?;
            let old_texture = std::mem::replace(&mut textures[index], texture);
            context.textures().deallocate(old_texture);
        }

        if frame % RESIZE_INTERVAL == RESIZE_INTERVAL - 1 {
            let width = rng.gen_range(640..2560);
            let height = rng.gen_range(360..1440);
            log::info!("resizing to {width}x{height}");

            for render_target in render_targets.drain(..) {
                context.render_targets().deallocate(render_target);
            }
            render_targets = create_render_targets(&context, width, height)?;
        }

        // Everything the frame allocated is released right away. The memory stays reserved until
        // the frame is complete.
        context.upload_buffers().deallocate(constants);
        for location in scratch {
            context.default_buffers().deallocate(location);
        }

        let value = context.end_frame();

        if frame % STATISTICS_INTERVAL == 0 {
            log::info!("frame {value}: {:#?}", context.statistics().total());
        }
    }

    // Wait for the device to become idle.
    let last_value = context.timeline().pending_value() - 1;
    context.frame_completed(last_value);

    for texture in textures {
        context.textures().deallocate(texture);
    }
    for render_target in render_targets {
        context.render_targets().deallocate(render_target);
    }

    // SAFETY: Every frame has completed.
    let count = unsafe { context.clear_up_all_allocations() };
    let statistics = context.statistics();
    log::info!("freed the last {count} allocations: {statistics:#?}");

    assert_eq!(statistics.total().allocation_count, 0);

    drop(context);
    assert_eq!(device.live_heaps(), 0);
    assert_eq!(device.live_resources(), 0);

    Ok(())
}

fn random_texture(rng: &mut impl Rng) -> TextureDesc {
    let size: u32 = 1 << rng.gen_range(6..11);
    let format = if rng.gen_bool(0.5) {
        TextureFormat::R8G8B8A8Srgb
    } else {
        TextureFormat::R8Unorm
    };

    TextureDesc {
        mip_levels: size.ilog2() + 1,
        ..TextureDesc::new_2d(format, size, size)
    }
}

fn create_render_targets(
    context: &AllocatorContext<HostDevice>,
    width: u32,
    height: u32,
) -> Result<Vec<ResourceLocation<HostDevice>>, Box<dyn Error>> {
    let color = TextureDesc {
        usage: TextureUsage::RenderTarget,
        ..TextureDesc::new_2d(TextureFormat::B8G8R8A8Srgb, width, height)
    };
    let depth = TextureDesc {
        usage: TextureUsage::DepthStencil,
        ..TextureDesc::new_2d(TextureFormat::D32Sfloat, width, height)
    };

    Ok(vec![
        context.render_targets().allocate(&color)?,
        context.render_targets().allocate(&depth)?,
    ])
}
