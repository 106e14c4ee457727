// Tests against a real Vulkan device (headless, no window).
//
// Run with: cargo test -- --ignored

use ash::vk;
use frame_renderer::backend::buffer::mip_level_count;
use frame_renderer::backend::descriptor::{create_sampler, DescriptorSetLayoutBuilder};
use frame_renderer::backend::{
    choose_sample_count, AttachmentFormats, BlendState, DescriptorAllocator, DeviceDesc, FrameSync, ImageDesc,
    MemoryUsage, PipelineBuilder, RenderError, ResourceAllocator, ShaderBinary, VulkanDevice,
};
use frame_renderer::scene::{checkerboard, DrawConstants, UniformBufferObject, Vertex};
use std::mem::size_of;
use std::path::Path;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn device(validation: bool) -> VulkanDevice {
    VulkanDevice::new(&DeviceDesc::headless("gpu-resource-tests", validation)).expect("no usable Vulkan device")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
#[ignore = "requires a Vulkan device"]
fn staging_upload_round_trips() {
    let device = device(true);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();

    for len in [1, 3, 256, 65_536 + 7, 4 * 1024 * 1024 + 3] {
        let data = pattern(len);
        let mut buffer = resources
            .create_buffer(
                &device,
                "round trip",
                len as u64,
                vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryUsage::DeviceLocal,
            )
            .unwrap();

        resources.upload(&device, &buffer, &data).unwrap();
        let back = resources.read_back(&device, &buffer).unwrap();
        assert_eq!(back, data, "mismatch for {len} bytes");

        resources.destroy_buffer(&device, &mut buffer);
    }

    resources.destroy(&device);
    assert_eq!(device.validation_error_count(), 0);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn oversized_upload_is_rejected() {
    let device = device(false);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();
    let mut buffer = resources
        .create_buffer(
            &device,
            "small",
            16,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::DeviceLocal,
        )
        .unwrap();

    let err = resources.upload(&device, &buffer, &[0u8; 17]).unwrap_err();
    assert!(matches!(err, RenderError::InvalidRequest(_)));

    let zero = resources.create_buffer(
        &device,
        "empty",
        0,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUsage::DeviceLocal,
    );
    assert!(matches!(zero, Err(RenderError::InvalidRequest(_))));

    resources.destroy_buffer(&device, &mut buffer);
    resources.destroy(&device);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn host_visible_buffers_are_mapped() {
    let device = device(false);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();
    let mut buffer = resources
        .create_buffer(
            &device,
            "uniforms",
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUsage::HostVisible,
        )
        .unwrap();

    buffer.write_mapped(&[9u8; 64]).unwrap();
    assert_eq!(buffer.mapped_slice().unwrap(), &[9u8; 64][..]);
    assert!(buffer.write_mapped(&[0u8; 65]).is_err());

    resources.destroy_buffer(&device, &mut buffer);
    resources.destroy(&device);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn texture_upload_and_depth_image() {
    let device = device(true);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };

    let mut desc = ImageDesc::texture(extent, vk::Format::R8G8B8A8_SRGB);
    if !device.supports_linear_blit(desc.format) {
        desc.mip_levels = 1;
    }
    let mut texture = resources.create_image(&device, "texture", &desc).unwrap();
    resources.upload_image(&device, &texture, &checkerboard(64, 4)).unwrap();
    assert!(resources.upload_image(&device, &texture, &[0u8; 10]).is_err());

    let samples = choose_sample_count(4, device.usable_sample_counts());
    let mut depth = resources.create_depth_image(&device, extent, samples).unwrap();
    assert_eq!(depth.format, vk::Format::D32_SFLOAT);
    assert_eq!(depth.samples, samples);

    resources.destroy_image(&device, &mut depth);
    resources.destroy_image(&device, &mut texture);
    resources.destroy(&device);
    assert_eq!(device.validation_error_count(), 0);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn mip_chain_is_generated_for_odd_sizes() {
    let device = device(true);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();
    let desc = ImageDesc::texture(
        vk::Extent2D {
            width: 37,
            height: 12,
        },
        vk::Format::R8G8B8A8_SRGB,
    );
    if !device.supports_linear_blit(desc.format) {
        eprintln!("skipping: no linear blit for {:?}", desc.format);
        return;
    }

    let mut texture = resources.create_image(&device, "mipped", &desc).unwrap();
    assert_eq!(texture.mip_levels, mip_level_count(desc.extent));
    assert_eq!(texture.mip_levels, 6);
    resources.upload_image(&device, &texture, &pattern(37 * 12 * 4)).unwrap();

    let too_many = ImageDesc {
        mip_levels: 7,
        ..desc
    };
    assert!(matches!(
        resources.create_image(&device, "too many levels", &too_many),
        Err(RenderError::InvalidRequest(_))
    ));

    resources.destroy_image(&device, &mut texture);
    resources.destroy(&device);
    assert_eq!(device.validation_error_count(), 0);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn multisampled_targets_use_a_supported_count() {
    let device = device(true);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();
    let samples = choose_sample_count(64, device.usable_sample_counts());
    assert!(device.usable_sample_counts().contains(samples));

    let extent = vk::Extent2D {
        width: 320,
        height: 200,
    };
    let mut color = resources
        .create_image(
            &device,
            "msaa color",
            &ImageDesc::transient_color(extent, vk::Format::B8G8R8A8_SRGB, samples),
        )
        .unwrap();
    assert_eq!(color.samples, samples);
    assert_eq!(color.mip_levels, 1);

    resources.destroy_image(&device, &mut color);
    resources.destroy(&device);
    assert_eq!(device.validation_error_count(), 0);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn every_frame_set_binds_uniforms_and_texture() {
    const FRAMES: u32 = 3;
    let device = device(true);
    let resources = ResourceAllocator::new(&device, TIMEOUT).unwrap();

    let layout = DescriptorSetLayoutBuilder::new()
        .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
        .binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
        .build(&device)
        .unwrap();
    let mut descriptors = DescriptorAllocator::new(
        &device,
        &[
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: FRAMES,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: FRAMES,
            },
        ],
        FRAMES,
    )
    .unwrap();
    let sets = descriptors.allocate_sets(&device, &layout, FRAMES).unwrap();

    let mut desc = ImageDesc::texture(
        vk::Extent2D {
            width: 16,
            height: 16,
        },
        vk::Format::R8G8B8A8_SRGB,
    );
    if !device.supports_linear_blit(desc.format) {
        desc.mip_levels = 1;
    }
    let mut texture = resources.create_image(&device, "texture", &desc).unwrap();
    resources.upload_image(&device, &texture, &checkerboard(16, 2)).unwrap();
    let sampler = create_sampler(&device, texture.mip_levels).unwrap();

    let ubo_size = size_of::<UniformBufferObject>() as vk::DeviceSize;
    let mut uniforms = Vec::new();
    for &set in &sets {
        let buffer = resources
            .create_buffer(
                &device,
                "frame uniforms",
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryUsage::HostVisible,
            )
            .unwrap();
        assert!(buffer.mapped_slice().is_some());
        DescriptorAllocator::bind_uniform_buffer(&device, set, 0, buffer.buffer, ubo_size);
        DescriptorAllocator::bind_combined_image_sampler(&device, set, 1, texture.view, sampler);
        uniforms.push(buffer);
    }
    assert_eq!(descriptors.remaining_sets(), 0);

    for mut buffer in uniforms {
        resources.destroy_buffer(&device, &mut buffer);
    }
    unsafe { device.device.destroy_sampler(sampler, None) };
    resources.destroy_image(&device, &mut texture);
    descriptors.destroy(&device.device);
    layout.destroy(&device.device);
    resources.destroy(&device);
    assert_eq!(device.validation_error_count(), 0);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn descriptor_pool_holds_exactly_frames_in_flight_sets() {
    const FRAMES: u32 = 2;
    let device = device(true);

    let layout = DescriptorSetLayoutBuilder::new()
        .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
        .build(&device)
        .unwrap();
    let mut descriptors = DescriptorAllocator::new(
        &device,
        &[vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: FRAMES,
        }],
        FRAMES,
    )
    .unwrap();

    let sets = descriptors.allocate_sets(&device, &layout, FRAMES).unwrap();
    assert_eq!(sets.len(), FRAMES as usize);

    let err = descriptors.allocate_sets(&device, &layout, 1).unwrap_err();
    assert!(matches!(
        err,
        RenderError::DescriptorPoolExhausted {
            requested: 1,
            remaining: 0
        }
    ));

    descriptors.destroy(&device.device);
    layout.destroy(&device.device);
    assert_eq!(device.validation_error_count(), 0);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn validation_follows_the_flag() {
    let without = device(false);
    assert!(!without.validation_enabled());
    drop(without);

    // The layer may not be installed; when it is, it must be on.
    let with = device(true);
    if with.validation_enabled() {
        assert_eq!(with.validation_error_count(), 0);
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn unsignaled_fence_wait_times_out_as_device_lost() {
    let device = device(false);
    let sync = FrameSync::new(&device).unwrap();

    assert!(sync.is_signaled(&device).unwrap());
    sync.wait(&device, TIMEOUT).unwrap();

    sync.reset(&device).unwrap();
    let err = sync.wait(&device, Duration::from_millis(10)).unwrap_err();
    assert!(err.is_device_lost());

    sync.destroy(&device.device);
}

#[test]
#[ignore = "requires a Vulkan device and compiled shaders"]
fn pipeline_builds_against_attachment_formats() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
    let vert = dir.join("quad.vert.spv");
    let frag = dir.join("quad.frag.spv");
    if !vert.exists() || !frag.exists() {
        eprintln!("skipping: SPIR-V not built (glslc missing)");
        return;
    }

    let device = device(true);
    let layout = DescriptorSetLayoutBuilder::new()
        .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
        .binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
        .build(&device)
        .unwrap();
    let stages = [
        ShaderBinary::load(&vert, vk::ShaderStageFlags::VERTEX, "main").unwrap(),
        ShaderBinary::load(&frag, vk::ShaderStageFlags::FRAGMENT, "main").unwrap(),
    ];

    let samples = choose_sample_count(4, device.usable_sample_counts());
    for blend in [BlendState::Opaque, BlendState::AlphaBlend] {
        let pipeline = PipelineBuilder::new(
            &stages,
            Vertex::layout(),
            blend,
            AttachmentFormats {
                color: vk::Format::B8G8R8A8_SRGB,
                depth: Some(vk::Format::D32_SFLOAT),
                samples,
            },
        )
        .set_layouts(&[layout.layout])
        .push_constants(vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: size_of::<DrawConstants>() as u32,
        })
        .build(&device)
        .unwrap();
        pipeline.destroy(&device.device);
    }

    layout.destroy(&device.device);
    assert_eq!(device.validation_error_count(), 0);
}
