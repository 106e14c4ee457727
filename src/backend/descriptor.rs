// Descriptor sets
//
// The pool is sized once at setup and never grows. Capacity is tracked on
// the CPU so running out is reported the same way on every driver.

use super::error::{RenderError, RenderResult, VkResultExt};
use super::VulkanDevice;
use ash::vk;

/// CPU-side view of what a fixed pool can still hand out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolBudget {
    remaining_sets: u32,
    remaining_descriptors: Vec<(vk::DescriptorType, u32)>,
}

impl PoolBudget {
    pub fn new(sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Self {
        let mut remaining_descriptors: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for size in sizes {
            match remaining_descriptors.iter_mut().find(|(ty, _)| *ty == size.ty) {
                Some((_, count)) => *count += size.descriptor_count,
                None => remaining_descriptors.push((size.ty, size.descriptor_count)),
            }
        }
        Self {
            remaining_sets: max_sets,
            remaining_descriptors,
        }
    }

    pub fn remaining_sets(&self) -> u32 {
        self.remaining_sets
    }

    /// How many more sets with this per-set shape fit.
    pub fn sets_that_fit(&self, per_set: &[(vk::DescriptorType, u32)]) -> u32 {
        per_set
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(ty, count)| self.remaining_of(*ty) / count)
            .fold(self.remaining_sets, u32::min)
    }

    pub fn check(&self, sets: u32, per_set: &[(vk::DescriptorType, u32)]) -> RenderResult<()> {
        let fits = self.sets_that_fit(per_set);
        if sets > fits {
            return Err(RenderError::DescriptorPoolExhausted {
                requested: sets,
                remaining: fits,
            });
        }
        Ok(())
    }

    pub fn reserve(&mut self, sets: u32, per_set: &[(vk::DescriptorType, u32)]) -> RenderResult<()> {
        self.check(sets, per_set)?;
        self.remaining_sets -= sets;
        for (ty, count) in per_set {
            if let Some((_, remaining)) = self.remaining_descriptors.iter_mut().find(|(t, _)| t == ty) {
                *remaining -= count * sets;
            }
        }
        Ok(())
    }

    fn remaining_of(&self, ty: vk::DescriptorType) -> u32 {
        self.remaining_descriptors
            .iter()
            .find(|(t, _)| *t == ty)
            .map_or(0, |(_, count)| *count)
    }
}

pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    /// Descriptor count per type, used for pool accounting.
    pub per_set: Vec<(vk::DescriptorType, u32)>,
}

impl DescriptorSetLayout {
    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_set_layout(self.layout, None) };
    }
}

#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(mut self, binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    pub fn per_set(&self) -> Vec<(vk::DescriptorType, u32)> {
        let mut per_set: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for binding in &self.bindings {
            match per_set.iter_mut().find(|(ty, _)| *ty == binding.descriptor_type) {
                Some((_, count)) => *count += binding.descriptor_count,
                None => per_set.push((binding.descriptor_type, binding.descriptor_count)),
            }
        }
        per_set
    }

    pub fn build(&self, device: &VulkanDevice) -> RenderResult<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("creating descriptor set layout")?;
        Ok(DescriptorSetLayout {
            layout,
            per_set: self.per_set(),
        })
    }
}

pub struct DescriptorAllocator {
    pub pool: vk::DescriptorPool,
    budget: PoolBudget,
}

impl DescriptorAllocator {
    pub fn new(device: &VulkanDevice, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> RenderResult<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(max_sets);
        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("creating descriptor pool")?;
        log::debug!("Descriptor pool: {} sets, sizes {:?}", max_sets, sizes);
        Ok(Self {
            pool,
            budget: PoolBudget::new(sizes, max_sets),
        })
    }

    pub fn remaining_sets(&self) -> u32 {
        self.budget.remaining_sets()
    }

    /// Allocate `count` sets of one layout. Never grows the pool.
    pub fn allocate_sets(
        &mut self,
        device: &VulkanDevice,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> RenderResult<Vec<vk::DescriptorSet>> {
        self.budget.check(count, &layout.per_set)?;

        let layouts = vec![layout.layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        match unsafe { device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => {
                self.budget.reserve(count, &layout.per_set)?;
                Ok(sets)
            }
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                Err(RenderError::DescriptorPoolExhausted {
                    requested: count,
                    remaining: self.budget.sets_that_fit(&layout.per_set),
                })
            }
            Err(result) => Err(RenderError::from_vk("allocating descriptor sets", result)),
        }
    }

    /// Point `binding` of `set` at bytes `[0, range)` of `buffer`. Only call
    /// while no submitted work reads the set.
    pub fn bind_uniform_buffer(
        device: &VulkanDevice,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn bind_combined_image_sampler(
        device: &VulkanDevice,
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
    }

    /// Frees every set allocated from the pool.
    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// Linear, repeat-addressed sampler that filters across `mip_levels`
/// levels. Anisotropy is used when the device enabled it.
pub fn create_sampler(device: &VulkanDevice, mip_levels: u32) -> RenderResult<vk::Sampler> {
    let anisotropy = device.enabled_features.sampler_anisotropy;
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy {
            device.properties.limits.max_sampler_anisotropy
        } else {
            1.0
        })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .mip_lod_bias(0.0);
    unsafe { device.device.create_sampler(&sampler_info, None) }.context("creating sampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    const UBO: vk::DescriptorType = vk::DescriptorType::UNIFORM_BUFFER;
    const SAMPLER: vk::DescriptorType = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;

    fn frame_pool(frames: u32) -> PoolBudget {
        PoolBudget::new(
            &[
                vk::DescriptorPoolSize {
                    ty: UBO,
                    descriptor_count: frames,
                },
                vk::DescriptorPoolSize {
                    ty: SAMPLER,
                    descriptor_count: frames,
                },
            ],
            frames,
        )
    }

    #[test]
    fn pool_sized_for_frames_fits_exactly_that_many_sets() {
        let per_set = [(UBO, 1), (SAMPLER, 1)];
        let mut budget = frame_pool(2);
        budget.reserve(2, &per_set).unwrap();

        let err = budget.reserve(1, &per_set).unwrap_err();
        assert!(matches!(
            err,
            RenderError::DescriptorPoolExhausted {
                requested: 1,
                remaining: 0
            }
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn one_request_over_capacity_fails_without_consuming() {
        let per_set = [(UBO, 1)];
        let mut budget = frame_pool(2);
        assert!(budget.reserve(3, &per_set).is_err());
        assert_eq!(budget.remaining_sets(), 2);
        budget.reserve(2, &per_set).unwrap();
    }

    #[test]
    fn descriptor_counts_limit_before_set_count() {
        let budget = PoolBudget::new(
            &[vk::DescriptorPoolSize {
                ty: UBO,
                descriptor_count: 2,
            }],
            10,
        );
        assert_eq!(budget.sets_that_fit(&[(UBO, 1)]), 2);
        assert_eq!(budget.sets_that_fit(&[(UBO, 2)]), 1);
        assert_eq!(budget.sets_that_fit(&[(SAMPLER, 1)]), 0);
    }

    #[test]
    fn layout_builder_counts_descriptors_per_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .binding(0, UBO, vk::ShaderStageFlags::VERTEX)
            .binding(1, SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            .binding(2, UBO, vk::ShaderStageFlags::FRAGMENT);
        let per_set = builder.per_set();
        assert_eq!(per_set, vec![(UBO, 2), (SAMPLER, 1)]);
    }
}
