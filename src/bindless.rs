//! Bindless texture table.
//!
//! All sampled images live in one partially-bound descriptor array. Material
//! data stores plain `u32` slot indices instead of descriptor sets; shaders
//! index the array with `nonuniformEXT`. Slots are handed out by a free-list
//! allocator and recycled when a texture is released.

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Number of slots in the sampled-image array.
pub const BINDLESS_CAPACITY: u32 = 512;

/// Binding index of the sampled-image array inside the bindless set layout.
pub const BINDLESS_IMAGE_BINDING: u32 = 0;

/// Free-list slot allocator.
///
/// Freshly created it hands out 0, 1, 2, ... in order; freed slots go onto a
/// stack and are reused most-recently-freed first. Callers only observe that
/// live slots are unique and `< capacity`.
pub struct SlotAllocator {
    capacity: u32,
    next_fresh: u32,
    free: Vec<u32>,
}

impl SlotAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next_fresh: 0,
            free: Vec::new(),
        }
    }

    /// Take a slot. Panics when the table is exhausted; capacity is a
    /// compile-time sizing decision, not a runtime condition.
    pub fn push(&mut self) -> u32 {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        assert!(
            self.next_fresh < self.capacity,
            "bindless table exhausted ({} slots)",
            self.capacity
        );
        let slot = self.next_fresh;
        self.next_fresh += 1;
        slot
    }

    /// Return a slot to the free list.
    ///
    /// Panics on out-of-range or double free. Double frees would alias two
    /// live textures onto one slot later, which is exactly the corruption
    /// this table exists to prevent.
    pub fn free(&mut self, slot: u32) {
        assert!(slot < self.next_fresh, "freeing slot {slot} that was never allocated");
        assert!(!self.free.contains(&slot), "double free of bindless slot {slot}");
        self.free.push(slot);
    }

    pub fn live_count(&self) -> u32 {
        self.next_fresh - self.free.len() as u32
    }
}

/// The bindless descriptor set: pool, layout, set, and the slot allocator.
///
/// The array binding is `PARTIALLY_BOUND | UPDATE_AFTER_BIND`, so unwritten
/// slots are legal as long as shaders never index them. Set mutation happens
/// only between frames (after the frame fence wait), which is what makes
/// slot reuse safe without per-slot fences.
pub struct BindlessTable {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    allocator: SlotAllocator,
}

impl BindlessTable {
    pub fn new(device: &ash::Device) -> RenderResult<Self> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: BINDLESS_CAPACITY,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("bindless pool: {e}")))?;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(BINDLESS_IMAGE_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(BINDLESS_CAPACITY)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("bindless layout: {e}")))?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("bindless set: {e}")))?[0];

        log::info!("created bindless table with {BINDLESS_CAPACITY} sampled-image slots");

        Ok(Self {
            pool,
            layout,
            set,
            allocator: SlotAllocator::new(BINDLESS_CAPACITY),
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Allocate a slot and point it at `view`. The returned index is what
    /// material data carries into shaders.
    ///
    /// Must only be called between frames (after the frame fence wait).
    pub fn write_image(&mut self, device: &ash::Device, view: vk::ImageView) -> u32 {
        let slot = self.allocator.push();
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BINDLESS_IMAGE_BINDING)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };
        slot
    }

    /// Recycle a slot. The caller guarantees no in-flight frame still indexes
    /// it; with a single frame in flight that means the frame fence has been
    /// waited since the last frame that used it.
    pub fn release(&mut self, slot: u32) {
        self.allocator.free(slot);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fresh_slots_are_sequential() {
        let mut alloc = SlotAllocator::new(8);
        assert_eq!(alloc.push(), 0);
        assert_eq!(alloc.push(), 1);
        assert_eq!(alloc.push(), 2);
        assert_eq!(alloc.live_count(), 3);
    }

    #[test]
    fn test_freed_slot_reused_before_fresh() {
        let mut alloc = SlotAllocator::new(8);
        let a = alloc.push();
        let b = alloc.push();
        alloc.free(a);
        assert_eq!(alloc.push(), a);
        assert_eq!(alloc.push(), b + 1);
    }

    #[test]
    fn test_live_slots_unique() {
        let mut alloc = SlotAllocator::new(64);
        let mut live = HashSet::new();
        for _ in 0..32 {
            assert!(live.insert(alloc.push()));
        }
        // Churn: free half, reallocate, uniqueness must hold throughout.
        let freed: Vec<u32> = live.iter().copied().filter(|s| s % 2 == 0).collect();
        for slot in &freed {
            alloc.free(*slot);
            live.remove(slot);
        }
        for _ in 0..freed.len() {
            assert!(live.insert(alloc.push()));
        }
        assert!(live.iter().all(|s| *s < 64));
    }

    #[test]
    #[should_panic(expected = "bindless table exhausted")]
    fn test_exhaustion_panics() {
        let mut alloc = SlotAllocator::new(2);
        alloc.push();
        alloc.push();
        alloc.push();
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut alloc = SlotAllocator::new(2);
        let slot = alloc.push();
        alloc.free(slot);
        alloc.free(slot);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn test_free_unallocated_panics() {
        let mut alloc = SlotAllocator::new(8);
        alloc.free(5);
    }
}
