//! GPU resource wrappers and the per-frame resource sets.
//!
//! Two lifetimes exist here. [`FrameResources`] lives for the renderer's whole
//! life: uniform/instance/draw/misc/dispatch buffers, the cascaded shadow map
//! and the samplers. [`ResizableTargets`] is tied to the surface extent and is
//! destroyed and recreated wholesale on resize.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{RenderError, RenderResult};
use crate::gpu_data::{
    self, MeshBufferAddresses, Uniforms, CULLED_INSTANCES_BUFFER_SIZE, DISPATCH_BUFFER_SIZE,
    DRAW_CALLS_BUFFER_SIZE, MAX_INSTANCES, MAX_MESHES, MISC_BUFFER_SIZE, SHADOW_CASCADE_COUNT,
};

/// Shadow map resolution, per cascade layer.
pub const SHADOW_MAP_SIZE: u32 = 1024;

pub const SCENE_COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const VISBUFFER_FORMAT: vk::Format = vk::Format::R32_UINT;

/// A device buffer plus its allocation.
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    allocation: Allocation,
    pub size: u64,
}

impl AllocatedBuffer {
    pub fn new(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RenderResult<Self> {
        let buffer_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("{name}: {e}")))?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::ResourceCreationFailed(format!("{name}: {e}")))?;

        unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("{name}: {e}")))?;

        Ok(Self {
            buffer,
            allocation,
            size,
        })
    }

    /// Write into a host-visible allocation. Panics on GPU-only buffers or
    /// out-of-bounds writes.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let mapped = self
            .allocation
            .mapped_slice_mut()
            .expect("write into a buffer that is not host visible");
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
    }

    pub fn device_address(&self, device: &ash::Device) -> u64 {
        let info = vk::BufferDeviceAddressInfo {
            buffer: self.buffer,
            ..Default::default()
        };
        unsafe { device.get_buffer_device_address(&info) }
    }

    pub fn destroy(mut self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        let allocation = std::mem::take(&mut self.allocation);
        let _ = allocator.lock().free(allocation);
        unsafe { device.destroy_buffer(self.buffer, None) };
    }

    /// Disassemble for the retirement queue without destroying anything.
    pub fn into_parts(mut self) -> (vk::Buffer, Allocation) {
        (self.buffer, std::mem::take(&mut self.allocation))
    }
}

/// A device image, its allocation, and a full view.
pub struct ImageWithView {
    pub image: vk::Image,
    allocation: Allocation,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl ImageWithView {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        name: &str,
        format: vk::Format,
        extent: vk::Extent2D,
        array_layers: u32,
        usage: vk::ImageUsageFlags,
        aspect_mask: vk::ImageAspectFlags,
    ) -> RenderResult<Self> {
        let image_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            initial_layout: vk::ImageLayout::UNDEFINED,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("{name}: {e}")))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::ResourceCreationFailed(format!("{name}: {e}")))?;

        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
            .map_err(|e| RenderError::ResourceCreationFailed(format!("{name}: {e}")))?;

        let view = create_view(
            device,
            image,
            format,
            if array_layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            },
            aspect_mask,
            0,
            array_layers,
        )
        .map_err(|e| RenderError::ResourceCreationFailed(format!("{name} view: {e}")))?;

        Ok(Self {
            image,
            allocation,
            view,
            format,
            extent,
        })
    }

    pub fn destroy(mut self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        unsafe { device.destroy_image_view(self.view, None) };
        let allocation = std::mem::take(&mut self.allocation);
        let _ = allocator.lock().free(allocation);
        unsafe { device.destroy_image(self.image, None) };
    }

    pub fn into_parts(mut self) -> (vk::Image, vk::ImageView, Allocation) {
        (self.image, self.view, std::mem::take(&mut self.allocation))
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    view_type: vk::ImageViewType,
    aspect_mask: vk::ImageAspectFlags,
    base_array_layer: u32,
    layer_count: u32,
) -> Result<vk::ImageView, vk::Result> {
    let view_info = vk::ImageViewCreateInfo {
        image,
        view_type,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer,
            layer_count,
        },
        ..Default::default()
    };
    unsafe { device.create_image_view(&view_info, None) }
}

/// Surface-extent-sized render targets, destroyed and recreated on resize.
pub struct ResizableTargets {
    pub scene_color: ImageWithView,
    pub depth: ImageWithView,
    pub visbuffer: ImageWithView,
    pub extent: vk::Extent2D,
}

impl ResizableTargets {
    pub fn new(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let scene_color = ImageWithView::new(
            device,
            allocator,
            "scene color",
            SCENE_COLOR_FORMAT,
            extent,
            1,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;
        let depth = ImageWithView::new(
            device,
            allocator,
            "depth",
            DEPTH_FORMAT,
            extent,
            1,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
        )?;
        let visbuffer = ImageWithView::new(
            device,
            allocator,
            "visibility buffer",
            VISBUFFER_FORMAT,
            extent,
            1,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        log::info!("created render targets at {}x{}", extent.width, extent.height);

        Ok(Self {
            scene_color,
            depth,
            visbuffer,
            extent,
        })
    }

    pub fn destroy(self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        self.scene_color.destroy(device, allocator);
        self.depth.destroy(device, allocator);
        self.visbuffer.destroy(device, allocator);
    }
}

/// Long-lived frame resources: buffers the culling pipeline writes and reads,
/// the cascaded shadow map, and the samplers.
pub struct FrameResources {
    pub uniform_buffer: AllocatedBuffer,
    pub instance_buffer: AllocatedBuffer,
    pub culled_instance_buffer: AllocatedBuffer,
    pub draw_calls_buffer: AllocatedBuffer,
    pub misc_buffer: AllocatedBuffer,
    pub dispatch_buffer: AllocatedBuffer,
    pub mesh_table_buffer: AllocatedBuffer,
    pub shadow_map: ImageWithView,
    /// One view per cascade layer, for per-cascade attachment binding.
    pub shadow_layer_views: Vec<vk::ImageView>,
    pub nearest_sampler: vk::Sampler,
    pub linear_sampler: vk::Sampler,
    pub shadow_sampler: vk::Sampler,
}

impl FrameResources {
    pub fn new(device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) -> RenderResult<Self> {
        let uniform_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "uniforms",
            std::mem::size_of::<Uniforms>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        let instance_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "instances",
            MAX_INSTANCES * std::mem::size_of::<gpu_data::Instance>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        let culled_instance_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "culled instances",
            CULLED_INSTANCES_BUFFER_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        )?;
        let draw_calls_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "draw calls",
            DRAW_CALLS_BUFFER_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        let misc_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "misc storage",
            MISC_BUFFER_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        let dispatch_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "dispatch args",
            DISPATCH_BUFFER_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        let mesh_table_buffer = AllocatedBuffer::new(
            device,
            allocator,
            "mesh table",
            MAX_MESHES * std::mem::size_of::<MeshBufferAddresses>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        let shadow_map = ImageWithView::new(
            device,
            allocator,
            "shadow map",
            DEPTH_FORMAT,
            vk::Extent2D {
                width: SHADOW_MAP_SIZE,
                height: SHADOW_MAP_SIZE,
            },
            SHADOW_CASCADE_COUNT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
        )?;
        let mut shadow_layer_views = Vec::with_capacity(SHADOW_CASCADE_COUNT as usize);
        for layer in 0..SHADOW_CASCADE_COUNT {
            let view = create_view(
                device,
                shadow_map.image,
                DEPTH_FORMAT,
                vk::ImageViewType::TYPE_2D,
                vk::ImageAspectFlags::DEPTH,
                layer,
                1,
            )
            .map_err(|e| {
                RenderError::ResourceCreationFailed(format!("shadow layer view {layer}: {e}"))
            })?;
            shadow_layer_views.push(view);
        }

        let nearest_sampler = create_sampler(device, vk::Filter::NEAREST, None)?;
        let linear_sampler = create_sampler(device, vk::Filter::LINEAR, None)?;
        let shadow_sampler = create_sampler(device, vk::Filter::LINEAR, Some(vk::CompareOp::GREATER))?;

        Ok(Self {
            uniform_buffer,
            instance_buffer,
            culled_instance_buffer,
            draw_calls_buffer,
            misc_buffer,
            dispatch_buffer,
            mesh_table_buffer,
            shadow_map,
            shadow_layer_views,
            nearest_sampler,
            linear_sampler,
            shadow_sampler,
        })
    }

    pub fn destroy(self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        unsafe {
            device.destroy_sampler(self.nearest_sampler, None);
            device.destroy_sampler(self.linear_sampler, None);
            device.destroy_sampler(self.shadow_sampler, None);
            for view in &self.shadow_layer_views {
                device.destroy_image_view(*view, None);
            }
        }
        self.shadow_map.destroy(device, allocator);
        self.uniform_buffer.destroy(device, allocator);
        self.instance_buffer.destroy(device, allocator);
        self.culled_instance_buffer.destroy(device, allocator);
        self.draw_calls_buffer.destroy(device, allocator);
        self.misc_buffer.destroy(device, allocator);
        self.dispatch_buffer.destroy(device, allocator);
        self.mesh_table_buffer.destroy(device, allocator);
    }
}

fn create_sampler(
    device: &ash::Device,
    filter: vk::Filter,
    compare: Option<vk::CompareOp>,
) -> RenderResult<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo {
        mag_filter: filter,
        min_filter: filter,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        compare_enable: if compare.is_some() { vk::TRUE } else { vk::FALSE },
        compare_op: compare.unwrap_or(vk::CompareOp::ALWAYS),
        min_lod: 0.0,
        max_lod: vk::LOD_CLAMP_NONE,
        border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
        ..Default::default()
    };
    unsafe { device.create_sampler(&sampler_info, None) }
        .map_err(|e| RenderError::ResourceCreationFailed(format!("sampler: {e}")))
}

// ---------------------------------------------------------------------------
// Main descriptor set bindings. Static bindings survive resize; resize
// bindings are rewritten whenever ResizableTargets is recreated.
// ---------------------------------------------------------------------------

pub const BINDING_UNIFORMS: u32 = 0;
pub const BINDING_INSTANCES: u32 = 1;
pub const BINDING_CULLED_INSTANCES: u32 = 2;
pub const BINDING_DRAW_CALLS: u32 = 3;
pub const BINDING_MISC: u32 = 4;
pub const BINDING_DISPATCH: u32 = 5;
pub const BINDING_SHADOW_MAP: u32 = 6;
pub const BINDING_SCENE_COLOR_STORAGE: u32 = 7;
pub const BINDING_DEPTH_SAMPLED: u32 = 8;
pub const BINDING_VISBUFFER_STORAGE: u32 = 9;
pub const BINDING_MESH_TABLE: u32 = 10;
pub const BINDING_NEAREST_SAMPLER: u32 = 11;
pub const BINDING_LINEAR_SAMPLER: u32 = 12;
pub const BINDING_SHADOW_SAMPLER: u32 = 13;

/// Create the frame descriptor set layout, its pool and the single set.
pub fn create_frame_descriptor_set(
    device: &ash::Device,
) -> RenderResult<(vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet)> {
    let all_stages = vk::ShaderStageFlags::COMPUTE
        | vk::ShaderStageFlags::VERTEX
        | vk::ShaderStageFlags::FRAGMENT;
    let compute_fragment = vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::FRAGMENT;

    let binding = |index: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags| {
        vk::DescriptorSetLayoutBinding::default()
            .binding(index)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stages)
    };

    let bindings = [
        binding(BINDING_UNIFORMS, vk::DescriptorType::UNIFORM_BUFFER, all_stages),
        binding(BINDING_INSTANCES, vk::DescriptorType::STORAGE_BUFFER, all_stages),
        binding(BINDING_CULLED_INSTANCES, vk::DescriptorType::STORAGE_BUFFER, all_stages),
        binding(BINDING_DRAW_CALLS, vk::DescriptorType::STORAGE_BUFFER, all_stages),
        binding(BINDING_MISC, vk::DescriptorType::STORAGE_BUFFER, all_stages),
        binding(BINDING_DISPATCH, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
        binding(BINDING_SHADOW_MAP, vk::DescriptorType::SAMPLED_IMAGE, compute_fragment),
        binding(BINDING_SCENE_COLOR_STORAGE, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE),
        binding(BINDING_DEPTH_SAMPLED, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::COMPUTE),
        binding(BINDING_VISBUFFER_STORAGE, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE),
        binding(BINDING_MESH_TABLE, vk::DescriptorType::STORAGE_BUFFER, all_stages),
        binding(BINDING_NEAREST_SAMPLER, vk::DescriptorType::SAMPLER, compute_fragment),
        binding(BINDING_LINEAR_SAMPLER, vk::DescriptorType::SAMPLER, compute_fragment),
        binding(BINDING_SHADOW_SAMPLER, vk::DescriptorType::SAMPLER, compute_fragment),
    ];

    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(|e| RenderError::ResourceCreationFailed(format!("frame set layout: {e}")))?;

    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 7,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLER,
            descriptor_count: 3,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&pool_sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
        .map_err(|e| RenderError::ResourceCreationFailed(format!("frame set pool: {e}")))?;

    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
        .map_err(|e| RenderError::ResourceCreationFailed(format!("frame set: {e}")))?[0];

    Ok((layout, pool, set))
}

fn buffer_write<'a>(
    set: vk::DescriptorSet,
    binding: u32,
    ty: vk::DescriptorType,
    info: &'a [vk::DescriptorBufferInfo],
) -> vk::WriteDescriptorSet<'a> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .buffer_info(info)
}

fn sampler_write<'a>(
    set: vk::DescriptorSet,
    binding: u32,
    info: &'a [vk::DescriptorImageInfo],
) -> vk::WriteDescriptorSet<'a> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::SAMPLER)
        .image_info(info)
}

/// Write the bindings that never change after startup.
pub fn write_static_descriptors(
    device: &ash::Device,
    set: vk::DescriptorSet,
    resources: &FrameResources,
) {
    let uniforms = [vk::DescriptorBufferInfo {
        buffer: resources.uniform_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let instances = [vk::DescriptorBufferInfo {
        buffer: resources.instance_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let culled = [vk::DescriptorBufferInfo {
        buffer: resources.culled_instance_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let draw_calls = [vk::DescriptorBufferInfo {
        buffer: resources.draw_calls_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let misc = [vk::DescriptorBufferInfo {
        buffer: resources.misc_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let dispatch = [vk::DescriptorBufferInfo {
        buffer: resources.dispatch_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let mesh_table = [vk::DescriptorBufferInfo {
        buffer: resources.mesh_table_buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let shadow = [vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: resources.shadow_map.view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];
    let sampler_info = |sampler: vk::Sampler| {
        [vk::DescriptorImageInfo {
            sampler,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }]
    };
    let nearest = sampler_info(resources.nearest_sampler);
    let linear = sampler_info(resources.linear_sampler);
    let shadow_cmp = sampler_info(resources.shadow_sampler);

    let writes = [
        buffer_write(set, BINDING_UNIFORMS, vk::DescriptorType::UNIFORM_BUFFER, &uniforms),
        buffer_write(set, BINDING_INSTANCES, vk::DescriptorType::STORAGE_BUFFER, &instances),
        buffer_write(set, BINDING_CULLED_INSTANCES, vk::DescriptorType::STORAGE_BUFFER, &culled),
        buffer_write(set, BINDING_DRAW_CALLS, vk::DescriptorType::STORAGE_BUFFER, &draw_calls),
        buffer_write(set, BINDING_MISC, vk::DescriptorType::STORAGE_BUFFER, &misc),
        buffer_write(set, BINDING_DISPATCH, vk::DescriptorType::STORAGE_BUFFER, &dispatch),
        buffer_write(set, BINDING_MESH_TABLE, vk::DescriptorType::STORAGE_BUFFER, &mesh_table),
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_SHADOW_MAP)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&shadow),
        sampler_write(set, BINDING_NEAREST_SAMPLER, &nearest),
        sampler_write(set, BINDING_LINEAR_SAMPLER, &linear),
        sampler_write(set, BINDING_SHADOW_SAMPLER, &shadow_cmp),
    ];
    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

/// Rewrite the extent-dependent bindings after (re)creating the targets.
pub fn write_resize_descriptors(
    device: &ash::Device,
    set: vk::DescriptorSet,
    targets: &ResizableTargets,
) {
    let scene_color = [vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: targets.scene_color.view,
        image_layout: vk::ImageLayout::GENERAL,
    }];
    let depth = [vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: targets.depth.view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];
    let visbuffer = [vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: targets.visbuffer.view,
        image_layout: vk::ImageLayout::GENERAL,
    }];

    let writes = [
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_SCENE_COLOR_STORAGE)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&scene_color),
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_DEPTH_SAMPLED)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&depth),
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_VISBUFFER_STORAGE)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&visbuffer),
    ];
    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_indices_are_distinct() {
        let bindings = [
            BINDING_UNIFORMS,
            BINDING_INSTANCES,
            BINDING_CULLED_INSTANCES,
            BINDING_DRAW_CALLS,
            BINDING_MISC,
            BINDING_DISPATCH,
            BINDING_SHADOW_MAP,
            BINDING_SCENE_COLOR_STORAGE,
            BINDING_DEPTH_SAMPLED,
            BINDING_VISBUFFER_STORAGE,
            BINDING_MESH_TABLE,
            BINDING_NEAREST_SAMPLER,
            BINDING_LINEAR_SAMPLER,
            BINDING_SHADOW_SAMPLER,
        ];
        let mut sorted = bindings.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), bindings.len());
    }

    #[test]
    fn test_target_formats() {
        assert_eq!(SCENE_COLOR_FORMAT, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(DEPTH_FORMAT, vk::Format::D32_SFLOAT);
        assert_eq!(VISBUFFER_FORMAT, vk::Format::R32_UINT);
    }
}
