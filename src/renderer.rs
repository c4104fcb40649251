//! The top-level renderer.
//!
//! Owns every collaborator — device, swapchain, frame resources, bindless
//! table, pipelines, UI — and runs the frame loop body: resize check, fence
//! wait, retirement drain, uploads, acquire, program build + record, submit,
//! present. One frame in flight; the frame fence is the single source of
//! truth for "the GPU is done with last frame".

use ash::vk;
use glam::{Vec2, Vec3};
use winit::window::Window;

use crate::bindless::BindlessTable;
use crate::camera::Camera;
use crate::deferred::{RetiredResource, RetirementQueue};
use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};
use crate::gpu_data::{Instance, MeshBufferAddresses, MAX_INSTANCES, MAX_MESHES};
use crate::meshlet::{MeshletData, MeshletIndices};
use crate::orchestrator::{self, RecordContext};
use crate::pipelines::Pipelines;
use crate::resize::{ResizeState, SurfaceTracker};
use crate::resources::{
    self, AllocatedBuffer, FrameResources, ImageWithView, ResizableTargets,
};
use crate::swapchain::Swapchain;
use crate::ui::UiIntegration;

/// Per-frame synchronization objects and the command buffer, for the single
/// frame in flight.
struct FrameSync {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    /// Created signaled so the first frame's wait is a no-op.
    frame_fence: vk::Fence,
}

impl FrameSync {
    fn new(device: &ash::Device, queue_family: u32) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }?[0];

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }?;
        let render_finished = unsafe { device.create_semaphore(&semaphore_info, None) }?;

        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let frame_fence = unsafe { device.create_fence(&fence_info, None) }?;

        Ok(Self {
            command_pool,
            command_buffer,
            image_available,
            render_finished,
            frame_fence,
        })
    }

    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.frame_fence, None);
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// CPU-side mesh data handed to [`Renderer::register_mesh`]. The attribute
/// slices must all have the same length.
pub struct MeshBuffers<'a> {
    pub positions: &'a [Vec3],
    pub normals: &'a [Vec3],
    pub uvs: &'a [Vec2],
    pub meshlets: &'a MeshletData,
}

/// GPU buffers of one registered mesh. Shaders reach them through the
/// address table, so nothing here is bound per draw.
struct RegisteredMesh {
    buffers: Vec<AllocatedBuffer>,
}

/// Builds the pipeline set once the descriptor interface exists. Shader
/// compilation and pipeline construction live outside the core.
pub type PipelineBuilder<'a> = dyn FnOnce(
        &ash::Device,
        &[vk::DescriptorSetLayout; 2],
        vk::Format,
    ) -> RenderResult<Pipelines>
    + 'a;

pub struct Renderer {
    context: DeviceContext,
    surface_format: vk::SurfaceFormatKHR,
    swapchain: Swapchain,
    tracker: SurfaceTracker,
    resources: FrameResources,
    targets: ResizableTargets,
    bindless: BindlessTable,
    pipelines: Pipelines,
    frame_set_layout: vk::DescriptorSetLayout,
    frame_pool: vk::DescriptorPool,
    frame_set: vk::DescriptorSet,
    sync: FrameSync,
    retirement: RetirementQueue,
    ui: UiIntegration,
    meshes: Vec<RegisteredMesh>,
    pending_instances: Option<Vec<Instance>>,
    instance_count: u32,
    pub camera: Camera,
    pub sun_direction: Vec3,
}

impl Renderer {
    pub fn new(
        window: &Window,
        validation: bool,
        build_pipelines: Box<PipelineBuilder<'_>>,
    ) -> RenderResult<Self> {
        let context = DeviceContext::new(window, validation)?;
        let device = &context.device;

        let capabilities = context.surface_capabilities()?;
        let surface_format = context.surface_format()?;
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device,
            &context.swapchain_loader,
            context.surface,
            &capabilities,
            surface_format,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            vk::SwapchainKHR::null(),
        )?;

        let resources = FrameResources::new(device, &context.allocator)?;
        let targets = ResizableTargets::new(device, &context.allocator, swapchain.extent)?;
        let bindless = BindlessTable::new(device)?;

        let (frame_set_layout, frame_pool, frame_set) =
            resources::create_frame_descriptor_set(device)?;
        resources::write_static_descriptors(device, frame_set, &resources);
        resources::write_resize_descriptors(device, frame_set, &targets);

        let pipelines = build_pipelines(
            device,
            &[frame_set_layout, bindless.layout()],
            surface_format.format,
        )?;

        let sync = FrameSync::new(device, context.queue_family)?;
        let ui = UiIntegration::new(&context, window, surface_format.format)?;
        let tracker = SurfaceTracker::new((swapchain.extent.width, swapchain.extent.height));

        log::info!(
            "renderer initialized at {}x{}",
            swapchain.extent.width,
            swapchain.extent.height
        );

        Ok(Self {
            context,
            surface_format,
            swapchain,
            tracker,
            resources,
            targets,
            bindless,
            pipelines,
            frame_set_layout,
            frame_pool,
            frame_set,
            sync,
            retirement: RetirementQueue::new(),
            ui,
            meshes: Vec::new(),
            pending_instances: None,
            instance_count: 0,
            camera: Camera::default(),
            sun_direction: Vec3::new(0.4, -1.0, 0.3),
        })
    }

    pub fn ui_context(&self) -> &egui::Context {
        self.ui.context()
    }

    /// Feed a window event to the UI. Returns true when the UI consumed it.
    pub fn on_window_event(&mut self, window: &Window, event: &winit::event::WindowEvent) -> bool {
        self.ui.on_window_event(window, event)
    }

    /// Upload a mesh's buffers and record their device addresses in the mesh
    /// table. The returned index is what [`Instance::mesh_index`] refers to.
    ///
    /// Meshes are expected to be registered during startup, before the first
    /// frame is recorded.
    pub fn register_mesh(&mut self, mesh: &MeshBuffers<'_>) -> RenderResult<u32> {
        assert!(
            (self.meshes.len() as u64) < MAX_MESHES,
            "mesh table exhausted ({MAX_MESHES} meshes)"
        );
        assert!(!mesh.positions.is_empty(), "mesh has no vertices");
        assert_eq!(mesh.positions.len(), mesh.normals.len());
        assert_eq!(mesh.positions.len(), mesh.uvs.len());

        let index = self.meshes.len() as u32;
        let name = |suffix: &str| format!("mesh {index} {suffix}");

        let positions = self.upload(&name("positions"), bytemuck::cast_slice(mesh.positions))?;
        let normals = self.upload(&name("normals"), bytemuck::cast_slice(mesh.normals))?;
        let uvs = self.upload(&name("uvs"), bytemuck::cast_slice(mesh.uvs))?;
        let indices = match &mesh.meshlets.indices {
            MeshletIndices::U16(v) => self.upload(&name("indices"), bytemuck::cast_slice(v))?,
            MeshletIndices::U32(v) => self.upload(&name("indices"), bytemuck::cast_slice(v))?,
        };
        let micro_indices = self.upload(&name("micro indices"), &mesh.meshlets.micro_indices)?;
        let meshlets = self.upload(
            &name("meshlets"),
            bytemuck::cast_slice(&mesh.meshlets.meshlets),
        )?;

        let device = &self.context.device;
        let addresses = MeshBufferAddresses {
            positions: positions.device_address(device),
            normals: normals.device_address(device),
            uvs: uvs.device_address(device),
            indices: indices.device_address(device),
            micro_indices: micro_indices.device_address(device),
            meshlets: meshlets.device_address(device),
            meshlet_count: mesh.meshlets.meshlets.len() as u32,
            index_width_32: matches!(mesh.meshlets.indices, MeshletIndices::U32(_)) as u32,
        };
        self.resources.mesh_table_buffer.write(
            index as u64 * std::mem::size_of::<MeshBufferAddresses>() as u64,
            bytemuck::bytes_of(&addresses),
        );

        log::debug!(
            "registered mesh {index}: {} meshlets, {} triangles",
            addresses.meshlet_count,
            mesh.meshlets.triangle_count()
        );

        self.meshes.push(RegisteredMesh {
            buffers: vec![positions, normals, uvs, indices, micro_indices, meshlets],
        });
        Ok(index)
    }

    fn upload(&self, name: &str, bytes: &[u8]) -> RenderResult<AllocatedBuffer> {
        let mut buffer = AllocatedBuffer::new(
            &self.context.device,
            &self.context.allocator,
            name,
            bytes.len().max(4) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            gpu_allocator::MemoryLocation::CpuToGpu,
        )?;
        buffer.write(0, bytes);
        Ok(buffer)
    }

    /// Expose a sampled image to shaders; returns its bindless slot.
    pub fn register_texture(&mut self, view: vk::ImageView) -> u32 {
        self.bindless.write_image(&self.context.device, view)
    }

    /// Recycle a texture's bindless slot and retire its resources against the
    /// current frame fence.
    pub fn retire_texture(&mut self, texture: ImageWithView, slot: u32) {
        self.bindless.release(slot);
        let (image, view, allocation) = texture.into_parts();
        self.retirement.retire(
            self.sync.frame_fence,
            vec![RetiredResource::Image {
                image,
                view,
                allocation: Some(allocation),
            }],
        );
    }

    /// Replace the instance list. Uploaded at the top of the next frame,
    /// after the fence wait, so an in-flight frame never sees a partial
    /// write.
    pub fn set_instances(&mut self, instances: &[Instance]) {
        assert!(
            instances.len() as u64 <= MAX_INSTANCES,
            "instance count {} exceeds capacity {MAX_INSTANCES}",
            instances.len()
        );
        self.pending_instances = Some(instances.to_vec());
    }

    /// Record and submit one frame. `build_ui` runs the UI for this frame.
    ///
    /// A stale surface is handled internally: the frame is skipped and the
    /// resize path runs at the top of the next call.
    pub fn render_frame(
        &mut self,
        window: &Window,
        build_ui: impl FnMut(&egui::Context),
    ) -> RenderResult<()> {
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        if self.tracker.poll((size.width, size.height)) {
            self.recreate_surface()?;
        }

        let device = &self.context.device;
        unsafe {
            device.wait_for_fences(&[self.sync.frame_fence], true, u64::MAX)?;
            device.reset_command_pool(
                self.sync.command_pool,
                vk::CommandPoolResetFlags::empty(),
            )?;
        }
        self.retirement.drain(device, &self.context.allocator);

        // GPU idle for our frame slot: uploads are race-free now.
        if let Some(instances) = self.pending_instances.take() {
            self.instance_count = instances.len() as u32;
            if !instances.is_empty() {
                self.resources
                    .instance_buffer
                    .write(0, bytemuck::cast_slice(&instances));
            }
        }
        let extent = self.swapchain.extent;
        let uniforms = self.camera.uniforms(
            (extent.width, extent.height),
            self.instance_count,
            self.sun_direction,
        );
        self.resources
            .uniform_buffer
            .write(0, bytemuck::bytes_of(&uniforms));

        let image_index = match self
            .swapchain
            .acquire(&self.context.swapchain_loader, self.sync.image_available)
        {
            Ok(index) => index,
            Err(RenderError::SurfaceOutdated) => {
                self.tracker.mark_surface_lost();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.ui.run(window, build_ui);
        if self.tracker.state() == ResizeState::Created {
            self.tracker.mark_in_use();
        }

        let program = orchestrator::build_frame_program(extent, self.instance_count);
        if cfg!(debug_assertions) {
            if let Err(errors) = orchestrator::validate(&program) {
                panic!("frame program failed replay validation: {errors:#?}");
            }
        }

        let device = &self.context.device;
        let cmd = self.sync.command_buffer;
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        {
            let ui = &mut self.ui;
            let queue = self.context.queue;
            let pool = self.sync.command_pool;
            let mut ui_paint = |cmd: vk::CommandBuffer| unsafe {
                ui.paint(queue, pool, cmd, extent);
            };
            let mut ctx = RecordContext {
                device,
                cmd,
                pipelines: &self.pipelines,
                frame_set: self.frame_set,
                bindless_set: self.bindless.set(),
                resources: &self.resources,
                targets: &self.targets,
                swapchain_image: self.swapchain.images[image_index as usize],
                swapchain_view: self.swapchain.image_views[image_index as usize],
                queue_family: self.context.queue_family,
                ui_paint: &mut ui_paint,
            };
            unsafe { orchestrator::record(&program, &mut ctx) };
        }

        unsafe {
            device.end_command_buffer(cmd)?;
            device.reset_fences(&[self.sync.frame_fence])?;

            let wait_semaphores = [self.sync.image_available];
            let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
            let command_buffers = [cmd];
            let signal_semaphores = [self.sync.render_finished];
            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);
            device
                .queue_submit(self.context.queue, &[submit_info], self.sync.frame_fence)
                .map_err(|e| RenderError::SubmitFailed(format!("{e:?}")))?;
        }

        match self.swapchain.present(
            &self.context.swapchain_loader,
            self.context.queue,
            self.sync.render_finished,
            image_index,
        ) {
            Ok(()) => Ok(()),
            Err(RenderError::SurfaceOutdated) => {
                self.tracker.mark_surface_lost();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop-the-world surface recreation: wait-idle, destroy the whole
    /// extent-dependent generation, recreate at the pending extent, rewrite
    /// the extent-dependent descriptors.
    fn recreate_surface(&mut self) -> RenderResult<()> {
        let (width, height) = self.tracker.pending_extent().unwrap_or(self.tracker.extent());
        self.context.wait_idle();

        let device = &self.context.device;
        let capabilities = self.context.surface_capabilities()?;
        let new_swapchain = Swapchain::new(
            device,
            &self.context.swapchain_loader,
            self.context.surface,
            &capabilities,
            self.surface_format,
            vk::Extent2D { width, height },
            self.swapchain.handle,
        )?;
        let mut old_swapchain = std::mem::replace(&mut self.swapchain, new_swapchain);
        old_swapchain.destroy(device, &self.context.swapchain_loader);
        if self.tracker.state() == ResizeState::PendingDestroy {
            self.tracker.mark_destroyed();
        }

        let new_targets =
            ResizableTargets::new(device, &self.context.allocator, self.swapchain.extent)?;
        let old_targets = std::mem::replace(&mut self.targets, new_targets);
        old_targets.destroy(device, &self.context.allocator);

        resources::write_resize_descriptors(device, self.frame_set, &self.targets);

        self.tracker
            .mark_recreated((self.swapchain.extent.width, self.swapchain.extent.height));
        Ok(())
    }

    /// Tear everything down in dependency order. The device goes last.
    pub fn destroy(mut self) {
        self.context.wait_idle();

        unsafe {
            self.retirement
                .flush_all(&self.context.device, &self.context.allocator);
        }
        self.ui.destroy();

        let device = &self.context.device;
        for mesh in self.meshes.drain(..) {
            for buffer in mesh.buffers {
                buffer.destroy(device, &self.context.allocator);
            }
        }
        self.targets.destroy(device, &self.context.allocator);
        self.resources.destroy(device, &self.context.allocator);
        self.swapchain.destroy(device, &self.context.swapchain_loader);
        self.bindless.destroy(device);
        self.pipelines.destroy(device);
        unsafe {
            device.destroy_descriptor_pool(self.frame_pool, None);
            device.destroy_descriptor_set_layout(self.frame_set_layout, None);
        }
        self.sync.destroy(device);

        self.context.destroy();
    }
}
