//! egui integration for the UI pass.
//!
//! The orchestrator's UI pass opens a dynamic rendering scope on the
//! swapchain image (LOAD/STORE, no clear) and hands the command buffer to
//! [`UiIntegration::paint`]. Everything else — input, layout, tessellation —
//! happens outside command recording.

use ash::vk;
use egui_ash_renderer::{DynamicRendering, Options, Renderer};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use std::sync::{Arc, Mutex};
use winit::event::WindowEvent;
use winit::window::Window;

use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// egui context, input state and the Vulkan paint backend.
pub struct UiIntegration {
    ctx: egui::Context,
    winit_state: egui_winit::State,
    // Dropped in this order: the renderer holds buffers from the allocator.
    renderer: Option<Renderer>,
    allocator: Option<Arc<Mutex<Allocator>>>,
    paint_jobs: Vec<egui::ClippedPrimitive>,
    textures_delta: egui::TexturesDelta,
}

impl UiIntegration {
    /// `swapchain_format` must match the format the UI pass renders into.
    pub fn new(
        context: &DeviceContext,
        window: &Window,
        swapchain_format: vk::Format,
    ) -> RenderResult<Self> {
        let ctx = egui::Context::default();
        let winit_state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
        );

        // egui-ash-renderer wants an allocator behind a std Mutex, so it gets
        // its own small one instead of sharing the renderer's parking_lot
        // allocator.
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            RenderError::InitializationFailed(format!("failed to create UI allocator: {e}"))
        })?;
        let allocator = Arc::new(Mutex::new(allocator));

        let renderer = Renderer::with_gpu_allocator(
            allocator.clone(),
            context.device.clone(),
            DynamicRendering {
                color_attachment_format: swapchain_format,
                depth_attachment_format: None,
            },
            Options {
                srgb_framebuffer: false,
                ..Default::default()
            },
        )
        .map_err(|e| {
            RenderError::InitializationFailed(format!("failed to create UI renderer: {e}"))
        })?;

        Ok(Self {
            ctx,
            winit_state,
            renderer: Some(renderer),
            allocator: Some(allocator),
            paint_jobs: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
        })
    }

    /// Feed a window event to egui. Returns true when egui consumed it.
    pub fn on_window_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        self.winit_state.on_window_event(window, event).consumed
    }

    /// Run the UI closure for this frame and tessellate the output.
    pub fn run(&mut self, window: &Window, mut build_ui: impl FnMut(&egui::Context)) {
        let raw_input = self.winit_state.take_egui_input(window);
        let full_output = self.ctx.run(raw_input, |ctx| build_ui(ctx));

        self.winit_state
            .handle_platform_output(window, full_output.platform_output);
        self.paint_jobs = self
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);
        self.textures_delta.append(full_output.textures_delta);
    }

    /// Record the UI draw into `cmd`.
    ///
    /// # Safety
    ///
    /// `cmd` must be recording, inside a dynamic rendering scope whose color
    /// attachment matches the format this integration was created with.
    pub unsafe fn paint(
        &mut self,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
    ) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        if !self.textures_delta.set.is_empty() {
            let set: Vec<_> = self.textures_delta.set.drain(..).collect();
            if let Err(e) = renderer.set_textures(queue, command_pool, &set) {
                log::error!("failed to upload UI textures: {e}");
            }
        }

        if let Err(e) = renderer.cmd_draw(cmd, extent, self.ctx.pixels_per_point(), &self.paint_jobs)
        {
            log::error!("failed to record UI draw: {e}");
        }

        if !self.textures_delta.free.is_empty() {
            let free: Vec<_> = self.textures_delta.free.drain(..).collect();
            if let Err(e) = renderer.free_textures(&free) {
                log::error!("failed to free UI textures: {e}");
            }
        }
    }

    /// Release GPU resources. Must run before the device is destroyed; the
    /// caller guarantees the device is idle.
    pub fn destroy(&mut self) {
        self.renderer = None;
        self.allocator = None;
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }

    pub fn wants_pointer_input(&self) -> bool {
        self.ctx.wants_pointer_input()
    }
}

impl Drop for UiIntegration {
    fn drop(&mut self) {
        if self.renderer.is_some() {
            log::warn!("UiIntegration dropped without destroy(); device may already be gone");
        }
    }
}
