//! Swapchain creation, acquisition and presentation.
//!
//! A stale surface is never fatal here: `ERROR_OUT_OF_DATE_KHR` from acquire
//! or present surfaces as [`RenderError::SurfaceOutdated`], which the frame
//! loop answers by running the resize path on the next iteration.

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Swapchain images and views for one surface extent generation.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &ash::Device,
        loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        let image_count =
            (capabilities.min_image_count + 1).min(if capabilities.max_image_count > 0 {
                capabilities.max_image_count
            } else {
                u32::MAX
            });

        let extent = vk::Extent2D {
            width: extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        };

        // STORAGE because the display transform writes the swapchain image
        // from a compute shader; COLOR_ATTACHMENT for the UI pass.
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }?;
        let images = unsafe { loader.get_swapchain_images(handle) }?;

        let image_views: Vec<vk::ImageView> = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo {
                    image,
                    view_type: vk::ImageViewType::TYPE_2D,
                    format: surface_format.format,
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                };
                unsafe { device.create_image_view(&view_info, None) }
            })
            .collect::<Result<_, _>>()?;

        log::info!(
            "created swapchain {}x{} with {} images",
            extent.width,
            extent.height,
            images.len()
        );

        Ok(Self {
            handle,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    /// Acquire the next presentable image, signaling `semaphore` when it is
    /// ready. A stale surface maps to `SurfaceOutdated`.
    pub fn acquire(
        &self,
        loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> RenderResult<u32> {
        let (index, suboptimal) = unsafe {
            loader.acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        }?;
        if suboptimal {
            log::debug!("acquired suboptimal swapchain image");
        }
        Ok(index)
    }

    /// Queue the image for presentation after `wait_semaphore`. Suboptimal
    /// presents succeed; a stale surface maps to `SurfaceOutdated`.
    pub fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
    ) -> RenderResult<()> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("presented to suboptimal swapchain");
                }
                Ok(())
            }
            Err(e) => Err(RenderError::from(e)),
        }
    }

    /// Destroy views and the swapchain handle. The caller guarantees no
    /// in-flight work references them (wait-idle on the resize path).
    pub fn destroy(&mut self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            loader.destroy_swapchain(self.handle, None);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}
