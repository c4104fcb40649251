//! Deferred destruction of GPU resources.
//!
//! The GPU runs behind the CPU, so a resource cannot be destroyed the moment
//! the renderer stops referencing it. Instead of destroying immediately,
//! callers retire resources against the fence of the frame that last used
//! them; the queue destroys a batch only once its fence is observed signaled.
//!
//! The frame loop calls [`RetirementQueue::drain`] once per frame, after the
//! frame fence wait. Shutdown calls [`RetirementQueue::flush_all`] after
//! wait-idle.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;
use std::sync::Arc;

/// A GPU resource whose destruction has been deferred.
pub enum RetiredResource {
    Buffer {
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
    },
    Image {
        image: vk::Image,
        view: vk::ImageView,
        allocation: Option<Allocation>,
    },
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
}

impl RetiredResource {
    /// Destroy the resource now.
    ///
    /// # Safety
    ///
    /// The GPU must no longer be using the resource.
    unsafe fn destroy(self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        match self {
            RetiredResource::Buffer { buffer, allocation } => {
                if let Some(allocation) = allocation {
                    if let Err(e) = allocator.lock().free(allocation) {
                        log::error!("failed to free buffer allocation: {e}");
                    }
                }
                device.destroy_buffer(buffer, None);
            }
            RetiredResource::Image {
                image,
                view,
                allocation,
            } => {
                if let Some(allocation) = allocation {
                    if let Err(e) = allocator.lock().free(allocation) {
                        log::error!("failed to free image allocation: {e}");
                    }
                }
                device.destroy_image_view(view, None);
                device.destroy_image(image, None);
            }
            RetiredResource::ImageView(view) => {
                device.destroy_image_view(view, None);
            }
            RetiredResource::Sampler(sampler) => {
                device.destroy_sampler(sampler, None);
            }
        }
    }
}

/// Scheduled-deletion list keyed by frame-completion fence.
///
/// Each retired batch remembers the fence that was submitted with the frame
/// that last touched its resources. A batch is destroyed only after
/// `vkGetFenceStatus` reports that fence signaled, so no frame counting or
/// in-flight assumptions are involved.
#[derive(Default)]
pub struct RetirementQueue {
    pending: Vec<(vk::Fence, Vec<RetiredResource>)>,
}

impl RetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `resources` for destruction once `fence` signals.
    ///
    /// An empty batch is dropped immediately; fences may repeat across
    /// batches (the single-frame-in-flight loop reuses one fence).
    pub fn retire(&mut self, fence: vk::Fence, resources: Vec<RetiredResource>) {
        if resources.is_empty() {
            return;
        }
        self.pending.push((fence, resources));
    }

    /// Destroy every batch whose fence has signaled. Unsignaled batches stay
    /// queued for a later drain.
    pub fn drain(&mut self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        let mut kept = Vec::with_capacity(self.pending.len());
        for (fence, resources) in self.pending.drain(..) {
            let signaled = unsafe { device.get_fence_status(fence) }.unwrap_or(false);
            if signaled {
                log::trace!("destroying {} retired resources", resources.len());
                for resource in resources {
                    // SAFETY: the batch's fence signaled, so the frame that
                    // last used these resources has completed on the GPU.
                    unsafe { resource.destroy(device, allocator) };
                }
            } else {
                kept.push((fence, resources));
            }
        }
        self.pending = kept;
    }

    /// Destroy everything regardless of fence state.
    ///
    /// # Safety
    ///
    /// The device must be idle (`vkDeviceWaitIdle`).
    pub unsafe fn flush_all(&mut self, device: &ash::Device, allocator: &Arc<Mutex<Allocator>>) {
        for (_, resources) in self.pending.drain(..) {
            for resource in resources {
                resource.destroy(device, allocator);
            }
        }
    }

    /// Number of batches still waiting on their fence.
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_batches_are_not_queued() {
        let mut queue = RetirementQueue::new();
        queue.retire(vk::Fence::null(), Vec::new());
        assert_eq!(queue.pending_batches(), 0);
    }

    #[test]
    fn test_batches_accumulate_until_drained() {
        let mut queue = RetirementQueue::new();
        queue.retire(
            vk::Fence::null(),
            vec![RetiredResource::Sampler(vk::Sampler::null())],
        );
        queue.retire(
            vk::Fence::null(),
            vec![RetiredResource::ImageView(vk::ImageView::null())],
        );
        assert_eq!(queue.pending_batches(), 2);
    }
}
