//! Pipeline handles.
//!
//! Shader compilation and pipeline construction live outside the core; this
//! module only names the logical pipelines the frame program binds and holds
//! the externally built handles for them.

use ash::vk;

/// Logical pipelines of the frame program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineId {
    InstanceCull,
    MeshletCull,
    VisbufferOpaque,
    VisbufferAlphaClip,
    ShadowOpaque,
    ShadowAlphaClip,
    DepthReduce,
    CascadeMatrices,
    DeferredLighting,
    DisplayTransform,
}

pub const ALL_PIPELINES: [PipelineId; 10] = [
    PipelineId::InstanceCull,
    PipelineId::MeshletCull,
    PipelineId::VisbufferOpaque,
    PipelineId::VisbufferAlphaClip,
    PipelineId::ShadowOpaque,
    PipelineId::ShadowAlphaClip,
    PipelineId::DepthReduce,
    PipelineId::CascadeMatrices,
    PipelineId::DeferredLighting,
    PipelineId::DisplayTransform,
];

impl PipelineId {
    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            Self::VisbufferOpaque
            | Self::VisbufferAlphaClip
            | Self::ShadowOpaque
            | Self::ShadowAlphaClip => vk::PipelineBindPoint::GRAPHICS,
            _ => vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn index(self) -> usize {
        ALL_PIPELINES.iter().position(|p| *p == self).unwrap()
    }
}

/// Externally built pipeline state objects plus the shared layout.
///
/// Every pipeline uses the same layout: set 0 is the frame descriptor set,
/// set 1 the bindless table, and a single `u32` push constant carries the
/// pass/cascade index.
pub struct Pipelines {
    pub layout: vk::PipelineLayout,
    handles: [vk::Pipeline; ALL_PIPELINES.len()],
}

impl Pipelines {
    /// Wrap externally created handles. Panics if any pipeline is missing or
    /// provided twice.
    pub fn new(layout: vk::PipelineLayout, handles: &[(PipelineId, vk::Pipeline)]) -> Self {
        assert_eq!(handles.len(), ALL_PIPELINES.len(), "pipeline set incomplete");
        let mut slots = [vk::Pipeline::null(); ALL_PIPELINES.len()];
        for (id, pipeline) in handles {
            let slot = &mut slots[id.index()];
            assert!(*slot == vk::Pipeline::null(), "pipeline {id:?} provided twice");
            *slot = *pipeline;
        }
        Self {
            layout,
            handles: slots,
        }
    }

    pub fn get(&self, id: PipelineId) -> vk::Pipeline {
        self.handles[id.index()]
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for handle in self.handles {
                device.destroy_pipeline(handle, None);
            }
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_bind_points() {
        assert_eq!(
            PipelineId::VisbufferOpaque.bind_point(),
            vk::PipelineBindPoint::GRAPHICS
        );
        assert_eq!(
            PipelineId::MeshletCull.bind_point(),
            vk::PipelineBindPoint::COMPUTE
        );
    }

    #[test]
    fn test_lookup_returns_registered_handle() {
        let handles: Vec<(PipelineId, vk::Pipeline)> = ALL_PIPELINES
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, vk::Pipeline::from_raw(i as u64 + 1)))
            .collect();
        let pipelines = Pipelines::new(vk::PipelineLayout::null(), &handles);
        assert_eq!(
            pipelines.get(PipelineId::DisplayTransform),
            vk::Pipeline::from_raw(10)
        );
        assert_eq!(pipelines.get(PipelineId::InstanceCull), vk::Pipeline::from_raw(1));
    }

    #[test]
    #[should_panic(expected = "provided twice")]
    fn test_duplicate_pipeline_panics() {
        let mut handles: Vec<(PipelineId, vk::Pipeline)> = ALL_PIPELINES
            .iter()
            .map(|id| (*id, vk::Pipeline::from_raw(1)))
            .collect();
        handles[1].0 = PipelineId::InstanceCull;
        Pipelines::new(vk::PipelineLayout::null(), &handles);
    }
}
