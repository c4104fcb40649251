//! Renderer error types.

use thiserror::Error;

/// Errors surfaced by the renderer core.
///
/// Only environment conditions are represented here. Programmer errors
/// (malformed barrier access pairs, slot-table exhaustion, meshlet bound
/// overflow) are preconditions and panic at the violation site instead.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to initialize renderer: {0}")]
    InitializationFailed(String),
    #[error("failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("failed to submit frame: {0}")]
    SubmitFailed(String),
    #[error("surface is out of date and must be resized")]
    SurfaceOutdated,
    #[error("surface lost")]
    SurfaceLost,
    #[error("out of GPU memory")]
    OutOfMemory,
    #[error("GPU device lost")]
    DeviceLost,
    #[error("Vulkan call failed: {0}")]
    Vulkan(ash::vk::Result),
}

pub type RenderResult<T> = Result<T, RenderError>;

impl From<ash::vk::Result> for RenderError {
    fn from(result: ash::vk::Result) -> Self {
        use ash::vk;
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SurfaceOutdated,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_error_display() {
        let err = RenderError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = RenderError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "failed to initialize renderer: no GPU found");
    }

    #[test]
    fn test_out_of_date_maps_to_surface_outdated() {
        let err = RenderError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, RenderError::SurfaceOutdated));

        let err = RenderError::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, RenderError::DeviceLost));
    }
}
