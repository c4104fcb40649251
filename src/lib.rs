//! # GPU-driven engine
//!
//! A GPU-driven Vulkan renderer core: the CPU records one fixed command
//! stream per frame and the GPU decides what actually gets drawn.
//!
//! ## Overview
//!
//! - [`orchestrator`] - The per-frame program: culling dispatches, barriers,
//!   indirect draws, built as data and replay-validated before recording
//! - [`barrier`] - Logical access types translated to Vulkan pipeline
//!   barriers
//! - [`meshlet`] - Splitting triangle lists into bounded meshlets with
//!   culling bounds
//! - [`bindless`] - The global sampled-image table and its slot allocator
//! - [`renderer`] - The top-level [`Renderer`] owning everything
//!
//! ## Example
//!
//! ```ignore
//! use gpu_driven_engine::{MeshBuffers, Renderer, build_meshlets};
//!
//! let mut renderer = Renderer::new(&window, true, pipeline_builder)?;
//! let meshlets = build_meshlets(&indices, &positions, false);
//! let mesh = renderer.register_mesh(&MeshBuffers {
//!     positions: &positions,
//!     normals: &normals,
//!     uvs: &uvs,
//!     meshlets: &meshlets,
//! })?;
//! renderer.set_instances(&instances);
//! renderer.render_frame(&window, |ctx| { /* egui */ })?;
//! ```

pub mod barrier;
pub mod bindless;
pub mod camera;
pub mod deferred;
pub mod device;
pub mod error;
pub mod gpu_data;
pub mod meshlet;
pub mod orchestrator;
pub mod pipelines;
pub mod renderer;
pub mod resize;
pub mod resources;
pub mod swapchain;
pub mod ui;

pub use camera::Camera;
pub use error::{RenderError, RenderResult};
pub use gpu_data::{Instance, Uniforms, INSTANCE_FLAG_ALPHA_CLIP};
pub use meshlet::{build_meshlets, MeshletData};
pub use pipelines::{PipelineId, Pipelines};
pub use renderer::{MeshBuffers, Renderer};
